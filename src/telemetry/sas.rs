use crate::error::ProvisioningError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Shared access signature for `resource_uri`, valid until `expiry` (unix seconds)
pub fn generate_sas_token(
    resource_uri: &str,
    key_base64: &str,
    key_name: Option<&str>,
    expiry: u64,
) -> Result<String, ProvisioningError> {
    let key = STANDARD
        .decode(key_base64.trim())
        .map_err(|e| ProvisioningError::InvalidKey {
            details: e.to_string(),
        })?;

    let encoded_uri = url_encode(resource_uri);
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| ProvisioningError::InvalidKey {
        details: e.to_string(),
    })?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        url_encode(&signature),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&url_encode(name));
    }
    Ok(token)
}

/// Unix timestamp `ttl` from now
pub fn expiry_from_now(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| (now + ttl).as_secs())
        .unwrap_or(ttl.as_secs())
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "b2NjdWNhbS10ZXN0LWtleQ==";

    #[test]
    fn test_token_format() {
        let token =
            generate_sas_token("scope01/registrations/cam-1", KEY, Some("registration"), 1_700_000_000)
                .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=scope01%2Fregistrations%2Fcam-1\
             &sig=2893RnvVIGYZ4j%2BVHmYVpXdwzKrdEC54T38m0enjvcc%3D\
             &se=1700000000&skn=registration"
        );
    }

    #[test]
    fn test_token_without_key_name() {
        let token = generate_sas_token("hub.example.net/devices/cam-1", KEY, None, 1).unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fcam-1&sig="));
        assert!(token.ends_with("&se=1"));
        assert!(!token.contains("skn="));
    }

    #[test]
    fn test_invalid_key() {
        let result = generate_sas_token("x", "not base64!", None, 1);
        assert!(matches!(result, Err(ProvisioningError::InvalidKey { .. })));
    }

    #[test]
    fn test_expiry_is_in_future() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(expiry_from_now(Duration::from_secs(3600)) >= now + 3600);
    }
}
