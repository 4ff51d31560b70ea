use super::sas::{expiry_from_now, generate_sas_token};
use super::{DeviceIdentity, TelemetryMessage, TelemetryTransport};
use crate::error::{OccucamError, Result, TelemetryError};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const API_VERSION: &str = "2020-03-13";
const TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Device-to-cloud messages over the hub's HTTPS endpoint
pub struct IotHubHttpTransport {
    client: reqwest::Client,
    base_url_override: Option<String>,
    session: Mutex<Option<Session>>,
}

#[derive(Debug, Clone)]
struct Session {
    events_url: String,
    authorization: String,
}

impl IotHubHttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                OccucamError::component("telemetry", &format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url_override: None,
            session: Mutex::new(None),
        })
    }

    /// Send to `base_url` instead of `https://<assigned hub>`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn current_session(&self) -> std::result::Result<Session, TelemetryError> {
        self.session
            .lock()
            .map_err(|_| TelemetryError::Connection {
                details: "session lock poisoned".to_string(),
            })?
            .clone()
            .ok_or_else(|| TelemetryError::Connection {
                details: "not connected".to_string(),
            })
    }
}

#[async_trait]
impl TelemetryTransport for IotHubHttpTransport {
    async fn connect(&self, identity: &DeviceIdentity) -> std::result::Result<(), TelemetryError> {
        let resource = format!("{}/devices/{}", identity.hub_host, identity.device_id);
        let authorization = generate_sas_token(
            &resource,
            &identity.shared_access_key,
            None,
            expiry_from_now(TOKEN_TTL),
        )?;

        let base_url = self
            .base_url_override
            .clone()
            .unwrap_or_else(|| format!("https://{}", identity.hub_host));
        let events_url = format!(
            "{}/devices/{}/messages/events?api-version={}",
            base_url, identity.device_id, API_VERSION
        );

        let mut session = self.session.lock().map_err(|_| TelemetryError::Connection {
            details: "session lock poisoned".to_string(),
        })?;
        *session = Some(Session {
            events_url,
            authorization,
        });

        info!("Connected to {} as {}", identity.hub_host, identity.device_id);
        Ok(())
    }

    async fn send(&self, message: &TelemetryMessage) -> std::result::Result<(), TelemetryError> {
        let session = self.current_session()?;

        let response = self
            .client
            .post(&session.events_url)
            .header(reqwest::header::AUTHORIZATION, &session.authorization)
            .header(reqwest::header::CONTENT_TYPE, message.content_type)
            .header("iothub-contenttype", message.content_type)
            .header("iothub-contentencoding", message.content_encoding)
            .body(message.body.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Hub accepted message with status {}", status);
        Ok(())
    }

    async fn disconnect(&self) -> std::result::Result<(), TelemetryError> {
        let mut session = self.session.lock().map_err(|_| TelemetryError::Connection {
            details: "session lock poisoned".to_string(),
        })?;
        if session.take().is_some() {
            debug!("Telemetry session closed");
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "http-trigger"))]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::Arc;

    type Received = Arc<Mutex<Vec<(String, String)>>>;

    async fn events(
        State(received): State<Received>,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        let authorization = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        received.lock().unwrap().push((authorization, body));
        StatusCode::NO_CONTENT
    }

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            hub_host: "hub.example.net".to_string(),
            device_id: "cam-1".to_string(),
            shared_access_key: "b2NjdWNhbS10ZXN0LWtleQ==".to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_posts_signed_message() {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/devices/cam-1/messages/events", post(events))
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let transport = IotHubHttpTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_base_url(format!("http://{}", address));
        transport.connect(&identity()).await.unwrap();
        transport
            .send(&TelemetryMessage::json(r#"{"NumberOfPersons":3}"#.to_string()))
            .await
            .unwrap();
        transport.disconnect().await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0]
            .0
            .starts_with("SharedAccessSignature sr=hub.example.net%2Fdevices%2Fcam-1"));
        assert_eq!(received[0].1, r#"{"NumberOfPersons":3}"#);
    }

    #[tokio::test]
    async fn test_send_without_connect_fails() {
        let transport = IotHubHttpTransport::new(Duration::from_secs(1)).unwrap();
        let result = transport.send(&TelemetryMessage::json("{}".to_string())).await;
        assert!(matches!(result, Err(TelemetryError::Connection { .. })));
    }
}
