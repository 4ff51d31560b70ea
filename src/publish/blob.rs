use super::BlobStore;
use crate::config::StorageConfig;
use crate::error::{OccucamError, PublishError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

const API_VERSION: &str = "2021-08-06";

/// Storage account endpoint and shared access signature from a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccount {
    pub blob_endpoint: Url,
    pub sas: String,
}

impl StorageAccount {
    /// Accepts `BlobEndpoint=...;SharedAccessSignature=...` or
    /// `DefaultEndpointsProtocol=https;AccountName=...;EndpointSuffix=...;SharedAccessSignature=...`
    pub fn parse(connection_string: &str) -> std::result::Result<Self, PublishError> {
        let invalid = |details: &str| PublishError::InvalidConnectionString {
            details: details.to_string(),
        };

        let fields: HashMap<&str, &str> = connection_string
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .filter_map(|part| part.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect();

        let sas = fields
            .get("SharedAccessSignature")
            .map(|s| s.trim_start_matches('?').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid("SharedAccessSignature is required"))?;

        let endpoint = match fields.get("BlobEndpoint") {
            Some(endpoint) => endpoint.to_string(),
            None => {
                let account = fields
                    .get("AccountName")
                    .ok_or_else(|| invalid("BlobEndpoint or AccountName is required"))?;
                let protocol = fields.get("DefaultEndpointsProtocol").unwrap_or(&"https");
                let suffix = fields.get("EndpointSuffix").unwrap_or(&"core.windows.net");
                format!("{}://{}.blob.{}", protocol, account, suffix)
            }
        };

        let blob_endpoint = Url::parse(&endpoint).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self { blob_endpoint, sas })
    }

    /// URL of `blob_name` in `container`, including the signature
    pub fn blob_url(&self, container: &str, blob_name: &str) -> std::result::Result<Url, PublishError> {
        let mut url = self.blob_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| PublishError::InvalidConnectionString {
                details: "BlobEndpoint cannot be a base URL".to_string(),
            })?
            .pop_if_empty()
            .push(container)
            .push(blob_name);
        url.set_query(Some(&self.sas));
        Ok(url)
    }
}

/// Block blob uploads over the storage REST API
pub struct AzureBlobStore {
    client: reqwest::Client,
    account: StorageAccount,
    container: String,
}

impl AzureBlobStore {
    pub fn new(account: StorageAccount, container: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| {
                OccucamError::component("publish", &format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            account,
            container: container.into(),
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let account = StorageAccount::parse(&config.connection_string)?;
        Self::new(
            account,
            config.container.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn put_file(&self, local_path: &Path, blob_name: &str) -> std::result::Result<(), PublishError> {
        let open_error = |source| PublishError::Open {
            path: local_path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(local_path).await.map_err(open_error)?;
        let length = file.metadata().await.map_err(open_error)?.len();

        let url = self.account.blob_url(&self.container, blob_name)?;
        debug!(
            "PUT {}/{} ({} bytes)",
            self.container, blob_name, length
        );

        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", API_VERSION)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                blob: blob_name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
