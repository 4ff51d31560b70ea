use super::{local_file_name, CaptureAdapter, CaptureResult};
use crate::config::CameraConfig;
use crate::error::{CaptureError, OccucamError, Result};
use crate::metadata::GpsFix;
use crate::workspace::Workspace;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const EXECUTE_PATH: &str = "/osc/commands/execute";

/// Capture through a network camera that exposes an HTTP command API
pub struct NetworkCaptureAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
    settle_delay: Duration,
    poll_attempts: u32,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<CommandErrorBody>,
    #[serde(default)]
    results: Option<ListFilesResults>,
}

#[derive(Debug, Deserialize)]
struct CommandErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ListFilesResults {
    #[serde(default)]
    entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    name: String,
    file_url: String,
    #[serde(default)]
    date_time_zone: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(default, rename = "_gpsInfo")]
    gps_info: Option<GpsInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct GpsInfo {
    lat: f64,
    lng: f64,
    #[serde(default, rename = "_altitude")]
    altitude: Option<f64>,
}

impl NetworkCaptureAdapter {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<(String, Option<String>)>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .map_err(|e| {
                OccucamError::component("capture", &format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            settle_delay: Duration::from_secs(8),
            poll_attempts: 3,
            poll_interval: Duration::from_secs(2),
        })
    }

    pub fn from_config(config: &CameraConfig) -> Result<Self> {
        let credentials = config
            .username
            .clone()
            .map(|user| (user, config.password.clone()));
        Ok(Self::new(&config.url, credentials, config.command_timeout())?
            .with_polling(
                Duration::from_secs(config.settle_seconds),
                config.poll_attempts,
                Duration::from_secs(config.poll_interval_seconds),
            ))
    }

    /// Override the settle delay and listing retry schedule
    pub fn with_polling(mut self, settle_delay: Duration, attempts: u32, interval: Duration) -> Self {
        self.settle_delay = settle_delay;
        self.poll_attempts = attempts.max(1);
        self.poll_interval = interval;
        self
    }

    async fn execute(&self, body: serde_json::Value) -> std::result::Result<CommandResponse, CaptureError> {
        let url = format!("{}{}", self.base_url, EXECUTE_PATH);
        let mut request = self.client.post(&url).json(&body);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                CaptureError::DeviceUnavailable {
                    details: e.to_string(),
                }
            } else {
                CaptureError::Http(e)
            }
        })?;

        let response: CommandResponse = response.error_for_status()?.json().await?;
        if let Some(error) = &response.error {
            return Err(CaptureError::CommandFailed {
                command: body["name"].as_str().unwrap_or_default().to_string(),
                details: format!("{}: {}", error.code, error.message),
            });
        }
        if response.state.as_deref() == Some("error") {
            return Err(CaptureError::CommandFailed {
                command: body["name"].as_str().unwrap_or_default().to_string(),
                details: "camera reported error state".to_string(),
            });
        }
        Ok(response)
    }

    async fn newest_file(&self) -> std::result::Result<Option<FileEntry>, CaptureError> {
        let response = self
            .execute(json!({
                "name": "camera.listFiles",
                "parameters": {
                    "fileType": "image",
                    "entryCount": 1,
                    "maxThumbSize": 0
                }
            }))
            .await?;

        Ok(response
            .results
            .and_then(|results| results.entries.into_iter().next()))
    }

    async fn take_picture(&self) -> std::result::Result<(), CaptureError> {
        info!("Capturing image");
        self.execute(json!({ "name": "camera.takePicture" })).await?;
        Ok(())
    }

    /// Poll the listing until an entry different from `previous` shows up
    async fn wait_for_new_file(
        &self,
        previous: Option<&str>,
    ) -> std::result::Result<FileEntry, CaptureError> {
        sleep(self.settle_delay).await;

        let mut saw_any_entry = false;
        for attempt in 1..=self.poll_attempts {
            match self.newest_file().await? {
                Some(entry) if Some(entry.file_url.as_str()) != previous => {
                    debug!("New file after {} listing attempt(s): {}", attempt, entry.name);
                    return Ok(entry);
                }
                Some(_) => saw_any_entry = true,
                None => {}
            }

            if attempt < self.poll_attempts {
                sleep(self.poll_interval).await;
            }
        }

        if saw_any_entry {
            Err(CaptureError::NoNewFile {
                attempts: self.poll_attempts,
            })
        } else {
            Err(CaptureError::NoFileListed)
        }
    }

    async fn download(
        &self,
        entry: &FileEntry,
        workspace: &Workspace,
    ) -> std::result::Result<std::path::PathBuf, CaptureError> {
        let target = workspace.image_path(local_file_name(&entry.name)?);
        info!("Downloading {} to {}", entry.file_url, target.display());

        let mut request = self.client.get(&entry.file_url);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }
        let response = request.send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(&target).await?;
        let mut total_bytes: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if total_bytes == 0 {
            return Err(CaptureError::Transfer {
                source_ref: entry.file_url.clone(),
                destination: target,
                details: "camera returned an empty file".to_string(),
            });
        }

        debug!("Downloaded {} bytes", total_bytes);
        Ok(target)
    }
}

#[async_trait]
impl CaptureAdapter for NetworkCaptureAdapter {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn capture(&self, workspace: &Workspace) -> std::result::Result<CaptureResult, CaptureError> {
        let previous = match self.newest_file().await {
            Ok(entry) => entry.map(|e| e.file_url),
            Err(CaptureError::DeviceUnavailable { details }) => {
                return Err(CaptureError::DeviceUnavailable { details })
            }
            Err(e) => {
                warn!("Could not list files before capture: {}", e);
                None
            }
        };

        self.take_picture().await?;
        let entry = self.wait_for_new_file(previous.as_deref()).await?;
        let source_image_path = self.download(&entry, workspace).await?;

        let gps = match (&entry.gps_info, entry.lat, entry.lng) {
            (Some(info), _, _) => Some(GpsFix {
                latitude: info.lat,
                longitude: info.lng,
                altitude: info.altitude.unwrap_or(0.0),
            }),
            (None, Some(latitude), Some(longitude)) => Some(GpsFix {
                latitude,
                longitude,
                altitude: 0.0,
            }),
            _ => None,
        };

        Ok(CaptureResult {
            source_image_path,
            capture_timestamp: entry.date_time_zone.filter(|t| !t.trim().is_empty()),
            gps,
        })
    }
}
