//! Camera capture strategies.
//!
//! Both strategies leave a single image file in the cycle's workspace and
//! describe it with a [`CaptureResult`].

mod network;
mod usb;

use crate::config::{CameraConfig, CameraKind};
use crate::error::{CaptureError, Result};
use crate::metadata::GpsFix;
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use network::NetworkCaptureAdapter;
pub use usb::{Gphoto2Camera, UsbCaptureAdapter};

/// Image produced by one capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub source_image_path: PathBuf,
    /// Raw camera timestamp when the camera reports one, e.g. `2022:05:13 18:20:14-04:00`
    pub capture_timestamp: Option<String>,
    pub gps: Option<GpsFix>,
}

impl CaptureResult {
    /// File name of the captured image
    pub fn file_name(&self) -> String {
        self.source_image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Extension of the captured image, used for the published artifact name
    pub fn extension(&self) -> Option<String> {
        self.source_image_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .filter(|e| !e.is_empty())
    }
}

/// Last component of a camera-supplied file name; cameras may report folders
/// as part of it, and nothing else may reach the workspace path.
pub(crate) fn local_file_name(reference: &str) -> std::result::Result<&str, CaptureError> {
    Path::new(reference)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or(CaptureError::NoFileReference)
}

/// Location of a file in the camera's own storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFilePath {
    pub folder: String,
    pub name: String,
}

/// A capture strategy
#[async_trait]
pub trait CaptureAdapter: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Take a picture and store it inside `workspace`
    async fn capture(&self, workspace: &Workspace)
        -> std::result::Result<CaptureResult, CaptureError>;
}

/// Low-level operations of a USB-tethered camera
#[async_trait]
pub trait TetheredCamera: Send + Sync {
    /// Acquire the device
    async fn open(&self) -> std::result::Result<(), CaptureError>;

    /// Fire the shutter and report where the camera stored the image
    async fn trigger_capture(&self) -> std::result::Result<CameraFilePath, CaptureError>;

    /// Copy a file from the camera to `destination`
    async fn fetch_file(
        &self,
        file: &CameraFilePath,
        destination: &Path,
    ) -> std::result::Result<(), CaptureError>;

    /// Release the device
    async fn release(&self) -> std::result::Result<(), CaptureError>;
}

/// Build the capture adapter selected in the configuration
pub fn adapter_from_config(config: &CameraConfig) -> Result<Arc<dyn CaptureAdapter>> {
    let adapter: Arc<dyn CaptureAdapter> = match config.kind {
        CameraKind::Usb => Arc::new(UsbCaptureAdapter::new(Gphoto2Camera::new(
            config.gphoto2_binary.clone(),
            config.command_timeout(),
        ))),
        CameraKind::Network => Arc::new(NetworkCaptureAdapter::from_config(config)?),
    };
    Ok(adapter)
}
