use super::{local_file_name, CameraFilePath, CaptureAdapter, CaptureResult, TetheredCamera};
use crate::error::CaptureError;
use crate::process::{run_with_timeout, ProcessFailure};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Capture through a USB-tethered camera
pub struct UsbCaptureAdapter<C: TetheredCamera> {
    camera: C,
}

impl<C: TetheredCamera> UsbCaptureAdapter<C> {
    pub fn new(camera: C) -> Self {
        Self { camera }
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    async fn capture_while_open(
        &self,
        workspace: &Workspace,
    ) -> Result<CaptureResult, CaptureError> {
        let file = self.camera.trigger_capture().await?;
        info!("Camera file path: {}/{}", file.folder, file.name);

        let target = workspace.image_path(local_file_name(&file.name)?);
        info!("Copying image to {}", target.display());
        self.camera.fetch_file(&file, &target).await?;

        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(CaptureError::Transfer {
                source_ref: format!("{}/{}", file.folder, file.name),
                destination: target,
                details: "file missing after transfer".to_string(),
            });
        }

        Ok(CaptureResult {
            source_image_path: target,
            capture_timestamp: None,
            gps: None,
        })
    }
}

#[async_trait]
impl<C: TetheredCamera> CaptureAdapter for UsbCaptureAdapter<C> {
    fn name(&self) -> &'static str {
        "usb"
    }

    async fn capture(&self, workspace: &Workspace) -> Result<CaptureResult, CaptureError> {
        self.camera.open().await?;

        let result = self.capture_while_open(workspace).await;

        // The device must be released whether or not the transfer worked
        if let Err(e) = self.camera.release().await {
            match &result {
                Ok(_) => warn!("Failed to release camera after capture: {}", e),
                Err(capture_error) => warn!(
                    "Failed to release camera after error ({}): {}",
                    capture_error, e
                ),
            }
        }

        result
    }
}

/// Tethered camera driven through the gphoto2 command line tool.
///
/// Each invocation opens and closes the camera port itself, so `open` only checks that a
/// camera is attached and `release` has nothing to hand back.
pub struct Gphoto2Camera {
    binary: String,
    timeout: Duration,
}

impl Gphoto2Camera {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, CaptureError> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        let label = format!("gphoto2 {}", args.join(" "));

        match run_with_timeout(command, &label, self.timeout).await {
            Ok(output) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(ProcessFailure::Spawn(e)) => Err(CaptureError::DeviceUnavailable {
                details: format!("cannot run {}: {}", self.binary, e),
            }),
            Err(ProcessFailure::ExitStatus { status, stderr }) => {
                Err(CaptureError::CommandFailed {
                    command: label,
                    details: format!("{} {}", status, stderr),
                })
            }
            Err(ProcessFailure::Timeout { seconds }) => Err(CaptureError::Timeout {
                operation: label,
                seconds,
            }),
        }
    }
}

#[async_trait]
impl TetheredCamera for Gphoto2Camera {
    async fn open(&self) -> Result<(), CaptureError> {
        let output = self.run(&["--auto-detect"]).await?;
        let cameras = parse_auto_detect(&output);
        match cameras.first() {
            Some(model) => {
                debug!("Detected camera: {}", model);
                Ok(())
            }
            None => Err(CaptureError::DeviceUnavailable {
                details: "no camera detected".to_string(),
            }),
        }
    }

    async fn trigger_capture(&self) -> Result<CameraFilePath, CaptureError> {
        info!("Capturing image");
        let output = self.run(&["--capture-image"]).await?;
        parse_new_file_location(&output).ok_or(CaptureError::NoFileReference)
    }

    async fn fetch_file(&self, file: &CameraFilePath, destination: &Path) -> Result<(), CaptureError> {
        let listing = self
            .run(&["--folder", file.folder.as_str(), "--list-files"])
            .await?;
        let number = find_file_number(&listing, &file.name).ok_or_else(|| {
            CaptureError::Transfer {
                source_ref: format!("{}/{}", file.folder, file.name),
                destination: destination.to_path_buf(),
                details: "file not present in folder listing".to_string(),
            }
        })?;

        let destination_str = destination.to_string_lossy();
        let number = number.to_string();
        self.run(&[
            "--folder",
            file.folder.as_str(),
            "--filename",
            destination_str.as_ref(),
            "--force-overwrite",
            "--get-file",
            number.as_str(),
        ])
        .await?;
        Ok(())
    }

    async fn release(&self) -> Result<(), CaptureError> {
        debug!("gphoto2 camera released");
        Ok(())
    }
}

/// Camera models listed by `gphoto2 --auto-detect`
pub(crate) fn parse_auto_detect(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            // Model and port are separated by a run of spaces
            let model = line.split("  ").next().unwrap_or(line).trim();
            Some(model.to_string())
        })
        .collect()
}

/// Parse `New file is in location /store/DCIM/100RICOH/R0010012.JPG on the camera`
pub(crate) fn parse_new_file_location(output: &str) -> Option<CameraFilePath> {
    const MARKER: &str = "New file is in location ";

    let line = output.lines().find(|line| line.contains(MARKER))?;
    let rest = &line[line.find(MARKER)? + MARKER.len()..];
    let path = rest.trim_end().trim_end_matches("on the camera").trim();

    let (folder, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some(CameraFilePath {
        folder: if folder.is_empty() { "/".to_string() } else { folder.to_string() },
        name: name.to_string(),
    })
}

/// Number of `name` in a `gphoto2 --list-files` listing (`#12  IMG_0001.JPG  rd ...`)
pub(crate) fn find_file_number(listing: &str, name: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let number = parts.next()?.strip_prefix('#')?.parse().ok()?;
        (parts.next()? == name).then_some(number)
    })
}
