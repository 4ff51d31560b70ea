use crate::config::RedactionConfig;
use crate::error::RedactionError;
use crate::process::{run_with_timeout, ProcessFailure};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Removes identifying features from an image
#[async_trait]
pub trait Redactor: Send + Sync {
    /// Write a redacted copy of `source` to `output`
    async fn redact(&self, source: &Path, output: &Path) -> Result<(), RedactionError>;
}

/// Face blurring for equirectangular images via an external binary
#[derive(Debug, Clone)]
pub struct FaceBlurRedactor {
    binary: String,
    model_dir: String,
    blur: bool,
    timeout: Duration,
}

impl FaceBlurRedactor {
    pub fn from_config(config: &RedactionConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            model_dir: config.model_dir.clone(),
            blur: config.blur,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    pub fn arguments(&self, source: &Path, output: &Path) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.blur {
            args.push(OsString::from("-b"));
        }
        args.push(format!("-m={}", self.model_dir).into());

        let mut output_arg = OsString::from("-o=");
        output_arg.push(output.as_os_str());
        args.push(output_arg);

        args.push(source.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Redactor for FaceBlurRedactor {
    async fn redact(&self, source: &Path, output: &Path) -> Result<(), RedactionError> {
        info!("Blurring faces in {}", source.display());

        let mut command = Command::new(&self.binary);
        command.args(self.arguments(source, output));

        match run_with_timeout(command, "face blur", self.timeout).await {
            Ok(_) => {}
            Err(ProcessFailure::Spawn(e)) => return Err(RedactionError::Spawn(e)),
            Err(ProcessFailure::ExitStatus { status, stderr }) => {
                debug!("Face blur stderr: {}", stderr);
                return Err(RedactionError::ExitStatus { status });
            }
            Err(ProcessFailure::Timeout { seconds }) => {
                return Err(RedactionError::Timeout { seconds })
            }
        }

        // The binary can exit 0 without writing anything when it cannot decode the input
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(RedactionError::MissingOutput {
                path: output.to_path_buf(),
            });
        }

        debug!("Redacted image written to {}", output.display());
        Ok(())
    }
}
