//! Object detection over a captured image.
//!
//! The detector runs out of process and reports through a label file with one
//! `classId x y w h` row per detection. Only persons and chairs are counted.

use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::process::{run_with_timeout, ProcessFailure};
use crate::workspace::Workspace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Detector class id for a person
pub const PERSON_CLASS: u32 = 0;
/// Detector class id for a chair
pub const CHAIR_CLASS: u32 = 56;

/// Occupancy counts for one image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub person_count: u32,
    pub chair_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InferenceStatus {
    /// The detector ran and wrote a label file
    Detected,
    /// The detector ran and found nothing (no label file)
    NoDetections,
    /// The detector did not complete; counts come from whatever label file exists
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOutcome {
    pub result: InferenceResult,
    pub status: InferenceStatus,
}

impl InferenceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, InferenceStatus::Failed { .. })
    }
}

/// Out-of-process object detector
#[async_trait]
pub trait Detector: Send + Sync {
    /// Run detection on `image`, writing labels under the workspace's detect directory
    async fn detect(&self, image: &Path, workspace: &Workspace) -> Result<(), InferenceError>;
}

/// YOLO `detect.py` run through a Python interpreter
#[derive(Debug, Clone)]
pub struct YoloDetector {
    python: String,
    script: String,
    weights: String,
    confidence_threshold: f64,
    line_thickness: u32,
    timeout: Duration,
}

impl YoloDetector {
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self {
            python: config.python.clone(),
            script: config.script.clone(),
            weights: config.weights.clone(),
            confidence_threshold: config.confidence_threshold,
            line_thickness: config.line_thickness,
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }

    /// Arguments passed to the interpreter for `image`
    pub fn arguments(&self, image: &Path, workspace: &Workspace) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.script.clone().into(),
            "--weights".into(),
            self.weights.clone().into(),
            "--source".into(),
            image.as_os_str().to_owned(),
            "--classes".into(),
            PERSON_CLASS.to_string().into(),
            CHAIR_CLASS.to_string().into(),
            "--conf-thres".into(),
            self.confidence_threshold.to_string().into(),
            "--hide-conf".into(),
            "--line-thickness".into(),
            self.line_thickness.to_string().into(),
            "--exist-ok".into(),
            "--save-txt".into(),
            "--project".into(),
        ];
        args.push(workspace.detect_project().into_os_string());
        args.push("--name".into());
        args.push("exp".into());
        args
    }
}

#[async_trait]
impl Detector for YoloDetector {
    async fn detect(&self, image: &Path, workspace: &Workspace) -> Result<(), InferenceError> {
        let mut command = Command::new(&self.python);
        command.args(self.arguments(image, workspace));

        match run_with_timeout(command, "detector", self.timeout).await {
            Ok(_) => Ok(()),
            Err(ProcessFailure::Spawn(e)) => Err(InferenceError::Spawn(e)),
            Err(ProcessFailure::ExitStatus { status, stderr }) => {
                debug!("Detector stderr: {}", stderr);
                Err(InferenceError::ExitStatus { status })
            }
            Err(ProcessFailure::Timeout { seconds }) => Err(InferenceError::Timeout { seconds }),
        }
    }
}

/// Runs the detector and turns its label file into counts
#[derive(Clone)]
pub struct InferenceRunner {
    detector: Arc<dyn Detector>,
}

impl InferenceRunner {
    pub fn new(detector: Arc<dyn Detector>) -> Self {
        Self { detector }
    }

    /// Never fails: a detector failure is reported in the outcome status and the
    /// label file is still consulted.
    pub async fn infer(&self, image: &Path, workspace: &Workspace) -> InferenceOutcome {
        info!("Running inference on {}", image.display());

        let detector_failure = match self.detector.detect(image, workspace).await {
            Ok(()) => None,
            Err(e) => {
                error!("Could not run inference on {}: {}", image.display(), e);
                Some(e.to_string())
            }
        };

        let label_path = workspace.label_path(image);
        let (result, label_present) = match read_labels(&label_path).await {
            Ok(Some(contents)) => (count_detections(&contents), true),
            Ok(None) => {
                info!("No objects were detected in {}", image.display());
                (InferenceResult::default(), false)
            }
            Err(e) => {
                warn!("{}", e);
                let reason = detector_failure.clone().unwrap_or_else(|| e.to_string());
                return InferenceOutcome {
                    result: InferenceResult::default(),
                    status: InferenceStatus::Failed { reason },
                };
            }
        };

        let status = match detector_failure {
            Some(reason) => InferenceStatus::Failed { reason },
            None if label_present => InferenceStatus::Detected,
            None => InferenceStatus::NoDetections,
        };

        info!(
            "Inference: {} person(s), {} chair(s) ({:?})",
            result.person_count, result.chair_count, status
        );
        InferenceOutcome { result, status }
    }
}

async fn read_labels(path: &Path) -> Result<Option<String>, InferenceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(InferenceError::LabelRead {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Count person and chair rows in label file contents
pub fn count_detections(contents: &str) -> InferenceResult {
    let mut result = InferenceResult::default();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let class = match (fields.len() >= 5, fields[0].parse::<f64>()) {
            (true, Ok(class)) if class >= 0.0 && class.fract() == 0.0 => class as u32,
            _ => {
                warn!("Skipping malformed label row {}: '{}'", index + 1, line);
                continue;
            }
        };

        match class {
            PERSON_CLASS => result.person_count += 1,
            CHAIR_CLASS => result.chair_count += 1,
            _ => {}
        }
    }

    result
}
