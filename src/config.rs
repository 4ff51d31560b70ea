use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OccucamConfig {
    pub camera: CameraConfig,
    pub inference: InferenceConfig,
    pub redaction: RedactionConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    pub pipeline: PipelineConfig,
    pub trigger: TriggerConfig,
}

/// Which capture strategy drives the camera
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// USB-tethered camera driven through gphoto2
    Usb,
    /// Network camera with an HTTP command API
    Network,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Capture strategy
    #[serde(default = "default_camera_kind")]
    pub kind: CameraKind,

    /// gphoto2 executable used by the USB strategy
    #[serde(default = "default_gphoto2_binary")]
    pub gphoto2_binary: String,

    /// Timeout applied to each camera command
    #[serde(default = "default_camera_command_timeout")]
    pub command_timeout_seconds: u64,

    /// Base URL of the network camera API
    #[serde(default = "default_camera_url")]
    pub url: String,

    /// Network camera credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// Delay between "take picture" and the first file listing
    #[serde(default = "default_camera_settle_seconds")]
    pub settle_seconds: u64,

    /// Number of listing attempts before giving up on a new file
    #[serde(default = "default_camera_poll_attempts")]
    pub poll_attempts: u32,

    /// Delay between listing attempts
    #[serde(default = "default_camera_poll_interval")]
    pub poll_interval_seconds: u64,
}

/// What to do with the cycle when the detector subprocess fails
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceFailurePolicy {
    /// Keep going with whatever counts the label file holds (zero if none)
    ZeroCounts,
    /// Fail the cycle before telemetry is sent
    AbortCycle,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InferenceConfig {
    /// Interpreter used to run the detector script
    #[serde(default = "default_inference_python")]
    pub python: String,

    /// Detector entry point
    #[serde(default = "default_inference_script")]
    pub script: String,

    /// Weight set passed to the detector
    #[serde(default = "default_inference_weights")]
    pub weights: String,

    /// Minimum detection confidence
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Bounding box line thickness in the annotated output
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,

    #[serde(default = "default_inference_timeout")]
    pub timeout_seconds: u64,

    #[serde(default = "default_inference_failure_policy")]
    pub failure_policy: InferenceFailurePolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionConfig {
    /// Face blur executable
    #[serde(default = "default_redaction_binary")]
    pub binary: String,

    /// Model asset directory handed to the blur binary
    #[serde(default = "default_redaction_model_dir")]
    pub model_dir: String,

    /// Pass the blur-enable flag
    #[serde(default = "default_redaction_blur")]
    pub blur: bool,

    #[serde(default = "default_redaction_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Object storage connection string (must carry a shared access signature)
    #[serde(default)]
    pub connection_string: String,

    /// Container every artifact is written to
    #[serde(default = "default_storage_container")]
    pub container: String,

    #[serde(default = "default_storage_timeout")]
    pub timeout_seconds: u64,
}

/// How the device obtains its cloud identity
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    #[serde(rename = "DPS")]
    Dps,
    #[serde(rename = "connectionString")]
    ConnectionString,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_security_type")]
    pub security_type: SecurityType,

    /// Provisioning scope
    #[serde(default)]
    pub id_scope: String,

    /// Provisioning symmetric key
    #[serde(default)]
    pub device_key: String,

    /// Provisioning registration id
    #[serde(default)]
    pub device_id: String,

    /// Provisioning service host
    #[serde(default = "default_dps_endpoint")]
    pub dps_endpoint: String,

    /// Device connection string, used with the connectionString security type
    #[serde(default)]
    pub connection_string: String,

    /// Device model id announced during provisioning
    #[serde(default)]
    pub model_id: String,

    /// Wait after sending before the connection is torn down
    #[serde(default = "default_telemetry_settle_seconds")]
    pub settle_seconds: u64,

    #[serde(default = "default_telemetry_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    /// Root under which per-cycle workspaces are created
    #[serde(default = "default_work_root")]
    pub work_root: String,

    /// Leftover workspaces kept on disk before the oldest are pruned
    #[serde(default = "default_max_retained_workspaces")]
    pub max_retained_workspaces: usize,

    /// Redact/publish branches allowed to run at once
    #[serde(default = "default_max_detached_branches")]
    pub max_detached_branches: usize,

    /// Upload the unredacted image when face blurring fails
    #[serde(default)]
    pub upload_unredacted_on_redaction_failure: bool,

    /// Time allowed for in-flight branches to finish at shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,

    /// Pending trigger commands before new ones are rejected
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TriggerConfig {
    /// IP address to bind to
    #[serde(default = "default_trigger_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_trigger_port")]
    pub port: u16,

    /// Remote method that starts a capture cycle
    #[serde(default = "default_trigger_method")]
    pub method_name: String,
}

impl CameraConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl PipelineConfig {
    pub fn work_root(&self) -> PathBuf {
        PathBuf::from(&self.work_root)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

impl TriggerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl OccucamConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("occucam.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.kind", "usb")?
            .set_default("camera.gphoto2_binary", default_gphoto2_binary())?
            .set_default(
                "camera.command_timeout_seconds",
                default_camera_command_timeout(),
            )?
            .set_default("camera.url", default_camera_url())?
            .set_default("camera.settle_seconds", default_camera_settle_seconds())?
            .set_default("camera.poll_attempts", default_camera_poll_attempts())?
            .set_default(
                "camera.poll_interval_seconds",
                default_camera_poll_interval(),
            )?
            .set_default("inference.python", default_inference_python())?
            .set_default("inference.script", default_inference_script())?
            .set_default("inference.weights", default_inference_weights())?
            .set_default(
                "inference.confidence_threshold",
                default_confidence_threshold(),
            )?
            .set_default("inference.line_thickness", default_line_thickness())?
            .set_default("inference.timeout_seconds", default_inference_timeout())?
            .set_default("inference.failure_policy", "zero_counts")?
            .set_default("redaction.binary", default_redaction_binary())?
            .set_default("redaction.model_dir", default_redaction_model_dir())?
            .set_default("redaction.blur", default_redaction_blur())?
            .set_default("redaction.timeout_seconds", default_redaction_timeout())?
            .set_default("storage.connection_string", "")?
            .set_default("storage.container", default_storage_container())?
            .set_default("storage.timeout_seconds", default_storage_timeout())?
            .set_default("telemetry.security_type", "DPS")?
            .set_default("telemetry.id_scope", "")?
            .set_default("telemetry.device_key", "")?
            .set_default("telemetry.device_id", "")?
            .set_default("telemetry.dps_endpoint", default_dps_endpoint())?
            .set_default("telemetry.connection_string", "")?
            .set_default("telemetry.model_id", "")?
            .set_default(
                "telemetry.settle_seconds",
                default_telemetry_settle_seconds(),
            )?
            .set_default("telemetry.timeout_seconds", default_telemetry_timeout())?
            .set_default("pipeline.work_root", default_work_root())?
            .set_default(
                "pipeline.max_retained_workspaces",
                default_max_retained_workspaces() as i64,
            )?
            .set_default(
                "pipeline.max_detached_branches",
                default_max_detached_branches() as i64,
            )?
            .set_default("pipeline.upload_unredacted_on_redaction_failure", false)?
            .set_default("pipeline.drain_timeout_seconds", default_drain_timeout())?
            .set_default(
                "pipeline.command_queue_capacity",
                default_command_queue_capacity() as i64,
            )?
            .set_default(
                "pipeline.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .set_default("trigger.ip", default_trigger_ip())?
            .set_default("trigger.port", default_trigger_port())?
            .set_default("trigger.method_name", default_trigger_method())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // OCCUCAM_TELEMETRY__DEVICE_KEY style overrides
            .add_source(
                Environment::with_prefix("OCCUCAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: OccucamConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!(
            "Camera: {:?}, work root: {}",
            config.camera.kind, config.pipeline.work_root
        );

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.kind == CameraKind::Network && self.camera.url.is_empty() {
            return Err(ConfigError::Message(
                "Network camera requires camera.url".to_string(),
            ));
        }

        if self.camera.poll_attempts == 0 {
            return Err(ConfigError::Message(
                "Camera poll_attempts must be greater than 0".to_string(),
            ));
        }

        if self.camera.command_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Camera command_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        let threshold = self.inference.confidence_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Message(format!(
                "Inference confidence_threshold must be in (0, 1], got {}",
                threshold
            )));
        }

        if self.inference.timeout_seconds == 0 || self.redaction.timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Subprocess timeouts must be greater than 0".to_string(),
            ));
        }

        if self.storage.container.is_empty() {
            return Err(ConfigError::Message(
                "Storage container must not be empty".to_string(),
            ));
        }

        if self.pipeline.work_root.is_empty() {
            return Err(ConfigError::Message(
                "Pipeline work_root must not be empty".to_string(),
            ));
        }

        if self.pipeline.max_detached_branches == 0 {
            return Err(ConfigError::Message(
                "Pipeline max_detached_branches must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.command_queue_capacity == 0 {
            return Err(ConfigError::Message(
                "Pipeline command_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.pipeline.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }

        if self.trigger.method_name.is_empty() {
            return Err(ConfigError::Message(
                "Trigger method_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for OccucamConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                kind: default_camera_kind(),
                gphoto2_binary: default_gphoto2_binary(),
                command_timeout_seconds: default_camera_command_timeout(),
                url: default_camera_url(),
                username: None,
                password: None,
                settle_seconds: default_camera_settle_seconds(),
                poll_attempts: default_camera_poll_attempts(),
                poll_interval_seconds: default_camera_poll_interval(),
            },
            inference: InferenceConfig {
                python: default_inference_python(),
                script: default_inference_script(),
                weights: default_inference_weights(),
                confidence_threshold: default_confidence_threshold(),
                line_thickness: default_line_thickness(),
                timeout_seconds: default_inference_timeout(),
                failure_policy: default_inference_failure_policy(),
            },
            redaction: RedactionConfig {
                binary: default_redaction_binary(),
                model_dir: default_redaction_model_dir(),
                blur: default_redaction_blur(),
                timeout_seconds: default_redaction_timeout(),
            },
            storage: StorageConfig {
                connection_string: String::new(),
                container: default_storage_container(),
                timeout_seconds: default_storage_timeout(),
            },
            telemetry: TelemetryConfig {
                security_type: default_security_type(),
                id_scope: String::new(),
                device_key: String::new(),
                device_id: String::new(),
                dps_endpoint: default_dps_endpoint(),
                connection_string: String::new(),
                model_id: String::new(),
                settle_seconds: default_telemetry_settle_seconds(),
                timeout_seconds: default_telemetry_timeout(),
            },
            pipeline: PipelineConfig {
                work_root: default_work_root(),
                max_retained_workspaces: default_max_retained_workspaces(),
                max_detached_branches: default_max_detached_branches(),
                upload_unredacted_on_redaction_failure: false,
                drain_timeout_seconds: default_drain_timeout(),
                command_queue_capacity: default_command_queue_capacity(),
                event_bus_capacity: default_event_bus_capacity(),
            },
            trigger: TriggerConfig {
                ip: default_trigger_ip(),
                port: default_trigger_port(),
                method_name: default_trigger_method(),
            },
        }
    }
}

// Default value functions
fn default_camera_kind() -> CameraKind {
    CameraKind::Usb
}
fn default_gphoto2_binary() -> String {
    "gphoto2".to_string()
}
fn default_camera_command_timeout() -> u64 {
    60
}
fn default_camera_url() -> String {
    "http://192.168.1.1".to_string()
}
fn default_camera_settle_seconds() -> u64 {
    8
}
fn default_camera_poll_attempts() -> u32 {
    3
}
fn default_camera_poll_interval() -> u64 {
    2
}

fn default_inference_python() -> String {
    "python3".to_string()
}
fn default_inference_script() -> String {
    "yolov5/detect.py".to_string()
}
fn default_inference_weights() -> String {
    "yolov5x6.pt".to_string()
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_line_thickness() -> u32 {
    15
}
fn default_inference_timeout() -> u64 {
    600
}
fn default_inference_failure_policy() -> InferenceFailurePolicy {
    InferenceFailurePolicy::ZeroCounts
}

fn default_redaction_binary() -> String {
    "blur360/build/src/equirect-blur-image".to_string()
}
fn default_redaction_model_dir() -> String {
    "models".to_string()
}
fn default_redaction_blur() -> bool {
    true
}
fn default_redaction_timeout() -> u64 {
    300
}

fn default_storage_container() -> String {
    "wipcontainer".to_string()
}
fn default_storage_timeout() -> u64 {
    120
}

fn default_security_type() -> SecurityType {
    SecurityType::Dps
}
fn default_dps_endpoint() -> String {
    "global.azure-devices-provisioning.net".to_string()
}
fn default_telemetry_settle_seconds() -> u64 {
    8
}
fn default_telemetry_timeout() -> u64 {
    30
}

fn default_work_root() -> String {
    "./work".to_string()
}
fn default_max_retained_workspaces() -> usize {
    5
}
fn default_max_detached_branches() -> usize {
    2
}
fn default_drain_timeout() -> u64 {
    120
}
fn default_command_queue_capacity() -> usize {
    8
}
fn default_event_bus_capacity() -> usize {
    100
}

fn default_trigger_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_trigger_port() -> u16 {
    8080
}
fn default_trigger_method() -> String {
    "RunWIP".to_string()
}
