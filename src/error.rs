use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OccucamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Redaction error: {0}")]
    Redaction(#[from] RedactionError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl OccucamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Camera could not produce a local image file
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Camera device unavailable: {details}")]
    DeviceUnavailable { details: String },

    #[error("Camera command '{command}' failed: {details}")]
    CommandFailed { command: String, details: String },

    #[error("Camera operation timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Camera returned no file reference")]
    NoFileReference,

    #[error("Camera file listing returned no entries")]
    NoFileListed,

    #[error("No new file appeared after {attempts} listing attempts")]
    NoNewFile { attempts: u32 },

    #[error("Failed to transfer {source_ref} to {}: {details}", .destination.display())]
    Transfer {
        source_ref: String,
        destination: PathBuf,
        details: String,
    },

    #[error("HTTP error talking to camera: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error during capture: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Image {} has no readable EXIF data: {details}", .path.display())]
    Unreadable { path: PathBuf, details: String },

    #[error("Image {} has no original date/time tag", .path.display())]
    MissingTimestamp { path: PathBuf },

    #[error("Malformed timestamp '{value}'")]
    MalformedTimestamp { value: String },
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to launch detector: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Detector exited with status {status}")]
    ExitStatus { status: String },

    #[error("Detector timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Failed to read label file {}: {source}", .path.display())]
    LabelRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum RedactionError {
    #[error("Failed to launch face blur: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Face blur exited with status {status}")]
    ExitStatus { status: String },

    #[error("Face blur timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Face blur produced no output at {}", .path.display())]
    MissingOutput { path: PathBuf },

    #[error("Refusing to write redacted output named '{name}'")]
    InvalidOutputName { name: String },
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Invalid storage connection string: {details}")]
    InvalidConnectionString { details: String },

    #[error("Failed to open {} for upload: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Storage rejected blob '{blob}' with status {status}: {body}")]
    Rejected {
        blob: String,
        status: u16,
        body: String,
    },
}

/// Local artifact removal failure. Collected into cleanup reports, never propagated.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to remove image {}: {source}", .path.display())]
    RemoveImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove working directory {}: {source}", .path.display())]
    RemoveDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to delete {}: {reason}", .path.display())]
    Unsafe { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Device provisioning returned status '{status}'")]
    NotAssigned { status: String },

    #[error("Missing provisioning setting: {field}")]
    MissingSetting { field: &'static str },

    #[error("Invalid device connection string: {details}")]
    InvalidConnectionString { details: String },

    #[error("Invalid symmetric key: {details}")]
    InvalidKey { details: String },

    #[error("Provisioning service error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provisioning did not complete after {attempts} status polls")]
    PollingExhausted { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Could not establish device identity: {0}")]
    Identity(#[from] ProvisioningError),

    #[error("Failed to serialize telemetry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Telemetry transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Device hub rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Telemetry connection error: {details}")]
    Connection { details: String },
}

/// A trigger could not be turned into a capture cycle
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Trigger queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Invalid location id: {details}")]
    InvalidLocation { details: String },
}

pub type Result<T> = std::result::Result<T, OccucamError>;
