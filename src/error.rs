use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScancamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Enrichment error: {0}")]
    Enrichment(#[from] EnrichmentError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl ScancamError {
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

/// Camera acquisition and snapshot failures.
///
/// Acquisition failures are fatal to the scanning session they occur in; the
/// arbitration pipeline simply stops receiving detections. Snapshot failures
/// downgrade an accepted scan to a barcode-only result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera permission denied")]
    PermissionDenied,

    #[error("Camera device is busy")]
    DeviceBusy,

    #[error("Camera device not found: {device}")]
    NotFound { device: String },

    #[error("Frame snapshot failed: {details}")]
    SnapshotFailed { details: String },

    #[error("Camera stream ended: {details}")]
    StreamEnded { details: String },
}

impl CameraError {
    /// Category-specific message suitable for surfacing to a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            CameraError::PermissionDenied => {
                "Camera access was denied. Grant camera permission and try again."
            }
            CameraError::DeviceBusy => {
                "The camera is in use by another application. Close it and try again."
            }
            CameraError::NotFound { .. } => "No camera was found on this device.",
            CameraError::SnapshotFailed { .. } => "Could not capture a still image.",
            CameraError::StreamEnded { .. } => "The camera stream ended unexpectedly.",
        }
    }

    /// Whether this error ends the scanning session it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CameraError::SnapshotFailed { .. })
    }
}

/// Failures of the external text-extraction service call.
///
/// These never cross the pipeline boundary as errors; they are folded into a
/// terminal `TextExtraction::Failed` sentinel on the enriched result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("Network error: {details}")]
    Network { details: String },

    #[error("Extraction request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Service returned status {status}: {details}")]
    Service { status: u16, details: String },

    #[error("Failed to parse extraction response: {details}")]
    Parse { details: String },
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },
}

pub type Result<T> = std::result::Result<T, ScancamError>;
