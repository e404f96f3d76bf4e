use crate::error::CameraError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

/// Encoded image formats a frame source may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Jpeg,
    Png,
}

impl SnapshotFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            SnapshotFormat::Jpeg => "image/jpeg",
            SnapshotFormat::Png => "image/png",
        }
    }
}

/// A still image captured from the live video source at acceptance time.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub data: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub format: SnapshotFormat,
    pub captured_at: SystemTime,
}

impl FrameSnapshot {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: SnapshotFormat) -> Self {
        Self {
            data: Arc::new(data),
            width,
            height,
            format,
            captured_at: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Read-only seam onto the live video source.
///
/// The pipeline only needs "a readable frame source": device enumeration,
/// facing-mode selection and stream setup stay with the embedding platform.
/// Multiple decoder adapters and the enrichment snapshot path share one
/// source concurrently; implementations must tolerate that.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Capture and encode the current frame as a still image.
    async fn snapshot(&self) -> Result<FrameSnapshot, CameraError>;
}

/// Frame source that always returns the same pre-encoded still. Used in tests
/// and as a stand-in while no camera is attached.
pub struct StaticFrameSource {
    snapshot: FrameSnapshot,
}

impl StaticFrameSource {
    pub fn new(snapshot: FrameSnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn snapshot(&self) -> Result<FrameSnapshot, CameraError> {
        Ok(self.snapshot.clone())
    }
}

/// Frame source whose snapshots always fail. Exercises the barcode-only
/// downgrade path.
pub struct FailingFrameSource {
    error: CameraError,
}

impl FailingFrameSource {
    pub fn new(error: CameraError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl FrameSource for FailingFrameSource {
    async fn snapshot(&self) -> Result<FrameSnapshot, CameraError> {
        Err(self.error.clone())
    }
}
