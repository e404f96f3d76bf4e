use crate::detection::RawDetection;
use crate::frame::FrameSource;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Wraps one barcode-decoding engine bound to a live video source.
///
/// `run` is the engine's decode loop: it emits a `RawDetection` into the sink
/// for every successful decode and stays silent on the overwhelmingly common
/// per-frame miss. The loop terminates when the cancellation token fires or
/// the source becomes unavailable. Multiple adapters may run concurrently
/// against the same source; none may assume exclusive access.
#[async_trait]
pub trait DecoderAdapter: Send + Sync + 'static {
    /// Stable identifier of the decoding engine, carried on every detection.
    fn id(&self) -> &str;

    async fn run(
        &self,
        source: Arc<dyn FrameSource>,
        detections: mpsc::Sender<RawDetection>,
        cancel: CancellationToken,
    );
}

/// Owns the spawned decode task of one adapter; the stop half of the
/// start/stop contract.
pub struct DecoderHandle {
    id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DecoderHandle {
    /// Spawn an adapter's decode loop against the shared source.
    pub fn spawn(
        adapter: Arc<dyn DecoderAdapter>,
        source: Arc<dyn FrameSource>,
        detections: mpsc::Sender<RawDetection>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        let id = adapter.id().to_string();
        let cancel = parent_cancel.child_token();
        let task_cancel = cancel.clone();

        info!("Starting decoder '{}'", id);
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            adapter.run(source, detections, task_cancel).await;
            debug!("Decoder '{}' loop ended", task_id);
        });

        Self { id, cancel, task }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the decode loop and wait for it to wind down.
    pub async fn stop(self) {
        info!("Stopping decoder '{}'", self.id);
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Decoder '{}' task ended abnormally: {}", self.id, e);
        }
    }
}

/// A scripted event for `ScriptedDecoder`.
#[derive(Debug, Clone)]
pub struct ScriptedDetection {
    /// Delay relative to the previous script entry.
    pub after: Duration,
    pub value: String,
    pub format: String,
}

impl ScriptedDetection {
    pub fn new<S: Into<String>>(after: Duration, value: S, format: S) -> Self {
        Self {
            after,
            value: value.into(),
            format: format.into(),
        }
    }
}

/// Decoder adapter that replays a fixed detection script on a schedule.
///
/// Stands in for a real decoding engine in tests and demos, the same way the
/// pipeline runs when no engine is attached: silent except for the scripted
/// hits.
pub struct ScriptedDecoder {
    id: String,
    script: Vec<ScriptedDetection>,
}

impl ScriptedDecoder {
    pub fn new<S: Into<String>>(id: S, script: Vec<ScriptedDetection>) -> Self {
        Self {
            id: id.into(),
            script,
        }
    }
}

#[async_trait]
impl DecoderAdapter for ScriptedDecoder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        _source: Arc<dyn FrameSource>,
        detections: mpsc::Sender<RawDetection>,
        cancel: CancellationToken,
    ) {
        for step in &self.script {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Decoder '{}' cancelled mid-script", self.id);
                    return;
                }
                _ = tokio::time::sleep(step.after) => {}
            }

            let detection =
                RawDetection::new(step.value.as_str(), step.format.as_str(), self.id.as_str());
            trace!("Decoder '{}' emitting '{}'", self.id, detection.value);
            if detections.send(detection).await.is_err() {
                // The aggregator went away; nothing left to decode for.
                debug!("Decoder '{}' sink closed, stopping", self.id);
                return;
            }
        }
    }
}
