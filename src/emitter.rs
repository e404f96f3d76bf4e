use crate::detection::ScanResult;
use crate::error::{Result, ScancamError};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// The single point producing externally observable `ScanResult`s.
///
/// Results go out over a broadcast channel so any number of consumers can
/// observe the scan stream. The barcode-or-text invariant is enforced here,
/// at the boundary, so no malformed result can ever leave the pipeline.
pub struct ResultEmitter {
    sender: broadcast::Sender<ScanResult>,
}

impl ResultEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the emitted result stream
    pub fn subscribe(&self) -> broadcast::Receiver<ScanResult> {
        self.sender.subscribe()
    }

    /// Emit a result to all subscribers.
    ///
    /// Emitting with no subscribers is not an error; scanning continues
    /// whether or not anyone is currently listening.
    pub fn emit(&self, result: ScanResult) -> Result<()> {
        if !result.is_valid() {
            return Err(ScancamError::component(
                "emitter",
                "ScanResult must carry at least one of barcode or text",
            ));
        }

        match &result.barcode {
            Some(barcode) => info!(
                "Emitting result {}: '{}' ({}){}",
                result.scan_id,
                barcode.value,
                barcode.format,
                if result.text.is_some() {
                    " [enriched]"
                } else {
                    ""
                }
            ),
            None => info!("Emitting text-only result {}", result.scan_id),
        }

        if self.sender.send(result).is_err() {
            debug!("No result subscribers, emission dropped");
        }
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for ResultEmitter {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}
