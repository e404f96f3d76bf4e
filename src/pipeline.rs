use crate::aggregator::CandidateAggregator;
use crate::config::ScancamConfig;
use crate::decoder::{DecoderAdapter, DecoderHandle};
use crate::detection::{Barcode, RawDetection, ScanResult};
use crate::emitter::ResultEmitter;
use crate::enrichment::{EnrichmentCoordinator, ProcessingState, TextExtractor};
use crate::error::{Result, ScancamError};
use crate::events::{EventBus, ScanEvent, SuppressReason};
use crate::frame::FrameSource;
use crate::selection::SelectionPolicy;
use crate::suppressor::{DuplicateSuppressor, SuppressDecision};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Control messages for the arbitration task.
enum PipelineCommand {
    /// Clear the current window without arbitrating it (camera switch).
    Reset,
}

/// State moved into the arbitration task when the pipeline starts.
struct ArbitrationParts {
    aggregator: CandidateAggregator,
    policy: SelectionPolicy,
    suppressor: DuplicateSuppressor,
    detections_rx: mpsc::Receiver<RawDetection>,
    commands_rx: mpsc::Receiver<PipelineCommand>,
}

/// The detection arbitration and duplicate-suppression pipeline.
///
/// Decoder adapters feed raw detections into a single mpsc channel; one
/// arbitration task consumes it, which serializes all `observe()` calls. The
/// debounce deadline is driven by `select!` over the channel and a
/// `sleep_until`, so every new observation cancels and reschedules the
/// pending flush. When the window fires, selection and duplicate suppression
/// run inline, a barcode-only result is emitted immediately, and enrichment
/// is launched fire-and-forget.
pub struct ScanPipeline {
    config: ScancamConfig,
    event_bus: EventBus,
    emitter: ResultEmitter,
    coordinator: Arc<EnrichmentCoordinator>,
    frame_source: Arc<dyn FrameSource>,
    detections_tx: mpsc::Sender<RawDetection>,
    commands_tx: mpsc::Sender<PipelineCommand>,
    parts: Mutex<Option<ArbitrationParts>>,
    task: Mutex<Option<JoinHandle<()>>>,
    decoders: Mutex<Vec<DecoderHandle>>,
    cancel: CancellationToken,
}

impl ScanPipeline {
    /// Create a pipeline from configuration and its two external
    /// collaborators: the frame source and the text extractor.
    pub fn new(
        config: ScancamConfig,
        frame_source: Arc<dyn FrameSource>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self> {
        config.validate()?;

        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let emitter = ResultEmitter::new(config.system.result_channel_capacity);
        let coordinator = Arc::new(EnrichmentCoordinator::new(
            extractor,
            config.enrichment.prompt.clone(),
            emitter.clone(),
            event_bus.clone(),
        ));

        let (detections_tx, detections_rx) =
            mpsc::channel(config.system.detection_channel_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(4);

        let parts = ArbitrationParts {
            aggregator: CandidateAggregator::new(config.arbitration.window()),
            policy: SelectionPolicy::new(config.arbitration.high_priority_formats.clone()),
            suppressor: DuplicateSuppressor::new(config.cooldown.cooldown()),
            detections_rx,
            commands_rx,
        };

        Ok(Self {
            config,
            event_bus,
            emitter,
            coordinator,
            frame_source,
            detections_tx,
            commands_tx,
            parts: Mutex::new(Some(parts)),
            task: Mutex::new(None),
            decoders: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the arbitration task. Idempotent; a second call is a no-op.
    pub async fn start(&self) -> Result<()> {
        let parts = match self.parts.lock().await.take() {
            Some(parts) => parts,
            None => {
                warn!("Scan pipeline is already running");
                return Ok(());
            }
        };

        info!(
            "Starting scan pipeline (window: {}ms, cooldown: {}ms, single_flight: {})",
            self.config.arbitration.window_ms,
            self.config.cooldown.cooldown_ms,
            self.config.cooldown.single_flight
        );

        let task = tokio::spawn(arbitration_loop(
            parts,
            self.event_bus.clone(),
            self.emitter.clone(),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.frame_source),
            self.coordinator.processing_state(),
            self.config.cooldown.single_flight,
            self.cancel.clone(),
        ));

        *self.task.lock().await = Some(task);
        Ok(())
    }

    /// Bind a decoder adapter to the shared frame source and start its
    /// decode loop.
    pub async fn attach_decoder(&self, adapter: Arc<dyn DecoderAdapter>) {
        let handle = DecoderHandle::spawn(
            adapter,
            Arc::clone(&self.frame_source),
            self.detections_tx.clone(),
            &self.cancel,
        );
        self.decoders.lock().await.push(handle);
    }

    /// Sink for callback-driven decoder engines that push detections
    /// directly instead of running an adapter loop.
    pub fn detections(&self) -> mpsc::Sender<RawDetection> {
        self.detections_tx.clone()
    }

    /// Subscribe to the emitted result stream.
    pub fn subscribe_results(&self) -> broadcast::Receiver<ScanResult> {
        self.emitter.subscribe()
    }

    /// Subscribe to pipeline lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_bus.subscribe()
    }

    pub fn processing_state(&self) -> ProcessingState {
        self.coordinator.processing_state()
    }

    /// Reset for a camera switch: stop all decoders, cancel the pending
    /// arbitration window and clear its candidates. The duplicate
    /// suppressor's state is left untouched, so the cooldown persists across
    /// the switch.
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting scan pipeline");

        let handles = std::mem::take(&mut *self.decoders.lock().await);
        for handle in handles {
            handle.stop().await;
        }

        self.commands_tx
            .send(PipelineCommand::Reset)
            .await
            .map_err(|_| ScancamError::system("Arbitration task is not running"))?;

        Ok(())
    }

    /// Capture a still and run text extraction directly, without any
    /// barcode involvement (pure OCR path). Emits a text-only result.
    pub async fn capture_text(&self) -> Result<ScanResult> {
        let snapshot = self
            .frame_source
            .snapshot()
            .await
            .map_err(ScancamError::Camera)?;

        let outcome = self.coordinator.extract_once(&snapshot).await;
        let result = ScanResult::text_only(outcome);
        self.emitter.emit(result.clone())?;
        Ok(result)
    }

    /// Stop decoders and the arbitration task.
    pub async fn shutdown(&self, reason: &str) {
        self.event_bus.publish_lossy(ScanEvent::ShutdownRequested {
            timestamp: SystemTime::now(),
            reason: reason.to_string(),
        });

        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.decoders.lock().await);
        for handle in handles {
            handle.stop().await;
        }

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Arbitration task ended abnormally: {}", e);
            }
        }

        info!("Scan pipeline shut down");
    }
}

#[allow(clippy::too_many_arguments)]
async fn arbitration_loop(
    mut parts: ArbitrationParts,
    event_bus: EventBus,
    emitter: ResultEmitter,
    coordinator: Arc<EnrichmentCoordinator>,
    frame_source: Arc<dyn FrameSource>,
    processing_state: ProcessingState,
    single_flight: bool,
    cancel: CancellationToken,
) {
    debug!("Arbitration loop started");

    loop {
        // Copy the deadline out so the timer future holds no borrow on the
        // aggregator while the select! arms run.
        let deadline = parts.aggregator.deadline();
        let pending_flush = async move {
            match deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            // Reset commands outrank detections already buffered behind
            // them; a pre-switch detection must not survive the switch.
            biased;

            _ = cancel.cancelled() => {
                debug!("Arbitration loop cancelled");
                break;
            }
            Some(command) = parts.commands_rx.recv() => {
                match command {
                    PipelineCommand::Reset => {
                        while parts.detections_rx.try_recv().is_ok() {}
                        parts.aggregator.clear();
                        event_bus.publish_lossy(ScanEvent::PipelineReset {
                            timestamp: SystemTime::now(),
                        });
                    }
                }
            }
            maybe_detection = parts.detections_rx.recv() => {
                match maybe_detection {
                    Some(detection) => {
                        event_bus.publish_lossy(ScanEvent::DetectionObserved {
                            value: detection.value.clone(),
                            format: detection.format.clone(),
                            source: detection.source.clone(),
                            timestamp: detection.observed_at,
                        });
                        parts.aggregator.observe(detection);
                    }
                    None => {
                        debug!("Detection channel closed, arbitration loop ending");
                        break;
                    }
                }
            }
            _ = pending_flush => {
                arbitrate_window(
                    &mut parts,
                    &event_bus,
                    &emitter,
                    &coordinator,
                    &frame_source,
                    &processing_state,
                    single_flight,
                ).await;
            }
        }
    }
}

/// One window flush: selection, suppression, emission, enrichment launch.
async fn arbitrate_window(
    parts: &mut ArbitrationParts,
    event_bus: &EventBus,
    emitter: &ResultEmitter,
    coordinator: &Arc<EnrichmentCoordinator>,
    frame_source: &Arc<dyn FrameSource>,
    processing_state: &ProcessingState,
    single_flight: bool,
) {
    let candidates = parts.aggregator.flush();
    event_bus.publish_lossy(ScanEvent::WindowFlushed {
        candidate_count: candidates.len(),
        timestamp: SystemTime::now(),
    });

    let winner = match parts.policy.select(candidates) {
        Some(winner) => winner,
        None => return,
    };

    if single_flight && processing_state.is_busy() {
        event_bus.publish_lossy(ScanEvent::ScanSuppressed {
            value: winner.value,
            reason: SuppressReason::EnrichmentBusy,
            timestamp: SystemTime::now(),
        });
        return;
    }

    match parts.suppressor.evaluate(&winner, Instant::now()) {
        SuppressDecision::Accept => {}
        SuppressDecision::DuplicateWithinCooldown => {
            event_bus.publish_lossy(ScanEvent::ScanSuppressed {
                value: winner.value,
                reason: SuppressReason::Cooldown,
                timestamp: SystemTime::now(),
            });
            return;
        }
    }

    let scan_id = Uuid::new_v4();
    let barcode = Barcode {
        value: winner.value,
        format: winner.format,
    };

    event_bus.publish_lossy(ScanEvent::ScanAccepted {
        scan_id,
        value: barcode.value.clone(),
        format: barcode.format.clone(),
        timestamp: SystemTime::now(),
    });

    // Newer acceptances supersede any enrichment still in flight, even if
    // this scan itself ends up barcode-only.
    coordinator.note_accepted(scan_id).await;

    // Fast path: the barcode-only result goes out before enrichment starts.
    if let Err(e) = emitter.emit(ScanResult::barcode_only(scan_id, barcode.clone())) {
        error!("Failed to emit barcode result: {}", e);
        return;
    }

    match frame_source.snapshot().await {
        Ok(snapshot) => {
            coordinator.spawn(scan_id, barcode, snapshot);
        }
        Err(e) => {
            // Downgrade to barcode-only; no retry.
            warn!("Snapshot capture failed, skipping enrichment: {}", e);
            if e.is_fatal() {
                event_bus.publish_lossy(ScanEvent::CameraUnavailable {
                    message: e.user_message().to_string(),
                    timestamp: SystemTime::now(),
                });
            } else {
                event_bus.publish_lossy(ScanEvent::SystemError {
                    component: "capture".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScancamConfig;
    use crate::decoder::{ScriptedDecoder, ScriptedDetection};
    use crate::detection::TextExtraction;
    use crate::enrichment::MockTextExtractor;
    use crate::error::CameraError;
    use crate::frame::{FailingFrameSource, FrameSnapshot, SnapshotFormat, StaticFrameSource};
    use std::time::Duration;
    use tokio::time::timeout;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn test_config(window_ms: u64, cooldown_ms: u64) -> ScancamConfig {
        let mut config = ScancamConfig::default();
        config.arbitration.window_ms = window_ms;
        config.cooldown.cooldown_ms = cooldown_ms;
        config
    }

    fn static_source() -> Arc<dyn FrameSource> {
        Arc::new(StaticFrameSource::new(FrameSnapshot::new(
            vec![0u8; 64],
            640,
            480,
            SnapshotFormat::Jpeg,
        )))
    }

    async fn recv_result(
        rx: &mut broadcast::Receiver<ScanResult>,
    ) -> ScanResult {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for result")
            .expect("result channel closed")
    }

    #[tokio::test]
    async fn test_high_priority_candidate_wins_across_decoders() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(60, 3000),
            static_source(),
            Arc::new(MockTextExtractor::returning_text("TRACKING LABEL")),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        pipeline.start().await.unwrap();

        // Decoder A votes twice for a short EAN; decoder B sees a Code 128
        // tracking number once.
        pipeline
            .attach_decoder(Arc::new(ScriptedDecoder::new(
                "decoder-a",
                vec![
                    ScriptedDetection::new(Duration::ZERO, "111", "ean"),
                    ScriptedDetection::new(Duration::from_millis(20), "111", "ean"),
                ],
            )))
            .await;
        pipeline
            .attach_decoder(Arc::new(ScriptedDecoder::new(
                "decoder-b",
                vec![ScriptedDetection::new(
                    Duration::from_millis(10),
                    "999999999999999999",
                    "code_128",
                )],
            )))
            .await;

        let partial = recv_result(&mut results).await;
        let partial_barcode = partial.barcode.unwrap();
        assert_eq!(partial_barcode.value, "999999999999999999");
        assert_eq!(partial_barcode.format, "code_128");
        assert!(partial.text.is_none());

        let enriched = recv_result(&mut results).await;
        assert_eq!(enriched.scan_id, partial.scan_id);
        assert_eq!(
            enriched.text,
            Some(TextExtraction::Text("TRACKING LABEL".to_string()))
        );

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_duplicate_within_cooldown_is_not_reemitted() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 5000),
            static_source(),
            Arc::new(MockTextExtractor::returning_no_text()),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        let mut events = pipeline.subscribe_events();
        pipeline.start().await.unwrap();

        // Same value in two bursts separated by more than the window but far
        // less than the cooldown.
        pipeline
            .attach_decoder(Arc::new(ScriptedDecoder::new(
                "decoder-a",
                vec![
                    ScriptedDetection::new(Duration::ZERO, "ABC123", "code_128"),
                    ScriptedDetection::new(Duration::from_millis(120), "ABC123", "code_128"),
                ],
            )))
            .await;

        let first = recv_result(&mut results).await;
        assert_eq!(first.barcode.as_ref().unwrap().value, "ABC123");

        let suppressed = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.expect("event bus closed") {
                    ScanEvent::ScanSuppressed { value, reason, .. } => break (value, reason),
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for suppression");
        assert_eq!(suppressed.0, "ABC123");
        assert_eq!(suppressed.1, SuppressReason::Cooldown);

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_different_value_accepted_during_cooldown() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 5000),
            static_source(),
            Arc::new(MockTextExtractor::returning_no_text()),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        pipeline.start().await.unwrap();

        pipeline
            .attach_decoder(Arc::new(ScriptedDecoder::new(
                "decoder-a",
                vec![
                    ScriptedDetection::new(Duration::ZERO, "FIRST", "code_128"),
                    ScriptedDetection::new(Duration::from_millis(120), "SECOND", "code_128"),
                ],
            )))
            .await;

        let first = recv_result(&mut results).await;
        assert_eq!(first.barcode.as_ref().unwrap().value, "FIRST");

        // Skip the enriched follow-up for FIRST, then expect SECOND.
        let mut next = recv_result(&mut results).await;
        while next.barcode.as_ref().unwrap().value == "FIRST" {
            next = recv_result(&mut results).await;
        }
        assert_eq!(next.barcode.as_ref().unwrap().value, "SECOND");

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_snapshot_failure_downgrades_to_barcode_only() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 3000),
            Arc::new(FailingFrameSource::new(CameraError::SnapshotFailed {
                details: "no frame available".to_string(),
            })),
            Arc::new(MockTextExtractor::returning_text("NEVER USED")),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        let mut events = pipeline.subscribe_events();
        pipeline.start().await.unwrap();

        pipeline
            .attach_decoder(Arc::new(ScriptedDecoder::new(
                "decoder-a",
                vec![ScriptedDetection::new(Duration::ZERO, "555", "ean")],
            )))
            .await;

        let partial = recv_result(&mut results).await;
        assert_eq!(partial.barcode.as_ref().unwrap().value, "555");
        assert!(partial.text.is_none());

        // Enrichment is skipped entirely: no started event, no second result.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(results.try_recv().is_err());
        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "enrichment_started" {
                saw_started = true;
            }
        }
        assert!(!saw_started);

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_reset_clears_window_but_keeps_cooldown() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 5000),
            static_source(),
            Arc::new(MockTextExtractor::returning_no_text()),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        pipeline.start().await.unwrap();

        let detections = pipeline.detections();
        detections
            .send(RawDetection::new("ABC123", "code_128", "native"))
            .await
            .unwrap();

        let first = recv_result(&mut results).await;
        assert_eq!(first.barcode.as_ref().unwrap().value, "ABC123");

        // Camera switch: cooldown must survive the reset.
        pipeline.reset().await.unwrap();

        detections
            .send(RawDetection::new("ABC123", "code_128", "native"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Only enrichment follow-ups for the first acceptance may appear;
        // no new partial for the duplicate.
        let mut accepted = 0;
        while let Ok(result) = results.try_recv() {
            if result.text.is_none() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 0);

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_reset_discards_detections_buffered_before_it() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 3000),
            static_source(),
            Arc::new(MockTextExtractor::returning_no_text()),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();

        // A detection from the old camera is still queued when the reset
        // arrives; it must not open a window after the switch.
        pipeline
            .detections()
            .send(RawDetection::new("OLDCAM", "ean", "native"))
            .await
            .unwrap();
        pipeline.reset().await.unwrap();
        pipeline.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(results.try_recv().is_err());

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_single_flight_blocks_new_acceptance_while_enriching() {
        init_tracing();
        let mut config = test_config(30, 3000);
        config.cooldown.single_flight = true;

        let pipeline = ScanPipeline::new(
            config,
            static_source(),
            Arc::new(
                MockTextExtractor::returning_text("SLOW").with_delay(Duration::from_millis(300)),
            ),
        )
        .unwrap();
        let mut events = pipeline.subscribe_events();
        pipeline.start().await.unwrap();

        let detections = pipeline.detections();
        detections
            .send(RawDetection::new("FIRST", "code_128", "native"))
            .await
            .unwrap();

        // Wait for the first acceptance, then present a different barcode
        // while its enrichment is still in flight.
        timeout(Duration::from_secs(2), async {
            loop {
                if let ScanEvent::ScanAccepted { .. } =
                    events.recv().await.expect("event bus closed")
                {
                    break;
                }
            }
        })
        .await
        .expect("first scan was never accepted");

        detections
            .send(RawDetection::new("SECOND", "code_128", "native"))
            .await
            .unwrap();

        let suppressed = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await.expect("event bus closed") {
                    ScanEvent::ScanSuppressed { value, reason, .. } => break (value, reason),
                    _ => continue,
                }
            }
        })
        .await
        .expect("timed out waiting for suppression");
        assert_eq!(suppressed.0, "SECOND");
        assert_eq!(suppressed.1, SuppressReason::EnrichmentBusy);

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_capture_text_emits_text_only_result() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 3000),
            static_source(),
            Arc::new(MockTextExtractor::returning_text("HANDWRITTEN NOTE")),
        )
        .unwrap();
        let mut results = pipeline.subscribe_results();
        pipeline.start().await.unwrap();

        let result = pipeline.capture_text().await.unwrap();
        assert!(result.barcode.is_none());
        assert_eq!(
            result.text,
            Some(TextExtraction::Text("HANDWRITTEN NOTE".to_string()))
        );

        let emitted = recv_result(&mut results).await;
        assert_eq!(emitted.scan_id, result.scan_id);

        pipeline.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        init_tracing();
        let pipeline = ScanPipeline::new(
            test_config(40, 3000),
            static_source(),
            Arc::new(MockTextExtractor::returning_no_text()),
        )
        .unwrap();

        pipeline.start().await.unwrap();
        pipeline.start().await.unwrap();

        pipeline.shutdown("test done").await;
    }
}
