use crate::config::EnrichmentConfig;
use crate::detection::{Barcode, ScanResult, TextExtraction};
use crate::emitter::ResultEmitter;
use crate::error::{EnrichmentError, Result, ScancamError};
use crate::events::{EventBus, ScanEvent};
use crate::frame::FrameSnapshot;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Seam onto the remote text-extraction service.
///
/// `Ok(Some(text))` is extracted text, `Ok(None)` means the service succeeded
/// but found no text in the image. Errors are terminal; the coordinator never
/// retries.
#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    async fn extract(
        &self,
        snapshot: &FrameSnapshot,
        prompt: &str,
    ) -> std::result::Result<Option<String>, EnrichmentError>;
}

#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    image: String,
    mime_type: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    text: Option<String>,
}

/// Production extractor calling the text-extraction service over HTTP.
///
/// One POST per accepted scan: the still image base64-encoded in a JSON body
/// alongside the fixed instruction prompt, with a bounded per-request
/// timeout. An empty or absent `text` field in the response is the service's
/// "no text found" outcome.
pub struct HttpTextExtractor {
    client: reqwest::Client,
    endpoint: String,
    timeout_ms: u64,
}

impl HttpTextExtractor {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ScancamError::component("enrichment".to_string(), e.to_string()))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout_ms: config.timeout_ms,
        })
    }
}

#[async_trait]
impl TextExtractor for HttpTextExtractor {
    async fn extract(
        &self,
        snapshot: &FrameSnapshot,
        prompt: &str,
    ) -> std::result::Result<Option<String>, EnrichmentError> {
        let request = ExtractRequest {
            image: BASE64.encode(snapshot.data.as_slice()),
            mime_type: snapshot.format.mime_type(),
            prompt,
        };

        debug!(
            "Posting {} byte snapshot to {}",
            snapshot.len(),
            self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EnrichmentError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    EnrichmentError::Network {
                        details: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Service {
                status: status.as_u16(),
                details,
            });
        }

        let parsed: ExtractResponse =
            response.json().await.map_err(|e| EnrichmentError::Parse {
                details: e.to_string(),
            })?;

        Ok(parsed.text.filter(|t| !t.trim().is_empty()))
    }
}

/// Busy/idle indicator for the enrichment cycle.
///
/// Not a queue: it counts outstanding enrichment calls so the optional
/// single-flight gate (and an embedding UI) can consult it. A counter rather
/// than a flag because concurrent mode allows calls to overlap; the state
/// reads busy until the last of them resolves.
#[derive(Clone)]
pub struct ProcessingState {
    outstanding: Arc<AtomicUsize>,
}

impl ProcessingState {
    pub fn new() -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) > 0
    }

    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn finish(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ProcessingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinates the secondary, higher-latency text-extraction step on top of
/// a primary barcode acceptance.
///
/// Calls are fire-and-forget: the arbitration pipeline never awaits them and
/// stays free to accept new candidates while one is in flight. Each call is
/// correlated by `scan_id`; a resolution that arrives after a newer scan has
/// been accepted is discarded rather than emitted, so an in-flight call can
/// never overwrite a newer result with a stale one.
pub struct EnrichmentCoordinator {
    extractor: Arc<dyn TextExtractor>,
    prompt: String,
    emitter: ResultEmitter,
    event_bus: EventBus,
    state: ProcessingState,
    latest_scan: Arc<Mutex<Option<Uuid>>>,
}

impl EnrichmentCoordinator {
    pub fn new(
        extractor: Arc<dyn TextExtractor>,
        prompt: String,
        emitter: ResultEmitter,
        event_bus: EventBus,
    ) -> Self {
        Self {
            extractor,
            prompt,
            emitter,
            event_bus,
            state: ProcessingState::new(),
            latest_scan: Arc::new(Mutex::new(None)),
        }
    }

    /// The busy/idle flag, shared with whoever needs to consult it.
    pub fn processing_state(&self) -> ProcessingState {
        self.state.clone()
    }

    /// Record that `scan_id` is now the newest accepted scan. Any enrichment
    /// still in flight for an older scan becomes stale from this point on.
    pub async fn note_accepted(&self, scan_id: Uuid) {
        *self.latest_scan.lock().await = Some(scan_id);
    }

    /// Run one extraction call inline and fold the outcome into a terminal
    /// `TextExtraction`. Used by the pure OCR capture path, which has no
    /// barcode to correlate against.
    pub async fn extract_once(&self, snapshot: &FrameSnapshot) -> TextExtraction {
        match self.extractor.extract(snapshot, &self.prompt).await {
            Ok(Some(text)) => TextExtraction::Text(text),
            Ok(None) => TextExtraction::NoText,
            Err(e) => {
                warn!("Text capture failed: {}", e);
                TextExtraction::Failed(e.to_string())
            }
        }
    }

    /// Launch exactly one extraction call for an accepted barcode.
    ///
    /// Returns the task handle for observability; the pipeline does not
    /// await it.
    pub fn spawn(
        &self,
        scan_id: Uuid,
        barcode: Barcode,
        snapshot: FrameSnapshot,
    ) -> JoinHandle<()> {
        self.state.begin();
        self.event_bus.publish_lossy(ScanEvent::EnrichmentStarted {
            scan_id,
            value: barcode.value.clone(),
        });

        let extractor = Arc::clone(&self.extractor);
        let prompt = self.prompt.clone();
        let emitter = self.emitter.clone();
        let event_bus = self.event_bus.clone();
        let state = self.state.clone();
        let latest_scan = Arc::clone(&self.latest_scan);

        tokio::spawn(async move {
            let outcome = match extractor.extract(&snapshot, &prompt).await {
                Ok(Some(text)) => {
                    info!("Extraction for {} found {} chars of text", scan_id, text.len());
                    TextExtraction::Text(text)
                }
                Ok(None) => {
                    info!("Extraction for {} found no text", scan_id);
                    TextExtraction::NoText
                }
                Err(e) => {
                    warn!("Extraction for {} failed: {}", scan_id, e);
                    event_bus.publish_lossy(ScanEvent::EnrichmentFailed {
                        scan_id,
                        error: e.to_string(),
                    });
                    TextExtraction::Failed(e.to_string())
                }
            };

            state.finish();

            // Correlate by identity, not arrival order: only the newest
            // accepted scan may be enriched.
            let is_current = *latest_scan.lock().await == Some(scan_id);
            if !is_current {
                debug!("Discarding stale enrichment for {}", scan_id);
                event_bus.publish_lossy(ScanEvent::EnrichmentDiscarded { scan_id });
                return;
            }

            if !outcome.is_failure() {
                event_bus.publish_lossy(ScanEvent::EnrichmentCompleted {
                    scan_id,
                    found_text: matches!(outcome, TextExtraction::Text(_)),
                });
            }

            let result = ScanResult::enriched(scan_id, barcode, outcome);
            if let Err(e) = emitter.emit(result) {
                warn!("Failed to emit enriched result for {}: {}", scan_id, e);
            }
        })
    }
}

/// Scripted extractor for tests and wiring without a live service.
pub struct MockTextExtractor {
    response: std::result::Result<Option<String>, EnrichmentError>,
    delay: Duration,
}

impl MockTextExtractor {
    pub fn returning_text<S: Into<String>>(text: S) -> Self {
        Self {
            response: Ok(Some(text.into())),
            delay: Duration::ZERO,
        }
    }

    pub fn returning_no_text() -> Self {
        Self {
            response: Ok(None),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(error: EnrichmentError) -> Self {
        Self {
            response: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl TextExtractor for MockTextExtractor {
    async fn extract(
        &self,
        _snapshot: &FrameSnapshot,
        _prompt: &str,
    ) -> std::result::Result<Option<String>, EnrichmentError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SnapshotFormat;

    fn snapshot() -> FrameSnapshot {
        FrameSnapshot::new(vec![0u8; 32], 640, 480, SnapshotFormat::Jpeg)
    }

    fn barcode() -> Barcode {
        Barcode {
            value: "999999999999999999".to_string(),
            format: "code_128".to_string(),
        }
    }

    fn coordinator(extractor: Arc<dyn TextExtractor>) -> (EnrichmentCoordinator, ResultEmitter, EventBus) {
        let emitter = ResultEmitter::new(8);
        let event_bus = EventBus::new(16);
        let coordinator = EnrichmentCoordinator::new(
            extractor,
            "Extract all text".to_string(),
            emitter.clone(),
            event_bus.clone(),
        );
        (coordinator, emitter, event_bus)
    }

    #[tokio::test]
    async fn test_successful_extraction_emits_enriched_result() {
        let (coordinator, emitter, event_bus) =
            coordinator(Arc::new(MockTextExtractor::returning_text("ACME PARCEL")));
        let mut results = emitter.subscribe();
        let mut events = event_bus.subscribe();

        let scan_id = Uuid::new_v4();
        coordinator.note_accepted(scan_id).await;
        coordinator
            .spawn(scan_id, barcode(), snapshot())
            .await
            .unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.scan_id, scan_id);
        assert_eq!(result.barcode, Some(barcode()));
        assert_eq!(
            result.text,
            Some(TextExtraction::Text("ACME PARCEL".to_string()))
        );

        // Started then completed, with text found
        assert_eq!(events.recv().await.unwrap().event_type(), "enrichment_started");
        match events.recv().await.unwrap() {
            ScanEvent::EnrichmentCompleted { found_text, .. } => assert!(found_text),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_text_outcome_is_distinct_from_failure() {
        let (coordinator, emitter, _bus) =
            coordinator(Arc::new(MockTextExtractor::returning_no_text()));
        let mut results = emitter.subscribe();

        let scan_id = Uuid::new_v4();
        coordinator.note_accepted(scan_id).await;
        coordinator
            .spawn(scan_id, barcode(), snapshot())
            .await
            .unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.text, Some(TextExtraction::NoText));
    }

    #[tokio::test]
    async fn test_failed_extraction_emits_failure_sentinel() {
        let (coordinator, emitter, event_bus) = coordinator(Arc::new(
            MockTextExtractor::failing(EnrichmentError::Timeout { timeout_ms: 8000 }),
        ));
        let mut results = emitter.subscribe();
        let mut events = event_bus.subscribe();

        let scan_id = Uuid::new_v4();
        coordinator.note_accepted(scan_id).await;
        coordinator
            .spawn(scan_id, barcode(), snapshot())
            .await
            .unwrap();

        let result = results.recv().await.unwrap();
        match result.text {
            Some(TextExtraction::Failed(ref details)) => {
                assert!(details.contains("8000"));
            }
            other => panic!("expected failure sentinel, got {:?}", other),
        }
        assert_ne!(result.text, Some(TextExtraction::NoText));

        assert_eq!(events.recv().await.unwrap().event_type(), "enrichment_started");
        assert_eq!(events.recv().await.unwrap().event_type(), "enrichment_failed");
    }

    #[tokio::test]
    async fn test_stale_resolution_is_discarded() {
        let (coordinator, emitter, event_bus) = coordinator(Arc::new(
            MockTextExtractor::returning_text("STALE").with_delay(Duration::from_millis(20)),
        ));
        let mut results = emitter.subscribe();
        let mut events = event_bus.subscribe();

        let old_scan = Uuid::new_v4();
        coordinator.note_accepted(old_scan).await;
        let task = coordinator.spawn(old_scan, barcode(), snapshot());

        // A newer scan is accepted while the old call is still in flight
        let new_scan = Uuid::new_v4();
        coordinator.note_accepted(new_scan).await;

        task.await.unwrap();

        assert!(results.try_recv().is_err());
        assert_eq!(events.recv().await.unwrap().event_type(), "enrichment_started");
        assert_eq!(
            events.recv().await.unwrap().event_type(),
            "enrichment_discarded"
        );
    }

    #[tokio::test]
    async fn test_processing_state_tracks_outstanding_call() {
        let (coordinator, _emitter, _bus) = coordinator(Arc::new(
            MockTextExtractor::returning_no_text().with_delay(Duration::from_millis(20)),
        ));
        let state = coordinator.processing_state();
        assert!(!state.is_busy());

        let scan_id = Uuid::new_v4();
        coordinator.note_accepted(scan_id).await;
        let task = coordinator.spawn(scan_id, barcode(), snapshot());
        assert!(state.is_busy());

        task.await.unwrap();
        assert!(!state.is_busy());
    }

    #[test]
    fn test_processing_state_stays_busy_across_overlapping_calls() {
        let state = ProcessingState::new();

        state.begin();
        state.begin();
        state.finish();
        // One call resolved, one still in flight
        assert!(state.is_busy());

        state.finish();
        assert!(!state.is_busy());
    }
}
