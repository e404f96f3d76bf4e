use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};
use uuid::Uuid;

/// Identifier of the decoder engine that produced a detection.
pub type DecoderId = String;

/// A single successful decode of one video frame.
///
/// Ephemeral: raw detections exist only on their way into the candidate
/// aggregator and are not retained beyond aggregation. A frame that fails to
/// decode produces no `RawDetection` at all; that is the common case, not an
/// error.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub value: String,
    pub format: String,
    pub source: DecoderId,
    pub observed_at: SystemTime,
    /// Engine-specific decode quality signal, lower is better. Not all
    /// engines report one.
    pub quality_error: Option<f64>,
}

impl RawDetection {
    pub fn new<S: Into<String>>(value: S, format: S, source: S) -> Self {
        Self {
            value: value.into(),
            format: format.into(),
            source: source.into(),
            observed_at: SystemTime::now(),
            quality_error: None,
        }
    }

    pub fn with_quality(mut self, quality_error: f64) -> Self {
        self.quality_error = Some(quality_error);
        self
    }
}

/// An aggregated detection competing within one arbitration window.
///
/// Keyed by `value`; repeated detections of the same value increment
/// `hit_count` in place. Owned exclusively by the aggregator and destroyed by
/// the selection decision at window flush.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub value: String,
    pub format: String,
    pub source: DecoderId,
    pub hit_count: u32,
    pub first_seen: Instant,
}

impl Candidate {
    pub fn from_detection(detection: &RawDetection, now: Instant) -> Self {
        Self {
            value: detection.value.clone(),
            format: detection.format.clone(),
            source: detection.source.clone(),
            hit_count: 1,
            first_seen: now,
        }
    }
}

/// The most recently accepted barcode. Exactly one instance lives at a time,
/// overwritten on each new acceptance; consulted only by the duplicate
/// suppressor.
#[derive(Debug, Clone)]
pub struct AcceptedScan {
    pub value: String,
    pub format: String,
    pub selected_at: Instant,
}

/// A decoded barcode value/format pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barcode {
    pub value: String,
    pub format: String,
}

/// Terminal outcome of the text-extraction step.
///
/// The three states stay distinguishable all the way to the consumer:
/// extraction that succeeded but found nothing is not the same thing as
/// extraction that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TextExtraction {
    /// The service returned extracted text.
    Text(String),
    /// The service succeeded but found no text in the image.
    NoText,
    /// The extraction call failed (network, timeout, parse). Carries the
    /// failure description; never retried.
    Failed(String),
}

impl TextExtraction {
    pub fn is_failure(&self) -> bool {
        matches!(self, TextExtraction::Failed(_))
    }
}

/// The externally visible unit of output.
///
/// The pipeline emits twice per accepted barcode: a barcode-only result
/// immediately on acceptance, then a second result carrying the same barcode
/// plus the `TextExtraction` outcome once enrichment resolves. Both share the
/// same `scan_id`. Text-only results are valid for a pure OCR capture path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: Uuid,
    pub barcode: Option<Barcode>,
    pub text: Option<TextExtraction>,
    pub accepted_at: SystemTime,
}

impl ScanResult {
    /// A barcode-only result, emitted immediately on acceptance.
    pub fn barcode_only(scan_id: Uuid, barcode: Barcode) -> Self {
        Self {
            scan_id,
            barcode: Some(barcode),
            text: None,
            accepted_at: SystemTime::now(),
        }
    }

    /// The enriched follow-up result for the same accepted barcode.
    pub fn enriched(scan_id: Uuid, barcode: Barcode, text: TextExtraction) -> Self {
        Self {
            scan_id,
            barcode: Some(barcode),
            text: Some(text),
            accepted_at: SystemTime::now(),
        }
    }

    /// A text-only result for the OCR capture path.
    pub fn text_only(text: TextExtraction) -> Self {
        Self {
            scan_id: Uuid::new_v4(),
            barcode: None,
            text: Some(text),
            accepted_at: SystemTime::now(),
        }
    }

    /// At least one of barcode/text must be present when emitted.
    pub fn is_valid(&self) -> bool {
        self.barcode.is_some() || self.text.is_some()
    }
}
