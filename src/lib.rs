pub mod aggregator;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod emitter;
pub mod enrichment;
pub mod error;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod selection;
pub mod suppressor;

pub use aggregator::CandidateAggregator;
pub use config::{ArbitrationConfig, CooldownConfig, EnrichmentConfig, ScancamConfig, SystemConfig};
pub use decoder::{DecoderAdapter, DecoderHandle, ScriptedDecoder, ScriptedDetection};
pub use detection::{
    AcceptedScan, Barcode, Candidate, DecoderId, RawDetection, ScanResult, TextExtraction,
};
pub use emitter::ResultEmitter;
pub use enrichment::{
    EnrichmentCoordinator, HttpTextExtractor, MockTextExtractor, ProcessingState, TextExtractor,
};
pub use error::{CameraError, EnrichmentError, EventBusError, Result, ScancamError};
pub use events::{EventBus, EventFilter, EventReceiver, ScanEvent, SuppressReason};
pub use frame::{
    FailingFrameSource, FrameSnapshot, FrameSource, SnapshotFormat, StaticFrameSource,
};
pub use pipeline::ScanPipeline;
pub use selection::SelectionPolicy;
pub use suppressor::{DuplicateSuppressor, SuppressDecision};
