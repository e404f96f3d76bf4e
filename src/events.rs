use crate::error::EventBusError;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a winning candidate was dropped instead of accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressReason {
    /// Same value as the last accepted scan, still inside the cooldown.
    Cooldown,
    /// An enrichment call is in flight and single-flight mode is enabled.
    EnrichmentBusy,
}

/// Events that can occur in the scanning pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
    /// A decoder produced a raw detection that entered the current window
    DetectionObserved {
        value: String,
        format: String,
        source: String,
        timestamp: SystemTime,
    },
    /// The arbitration window elapsed and its candidate set was handed to
    /// the selection policy
    WindowFlushed {
        candidate_count: usize,
        timestamp: SystemTime,
    },
    /// A winning candidate passed duplicate suppression
    ScanAccepted {
        scan_id: Uuid,
        value: String,
        format: String,
        timestamp: SystemTime,
    },
    /// A winning candidate was silently dropped
    ScanSuppressed {
        value: String,
        reason: SuppressReason,
        timestamp: SystemTime,
    },
    /// Text extraction started for an accepted scan
    EnrichmentStarted { scan_id: Uuid, value: String },
    /// Text extraction resolved for an accepted scan
    EnrichmentCompleted { scan_id: Uuid, found_text: bool },
    /// Text extraction failed for an accepted scan
    EnrichmentFailed { scan_id: Uuid, error: String },
    /// An enrichment resolution arrived after a newer acceptance and was
    /// discarded as stale
    EnrichmentDiscarded { scan_id: Uuid },
    /// The camera became unavailable; the session cannot continue
    CameraUnavailable {
        message: String,
        timestamp: SystemTime,
    },
    /// The pipeline was reset (e.g. camera facing-mode switch)
    PipelineReset { timestamp: SystemTime },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// Pipeline shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl ScanEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> SystemTime {
        match self {
            ScanEvent::DetectionObserved { timestamp, .. } => *timestamp,
            ScanEvent::WindowFlushed { timestamp, .. } => *timestamp,
            ScanEvent::ScanAccepted { timestamp, .. } => *timestamp,
            ScanEvent::ScanSuppressed { timestamp, .. } => *timestamp,
            ScanEvent::EnrichmentStarted { .. } => SystemTime::now(),
            ScanEvent::EnrichmentCompleted { .. } => SystemTime::now(),
            ScanEvent::EnrichmentFailed { .. } => SystemTime::now(),
            ScanEvent::EnrichmentDiscarded { .. } => SystemTime::now(),
            ScanEvent::CameraUnavailable { timestamp, .. } => *timestamp,
            ScanEvent::PipelineReset { timestamp } => *timestamp,
            ScanEvent::SystemError { .. } => SystemTime::now(),
            ScanEvent::ShutdownRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ScanEvent::DetectionObserved { value, source, .. } => {
                format!("Detection '{}' observed from {}", value, source)
            }
            ScanEvent::WindowFlushed {
                candidate_count, ..
            } => {
                format!("Window flushed with {} candidate(s)", candidate_count)
            }
            ScanEvent::ScanAccepted { value, format, .. } => {
                format!("Scan accepted: '{}' ({})", value, format)
            }
            ScanEvent::ScanSuppressed { value, reason, .. } => {
                format!("Scan suppressed: '{}' ({:?})", value, reason)
            }
            ScanEvent::EnrichmentStarted { scan_id, .. } => {
                format!("Enrichment started: {}", scan_id)
            }
            ScanEvent::EnrichmentCompleted {
                scan_id,
                found_text,
            } => {
                format!(
                    "Enrichment completed: {} ({})",
                    scan_id,
                    if *found_text { "text found" } else { "no text" }
                )
            }
            ScanEvent::EnrichmentFailed { scan_id, error } => {
                format!("Enrichment failed: {} ({})", scan_id, error)
            }
            ScanEvent::EnrichmentDiscarded { scan_id } => {
                format!("Stale enrichment discarded: {}", scan_id)
            }
            ScanEvent::CameraUnavailable { message, .. } => {
                format!("Camera unavailable: {}", message)
            }
            ScanEvent::PipelineReset { .. } => "Pipeline reset".to_string(),
            ScanEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            ScanEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::DetectionObserved { .. } => "detection_observed",
            ScanEvent::WindowFlushed { .. } => "window_flushed",
            ScanEvent::ScanAccepted { .. } => "scan_accepted",
            ScanEvent::ScanSuppressed { .. } => "scan_suppressed",
            ScanEvent::EnrichmentStarted { .. } => "enrichment_started",
            ScanEvent::EnrichmentCompleted { .. } => "enrichment_completed",
            ScanEvent::EnrichmentFailed { .. } => "enrichment_failed",
            ScanEvent::EnrichmentDiscarded { .. } => "enrichment_discarded",
            ScanEvent::CameraUnavailable { .. } => "camera_unavailable",
            ScanEvent::PipelineReset { .. } => "pipeline_reset",
            ScanEvent::SystemError { .. } => "system_error",
            ScanEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            debug_logging: true,
        }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: ScanEvent) -> Result<usize, EventBusError> {
        if self.debug_logging {
            debug!("Publishing event: {}", event.description());
        }

        // Log important events at appropriate levels
        match &event {
            ScanEvent::ScanAccepted { value, format, .. } => {
                info!("Scan accepted: '{}' ({})", value, format);
            }
            ScanEvent::ScanSuppressed { value, reason, .. } => {
                debug!("Scan suppressed: '{}' ({:?})", value, reason);
            }
            ScanEvent::EnrichmentFailed { scan_id, error } => {
                warn!("Enrichment failed for {}: {}", scan_id, error);
            }
            ScanEvent::CameraUnavailable { message, .. } => {
                error!("Camera unavailable: {}", message);
            }
            ScanEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            ScanEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Publish an event, ignoring the absence of subscribers.
    ///
    /// Lifecycle events are advisory; components must not fail because
    /// nobody is listening.
    pub fn publish_lossy(&self, event: ScanEvent) {
        let _ = self.publish(event);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
    /// Custom filter function
    Custom(fn(&ScanEvent) -> bool),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &ScanEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
            EventFilter::Custom(filter_fn) => filter_fn(event),
        }
    }
}

/// Event receiver applying a filter to a broadcast subscription
pub struct EventReceiver {
    receiver: broadcast::Receiver<ScanEvent>,
    filter: EventFilter,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<ScanEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next event passing the filter. Lagged messages are
    /// skipped; `None` means the bus was dropped.
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event receiver lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
