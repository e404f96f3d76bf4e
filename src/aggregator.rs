use crate::detection::{Candidate, RawDetection};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Collects raw detections from all active decoders over one arbitration
/// window.
///
/// Detections are deduplicated by exact value: a repeat observation
/// increments the candidate's hit count in place and keeps its original
/// `first_seen`. Every observation re-arms the flush deadline `window` after
/// the most recent observation, so the window behaves as a debounce with no
/// maximum wait. The aggregator is pure state; the owning pipeline task
/// drives the deadline and serializes `observe()` calls.
pub struct CandidateAggregator {
    candidates: HashMap<String, Candidate>,
    window: Duration,
    deadline: Option<Instant>,
}

impl CandidateAggregator {
    pub fn new(window: Duration) -> Self {
        Self {
            candidates: HashMap::new(),
            window,
            deadline: None,
        }
    }

    /// Insert or update the candidate keyed by the detection's value and
    /// re-arm the flush deadline. Returns the candidate's hit count after
    /// the update.
    pub fn observe(&mut self, detection: RawDetection) -> u32 {
        let now = Instant::now();
        self.deadline = Some(now + self.window);

        let hit_count = match self.candidates.get_mut(&detection.value) {
            Some(candidate) => {
                candidate.hit_count += 1;
                trace!(
                    "Candidate '{}' hit count now {}",
                    candidate.value,
                    candidate.hit_count
                );
                candidate.hit_count
            }
            None => {
                let candidate = Candidate::from_detection(&detection, now);
                debug!(
                    "New candidate '{}' ({}) from {}",
                    candidate.value, candidate.format, candidate.source
                );
                self.candidates.insert(detection.value.clone(), candidate);
                1
            }
        };

        hit_count
    }

    /// The instant the pending flush is due, if a window is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Hand back the full candidate set and clear all state.
    ///
    /// Clearing is unconditional: even when selection rejects every
    /// candidate, the aggregator never carries stale state into the next
    /// round.
    pub fn flush(&mut self) -> Vec<Candidate> {
        self.deadline = None;
        let candidates: Vec<Candidate> = self.candidates.drain().map(|(_, c)| c).collect();
        debug!("Flushed {} candidate(s)", candidates.len());
        candidates
    }

    /// Drop all pending state without producing candidates (pipeline reset).
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.deadline = None;
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
