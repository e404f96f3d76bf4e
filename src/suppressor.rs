use crate::detection::{AcceptedScan, Candidate};
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of evaluating a winning candidate against the suppression rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressDecision {
    Accept,
    /// Same value as the last accepted scan, still inside the cooldown.
    DuplicateWithinCooldown,
}

/// Drops a still-visible barcode instead of reporting it repeatedly.
///
/// State is a single `AcceptedScan` slot overwritten on each acceptance. A
/// candidate is rejected only when it repeats the last accepted value inside
/// the cooldown; a different value is always accepted no matter how fresh the
/// previous acceptance is. The slot survives a pipeline reset so a camera
/// switch does not re-report the barcode that triggered it.
pub struct DuplicateSuppressor {
    cooldown: Duration,
    last_accepted: Option<AcceptedScan>,
}

impl DuplicateSuppressor {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_accepted: None,
        }
    }

    /// Evaluate a winning candidate at `now`. On acceptance the candidate
    /// overwrites the `AcceptedScan` slot.
    pub fn evaluate(&mut self, candidate: &Candidate, now: Instant) -> SuppressDecision {
        if let Some(ref last) = self.last_accepted {
            if last.value == candidate.value {
                let elapsed = now.saturating_duration_since(last.selected_at);
                if elapsed < self.cooldown {
                    debug!(
                        "Suppressing duplicate '{}' ({}ms into {}ms cooldown)",
                        candidate.value,
                        elapsed.as_millis(),
                        self.cooldown.as_millis()
                    );
                    return SuppressDecision::DuplicateWithinCooldown;
                }
            }
        }

        self.last_accepted = Some(AcceptedScan {
            value: candidate.value.clone(),
            format: candidate.format.clone(),
            selected_at: now,
        });
        SuppressDecision::Accept
    }

    pub fn last_accepted(&self) -> Option<&AcceptedScan> {
        self.last_accepted.as_ref()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
