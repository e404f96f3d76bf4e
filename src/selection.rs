use crate::detection::Candidate;
use std::collections::HashSet;
use tracing::debug;

/// Picks exactly one winner from the candidate set of an arbitration window.
///
/// High-priority formats (long-identifier symbologies such as Code 128
/// shipping labels) always out-rank the rest: when any high-priority
/// candidate was seen in the window, every other format is discarded outright
/// regardless of hit count. Survivors are ordered by descending value length,
/// then descending hit count. The final tie-break on value keeps the ordering
/// total and deterministic.
pub struct SelectionPolicy {
    high_priority_formats: HashSet<String>,
}

impl SelectionPolicy {
    pub fn new<I, S>(high_priority_formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            high_priority_formats: high_priority_formats.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_high_priority(&self, format: &str) -> bool {
        self.high_priority_formats.contains(format)
    }

    /// Select at most one winning candidate. Consumes the set; an empty set
    /// selects nothing.
    pub fn select(&self, mut candidates: Vec<Candidate>) -> Option<Candidate> {
        if candidates.is_empty() {
            return None;
        }

        let has_high_priority = candidates
            .iter()
            .any(|c| self.is_high_priority(&c.format));
        if has_high_priority {
            let before = candidates.len();
            candidates.retain(|c| self.is_high_priority(&c.format));
            if candidates.len() < before {
                debug!(
                    "Discarded {} lower-priority candidate(s)",
                    before - candidates.len()
                );
            }
        }

        candidates.sort_by(|a, b| {
            b.value
                .len()
                .cmp(&a.value.len())
                .then_with(|| b.hit_count.cmp(&a.hit_count))
                .then_with(|| a.value.cmp(&b.value))
        });

        let winner = candidates.into_iter().next();
        if let Some(ref winner) = winner {
            debug!(
                "Selected '{}' ({}, {} hit(s))",
                winner.value, winner.format, winner.hit_count
            );
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn candidate(value: &str, format: &str, hit_count: u32) -> Candidate {
        Candidate {
            value: value.to_string(),
            format: format.to_string(),
            source: "native".to_string(),
            hit_count,
            first_seen: Instant::now(),
        }
    }

    fn policy() -> SelectionPolicy {
        SelectionPolicy::new(vec!["code_128"])
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        assert!(policy().select(Vec::new()).is_none());
    }

    #[test]
    fn test_high_priority_format_overrides_hit_count() {
        // Decoder A hit "111" twice; decoder B saw a Code 128 tracking label
        // once. The label must win.
        let candidates = vec![
            candidate("111", "ean", 2),
            candidate("999999999999999999", "code_128", 1),
        ];

        let winner = policy().select(candidates).unwrap();
        assert_eq!(winner.value, "999999999999999999");
        assert_eq!(winner.format, "code_128");
    }

    #[test]
    fn test_high_priority_never_loses_to_any_hit_count() {
        let candidates = vec![
            candidate("55555555", "ean", 50),
            candidate("AB", "code_128", 1),
        ];

        // Even a shorter value wins once its format partitions everything
        // else out of consideration.
        let winner = policy().select(candidates).unwrap();
        assert_eq!(winner.format, "code_128");
    }

    #[test]
    fn test_longest_value_wins_without_high_priority() {
        let candidates = vec![
            candidate("12345", "ean", 9),
            candidate("1234567890", "upc_a", 1),
        ];

        let winner = policy().select(candidates).unwrap();
        assert_eq!(winner.value, "1234567890");
    }

    #[test]
    fn test_length_tie_broken_by_hit_count() {
        let candidates = vec![
            candidate("AAAAA", "ean", 2),
            candidate("BBBBB", "ean", 5),
        ];

        let winner = policy().select(candidates).unwrap();
        assert_eq!(winner.value, "BBBBB");
    }

    #[test]
    fn test_full_tie_is_deterministic() {
        let a = vec![candidate("AAA", "ean", 3), candidate("BBB", "ean", 3)];
        let b = vec![candidate("BBB", "ean", 3), candidate("AAA", "ean", 3)];

        let winner_a = policy().select(a).unwrap();
        let winner_b = policy().select(b).unwrap();
        assert_eq!(winner_a.value, winner_b.value);
    }

    #[test]
    fn test_ordering_among_high_priority_candidates() {
        let candidates = vec![
            candidate("SHORT", "code_128", 4),
            candidate("MUCHLONGERVALUE", "code_128", 1),
        ];

        let winner = policy().select(candidates).unwrap();
        assert_eq!(winner.value, "MUCHLONGERVALUE");
    }

    #[test]
    fn test_single_candidate_after_repeat_hits() {
        let winner = policy()
            .select(vec![candidate("555", "ean", 3)])
            .unwrap();
        assert_eq!(winner.value, "555");
        assert_eq!(winner.hit_count, 3);
    }
}
