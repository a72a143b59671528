//! Reliability score and badge derivation (§4.3).
//!
//! Two independent mechanisms, deliberately kept apart: an event-weighted
//! `reliability_score` in `[0, 100]`, and a completion-ratio `badge`. Never
//! conflate them — a host can have a low score from one bad week yet still
//! be `CONFIAVEL` by lifetime completion ratio, or vice versa.

use crate::models::{ReliabilityBadge, ReliabilityEventType};

pub const BASE_SCORE: i64 = 100;

/// Apply one event's delta to the current score, clamped to `[0, 100]`.
pub fn apply_event(current_score: i64, event: ReliabilityEventType) -> i64 {
    (current_score + event.score_delta()).clamp(0, 100)
}

/// Fold a sequence of events from the base score. Exposed mainly for tests
/// that want to assert the clamp holds over long event runs.
pub fn score_after(events: &[ReliabilityEventType]) -> i64 {
    events.iter().fold(BASE_SCORE, |score, e| apply_event(score, *e))
}

pub fn derive_badge(sessions_total: i64, sessions_completed: i64) -> ReliabilityBadge {
    if sessions_total < 5 {
        return ReliabilityBadge::Novo;
    }
    let ratio = sessions_completed as f64 / sessions_total as f64;
    if ratio >= 0.9 {
        ReliabilityBadge::Confiavel
    } else {
        ReliabilityBadge::Instavel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_stays_in_bounds_under_long_failure_runs() {
        let events = vec![ReliabilityEventType::HostDown; 50];
        assert_eq!(score_after(&events), 0);
    }

    #[test]
    fn score_stays_in_bounds_under_long_success_runs() {
        let events = vec![ReliabilityEventType::SessionOk; 500];
        assert_eq!(score_after(&events), 100);
    }

    #[test]
    fn mixed_event_sequence() {
        let events = vec![
            ReliabilityEventType::SessionOk,
            ReliabilityEventType::SessionFailed,
            ReliabilityEventType::HostDown,
        ];
        // 100 +1 -2 -10 = 89
        assert_eq!(score_after(&events), 89);
    }

    #[test]
    fn badge_new_host_under_five_sessions() {
        assert_eq!(derive_badge(4, 4), ReliabilityBadge::Novo);
        assert_eq!(derive_badge(0, 0), ReliabilityBadge::Novo);
    }

    #[test]
    fn badge_reliable_at_90_percent_completion() {
        assert_eq!(derive_badge(10, 9), ReliabilityBadge::Confiavel);
        assert_eq!(derive_badge(100, 90), ReliabilityBadge::Confiavel);
    }

    #[test]
    fn badge_unstable_below_90_percent() {
        assert_eq!(derive_badge(10, 8), ReliabilityBadge::Instavel);
        assert_eq!(derive_badge(20, 5), ReliabilityBadge::Instavel);
    }
}
