//! Verdict Folder (§4.G) — a pure, deterministic fold over the multiset of
//! partial worker statuses plus a timeout flag.
//!
//! Grounded on the original `_aggregate_verdict`/`EventService._finalize`
//! precedence (`apps/moderation_orchestrator/src/apps/orchestrator_service.py`,
//! `services/moderation_aggregator/app/events/service.py`): block beats
//! everything, error/failed/review fold together, timeout alone is a late
//! review, otherwise allow. The open question of whether `review` should
//! outrank `error` is decided in DESIGN.md by preserving the original's
//! collapse of both into one case.

use crate::model::{PartialStatus, Verdict};

/// Fold a multiset of partial statuses and a timeout flag into the final
/// verdict, per the precedence in §3 of the specification:
/// block > (error|failed|review) > timed_out > allow.
pub fn fold(statuses: &[PartialStatus], timed_out: bool) -> Verdict {
    if statuses.iter().any(|s| *s == PartialStatus::Rejected) {
        return Verdict::Block;
    }
    if statuses.iter().any(|s| *s == PartialStatus::Failed) {
        return Verdict::Review;
    }
    if timed_out {
        return Verdict::Review;
    }
    Verdict::Allow
}

/// Render a human-readable reason string for the final event, mirroring the
/// original's `f"Aggregated from {len(all_results)} workers."` style.
pub fn reason(statuses: &[PartialStatus], timed_out: bool) -> String {
    if statuses.is_empty() {
        return "Aggregated from 0 workers; no data at fold time.".to_string();
    }
    if timed_out {
        return format!(
            "Aggregated from {} workers; finalized after timeout.",
            statuses.len()
        );
    }
    format!("Aggregated from {} workers.", statuses.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use PartialStatus::*;

    #[test]
    fn all_allow() {
        assert_eq!(fold(&[Approved, Approved], false), Verdict::Allow);
    }

    #[test]
    fn block_wins_over_approved() {
        assert_eq!(fold(&[Rejected, Approved], false), Verdict::Block);
    }

    #[test]
    fn failed_escalates_to_review() {
        assert_eq!(fold(&[Failed], false), Verdict::Review);
    }

    #[test]
    fn block_wins_over_failed() {
        assert_eq!(fold(&[Rejected, Failed], false), Verdict::Block);
    }

    #[test]
    fn timeout_alone_is_review() {
        assert_eq!(fold(&[Approved], true), Verdict::Review);
    }

    #[test]
    fn timeout_does_not_override_block() {
        assert_eq!(fold(&[Rejected], true), Verdict::Block);
    }

    #[test]
    fn empty_input_is_allow_unless_timed_out() {
        assert_eq!(fold(&[], false), Verdict::Allow);
        assert_eq!(fold(&[], true), Verdict::Review);
    }

    #[test]
    fn pending_never_escalates_on_its_own() {
        assert_eq!(fold(&[Pending, Approved], false), Verdict::Allow);
    }
}
