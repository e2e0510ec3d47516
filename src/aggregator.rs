//! Result Aggregator (§4.F) — consumes partial results, updates state
//! atomically, finalizes when complete, publishes exactly-once-effectively.
//!
//! Grounded on `examples/original_source/services/moderation_aggregator/app/events/service.py`'s
//! `EventService.handle_message`/`_finalize`, upgraded per §4.F/§4.B's
//! redesign: idempotent first-seen decrement (not unconditional), and a
//! cached `final` event that survives retries. The ack/nack decision
//! follows `rabbitmq.py`'s `_on_message`: ack after side effects succeed,
//! nack-with-requeue on handler error so the idempotent decrement can
//! safely replay.

use crate::aggregation_store::AggregationStore;
use crate::fleet_registry::FleetRegistry;
use crate::job_store::JobStore;
use crate::model::{FinalEvent, PartialStatus, ResultBody};
use crate::verdict;

pub struct ResultAggregator {
    store: AggregationStore,
    registry: FleetRegistry,
    job_store: JobStore,
}

/// Outcome of handling one inbound result delivery.
pub enum HandleOutcome {
    /// Not yet complete; ack the delivery and move on.
    Pending,
    /// Complete; here is the final event to publish. The caller (broker
    /// consumer loop) must publish-with-confirm, then call
    /// `ResultAggregator::cleanup` only on success.
    Final(FinalEvent),
    /// The delivery was malformed beyond recovery; log and ack (§7).
    Dropped(String),
}

impl ResultAggregator {
    pub fn new(store: AggregationStore, registry: FleetRegistry, job_store: JobStore) -> Self {
        Self {
            store,
            registry,
            job_store,
        }
    }

    /// Handle one inbound result. `correlation_id` and `service_name` must
    /// already be validated non-empty by the broker gateway before this is
    /// called (§7 "Malformed delivery").
    pub async fn handle_result(
        &self,
        body: &[u8],
        correlation_id: &str,
        service_name: &str,
        moderation_type: Option<&str>,
    ) -> anyhow::Result<HandleOutcome> {
        let parsed: ResultBody = match serde_json::from_slice(body) {
            Ok(p) => p,
            Err(err) => {
                return Ok(HandleOutcome::Dropped(format!(
                    "failed to parse result body: {err}"
                )));
            }
        };
        // The external timeout driver (§5) re-enqueues a synthetic result
        // with status "timed_out" for a task it gave up on; that string is
        // not one of the four PartialStatus values a real worker reports,
        // so it is stored verbatim and unpacked again at fold time below.
        let raw_status = parsed.status.trim().to_lowercase();
        let stored_status: &str = if raw_status == "timed_out" {
            "timed_out"
        } else {
            PartialStatus::parse_or_failed(&parsed.status).as_str()
        };

        let expected = match moderation_type {
            Some(t) if !t.trim().is_empty() => self.registry.count_for_type(t).await,
            _ => self.registry.current_count().await,
        }
        .max(1);

        let remaining = self
            .store
            .record_result(correlation_id, expected, service_name, stored_status)
            .await?;

        if remaining > 0 {
            return Ok(HandleOutcome::Pending);
        }

        if let Some(cached) = self.store.read_final(correlation_id).await? {
            let event: FinalEvent = serde_json::from_str(&cached)?;
            return Ok(HandleOutcome::Final(event));
        }

        let all = self.store.all_statuses(correlation_id).await?;
        let timed_out = all.values().any(|s| s == "timed_out");
        let statuses: Vec<PartialStatus> = all
            .values()
            .filter(|s| s.as_str() != "timed_out")
            .map(|s| PartialStatus::parse_or_failed(s))
            .collect();
        let final_verdict = verdict::fold(&statuses, timed_out);
        let event = FinalEvent {
            status: final_verdict,
            reason: verdict::reason(&statuses, timed_out),
        };

        let serialized = serde_json::to_string(&event)?;
        self.store.write_final(correlation_id, &serialized).await?;

        Ok(HandleOutcome::Final(event))
    }

    /// Persist the decision and clear aggregation state. Must only be
    /// called after the final event has been published and confirmed
    /// (§4.F.3) — on publish failure the caller leaves state intact and
    /// nacks with requeue instead.
    pub async fn finalize(
        &self,
        correlation_id: uuid::Uuid,
        event: &FinalEvent,
    ) -> anyhow::Result<()> {
        self.job_store
            .upsert_decision(correlation_id, event.status.as_str(), false)
            .await?;
        self.store.cleanup(&correlation_id.to_string()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_body_defaults_missing_status_to_failed() {
        let parsed: ResultBody = serde_json::from_str(r#"{"reason": "no status field"}"#).unwrap();
        assert_eq!(parsed.status, "failed");
    }

    #[test]
    fn result_body_unknown_status_coerces_via_partial_status() {
        let parsed: ResultBody = serde_json::from_str(r#"{"status": "bogus"}"#).unwrap();
        assert_eq!(PartialStatus::parse_or_failed(&parsed.status), PartialStatus::Failed);
    }
}
