//! Core data model: `Job`, per-modality payloads, `Task`, `Decision`, and the
//! status/verdict enums, with the `as_str`/`parse` round-trip pattern used by
//! `bpmn_integration::types::CorrelationStatus` for every enum it defines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a `Job` or a `Task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Completed,
    Failed,
    TimedOut,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::TimedOut => "timed_out",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Status::Pending),
            "completed" => Some(Status::Completed),
            "failed" => Some(Status::Failed),
            "timed_out" => Some(Status::TimedOut),
            _ => None,
        }
    }
}

/// A worker's reported partial outcome, as carried in a result message body
/// and in `AggregationState.data`. Unknown values coerce to `Failed` per
/// §6/§7 of the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialStatus {
    Pending,
    Approved,
    Rejected,
    Failed,
}

impl PartialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartialStatus::Pending => "pending",
            PartialStatus::Approved => "approved",
            PartialStatus::Rejected => "rejected",
            PartialStatus::Failed => "failed",
        }
    }

    /// Unknown statuses coerce to `Failed` rather than erroring — see §7
    /// "Malformed delivery" vs. "schema violation" distinction: an
    /// unrecognized *status value* inside an otherwise well-formed body is
    /// not a parse failure, it is data the fold must still be able to use.
    pub fn parse_or_failed(value: &str) -> Self {
        match value {
            "pending" => PartialStatus::Pending,
            "approved" => PartialStatus::Approved,
            "rejected" => PartialStatus::Rejected,
            _ => PartialStatus::Failed,
        }
    }
}

/// Final verdict emitted on the completion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Block,
    Review,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Block => "block",
            Verdict::Review => "review",
            Verdict::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Verdict::Allow),
            "block" => Some(Verdict::Block),
            "review" => Some(Verdict::Review),
            "error" => Some(Verdict::Error),
            _ => None,
        }
    }
}

/// Which axis a job is routed along. Adding a modality is three additions:
/// a variant here, a routing key in `routing_key()`, and a payload table in
/// the Job Store — per §9 of the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    pub fn label(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
        }
    }

    /// Logical worker event names this modality fans out to. Targets are
    /// event names, not physical worker ids (§4.E).
    pub fn targets(&self) -> &'static [&'static str] {
        match self {
            Modality::Text => &["moderation_text_toxicornotclassifier"],
            Modality::Image => &["moderation_image_catornotclassifier"],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub correlation_id: Uuid,
    pub content_id: Option<String>,
    pub submitter_id: Option<String>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub correlation_id: Uuid,
    pub event_name: String,
    pub status: Status,
    pub payload: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub correlation_id: Uuid,
    pub final_verdict: Verdict,
    pub timed_out: bool,
    pub decided_at: DateTime<Utc>,
}

/// Inbound job submission, as decoded from the ingress message body (§4.E).
#[derive(Debug, Clone, Deserialize)]
pub struct IngressContent {
    pub content_id: Option<String>,
    pub submitter_id: Option<String>,
    pub text: Option<String>,
    pub image_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressEvent {
    pub correlating_id: Option<Uuid>,
    pub content: IngressContent,
}

/// The `{status, reason}` body published by a worker on the result exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultBody {
    #[serde(default = "default_failed_status")]
    pub status: String,
    pub reason: Option<String>,
}

fn default_failed_status() -> String {
    "failed".to_string()
}

/// The `{status, reason}` body published by the aggregator on the egress
/// exchange — the final event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalEvent {
    pub status: Verdict,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [Status::Pending, Status::Completed, Status::Failed, Status::TimedOut] {
            assert_eq!(Status::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn verdict_round_trips() {
        for v in [Verdict::Allow, Verdict::Block, Verdict::Review, Verdict::Error] {
            assert_eq!(Verdict::parse(v.as_str()), Some(v));
        }
    }

    #[test]
    fn partial_status_unknown_coerces_to_failed() {
        assert_eq!(PartialStatus::parse_or_failed("bogus"), PartialStatus::Failed);
        assert_eq!(PartialStatus::parse_or_failed(""), PartialStatus::Failed);
    }

    #[test]
    fn modality_targets_are_distinct_event_names() {
        assert_ne!(Modality::Text.targets(), Modality::Image.targets());
    }
}
