//! Job Orchestrator (§4.E) — inbound-job entry point: normalizes, seeds
//! tasks, fans out.
//!
//! Grounded on `examples/original_source/apps/moderation_orchestrator/src/apps/orchestrator_service.py`'s
//! `_seed_job_and_tasks`/`_publish_fanout`/`run_orchestrator`: one DB
//! transaction that inserts the job (if new), upserts payload rows, derives
//! targets from payload presence, and inserts one pending task row per
//! target; then, outside the transaction, one task-request publish per
//! target.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::BrokerGateway;
use crate::config::Config;
use crate::job_store::JobStore;
use crate::model::{IngressEvent, Modality};

#[derive(Debug, Serialize)]
pub struct SubmitResult {
    pub correlation_id: Uuid,
    pub published_targets: Vec<String>,
}

#[derive(Serialize)]
struct TaskRequestPayload<'a> {
    correlating_id: Uuid,
    task: TaskRef<'a>,
    content: IngressContentEcho<'a>,
}

#[derive(Serialize)]
struct TaskRef<'a> {
    event_name: &'a str,
}

#[derive(Serialize)]
struct IngressContentEcho<'a> {
    content_id: &'a Option<String>,
    submitter_id: &'a Option<String>,
    text: &'a Option<String>,
    image_uri: &'a Option<String>,
}

#[derive(Serialize)]
struct TaskRequestEnvelope<'a> {
    message_id: Uuid,
    #[serde(rename = "type")]
    kind: &'static str,
    correlation_id: Uuid,
    service_id: &'static str,
    timestamp: String,
    payload: TaskRequestPayload<'a>,
}

pub struct Orchestrator {
    job_store: JobStore,
    broker: BrokerGateway,
    ingress_exchange: String,
}

impl Orchestrator {
    pub fn new(job_store: JobStore, broker: BrokerGateway, cfg: &Config) -> Self {
        Self {
            job_store,
            broker,
            ingress_exchange: cfg.ingress_exchange.clone(),
        }
    }

    /// Idempotent entry point: accept an inbound job event, persist it, and
    /// fan it out over the broker. Safe to call again with the same
    /// `correlating_id` — steps 2–5 become no-ops and only missing targets
    /// are (re-)published (§4.E "Failure semantics").
    pub async fn submit(&self, event: IngressEvent) -> anyhow::Result<SubmitResult> {
        let correlation_id = event.correlating_id.unwrap_or_else(Uuid::new_v4);
        let content = event.content;

        anyhow::ensure!(
            content.text.is_some() || content.image_uri.is_some(),
            "ingress event must carry at least one of content.text or content.image_uri"
        );

        let mut tx = self.job_store.begin().await?;
        self.job_store.ensure_job(&mut tx, correlation_id).await?;

        if let Some(text) = &content.text {
            self.job_store
                .upsert_text_payload(&mut tx, correlation_id, text)
                .await?;
        }
        if let Some(image_uri) = &content.image_uri {
            self.job_store
                .upsert_image_payload(&mut tx, correlation_id, image_uri)
                .await?;
        }

        let modalities = self.job_store.modalities_present(&mut tx, correlation_id).await?;
        let mut targets: Vec<&'static str> = Vec::new();
        for modality in &modalities {
            targets.extend(modality.targets());
        }

        let mut new_targets = Vec::new();
        for target in &targets {
            if self.job_store.ensure_task(&mut tx, correlation_id, target).await? {
                new_targets.push(*target);
            }
        }

        tx.commit().await?;

        let mut published = Vec::new();
        for target in &new_targets {
            self.publish_task_request(correlation_id, target, &content).await?;
            published.push(target.to_string());
        }

        Ok(SubmitResult {
            correlation_id,
            published_targets: published,
        })
    }

    async fn publish_task_request(
        &self,
        correlation_id: Uuid,
        event_name: &str,
        content: &crate::model::IngressContent,
    ) -> anyhow::Result<()> {
        let envelope = TaskRequestEnvelope {
            message_id: Uuid::new_v4(),
            kind: "Moderation.Task.Requested.v1",
            correlation_id,
            service_id: "orchestrator",
            timestamp: Utc::now().to_rfc3339(),
            payload: TaskRequestPayload {
                correlating_id: correlation_id,
                task: TaskRef { event_name },
                content: IngressContentEcho {
                    content_id: &content.content_id,
                    submitter_id: &content.submitter_id,
                    text: &content.text,
                    image_uri: &content.image_uri,
                },
            },
        };
        let body = serde_json::to_vec(&envelope)?;
        let routing_key = event_name;
        self.broker
            .channel()
            .basic_publish(
                &self.ingress_exchange,
                routing_key,
                lapin::options::BasicPublishOptions::default(),
                &body,
                lapin::BasicProperties::default()
                    .with_correlation_id(correlation_id.to_string().into())
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IngressContent;

    #[test]
    fn modality_targets_drive_selection_not_event_shape() {
        let modalities = [Modality::Text];
        let mut targets: Vec<&str> = Vec::new();
        for m in &modalities {
            targets.extend(m.targets());
        }
        assert_eq!(targets, vec!["moderation_text_toxicornotclassifier"]);
    }

    #[test]
    fn task_request_envelope_serializes_expected_shape() {
        let content = IngressContent {
            content_id: Some("post-1".to_string()),
            submitter_id: None,
            text: Some("hello".to_string()),
            image_uri: None,
        };
        let envelope = TaskRequestEnvelope {
            message_id: Uuid::nil(),
            kind: "Moderation.Task.Requested.v1",
            correlation_id: Uuid::nil(),
            service_id: "orchestrator",
            timestamp: Utc::now().to_rfc3339(),
            payload: TaskRequestPayload {
                correlating_id: Uuid::nil(),
                task: TaskRef { event_name: "moderation_text_toxicornotclassifier" },
                content: IngressContentEcho {
                    content_id: &content.content_id,
                    submitter_id: &content.submitter_id,
                    text: &content.text,
                    image_uri: &content.image_uri,
                },
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "Moderation.Task.Requested.v1");
        assert_eq!(json["service_id"], "orchestrator");
        assert_eq!(json["payload"]["task"]["event_name"], "moderation_text_toxicornotclassifier");
    }
}
