//! Result Aggregator binary — consumes the result queue, folds partial
//! verdicts, and publishes the completion event exactly-once-effectively.
//! Shutdown and reconnect structure mirror `orchestrator.rs` and, beneath
//! it, `bpmn_integration::worker::JobWorker::run`.

use moderation_orchestrator::aggregation_store::AggregationStore;
use moderation_orchestrator::aggregator::{HandleOutcome, ResultAggregator};
use moderation_orchestrator::broker::{self, normalize_delivery, BrokerGateway};
use moderation_orchestrator::config::Config;
use moderation_orchestrator::fleet_registry::FleetRegistry;
use moderation_orchestrator::job_store::JobStore;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    moderation_orchestrator::logging::init();

    let cfg = Config::from_env()?;
    let job_store = JobStore::connect(&cfg.database_url).await?;
    let registry = FleetRegistry::connect(
        cfg.fleet_runtime_endpoint.as_deref(),
        &cfg.moderation_label,
        &cfg.moderation_type_label_key,
    )
    .await?;
    registry.spawn_event_listener();
    let store = AggregationStore::new(&cfg.redis_url, cfg.aggregation_ttl.as_secs())?;
    let aggregator = ResultAggregator::new(store, registry, job_store);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    run(&aggregator, &cfg, &mut shutdown_rx).await
}

async fn run(
    aggregator: &ResultAggregator,
    cfg: &Config,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let gateway = broker::connect_with_backoff(cfg).await;
        let mut consumer = match gateway.consume_results(cfg, "moderation-aggregator").await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, "failed to start result consumer, retrying");
                tokio::time::sleep(cfg.reconnect_delay).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("shutdown signal received, closing aggregator");
                        let _ = gateway.close().await;
                        return Ok(());
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let inbound = normalize_delivery(&delivery);
                            let tag = inbound.delivery_tag();
                            handle_delivery(aggregator, &gateway, cfg, &inbound, tag).await;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%err, "result consumer error, reconnecting");
                            break;
                        }
                        None => {
                            tracing::warn!("result consumer stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        tokio::time::sleep(cfg.reconnect_delay).await;
    }
}

async fn handle_delivery(
    aggregator: &ResultAggregator,
    gateway: &BrokerGateway,
    cfg: &Config,
    inbound: &moderation_orchestrator::broker::InboundDelivery,
    delivery_tag: u64,
) {
    let correlation_id = match &inbound.correlation_id {
        Some(cid) => cid.clone(),
        None => {
            tracing::error!("dropping result delivery with no correlation_id");
            let _ = gateway.ack(delivery_tag).await;
            return;
        }
    };
    let service_name = inbound
        .service_name
        .clone()
        .unwrap_or_else(|| "unknown".to_string());

    let outcome = match aggregator
        .handle_result(
            &inbound.body,
            &correlation_id,
            &service_name,
            inbound.moderation_type.as_deref(),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::warn!(%err, %correlation_id, "failed to handle result, nacking with requeue");
            let _ = gateway.nack_requeue(delivery_tag).await;
            return;
        }
    };

    match outcome {
        HandleOutcome::Pending => {
            let _ = gateway.ack(delivery_tag).await;
        }
        HandleOutcome::Dropped(reason) => {
            tracing::warn!(%correlation_id, %reason, "dropping malformed result delivery");
            let _ = gateway.ack(delivery_tag).await;
        }
        HandleOutcome::Final(event) => {
            let body = match serde_json::to_vec(&event) {
                Ok(b) => b,
                Err(err) => {
                    tracing::error!(%err, %correlation_id, "failed to serialize final event");
                    let _ = gateway.nack_requeue(delivery_tag).await;
                    return;
                }
            };

            let published = gateway
                .publish_confirmed(
                    &cfg.egress_exchange,
                    &cfg.egress_routing_key,
                    &body,
                    Some(&correlation_id),
                    &cfg.service_name,
                )
                .await;

            match published {
                Ok(true) => {
                    let id = match uuid::Uuid::parse_str(&correlation_id) {
                        Ok(id) => id,
                        Err(err) => {
                            tracing::error!(%err, %correlation_id, "final correlation_id is not a uuid");
                            let _ = gateway.ack(delivery_tag).await;
                            return;
                        }
                    };
                    if let Err(err) = aggregator.finalize(id, &event).await {
                        tracing::error!(%err, %correlation_id, "failed to persist decision after publish");
                        let _ = gateway.nack_requeue(delivery_tag).await;
                        return;
                    }
                    let _ = gateway.ack(delivery_tag).await;
                }
                Ok(false) => {
                    tracing::warn!(%correlation_id, "final event was not confirmed, leaving state intact");
                    let _ = gateway.nack_requeue(delivery_tag).await;
                }
                Err(err) => {
                    tracing::warn!(%err, %correlation_id, "failed to publish final event, leaving state intact");
                    let _ = gateway.nack_requeue(delivery_tag).await;
                }
            }
        }
    }
}
