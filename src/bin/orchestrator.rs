//! Job Orchestrator binary — consumes the ingress queue and fans each job
//! out to the worker fleet. The run loop structure (a `tokio::select!`
//! between the next delivery and a shutdown watch channel) follows
//! `bpmn_integration::worker::JobWorker::run` in the teacher.

use moderation_orchestrator::broker::{self, normalize_delivery};
use moderation_orchestrator::config::Config;
use moderation_orchestrator::job_store::JobStore;
use moderation_orchestrator::model::IngressEvent;
use moderation_orchestrator::orchestrator::Orchestrator;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    moderation_orchestrator::logging::init();

    let cfg = Config::from_env()?;
    let job_store = JobStore::connect(&cfg.database_url).await?;
    let gateway = broker::connect_with_backoff(&cfg).await;
    let orchestrator = Orchestrator::new(job_store, gateway, &cfg);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    run(&orchestrator, &cfg, &mut shutdown_rx).await
}

async fn run(
    orchestrator: &Orchestrator,
    cfg: &Config,
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let gateway = broker::connect_with_backoff(cfg).await;
        let mut consumer = match gateway.consume_ingress(cfg, "moderation-orchestrator").await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, "failed to start ingress consumer, retrying");
                tokio::time::sleep(cfg.reconnect_delay).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("shutdown signal received, closing orchestrator");
                        let _ = gateway.close().await;
                        return Ok(());
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let inbound = normalize_delivery(&delivery);
                            handle_delivery(orchestrator, &gateway, &inbound, delivery.delivery_tag).await;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(%err, "ingress consumer error, reconnecting");
                            break;
                        }
                        None => {
                            tracing::warn!("ingress consumer stream ended, reconnecting");
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
    orchestrator: &Orchestrator,
    gateway: &moderation_orchestrator::broker::BrokerGateway,
    inbound: &moderation_orchestrator::broker::InboundDelivery,
    delivery_tag: u64,
) {
    let event: IngressEvent = match serde_json::from_slice(&inbound.body) {
        Ok(e) => e,
        Err(err) => {
            tracing::error!(%err, "dropping malformed ingress delivery");
            let _ = gateway.ack(delivery_tag).await;
            return;
        }
    };

    match orchestrator.submit(event).await {
        Ok(result) => {
            tracing::info!(
                correlation_id = %result.correlation_id,
                targets = ?result.published_targets,
                "job submitted"
            );
            let _ = gateway.ack(delivery_tag).await;
        }
        Err(err) => {
            tracing::warn!(%err, "failed to submit job, nacking with requeue");
            let _ = gateway.nack_requeue(delivery_tag).await;
        }
    }
}
