//! Broker Gateway (§4.D) — typed AMQP consume/publish with confirms,
//! returned-message handling, reconnect-with-backoff, QoS.
//!
//! Grounded on `examples/original_source/services/moderation_aggregator/app/events/rabbitmq.py`'s
//! `RabbitMQEventLoop`: `_setup_topology` (exchange/queue declare, bind,
//! `basic_qos`, `confirm_delivery`), `_on_message` (header/property
//! extraction with UTF-8 normalization), `_publish_final` (mandatory +
//! persistent + confirms), and `run_forever`'s reconnect-with-backoff loop.
//! The graceful-shutdown signal is `tokio::sync::watch<bool>`, the same
//! primitive `bpmn_integration::worker::JobWorker::run` selects on.

use std::time::Duration;

use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio_stream::StreamExt;

use crate::config::Config;

pub struct BrokerGateway {
    connection: Connection,
    channel: Channel,
}

/// A normalized inbound delivery: decoded body bytes plus the
/// `correlation_id` property and `x-service-name`/`x-moderation-type`
/// headers, already UTF-8 decoded, trimmed, and empty-collapsed-to-`None`
/// (§4.D "Consumer loop").
pub struct InboundDelivery {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub service_name: Option<String>,
    pub moderation_type: Option<String>,
    delivery_tag: u64,
}

fn normalize_header(headers: &FieldTable, key: &str) -> Option<String> {
    let value = headers.inner().get(key)?;
    let as_string = match value {
        lapin::types::AMQPValue::LongString(s) => s.to_string(),
        lapin::types::AMQPValue::ShortString(s) => s.to_string(),
        other => format!("{other:?}"),
    };
    let trimmed = as_string.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

impl BrokerGateway {
    /// Connect and declare the full topology (ingress/result/egress
    /// exchanges, the result queue and its binding, QoS, confirms) — the
    /// Rust analogue of `_setup_topology`.
    pub async fn connect(cfg: &Config) -> crate::error::Result<Self> {
        // `pika`'s URLParameters defaults an empty vhost path to "/"; lapin
        // needs the vhost segment spelled out, so a bare trailing slash
        // (no vhost given) is expanded to the default vhost explicitly.
        let mut amqp_url = cfg.amqp_url.clone();
        if amqp_url.ends_with('/') {
            amqp_url.push_str("%2f");
        }

        let connection =
            Connection::connect(&amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &cfg.ingress_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                &cfg.result_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(
                &cfg.egress_exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &cfg.result_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &cfg.result_queue_name,
                &cfg.result_exchange,
                &cfg.result_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &cfg.ingress_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &cfg.ingress_queue_name,
                &cfg.ingress_exchange,
                &cfg.ingress_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(cfg.prefetch_count, BasicQosOptions::default())
            .await?;
        channel.confirm_select(lapin::options::ConfirmSelectOptions::default()).await?;

        Ok(Self { connection, channel })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn close(&self) -> crate::error::Result<()> {
        self.channel.close(200, "normal shutdown").await?;
        self.connection.close(200, "normal shutdown").await?;
        Ok(())
    }

    /// Start consuming from the result queue (used by the aggregator).
    pub async fn consume_results(&self, cfg: &Config, consumer_tag: &str) -> crate::error::Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                &cfg.result_queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Start consuming from the ingress queue (used by the orchestrator).
    pub async fn consume_ingress(&self, cfg: &Config, consumer_tag: &str) -> crate::error::Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                &cfg.ingress_queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Publish a message to `exchange`/`routing_key` with `mandatory=true`,
    /// persistent delivery, and wait on the publisher confirm — the Rust
    /// analogue of `_publish_final`. Returns `Ok(true)` if the broker
    /// confirmed (and did not return the message as unroutable),
    /// `Ok(false)` on an unroutable return or a negative confirm.
    pub async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        correlation_id: Option<&str>,
        service_name: &str,
    ) -> crate::error::Result<bool> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_content_type("application/json".into())
            .with_message_id(uuid::Uuid::new_v4().to_string().into());
        if let Some(cid) = correlation_id {
            properties = properties.with_correlation_id(cid.into());
        }
        let mut headers = FieldTable::default();
        headers.insert(
            "x-service-name".into(),
            lapin::types::AMQPValue::LongString(service_name.into()),
        );
        properties = properties.with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                body,
                properties,
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Ack(returned) => Ok(returned.is_none()),
            Confirmation::Nack(_) => Ok(false),
            Confirmation::NotRequested => Ok(true),
        }
    }

    pub async fn ack(&self, tag: u64) -> crate::error::Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    pub async fn nack_requeue(&self, tag: u64) -> crate::error::Result<()> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Normalize a raw lapin delivery into an `InboundDelivery`, extracting the
/// `correlation_id` property and the `x-service-name`/`x-moderation-type`
/// headers with UTF-8/trim/empty normalization — `_on_message`'s body.
pub fn normalize_delivery(delivery: &lapin::message::Delivery) -> InboundDelivery {
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty());

    let (service_name, moderation_type) = match delivery.properties.headers() {
        Some(headers) => (
            normalize_header(headers, "x-service-name"),
            normalize_header(headers, "x-moderation-type"),
        ),
        None => (None, None),
    };

    InboundDelivery {
        body: delivery.data.clone(),
        correlation_id,
        service_name,
        moderation_type,
        delivery_tag: delivery.delivery_tag,
    }
}

impl InboundDelivery {
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

/// Reconnect-with-backoff wrapper the way `run_forever` loops around
/// `pika.BlockingConnection`: on any connect error, log, sleep
/// `reconnect_delay`, and retry indefinitely.
pub async fn connect_with_backoff(cfg: &Config) -> BrokerGateway {
    loop {
        match BrokerGateway::connect(cfg).await {
            Ok(gateway) => return gateway,
            Err(err) => {
                tracing::warn!(%err, delay = ?cfg.reconnect_delay, "broker connect failed, retrying");
                tokio::time::sleep(cfg.reconnect_delay).await;
            }
        }
    }
}
