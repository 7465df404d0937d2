//! AMQP queue access.
//!
//! One broker connection per process and one channel per consumer instance.
//! Deliveries are consumed with manual acknowledgement; the consumer loop only
//! sees the [`MessageSource`] and [`AckHandle`] seams, so it can run against
//! an in-memory source in tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPUri, AMQPUserInfo};
use lapin::{acker::Acker, Channel, Connection, ConnectionProperties, Consumer};

use crate::config::{Config, QueueCredentials};
use crate::error::{ConnectionSetupError, QueueError};

// ---

const DEAD_LETTER_ARGUMENT: &str = "x-dead-letter-exchange";

/// Settles one delivery with the broker.
#[async_trait]
pub trait AckHandle: Send + Sync {
    // ---
    async fn ack(&self) -> Result<(), QueueError>;

    /// Reject without requeue; the broker routes it to the dead-letter
    /// exchange when the queue has one, and drops it otherwise.
    async fn dead_letter(&self) -> Result<(), QueueError>;
}

/// One delivery as seen by the consumer loop.
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub handle: Box<dyn AckHandle>,
}

/// A subscription delivering messages one at a time.
#[async_trait]
pub trait MessageSource: Send {
    // ---
    /// Wait for the next delivery; `None` once the subscription has ended.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>>;

    /// Ask the broker to stop sending new deliveries.
    async fn cancel(&mut self) -> Result<(), QueueError>;

    /// Release the subscription's channel.
    async fn close(&mut self) -> Result<(), QueueError>;
}

/// The process-wide broker connection.
pub struct AmqpConnection {
    // ---
    connection: Connection,
    queue_name: String,
    dead_letter_exchange: Option<String>,
    prefetch_count: u16,
}

impl AmqpConnection {
    // ---
    pub async fn connect(cfg: &Config) -> Result<Self, ConnectionSetupError> {
        // ---
        let uri = build_uri(&cfg.queue_url, &cfg.queue_credentials)?;
        let properties =
            ConnectionProperties::default().with_connection_name(cfg.app_name.clone().into());

        let connection = Connection::connect_uri(uri, properties)
            .await
            .map_err(ConnectionSetupError::Connect)?;

        tracing::info!(queue = %cfg.queue_name, "Connection successful to RabbitMQ");

        Ok(Self {
            connection,
            queue_name: cfg.queue_name.clone(),
            dead_letter_exchange: cfg.dead_letter_exchange.clone(),
            prefetch_count: cfg.prefetch_count,
        })
    }

    /// Open a channel, declare the durable queue and start consuming.
    pub async fn subscribe(&self, consumer_tag: &str) -> Result<AmqpSource, ConnectionSetupError> {
        // ---
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(ConnectionSetupError::Channel)?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(ConnectionSetupError::Channel)?;

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(self.dead_letter_exchange.as_deref()),
            )
            .await
            .map_err(|source| ConnectionSetupError::Declare {
                queue: self.queue_name.clone(),
                source,
            })?;

        // `no_ack` stays false: every delivery is settled explicitly.
        let consumer = channel
            .basic_consume(
                &self.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| ConnectionSetupError::Consume {
                queue: self.queue_name.clone(),
                source,
            })?;

        tracing::debug!(consumer_tag, queue = %self.queue_name, "Subscribed");

        Ok(AmqpSource {
            channel,
            consumer,
            consumer_tag: consumer_tag.to_string(),
        })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "bridge shutting down").await?;
        Ok(())
    }
}

/// Parse the broker URL and attach the configured login to it.
fn build_uri(url: &str, credentials: &QueueCredentials) -> Result<AMQPUri, ConnectionSetupError> {
    // ---
    let mut uri: AMQPUri = url.parse().map_err(ConnectionSetupError::InvalidUrl)?;
    uri.authority.userinfo = AMQPUserInfo {
        username: credentials.username.clone(),
        password: credentials.password.clone(),
    };
    Ok(uri)
}

fn queue_arguments(dead_letter_exchange: Option<&str>) -> FieldTable {
    // ---
    let mut arguments = FieldTable::default();
    if let Some(exchange) = dead_letter_exchange {
        arguments.insert(
            DEAD_LETTER_ARGUMENT.into(),
            AMQPValue::LongString(exchange.to_string().into()),
        );
    }
    arguments
}

/// A consumer subscription on its own channel.
pub struct AmqpSource {
    // ---
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
}

#[async_trait]
impl MessageSource for AmqpSource {
    // ---
    async fn next_message(&mut self) -> Option<Result<InboundMessage, QueueError>> {
        // ---
        let delivery = self.consumer.next().await?;

        Some(delivery.map_err(QueueError::from).map(|delivery| {
            let Delivery {
                delivery_tag,
                redelivered,
                data,
                acker,
                ..
            } = delivery;

            InboundMessage {
                body: data,
                delivery_tag,
                redelivered,
                handle: Box::new(AmqpAck(acker)),
            }
        }))
    }

    async fn cancel(&mut self) -> Result<(), QueueError> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), QueueError> {
        self.channel.close(200, "consumer stopped").await?;
        Ok(())
    }
}

struct AmqpAck(Acker);

#[async_trait]
impl AckHandle for AmqpAck {
    // ---
    async fn ack(&self) -> Result<(), QueueError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn dead_letter(&self) -> Result<(), QueueError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await?;
        Ok(())
    }
}
