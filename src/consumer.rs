//! The consumer loop: queue delivery → normalize → sink → settle.
//!
//! A message is acknowledged only after every record derived from it has been
//! delivered. Anything that cannot succeed by being redelivered (an
//! undecodable body, an event missing a required field, a record the sink
//! rejected, or retries exhausted) dead-letters the message instead, after
//! every sibling record has still been attempted. One message is processed at
//! a time per instance.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, DeliveryError, QueueError};
use crate::models::EventRecord;
use crate::normalize::Normalizer;
use crate::queue::{InboundMessage, MessageSource};
use crate::retry::RetryPolicy;
use crate::sink::Sink;

// ---

/// Lifecycle of one consumer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connected,
    Consuming,
    Draining,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Connected,
            2 => ConsumerState::Consuming,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsumerState::Disconnected => 0,
            ConsumerState::Connected => 1,
            ConsumerState::Consuming => 2,
            ConsumerState::Draining => 3,
        }
    }
}

/// Live counters for one instance, shared with the health route.
#[derive(Debug)]
pub struct ConsumerStatus {
    // ---
    instance: usize,
    state: AtomicU8,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    /// Epoch millis of the last settled message, 0 if none yet.
    last_message_ms: AtomicI64,
}

/// Serializable view of a [`ConsumerStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub instance: usize,
    pub state: ConsumerState,
    pub messages_acked: u64,
    pub messages_dead_lettered: u64,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConsumerStatus {
    // ---
    pub fn new(instance: usize) -> Self {
        Self {
            instance,
            state: AtomicU8::new(ConsumerState::Disconnected.as_u8()),
            acked: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }

    pub fn set_state(&self, state: ConsumerState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn record(&self, disposition: &Disposition) {
        match disposition {
            Disposition::Ack => self.acked.fetch_add(1, Ordering::Relaxed),
            Disposition::DeadLetter(_) => self.dead_lettered.fetch_add(1, Ordering::Relaxed),
        };
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        // ---
        let last_ms = self.last_message_ms.load(Ordering::Relaxed);
        StatusSnapshot {
            instance: self.instance,
            state: self.state(),
            messages_acked: self.acked.load(Ordering::Relaxed),
            messages_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_message_at: (last_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_ms))
                .flatten(),
        }
    }
}

/// How a message is settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    DeadLetter(String),
}

/// Per-message tally of what happened to each event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageReport {
    pub events: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub exhausted: usize,
}

impl MessageReport {
    fn disposition(&self) -> Disposition {
        // ---
        if self.delivered == self.events {
            return Disposition::Ack;
        }
        Disposition::DeadLetter(format!(
            "{} of {} events not delivered (skipped {}, rejected {}, retries exhausted {})",
            self.events - self.delivered,
            self.events,
            self.skipped,
            self.rejected,
            self.exhausted
        ))
    }
}

/// One consumer instance: a subscription plus the pipeline it feeds.
pub struct EventConsumer<S: MessageSource> {
    // ---
    source: S,
    processor: Processor,
}

/// Everything needed to turn one delivery into a settled message.
struct Processor {
    normalizer: Normalizer,
    sink: Arc<dyn Sink>,
    retry_policy: RetryPolicy,
    drain_timeout: Duration,
    status: Arc<ConsumerStatus>,
}

impl<S: MessageSource> EventConsumer<S> {
    // ---
    pub fn new(
        source: S,
        normalizer: Normalizer,
        sink: Arc<dyn Sink>,
        retry_policy: RetryPolicy,
        drain_timeout: Duration,
        status: Arc<ConsumerStatus>,
    ) -> Self {
        Self {
            source,
            processor: Processor {
                normalizer,
                sink,
                retry_policy,
                drain_timeout,
                status,
            },
        }
    }

    /// Consume until `shutdown` is cancelled or the subscription fails.
    ///
    /// On cancellation the wait for the next delivery stops at once, the
    /// in-flight message is finished (bounded by the drain timeout) and the
    /// subscription is closed. A subscription that ends on its own is an
    /// error, so the process can be restarted by its supervisor.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), QueueError> {
        // ---
        let Self {
            mut source,
            processor,
        } = self;

        processor.status.set_state(ConsumerState::Consuming);
        info!(
            sink = processor.sink.name(),
            variant = %processor.normalizer.variant(),
            "Consuming"
        );

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = source.next_message() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => break Err(e),
                None => break Err(QueueError::StreamClosed),
            };

            if !processor.handle_bounded(message, &shutdown).await {
                break Ok(());
            }
        };

        processor.status.set_state(ConsumerState::Draining);
        if let Err(e) = source.cancel().await {
            warn!(error = %e, "Failed to cancel subscription");
        }
        if let Err(e) = source.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        processor.status.set_state(ConsumerState::Disconnected);

        match &result {
            Ok(()) => info!("Consumer stopped"),
            Err(e) => error!(error = %e, "Consumer stopped unexpectedly"),
        }
        result
    }
}

impl Processor {
    /// Handle one message, giving up once the drain timeout elapses after
    /// shutdown. Returns false if the message was abandoned unsettled.
    async fn handle_bounded(&self, message: InboundMessage, shutdown: &CancellationToken) -> bool {
        // ---
        let delivery_tag = message.delivery_tag;
        let drain_deadline = async {
            shutdown.cancelled().await;
            self.status.set_state(ConsumerState::Draining);
            tokio::time::sleep(self.drain_timeout).await;
        };

        tokio::select! {
            _ = self.handle_message(message) => true,
            _ = drain_deadline => {
                warn!(
                    delivery_tag,
                    "Drain timeout elapsed; leaving message unacknowledged for redelivery"
                );
                false
            }
        }
    }

    /// Process one delivery end to end and settle it with the broker.
    async fn handle_message(&self, message: InboundMessage) -> Disposition {
        // ---
        let raw = String::from_utf8_lossy(&message.body);
        info!(
            raw = %raw,
            delivery_tag = message.delivery_tag,
            redelivered = message.redelivered,
            "Reading message"
        );

        let disposition = match self.process(&message.body, &raw).await {
            Ok(report) => {
                debug!(?report, "Message processed");
                report.disposition()
            }
            Err(e) => {
                error!(raw = %raw, error_kind = "decode", error = %e, "Undecodable message");
                Disposition::DeadLetter(e.to_string())
            }
        };

        let settled = match &disposition {
            Disposition::Ack => message.handle.ack().await,
            Disposition::DeadLetter(reason) => {
                warn!(
                    delivery_tag = message.delivery_tag,
                    reason = %reason,
                    "Dead-lettering message"
                );
                message.handle.dead_letter().await
            }
        };

        match settled {
            Ok(()) => self.status.record(&disposition),
            Err(e) => error!(
                delivery_tag = message.delivery_tag,
                error = %e,
                "Failed to settle message; broker will redeliver it"
            ),
        }

        disposition
    }

    async fn process(&self, body: &[u8], raw: &str) -> Result<MessageReport, DecodeError> {
        // ---
        let outcomes = self.normalizer.normalize(body)?;
        let mut report = MessageReport {
            events: outcomes.len(),
            ..MessageReport::default()
        };

        for outcome in outcomes {
            let record = match outcome {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        raw = %raw,
                        event_index = e.index,
                        field = e.field,
                        error_kind = "field_missing",
                        "Skipping event"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            match self.deliver_with_retry(&record).await {
                Ok(attempts) => {
                    debug!(unit_id = record.unit_id, attempts, "Record delivered");
                    report.delivered += 1;
                }
                Err(e) => {
                    error!(
                        raw = %raw,
                        unit_id = record.unit_id,
                        utc_timestamp = ?record.timestamp(),
                        error_kind = %e.kind,
                        status = ?e.status,
                        error = %e,
                        "Record not delivered"
                    );
                    if e.is_retryable() {
                        report.exhausted += 1;
                    } else {
                        report.rejected += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Deliver with bounded backoff; returns the number of attempts used.
    async fn deliver_with_retry(&self, record: &EventRecord) -> Result<u32, DeliveryError> {
        // ---
        let mut attempt = 1;
        loop {
            match self.sink.deliver(record).await {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    let backoff = self.retry_policy.time_until_next_retry(attempt);
                    warn!(
                        unit_id = record.unit_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
