//! Error taxonomy for the bridge pipeline.
//!
//! Decode and field errors are handled locally by the consumer loop and never
//! crash it. Delivery errors carry a [`DeliveryErrorKind`] so that both sink
//! strategies feed one retry/ack policy. Connection setup errors are fatal for
//! the consumer instance and surface to `main`.

use std::fmt;

use thiserror::Error;

// ---

/// The message body could not be decoded into an `events` sequence.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message body has no `events` key")]
    MissingEvents,
    #[error("`events` is not a sequence")]
    EventsNotSequence,
}

/// A required field is absent (or not numeric) for one event of a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("event {index}: required field `{field}` is missing")]
pub struct FieldMissingError {
    pub index: usize,
    pub field: &'static str,
}

/// Classification shared by every sink strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    /// Network failure or transient server-side failure.
    Transport,
    /// The sink refused the record.
    Rejected,
    /// The sink connection could not be obtained.
    ConnectionFailed,
    /// The database refused the row (SQLSTATE class 23).
    ConstraintViolation,
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryErrorKind::Transport => "transport",
            DeliveryErrorKind::Rejected => "rejected",
            DeliveryErrorKind::ConnectionFailed => "connection_failed",
            DeliveryErrorKind::ConstraintViolation => "constraint_violation",
        };
        f.write_str(name)
    }
}

/// A record could not be delivered to the sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub kind: DeliveryErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "delivery failed ({}, status {}): {}",
                self.kind, status, self.message
            ),
            None => write!(f, "delivery failed ({}): {}", self.kind, self.message),
        }
    }
}

impl DeliveryError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Transport,
            status: None,
            message: message.into(),
        }
    }

    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::Rejected,
            status,
            message: message.into(),
        }
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::ConnectionFailed,
            status: None,
            message: message.into(),
        }
    }

    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self {
            kind: DeliveryErrorKind::ConstraintViolation,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Transport-class failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DeliveryErrorKind::Transport | DeliveryErrorKind::ConnectionFailed
        )
    }
}

/// Errors raised by the queue while consuming or acknowledging.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("delivery stream closed by the broker")]
    StreamClosed,
}

/// The queue connection could not be established at startup.
#[derive(Error, Debug)]
pub enum ConnectionSetupError {
    #[error("invalid queue url: {0}")]
    InvalidUrl(String),
    #[error("failed to connect to the broker: {0}")]
    Connect(#[source] lapin::Error),
    #[error("failed to open a channel: {0}")]
    Channel(#[source] lapin::Error),
    #[error("failed to declare queue `{queue}`: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },
    #[error("failed to start consuming from `{queue}`: {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },
}
