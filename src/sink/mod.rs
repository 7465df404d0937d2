//! Delivery sinks for normalized records.
//!
//! Both strategies report the same [`DeliveryError`] taxonomy, so the consumer
//! loop applies one retry/ack policy regardless of the configured sink.

use async_trait::async_trait;

use crate::error::DeliveryError;
use crate::models::EventRecord;

mod db;
mod http;

pub use self::db::DbSink;
pub use self::http::HttpSink;

// ---

/// Forwards one record downstream. Implementations never retry internally.
#[async_trait]
pub trait Sink: Send + Sync {
    // ---
    async fn deliver(&self, record: &EventRecord) -> Result<(), DeliveryError>;

    /// Short label used in log lines.
    fn name(&self) -> &'static str;
}
