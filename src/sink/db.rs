//! Database sink: one parameterized insert per record, in its own transaction.

use async_trait::async_trait;
use sqlx::PgPool;

use super::Sink;
use crate::error::DeliveryError;
use crate::models::EventRecord;

// ---

pub struct DbSink {
    // ---
    pool: PgPool,
}

impl DbSink {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, record: &EventRecord) -> Result<(), sqlx::Error> {
        // ---
        // Dropping the transaction on an early return rolls it back.
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO telemetry_events (
                unit_id, latitude, longitude, ground_speed,
                fuel_level, fuel_rate, total_used_fuel,
                event_type, utc_timestamp_seconds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.unit_id)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.ground_speed)
        .bind(record.fuel_level)
        .bind(record.fuel_rate)
        .bind(record.total_used_fuel)
        .bind(record.event_type)
        .bind(record.utc_timestamp_seconds)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl Sink for DbSink {
    // ---
    async fn deliver(&self, record: &EventRecord) -> Result<(), DeliveryError> {
        self.insert(record).await.map_err(classify)
    }

    fn name(&self) -> &'static str {
        "db"
    }
}

/// Map a driver error onto the shared delivery taxonomy.
fn classify(error: sqlx::Error) -> DeliveryError {
    // ---
    match &error {
        // SQLSTATE class 23: integrity constraint violation.
        // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
        sqlx::Error::Database(db_error)
            if db_error
                .code()
                .is_some_and(|code| code.starts_with("23")) =>
        {
            DeliveryError::constraint_violation(error.to_string())
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => DeliveryError::connection_failed(error.to_string()),
        _ => DeliveryError::transport(error.to_string()),
    }
}
