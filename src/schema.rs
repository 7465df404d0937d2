//! Database schema management for the DB sink.
//!
//! Ensures the destination table and its lookup index exist before the
//! consumers start. Applied once on startup from `main.rs`, only when the
//! bridge runs with `SINK_MODE=db`.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create the `telemetry_events` table (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // One row per delivered record; columns mirror the DB-accepted subset.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_events (
            id                    BIGSERIAL PRIMARY KEY,
            unit_id               BIGINT           NOT NULL,
            latitude              DOUBLE PRECISION NOT NULL,
            longitude             DOUBLE PRECISION NOT NULL,
            ground_speed          DOUBLE PRECISION NOT NULL,
            fuel_level            DOUBLE PRECISION NOT NULL,
            fuel_rate             DOUBLE PRECISION NOT NULL,
            total_used_fuel       DOUBLE PRECISION NOT NULL,
            event_type            BIGINT,
            utc_timestamp_seconds BIGINT           NOT NULL,
            inserted_at           TIMESTAMPTZ      NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Redelivered messages produce duplicates; this is the key to dedupe on.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_telemetry_events_unit_ts
            ON telemetry_events (unit_id, utc_timestamp_seconds);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
