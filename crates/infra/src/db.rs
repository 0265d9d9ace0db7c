//! Postgres pool construction and schema bootstrap.

use anyhow::Context;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;

/// Postgres error codes the stores react to.
pub(crate) mod pg_codes {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

/// Schema used by the sequence allocator and the invoice store.
///
/// Every statement is idempotent so bootstrap can run on each start.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sequences (
        name        TEXT PRIMARY KEY,
        last_value  BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoices (
        id                   UUID PRIMARY KEY,
        invoice_type         TEXT NOT NULL CHECK (invoice_type IN ('charge', 'credit_note')),
        state                TEXT NOT NULL CHECK (state IN ('open', 'paid', 'refunded')),
        billed_amount        NUMERIC(10, 2) NOT NULL DEFAULT 0,
        total_amount         NUMERIC(10, 2) NOT NULL DEFAULT 0,
        outstanding_amount   NUMERIC(10, 2) NOT NULL DEFAULT 0,
        number               BIGINT UNIQUE,
        credited_invoice_id  UUID REFERENCES invoices (id),
        created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at           TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS invoices_credited_invoice_idx
        ON invoices (credited_invoice_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_rows (
        id                    UUID PRIMARY KEY,
        invoice_id            UUID NOT NULL REFERENCES invoices (id) ON DELETE CASCADE,
        amount                NUMERIC(10, 2) NOT NULL DEFAULT 0 CHECK (amount >= 0),
        compensation_amount   NUMERIC(12, 2),
        increase_percentage   NUMERIC(12, 2),
        sign_date             DATE,
        plan_lawfulness_date  DATE,
        description           TEXT,
        created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at            TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS invoice_rows_invoice_idx ON invoice_rows (invoice_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS invoice_payments (
        id           UUID PRIMARY KEY,
        invoice_id   UUID NOT NULL REFERENCES invoices (id) ON DELETE CASCADE,
        paid_amount  NUMERIC(10, 2) NOT NULL CHECK (paid_amount >= 0),
        paid_date    DATE NOT NULL,
        filing_code  VARCHAR(35),
        created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at   TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS invoice_payments_invoice_idx ON invoice_payments (invoice_id)
    "#,
];

/// Open a connection pool and make sure the schema exists.
#[instrument(skip(config), fields(max_connections = config.max_connections))]
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.url)
        .await
        .context("failed to connect to Postgres")?;

    ensure_schema(&pool).await?;
    info!("Postgres pool ready");
    Ok(pool)
}

/// Create missing tables and indexes.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin schema transaction")?;
    for (idx, statement) in SCHEMA.iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("schema statement #{idx} failed"))?;
    }
    tx.commit().await.context("failed to commit schema")?;
    Ok(())
}

/// SQLSTATE of a database error, if the error came from the server.
pub(crate) fn sql_state(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}
