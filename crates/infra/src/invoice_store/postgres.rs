//! Postgres-backed invoice store.
//!
//! Settlement and numbering each run in one transaction that starts by
//! locking the invoice row (`SELECT ... FOR UPDATE`). Concurrent recomputes of
//! the same invoice therefore serialize, and the four derived fields are
//! written in a single commit or not at all.
//!
//! Soft-deleted records (`deleted_at IS NOT NULL`) are invisible to every
//! query here.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | `InvoiceStoreError` |
//! |------------|----------|---------------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `Validation` |
//! | Database (check violation) | `23514` | `Validation` |
//! | Database (numeric out of range) | `22003` | `Validation` (amount too large for the column) |
//! | Database (other), PoolClosed, Io, ... | any | `Storage` (`RecomputeFailed` during settlement) |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use leasebook_core::{DomainResult, InvoiceId, InvoiceRowId, Money, PaymentId};
use leasebook_invoicing::{
    recompute, Compensation, CreditInvoice, Invoice, InvoiceRow, NewInvoice, Payment, Settlement,
    StoredInvoice,
};

use super::r#trait::{InvoiceStore, InvoiceStoreError};
use crate::config::NumberingConfig;
use crate::db::{pg_codes::*, sql_state};
use crate::sequence::{allocate_in_tx, r#trait::validate_request};

const INVOICE_COLUMNS: &str = r#"
    id,
    invoice_type,
    state,
    billed_amount,
    total_amount,
    outstanding_amount,
    number,
    credited_invoice_id
"#;

const ROW_COLUMNS: &str = r#"
    id,
    invoice_id,
    amount,
    compensation_amount,
    increase_percentage,
    sign_date,
    plan_lawfulness_date,
    description
"#;

/// Postgres-backed invoice store.
#[derive(Debug, Clone)]
pub struct PostgresInvoiceStore {
    pool: Arc<PgPool>,
}

impl PostgresInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self, new), fields(invoice_id = %new.invoice_id), err)]
    pub async fn insert_invoice(&self, new: NewInvoice) -> Result<Invoice, InvoiceStoreError> {
        new.validate()?;

        let mut tx = self.begin().await?;

        if let Some(credited) = new.credited_invoice {
            if !invoice_exists(&mut tx, credited).await? {
                rollback(tx).await?;
                return Err(InvoiceStoreError::NotFound(credited));
            }
        }

        let invoice = Invoice::open(new.invoice_id, new.invoice_type, new.credited_invoice);

        sqlx::query(
            r#"
            INSERT INTO invoices (id, invoice_type, state, credited_invoice_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(invoice.id().as_uuid())
        .bind(invoice.invoice_type().as_str())
        .bind(invoice.state().as_str())
        .bind(invoice.credited_invoice().map(Uuid::from))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_invoice", e))?;

        for row in &new.rows {
            insert_row(&mut tx, invoice.id(), row).await?;
        }
        for payment in &new.payments {
            insert_payment(&mut tx, invoice.id(), payment).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(
            invoice_type = invoice.invoice_type().as_str(),
            rows = new.rows.len(),
            payments = new.payments.len(),
            "invoice created"
        );
        Ok(invoice)
    }

    #[instrument(skip(self, row), fields(invoice_id = %invoice_id), err)]
    pub async fn insert_row(
        &self,
        invoice_id: InvoiceId,
        row: InvoiceRow,
    ) -> Result<(), InvoiceStoreError> {
        row.validate()?;
        let mut tx = self.begin().await?;
        if !invoice_exists(&mut tx, invoice_id).await? {
            rollback(tx).await?;
            return Err(InvoiceStoreError::NotFound(invoice_id));
        }
        insert_row(&mut tx, invoice_id, &row).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, payment), fields(invoice_id = %invoice_id), err)]
    pub async fn insert_payment(
        &self,
        invoice_id: InvoiceId,
        payment: Payment,
    ) -> Result<(), InvoiceStoreError> {
        payment.validate()?;
        let mut tx = self.begin().await?;
        if !invoice_exists(&mut tx, invoice_id).await? {
            rollback(tx).await?;
            return Err(InvoiceStoreError::NotFound(invoice_id));
        }
        insert_payment(&mut tx, invoice_id, &payment).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn load_invoice(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Option<Invoice>, InvoiceStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(invoice_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_invoice", e))?;

        row.map(|r| decode_invoice(&r)).transpose()
    }

    /// Lock, read, settle and write back in one transaction.
    #[instrument(skip(self), fields(invoice_id = %invoice_id), err)]
    pub async fn settle(&self, invoice_id: InvoiceId) -> Result<Settlement, InvoiceStoreError> {
        self.settle_inner(invoice_id)
            .await
            .map_err(InvoiceStoreError::into_recompute_failure)
    }

    async fn settle_inner(&self, invoice_id: InvoiceId) -> Result<Settlement, InvoiceStoreError> {
        let mut tx = self.begin().await?;

        let Some(mut invoice) = lock_invoice(&mut tx, invoice_id).await? else {
            rollback(tx).await?;
            return Err(InvoiceStoreError::NotFound(invoice_id));
        };

        let mut rows = load_rows(&mut tx, invoice_id).await?;
        let payments = load_payments(&mut tx, invoice_id).await?;
        let credits = load_credit_invoices(&mut tx, invoice_id).await?;

        let settled = refresh_rows(&mut rows).and_then(|refreshed| {
            recompute(&invoice, &rows, &payments, &credits).map(|settlement| (settlement, refreshed))
        });
        let (settlement, refreshed) = match settled {
            Ok(settled) => settled,
            Err(err) => {
                warn!(error = %err, "stored invoice data failed validation; rolling back");
                rollback(tx).await?;
                return Err(err.into());
            }
        };

        for (row_id, amount) in &refreshed {
            sqlx::query("UPDATE invoice_rows SET amount = $2 WHERE id = $1")
                .bind(row_id.as_uuid())
                .bind(amount.amount())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_row_amount", e))?;
        }

        sqlx::query(
            r#"
            UPDATE invoices
            SET billed_amount = $2,
                total_amount = $3,
                outstanding_amount = $4,
                state = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice_id.as_uuid())
        .bind(settlement.billed_amount.amount())
        .bind(settlement.total_amount.amount())
        .bind(settlement.outstanding_amount.amount())
        .bind(settlement.state.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_invoice_amounts", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let previous = invoice.state();
        settlement.apply_to(&mut invoice);
        debug!(
            billed = %settlement.billed_amount,
            outstanding = %settlement.outstanding_amount,
            refreshed_rows = refreshed.len(),
            "invoice settled"
        );
        if previous != settlement.state {
            info!(from = previous.as_str(), to = settlement.state.as_str(), "invoice state changed");
        }
        Ok(settlement)
    }

    /// Return the existing number or allocate one in the same transaction.
    #[instrument(skip(self, numbering), fields(invoice_id = %invoice_id, sequence = %numbering.sequence_name), err)]
    pub async fn number_invoice(
        &self,
        invoice_id: InvoiceId,
        numbering: &NumberingConfig,
    ) -> Result<i64, InvoiceStoreError> {
        let name = validate_request(&numbering.sequence_name, numbering.initial_value)?;

        let mut tx = self.begin().await?;

        let Some(mut invoice) = lock_invoice(&mut tx, invoice_id).await? else {
            rollback(tx).await?;
            return Err(InvoiceStoreError::NotFound(invoice_id));
        };

        if let Some(number) = invoice.number() {
            rollback(tx).await?;
            return Ok(number);
        }

        let number = match allocate_in_tx(&mut tx, &name, numbering.initial_value).await {
            Ok(number) => number,
            Err(err) => {
                rollback(tx).await?;
                return Err(err.into());
            }
        };
        invoice.assign_number(number)?;

        sqlx::query("UPDATE invoices SET number = $2, updated_at = NOW() WHERE id = $1")
            .bind(invoice_id.as_uuid())
            .bind(number)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_invoice_number", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(number, "invoice number assigned");
        Ok(number)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, InvoiceStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl InvoiceStore for PostgresInvoiceStore {
    async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, InvoiceStoreError> {
        self.insert_invoice(new).await
    }

    async fn add_row(
        &self,
        invoice_id: InvoiceId,
        row: InvoiceRow,
    ) -> Result<(), InvoiceStoreError> {
        self.insert_row(invoice_id, row).await
    }

    async fn add_payment(
        &self,
        invoice_id: InvoiceId,
        payment: Payment,
    ) -> Result<(), InvoiceStoreError> {
        self.insert_payment(invoice_id, payment).await
    }

    async fn get(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, InvoiceStoreError> {
        self.load_invoice(invoice_id).await
    }

    async fn recompute_amounts(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Settlement, InvoiceStoreError> {
        self.settle(invoice_id).await
    }

    async fn assign_number(
        &self,
        invoice_id: InvoiceId,
        numbering: &NumberingConfig,
    ) -> Result<i64, InvoiceStoreError> {
        self.number_invoice(invoice_id, numbering).await
    }
}

/// Re-derive compensation rows; returns the rows whose amount changed.
fn refresh_rows(rows: &mut [InvoiceRow]) -> DomainResult<Vec<(InvoiceRowId, Money)>> {
    let mut refreshed = Vec::new();
    for row in rows.iter_mut() {
        if row.refresh_amount()? {
            refreshed.push((row.id, row.amount));
        }
    }
    Ok(refreshed)
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), InvoiceStoreError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

async fn invoice_exists(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
) -> Result<bool, InvoiceStoreError> {
    let found: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM invoices WHERE id = $1 AND deleted_at IS NULL FOR SHARE")
            .bind(invoice_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("invoice_exists", e))?;
    Ok(found.is_some())
}

async fn lock_invoice(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
) -> Result<Option<Invoice>, InvoiceStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
    ))
    .bind(invoice_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_invoice", e))?;

    row.map(|r| decode_invoice(&r)).transpose()
}

async fn load_rows(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
) -> Result<Vec<InvoiceRow>, InvoiceStoreError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {ROW_COLUMNS}
        FROM invoice_rows
        WHERE invoice_id = $1 AND deleted_at IS NULL
        ORDER BY created_at ASC, id ASC
        "#
    ))
    .bind(invoice_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_rows", e))?;

    rows.iter()
        .map(|r| decode_row(r).map(|record| record.row))
        .collect()
}

async fn load_payments(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
) -> Result<Vec<Payment>, InvoiceStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, paid_amount, paid_date, filing_code
        FROM invoice_payments
        WHERE invoice_id = $1 AND deleted_at IS NULL
        ORDER BY paid_date ASC, id ASC
        "#,
    )
    .bind(invoice_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_payments", e))?;

    rows.iter()
        .map(|r| {
            PaymentRecord::from_row(r)
                .map(Payment::from)
                .map_err(|e| decode_error("payment", e))
        })
        .collect()
}

/// Rows of every live credit note that points at `invoice_id`.
async fn load_credit_invoices(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
) -> Result<Vec<CreditInvoice>, InvoiceStoreError> {
    let rows = sqlx::query(
        r#"
        SELECT
            r.id,
            r.invoice_id,
            r.amount,
            r.compensation_amount,
            r.increase_percentage,
            r.sign_date,
            r.plan_lawfulness_date,
            r.description
        FROM invoices ci
        JOIN invoice_rows r ON r.invoice_id = ci.id AND r.deleted_at IS NULL
        WHERE ci.credited_invoice_id = $1 AND ci.deleted_at IS NULL
        ORDER BY ci.id ASC, r.created_at ASC, r.id ASC
        "#,
    )
    .bind(invoice_id.as_uuid())
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_credit_invoices", e))?;

    let mut grouped: BTreeMap<Uuid, Vec<InvoiceRow>> = BTreeMap::new();
    for r in &rows {
        let record = decode_row(r)?;
        grouped.entry(record.invoice_id).or_default().push(record.row);
    }

    Ok(grouped
        .into_iter()
        .map(|(id, rows)| CreditInvoice {
            id: InvoiceId::from_uuid(id),
            rows,
        })
        .collect())
}

async fn insert_row(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
    row: &InvoiceRow,
) -> Result<(), InvoiceStoreError> {
    let compensation = row.compensation.as_ref();
    sqlx::query(
        r#"
        INSERT INTO invoice_rows (
            id,
            invoice_id,
            amount,
            compensation_amount,
            increase_percentage,
            sign_date,
            plan_lawfulness_date,
            description
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(row.id.as_uuid())
    .bind(invoice_id.as_uuid())
    .bind(row.amount.amount())
    .bind(compensation.map(|c| c.compensation_amount.amount()))
    .bind(compensation.map(|c| c.increase_percentage))
    .bind(compensation.and_then(|c| c.sign_date))
    .bind(compensation.and_then(|c| c.plan_lawfulness_date))
    .bind(row.description.as_deref())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_row", e))?;
    Ok(())
}

async fn insert_payment(
    tx: &mut Transaction<'_, Postgres>,
    invoice_id: InvoiceId,
    payment: &Payment,
) -> Result<(), InvoiceStoreError> {
    sqlx::query(
        r#"
        INSERT INTO invoice_payments (id, invoice_id, paid_amount, paid_date, filing_code)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(payment.id.as_uuid())
    .bind(invoice_id.as_uuid())
    .bind(payment.paid_amount.amount())
    .bind(payment.paid_date)
    .bind(payment.filing_code.as_deref())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_payment", e))?;
    Ok(())
}

/// Map SQLx errors to `InvoiceStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> InvoiceStoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let msg = format!("database error in {}: {}", operation, db_err.message());
        return match sql_state(&err).as_deref() {
            Some(UNIQUE_VIOLATION) => InvoiceStoreError::Conflict(msg),
            Some(FOREIGN_KEY_VIOLATION) | Some(CHECK_VIOLATION) | Some(NUMERIC_VALUE_OUT_OF_RANGE) => {
                InvoiceStoreError::Validation(msg)
            }
            _ => InvoiceStoreError::Storage(msg),
        };
    }
    match err {
        sqlx::Error::PoolClosed => {
            InvoiceStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            InvoiceStoreError::Storage(format!("timed out acquiring connection in {}", operation))
        }
        _ => InvoiceStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(what: &str, err: sqlx::Error) -> InvoiceStoreError {
    InvoiceStoreError::Storage(format!("failed to decode {what} row: {err}"))
}

fn decode_invoice(row: &sqlx::postgres::PgRow) -> Result<Invoice, InvoiceStoreError> {
    let record = InvoiceRecord::from_row(row).map_err(|e| decode_error("invoice", e))?;
    let stored = StoredInvoice {
        id: InvoiceId::from_uuid(record.id),
        invoice_type: record.invoice_type.parse()?,
        state: record.state.parse()?,
        billed_amount: Money::new(record.billed_amount),
        total_amount: Money::new(record.total_amount),
        outstanding_amount: Money::new(record.outstanding_amount),
        number: record.number,
        credited_invoice: record.credited_invoice_id.map(InvoiceId::from_uuid),
    };
    Ok(stored.into())
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<RowRecord, InvoiceStoreError> {
    RowRecord::from_row(row).map_err(|e| decode_error("invoice_row", e))
}

// SQLx row types

#[derive(Debug)]
struct InvoiceRecord {
    id: Uuid,
    invoice_type: String,
    state: String,
    billed_amount: Decimal,
    total_amount: Decimal,
    outstanding_amount: Decimal,
    number: Option<i64>,
    credited_invoice_id: Option<Uuid>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for InvoiceRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(InvoiceRecord {
            id: row.try_get("id")?,
            invoice_type: row.try_get("invoice_type")?,
            state: row.try_get("state")?,
            billed_amount: row.try_get("billed_amount")?,
            total_amount: row.try_get("total_amount")?,
            outstanding_amount: row.try_get("outstanding_amount")?,
            number: row.try_get("number")?,
            credited_invoice_id: row.try_get("credited_invoice_id")?,
        })
    }
}

#[derive(Debug)]
struct RowRecord {
    invoice_id: Uuid,
    row: InvoiceRow,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RowRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let compensation_amount: Option<Decimal> = row.try_get("compensation_amount")?;
        let increase_percentage: Option<Decimal> = row.try_get("increase_percentage")?;
        let sign_date: Option<NaiveDate> = row.try_get("sign_date")?;
        let plan_lawfulness_date: Option<NaiveDate> = row.try_get("plan_lawfulness_date")?;

        let compensation = compensation_amount.map(|amount| Compensation {
            compensation_amount: Money::new(amount),
            increase_percentage: increase_percentage.unwrap_or(Decimal::ZERO),
            sign_date,
            plan_lawfulness_date,
        });

        let id: Uuid = row.try_get("id")?;
        let amount: Decimal = row.try_get("amount")?;
        Ok(RowRecord {
            invoice_id: row.try_get("invoice_id")?,
            row: InvoiceRow {
                id: InvoiceRowId::from_uuid(id),
                amount: Money::new(amount),
                compensation,
                description: row.try_get("description")?,
            },
        })
    }
}

#[derive(Debug)]
struct PaymentRecord {
    id: Uuid,
    paid_amount: Decimal,
    paid_date: NaiveDate,
    filing_code: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PaymentRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(PaymentRecord {
            id: row.try_get("id")?,
            paid_amount: row.try_get("paid_amount")?,
            paid_date: row.try_get("paid_date")?,
            filing_code: row.try_get("filing_code")?,
        })
    }
}

impl From<PaymentRecord> for Payment {
    fn from(record: PaymentRecord) -> Self {
        Payment {
            id: PaymentId::from_uuid(record.id),
            paid_amount: Money::new(record.paid_amount),
            paid_date: record.paid_date,
            filing_code: record.filing_code,
        }
    }
}
