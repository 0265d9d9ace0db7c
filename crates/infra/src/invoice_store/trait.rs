use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use leasebook_core::{DomainError, InvoiceId};
use leasebook_invoicing::{Invoice, InvoiceRow, NewInvoice, Payment, Settlement};

use crate::config::NumberingConfig;
use crate::sequence::SequenceError;

/// Invoice store operation error.
///
/// - **Validation** / **NotFound** / **Conflict**: the request cannot succeed
///   as given; retrying will not help.
/// - **RecomputeFailed**: the store failed while settling; nothing was
///   written and the recompute can be retried.
/// - **Storage**: any other store failure.
/// - **Numbering**: invoice number allocation failed.
#[derive(Debug, Error)]
pub enum InvoiceStoreError {
    #[error("invalid invoice input: {0}")]
    Validation(String),

    #[error("invoice not found: {0}")]
    NotFound(InvoiceId),

    #[error("invoice conflict: {0}")]
    Conflict(String),

    #[error("settlement recompute failed: {0}")]
    RecomputeFailed(String),

    #[error("invoice storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Numbering(#[from] SequenceError),
}

impl InvoiceStoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InvoiceStoreError::RecomputeFailed(_) | InvoiceStoreError::Storage(_) => true,
            InvoiceStoreError::Numbering(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Re-label a storage failure as a failed recompute.
    pub(crate) fn into_recompute_failure(self) -> Self {
        match self {
            InvoiceStoreError::Storage(msg) => InvoiceStoreError::RecomputeFailed(msg),
            other => other,
        }
    }
}

impl From<DomainError> for InvoiceStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg)
            | DomainError::AmountOutOfRange(msg)
            | DomainError::InvalidId(msg) => InvoiceStoreError::Validation(msg),
            DomainError::Conflict(msg) | DomainError::InvariantViolation(msg) => {
                InvoiceStoreError::Conflict(msg)
            }
        }
    }
}

/// Persistence collaborator for invoices.
///
/// Implementations must:
/// - validate inputs (non-negative amounts, existing credited invoice) before
///   writing anything
/// - hide soft-deleted invoices, rows and payments
/// - run `recompute_amounts` as lock + read + write in one transaction, so
///   concurrent recomputes of the same invoice serialize
/// - assign an invoice number at most once, atomically with allocating it
#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Create an open invoice with its initial rows and payments.
    ///
    /// Derived amounts start at zero; call `recompute_amounts` afterwards.
    async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, InvoiceStoreError>;

    async fn add_row(&self, invoice_id: InvoiceId, row: InvoiceRow)
    -> Result<(), InvoiceStoreError>;

    async fn add_payment(
        &self,
        invoice_id: InvoiceId,
        payment: Payment,
    ) -> Result<(), InvoiceStoreError>;

    async fn get(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, InvoiceStoreError>;

    /// Refresh row amounts, settle the invoice and persist the four derived
    /// fields (`billed_amount`, `total_amount`, `outstanding_amount`, `state`).
    async fn recompute_amounts(&self, invoice_id: InvoiceId)
    -> Result<Settlement, InvoiceStoreError>;

    /// Return the invoice number, allocating and persisting one on first use.
    async fn assign_number(
        &self,
        invoice_id: InvoiceId,
        numbering: &NumberingConfig,
    ) -> Result<i64, InvoiceStoreError>;
}

#[async_trait]
impl<S> InvoiceStore for Arc<S>
where
    S: InvoiceStore + ?Sized,
{
    async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, InvoiceStoreError> {
        (**self).create_invoice(new).await
    }

    async fn add_row(
        &self,
        invoice_id: InvoiceId,
        row: InvoiceRow,
    ) -> Result<(), InvoiceStoreError> {
        (**self).add_row(invoice_id, row).await
    }

    async fn add_payment(
        &self,
        invoice_id: InvoiceId,
        payment: Payment,
    ) -> Result<(), InvoiceStoreError> {
        (**self).add_payment(invoice_id, payment).await
    }

    async fn get(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, InvoiceStoreError> {
        (**self).get(invoice_id).await
    }

    async fn recompute_amounts(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Settlement, InvoiceStoreError> {
        (**self).recompute_amounts(invoice_id).await
    }

    async fn assign_number(
        &self,
        invoice_id: InvoiceId,
        numbering: &NumberingConfig,
    ) -> Result<i64, InvoiceStoreError> {
        (**self).assign_number(invoice_id, numbering).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_validation_maps_to_validation() {
        let err: InvoiceStoreError = DomainError::validation("paid amount must not be negative").into();
        assert!(matches!(err, InvoiceStoreError::Validation(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_failure_becomes_recompute_failure() {
        let err = InvoiceStoreError::Storage("connection reset".into()).into_recompute_failure();
        assert!(matches!(err, InvoiceStoreError::RecomputeFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "settlement recompute failed: connection reset");
    }

    #[test]
    fn numbering_retryability_follows_sequence_error() {
        let err: InvoiceStoreError = SequenceError::Validation("bad name".into()).into();
        assert!(!err.is_retryable());
        let err: InvoiceStoreError = SequenceError::AllocationFailed("timeout".into()).into();
        assert!(err.is_retryable());
    }
}
