use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use leasebook_core::InvoiceId;
use leasebook_invoicing::{
    recompute, CreditInvoice, Invoice, InvoiceRow, NewInvoice, Payment, Settlement,
};

use super::r#trait::{InvoiceStore, InvoiceStoreError};
use crate::config::NumberingConfig;
use crate::sequence::{r#trait::validate_request, InMemorySequenceAllocator};

#[derive(Debug, Clone)]
struct InvoiceRecord {
    invoice: Invoice,
    rows: Vec<InvoiceRow>,
    payments: Vec<Payment>,
}

/// In-memory invoice store.
///
/// Intended for tests/dev. One lock guards all invoices, so every operation
/// is trivially atomic. Numbering draws from an in-memory allocator that may
/// be shared with other users of the same sequences.
#[derive(Debug)]
pub struct InMemoryInvoiceStore {
    invoices: RwLock<HashMap<InvoiceId, InvoiceRecord>>,
    sequences: Arc<InMemorySequenceAllocator>,
}

impl Default for InMemoryInvoiceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::with_sequences(Arc::new(InMemorySequenceAllocator::new()))
    }

    pub fn with_sequences(sequences: Arc<InMemorySequenceAllocator>) -> Self {
        Self {
            invoices: RwLock::new(HashMap::new()),
            sequences,
        }
    }

    fn poisoned() -> InvoiceStoreError {
        InvoiceStoreError::Storage("lock poisoned".to_string())
    }

    /// Credit notes pointing at `invoice_id`, with their rows.
    fn credit_invoices_of(
        invoices: &HashMap<InvoiceId, InvoiceRecord>,
        invoice_id: InvoiceId,
    ) -> Vec<CreditInvoice> {
        let mut credits: Vec<CreditInvoice> = invoices
            .values()
            .filter(|r| r.invoice.credited_invoice() == Some(invoice_id))
            .map(|r| CreditInvoice {
                id: r.invoice.id(),
                rows: r.rows.clone(),
            })
            .collect();
        credits.sort_by_key(|c| *c.id.as_uuid());
        credits
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, InvoiceStoreError> {
        new.validate()?;

        let mut invoices = self.invoices.write().map_err(|_| Self::poisoned())?;
        if invoices.contains_key(&new.invoice_id) {
            return Err(InvoiceStoreError::Conflict(format!(
                "invoice {} already exists",
                new.invoice_id
            )));
        }
        if let Some(credited) = new.credited_invoice {
            if !invoices.contains_key(&credited) {
                return Err(InvoiceStoreError::NotFound(credited));
            }
        }

        let invoice = Invoice::open(new.invoice_id, new.invoice_type, new.credited_invoice);
        invoices.insert(
            new.invoice_id,
            InvoiceRecord {
                invoice: invoice.clone(),
                rows: new.rows,
                payments: new.payments,
            },
        );

        info!(invoice_id = %invoice.id(), invoice_type = invoice.invoice_type().as_str(), "invoice created");
        Ok(invoice)
    }

    async fn add_row(
        &self,
        invoice_id: InvoiceId,
        row: InvoiceRow,
    ) -> Result<(), InvoiceStoreError> {
        row.validate()?;
        let mut invoices = self.invoices.write().map_err(|_| Self::poisoned())?;
        let record = invoices
            .get_mut(&invoice_id)
            .ok_or(InvoiceStoreError::NotFound(invoice_id))?;
        record.rows.push(row);
        Ok(())
    }

    async fn add_payment(
        &self,
        invoice_id: InvoiceId,
        payment: Payment,
    ) -> Result<(), InvoiceStoreError> {
        payment.validate()?;
        let mut invoices = self.invoices.write().map_err(|_| Self::poisoned())?;
        let record = invoices
            .get_mut(&invoice_id)
            .ok_or(InvoiceStoreError::NotFound(invoice_id))?;
        record.payments.push(payment);
        Ok(())
    }

    async fn get(&self, invoice_id: InvoiceId) -> Result<Option<Invoice>, InvoiceStoreError> {
        let invoices = self.invoices.read().map_err(|_| Self::poisoned())?;
        Ok(invoices.get(&invoice_id).map(|r| r.invoice.clone()))
    }

    async fn recompute_amounts(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Settlement, InvoiceStoreError> {
        let mut invoices = self
            .invoices
            .write()
            .map_err(|_| Self::poisoned().into_recompute_failure())?;

        let credits = Self::credit_invoices_of(&invoices, invoice_id);
        let record = invoices
            .get_mut(&invoice_id)
            .ok_or(InvoiceStoreError::NotFound(invoice_id))?;

        // Work on copies so a validation failure leaves the record untouched.
        let mut rows = record.rows.clone();
        for row in &mut rows {
            row.refresh_amount()?;
        }
        let settlement = recompute(&record.invoice, &rows, &record.payments, &credits)?;

        record.rows = rows;
        let previous = record.invoice.state();
        settlement.apply_to(&mut record.invoice);

        debug!(
            %invoice_id,
            billed = %settlement.billed_amount,
            outstanding = %settlement.outstanding_amount,
            "invoice settled"
        );
        if previous != settlement.state {
            info!(%invoice_id, from = previous.as_str(), to = settlement.state.as_str(), "invoice state changed");
        }
        Ok(settlement)
    }

    async fn assign_number(
        &self,
        invoice_id: InvoiceId,
        numbering: &NumberingConfig,
    ) -> Result<i64, InvoiceStoreError> {
        let name = validate_request(&numbering.sequence_name, numbering.initial_value)?;

        let mut invoices = self.invoices.write().map_err(|_| Self::poisoned())?;
        let record = invoices
            .get_mut(&invoice_id)
            .ok_or(InvoiceStoreError::NotFound(invoice_id))?;

        if let Some(number) = record.invoice.number() {
            return Ok(number);
        }

        let number = self.sequences.allocate(&name, numbering.initial_value)?;
        record.invoice.assign_number(number)?;
        info!(%invoice_id, number, "invoice number assigned");
        Ok(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use leasebook_core::Money;
    use leasebook_invoicing::{Compensation, InvoiceState, InvoiceType};
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    fn eur(s: &str) -> Money {
        s.parse().unwrap()
    }

    fn paid_on() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap()
    }

    fn rows(amounts: &[&str]) -> Vec<InvoiceRow> {
        amounts.iter().map(|a| InvoiceRow::new(eur(a))).collect()
    }

    async fn charge(store: &InMemoryInvoiceStore, amounts: &[&str]) -> InvoiceId {
        store
            .create_invoice(NewInvoice::charge(rows(amounts)))
            .await
            .unwrap()
            .id()
    }

    #[tokio::test]
    async fn partial_payment_leaves_invoice_open() {
        let store = InMemoryInvoiceStore::new();
        let id = charge(&store, &["1000.00"]).await;
        store
            .add_payment(id, Payment::new(eur("400.00"), paid_on()))
            .await
            .unwrap();

        let s = store.recompute_amounts(id).await.unwrap();
        assert_eq!(s.outstanding_amount, eur("600.00"));

        let invoice = store.get(id).await.unwrap().unwrap();
        assert_eq!(invoice.billed_amount(), eur("1000.00"));
        assert_eq!(invoice.total_amount(), eur("1000.00"));
        assert_eq!(invoice.outstanding_amount(), eur("600.00"));
        assert_eq!(invoice.state(), InvoiceState::Open);
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let store = InMemoryInvoiceStore::new();
        let id = charge(&store, &["300.00", "200.00"]).await;
        store
            .add_payment(id, Payment::new(eur("500.00"), paid_on()))
            .await
            .unwrap();

        let first = store.recompute_amounts(id).await.unwrap();
        let after_first = store.get(id).await.unwrap();
        let second = store.recompute_amounts(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(after_first, store.get(id).await.unwrap());
        assert_eq!(second.state, InvoiceState::Paid);
    }

    #[tokio::test]
    async fn linked_credit_note_refunds_original() {
        let store = InMemoryInvoiceStore::new();
        let original = charge(&store, &["800.00"]).await;
        store
            .create_invoice(NewInvoice::credit_note(original, rows(&["800.00"])))
            .await
            .unwrap();

        let s = store.recompute_amounts(original).await.unwrap();
        assert_eq!(s.state, InvoiceState::Refunded);
        assert_eq!(s.outstanding_amount, Money::ZERO);
    }

    #[tokio::test]
    async fn partial_credit_note_reduces_balance_only() {
        let store = InMemoryInvoiceStore::new();
        let original = charge(&store, &["800.00"]).await;
        store
            .create_invoice(NewInvoice::credit_note(original, rows(&["300.00"])))
            .await
            .unwrap();

        let s = store.recompute_amounts(original).await.unwrap();
        assert_eq!(s.outstanding_amount, eur("500.00"));
        assert_eq!(s.state, InvoiceState::Open);
    }

    #[tokio::test]
    async fn credit_note_for_unknown_invoice_is_rejected() {
        let store = InMemoryInvoiceStore::new();
        let missing = InvoiceId::new();
        let err = store
            .create_invoice(NewInvoice::credit_note(missing, rows(&["1.00"])))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceStoreError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected_before_storing() {
        let store = InMemoryInvoiceStore::new();
        let id = charge(&store, &["10.00"]).await;

        let err = store
            .add_payment(id, Payment::new(eur("-5.00"), paid_on()))
            .await
            .unwrap_err();
        assert!(matches!(err, InvoiceStoreError::Validation(_)));

        let err = store.add_row(id, InvoiceRow::new(eur("-1.00"))).await.unwrap_err();
        assert!(matches!(err, InvoiceStoreError::Validation(_)));

        let s = store.recompute_amounts(id).await.unwrap();
        assert_eq!(s.billed_amount, eur("10.00"));
        assert_eq!(s.payments_total, Money::ZERO);
    }

    #[tokio::test]
    async fn recompute_of_missing_invoice_is_not_found() {
        let store = InMemoryInvoiceStore::new();
        let err = store.recompute_amounts(InvoiceId::new()).await.unwrap_err();
        assert!(matches!(err, InvoiceStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn compensation_rows_are_refreshed_before_settling() {
        let store = InMemoryInvoiceStore::new();
        let mut row = InvoiceRow::from_compensation(Compensation {
            compensation_amount: eur("10000.00"),
            increase_percentage: dec!(2),
            sign_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            plan_lawfulness_date: NaiveDate::from_ymd_opt(2022, 1, 1),
        })
        .unwrap();
        // stale amount, as if inputs were edited after the row was stored
        row.amount = eur("10000.00");

        let id = store
            .create_invoice(NewInvoice::charge(vec![row]))
            .await
            .unwrap()
            .id();
        let s = store.recompute_amounts(id).await.unwrap();
        assert_eq!(s.billed_amount, eur("10400.00"));
    }

    #[tokio::test]
    async fn failed_recompute_leaves_invoice_and_rows_untouched() {
        let store = InMemoryInvoiceStore::new();
        let new = NewInvoice::charge(rows(&["100.00"]))
            .with_payments(vec![Payment::new(eur("40.00"), paid_on())]);
        let id = store.create_invoice(new).await.unwrap().id();
        store.recompute_amounts(id).await.unwrap();
        let settled = store.get(id).await.unwrap().unwrap();

        // Valid as stored, but the period runs backwards ten years, so the
        // refreshed amount comes out negative.
        let mut row = InvoiceRow::new(eur("100.00"));
        row.compensation = Some(Compensation {
            compensation_amount: eur("1000.00"),
            increase_percentage: dec!(20),
            sign_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            plan_lawfulness_date: NaiveDate::from_ymd_opt(2010, 1, 1),
        });
        let bad_row = row.id;
        store.add_row(id, row).await.unwrap();

        let err = store.recompute_amounts(id).await.unwrap_err();
        assert!(matches!(err, InvoiceStoreError::Validation(_)));
        assert!(!err.is_retryable());

        assert_eq!(store.get(id).await.unwrap().unwrap(), settled);
        let invoices = store.invoices.read().unwrap();
        let stored = invoices[&id]
            .rows
            .iter()
            .find(|r| r.id == bad_row)
            .unwrap();
        assert_eq!(stored.amount, eur("100.00"));
        assert_eq!(settled.outstanding_amount(), eur("60.00"));
    }

    #[tokio::test]
    async fn invoice_number_is_assigned_once() {
        let store = InMemoryInvoiceStore::new();
        let numbering = NumberingConfig::default();
        let a = charge(&store, &["1.00"]).await;
        let b = charge(&store, &["2.00"]).await;

        assert_eq!(store.assign_number(a, &numbering).await.unwrap(), 1_000_000);
        assert_eq!(store.assign_number(a, &numbering).await.unwrap(), 1_000_000);
        assert_eq!(store.assign_number(b, &numbering).await.unwrap(), 1_000_001);
        assert_eq!(store.get(a).await.unwrap().unwrap().number(), Some(1_000_000));
    }

    #[tokio::test]
    async fn invalid_numbering_config_touches_nothing() {
        let sequences = Arc::new(InMemorySequenceAllocator::new());
        let store = InMemoryInvoiceStore::with_sequences(sequences.clone());
        let id = charge(&store, &["1.00"]).await;

        let numbering = NumberingConfig {
            sequence_name: "invoice numbers".to_string(),
            initial_value: 1,
        };
        let err = store.assign_number(id, &numbering).await.unwrap_err();
        assert!(matches!(err, InvoiceStoreError::Numbering(_)));
        assert!(!err.is_retryable());
        assert_eq!(store.get(id).await.unwrap().unwrap().number(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_numbering_never_duplicates() {
        let store = Arc::new(InMemoryInvoiceStore::new());
        let mut ids = Vec::new();
        for _ in 0..40 {
            ids.push(charge(&store, &["1.00"]).await);
        }

        let mut handles = Vec::new();
        for id in ids {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.assign_number(id, &NumberingConfig::default()).await.unwrap()
            }));
        }

        let mut numbers = HashSet::new();
        for handle in handles {
            assert!(numbers.insert(handle.await.unwrap()));
        }
        assert_eq!(numbers.len(), 40);
    }

    #[tokio::test]
    async fn credit_note_itself_settles_without_paid_state() {
        let store = InMemoryInvoiceStore::new();
        let original = charge(&store, &["50.00"]).await;
        let credit = store
            .create_invoice(NewInvoice::credit_note(original, vec![]))
            .await
            .unwrap();
        assert_eq!(credit.invoice_type(), InvoiceType::CreditNote);

        let s = store.recompute_amounts(credit.id()).await.unwrap();
        assert_eq!(s.billed_amount, Money::ZERO);
        assert_eq!(s.state, InvoiceState::Open);
    }
}
