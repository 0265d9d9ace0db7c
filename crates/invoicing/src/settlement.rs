//! Invoice settlement: net billed rows against payments and credit notes.
//!
//! The calculator is a pure function of the invoice header and its child
//! collections. Stores load the collections inside a transaction, call
//! [`recompute`], and write the resulting [`Settlement`] back in the same
//! commit.

use serde::{Deserialize, Serialize};

use leasebook_core::{DomainResult, Money};

use crate::invoice::{CreditInvoice, Invoice, InvoiceRow, InvoiceState, InvoiceType, Payment};

/// Derived amounts and state for one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub billed_amount: Money,
    pub total_amount: Money,
    pub outstanding_amount: Money,
    pub state: InvoiceState,
    /// Sum of payments; informational, not persisted.
    pub payments_total: Money,
    /// Sum of all linked credit note rows; informational, not persisted.
    pub credited_total: Money,
}

impl Settlement {
    /// Write the four persisted fields onto the invoice header.
    pub fn apply_to(&self, invoice: &mut Invoice) {
        invoice.set_settled(
            self.billed_amount,
            self.total_amount,
            self.outstanding_amount,
            self.state,
        );
    }

    /// Whether applying this settlement would change the invoice.
    pub fn differs_from(&self, invoice: &Invoice) -> bool {
        self.billed_amount != invoice.billed_amount()
            || self.total_amount != invoice.total_amount()
            || self.outstanding_amount != invoice.outstanding_amount()
            || self.state != invoice.state()
    }
}

/// Recompute billed/total/outstanding amounts and the resulting state.
///
/// Credit notes count with the full total of their rows, whatever state the
/// credit note itself is in. State transitions are evaluated in order:
///
/// 1. credited total is non-zero and covers the billed total → `Refunded`
/// 2. charge invoice with nothing outstanding → `Paid`
/// 3. otherwise the current state is kept (never reverts to `Open`)
///
/// Negative or oversized amounts anywhere in the inputs fail validation
/// before anything is computed, and every sum is overflow-checked.
pub fn recompute(
    invoice: &Invoice,
    rows: &[InvoiceRow],
    payments: &[Payment],
    credit_invoices: &[CreditInvoice],
) -> DomainResult<Settlement> {
    for row in rows {
        row.validate()?;
    }
    for payment in payments {
        payment.validate()?;
    }
    for credit in credit_invoices {
        for row in &credit.rows {
            row.validate()?;
        }
    }

    let billed = Money::try_sum(rows.iter().map(|r| r.amount))?;
    let payments_total = Money::try_sum(payments.iter().map(|p| p.paid_amount))?;
    let credited_total = Money::try_sum(
        credit_invoices
            .iter()
            .map(CreditInvoice::rows_total)
            .collect::<DomainResult<Vec<_>>>()?,
    )?;

    let outstanding = billed
        .checked_sub(payments_total)?
        .checked_sub(credited_total)?
        .clamp_to_zero();

    // Refund takes priority even when payments already covered the invoice.
    let state = if !credited_total.is_zero() && credited_total >= billed {
        InvoiceState::Refunded
    } else if invoice.invoice_type() == InvoiceType::Charge && outstanding.is_zero() {
        InvoiceState::Paid
    } else {
        invoice.state()
    };

    Ok(Settlement {
        billed_amount: billed,
        total_amount: billed,
        outstanding_amount: outstanding,
        state,
        payments_total,
        credited_total,
    })
}
