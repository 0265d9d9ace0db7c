//! Invoicing domain module.
//!
//! Business rules for land use agreement invoices: the invoice model, the
//! settlement calculator that nets rows against payments and credit notes, and
//! the 360-day-calendar increase used to derive row amounts. Everything here
//! is deterministic domain logic (no IO, no storage).

pub mod invoice;
pub mod row_amount;
pub mod settlement;

pub use invoice::{
    Compensation, CreditInvoice, Invoice, InvoiceRow, InvoiceState, InvoiceType,
    MAX_COMPENSATION_INPUT, NewInvoice, Payment, StoredInvoice,
};
pub use row_amount::{days360, increase_with_360_day_calendar};
pub use settlement::{Settlement, recompute};
