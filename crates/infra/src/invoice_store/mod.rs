//! Invoice persistence boundary.
//!
//! Stores own invoices with their rows, payments and credit-note links, and
//! run settlement and numbering as single atomic operations: every derived
//! field is written in one commit or not at all.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInvoiceStore;
pub use postgres::PostgresInvoiceStore;
pub use r#trait::{InvoiceStore, InvoiceStoreError};
