//! Infrastructure layer: configuration, Postgres wiring and the persistence
//! boundaries for sequences and invoices.

pub mod agreements;
pub mod config;
pub mod db;
pub mod invoice_store;
pub mod sequence;
pub mod services;

pub use agreements::assign_agreement_identifier;
pub use config::{ConfigError, DatabaseConfig, InfraConfig, NumberingConfig};
pub use invoice_store::{InMemoryInvoiceStore, InvoiceStore, InvoiceStoreError, PostgresInvoiceStore};
pub use sequence::{
    InMemorySequenceAllocator, PostgresSequenceAllocator, SequenceAllocator, SequenceError,
    SequenceName,
};
pub use services::Services;
