//! `leasebook-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the error model, typed identifiers and the exact-decimal `Money` type.

pub mod error;
pub mod id;
pub mod money;

pub use error::{DomainError, DomainResult};
pub use id::{InvoiceId, InvoiceRowId, PaymentId};
pub use money::{MAX_AMOUNT, Money};
