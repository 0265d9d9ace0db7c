//! Land use agreement domain module.
//!
//! Agreements are identified by a human-readable code scoped to the agreement
//! type, municipality and district. The running number inside each scope comes
//! from a named sequence; this crate only knows how to name that sequence and
//! how to render the final identifier.

pub mod identifier;

pub use identifier::{AgreementIdentifier, AgreementIdentifierScope};
