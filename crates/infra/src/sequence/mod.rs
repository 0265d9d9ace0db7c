//! Named, persisted monotonic counters.
//!
//! Each sequence hands out strictly increasing integers with no duplicates,
//! even when many workers ask for the next value at the same time. Values are
//! assigned by the backing store at commit; a failed call consumes nothing.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySequenceAllocator;
pub use postgres::{allocate_in_tx, PostgresSequenceAllocator};
pub use r#trait::{MAX_SEQUENCE_NAME_LEN, SequenceAllocator, SequenceError, SequenceName};
