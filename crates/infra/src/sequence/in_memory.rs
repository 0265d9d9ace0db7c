use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::r#trait::{
    check_initial_value, validate_request, SequenceAllocator, SequenceError, SequenceName,
};

/// In-process sequence allocator.
///
/// The read-increment-write happens under one mutex, so values are unique
/// across threads of this process. Nothing is shared between processes:
/// use it for tests and single-instance deployments only.
#[derive(Debug, Default)]
pub struct InMemorySequenceAllocator {
    counters: Mutex<HashMap<SequenceName, i64>>,
}

impl InMemorySequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous allocation for callers that already hold their own lock.
    pub fn allocate(&self, name: &SequenceName, initial_value: i64) -> Result<i64, SequenceError> {
        check_initial_value(initial_value)?;
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| SequenceError::AllocationFailed("lock poisoned".to_string()))?;

        let value = match counters.get(name) {
            None => initial_value,
            Some(last) => last.checked_add(1).ok_or_else(|| {
                SequenceError::AllocationFailed(format!("sequence '{name}' exhausted"))
            })?,
        };
        counters.insert(name.clone(), value);

        debug!(sequence = %name, value, "allocated sequence value");
        Ok(value)
    }

    /// Last value handed out for `name`, if any.
    pub fn current(&self, name: &str) -> Option<i64> {
        let name = SequenceName::parse(name).ok()?;
        self.counters.lock().ok()?.get(&name).copied()
    }
}

#[async_trait]
impl SequenceAllocator for InMemorySequenceAllocator {
    async fn next_value(&self, name: &str, initial_value: i64) -> Result<i64, SequenceError> {
        let name = validate_request(name, initial_value)?;
        self.allocate(&name, initial_value)
    }
}
