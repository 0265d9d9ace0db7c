//! Store wiring selected from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::{InfraConfig, NumberingConfig};
use crate::db;
use crate::invoice_store::{InMemoryInvoiceStore, InvoiceStore, PostgresInvoiceStore};
use crate::sequence::{InMemorySequenceAllocator, PostgresSequenceAllocator, SequenceAllocator};

/// The sequence allocator and invoice store a process runs with.
///
/// Both share one backend: with a database configured they share the pool,
/// otherwise the invoice store numbers invoices from the same in-memory
/// counters the allocator hands out.
#[derive(Clone)]
pub struct Services {
    pub sequences: Arc<dyn SequenceAllocator>,
    pub invoices: Arc<dyn InvoiceStore>,
    pub numbering: NumberingConfig,
}

impl Services {
    pub async fn from_config(config: &InfraConfig) -> anyhow::Result<Self> {
        match &config.database {
            Some(database) => {
                let pool = db::connect(database)
                    .await
                    .context("failed to initialize Postgres stores")?;
                info!("using Postgres stores");
                Ok(Self {
                    sequences: Arc::new(PostgresSequenceAllocator::new(pool.clone())),
                    invoices: Arc::new(PostgresInvoiceStore::new(pool)),
                    numbering: config.numbering.clone(),
                })
            }
            None => {
                info!("DATABASE_URL not set; using in-memory stores");
                Ok(Self::in_memory(config.numbering.clone()))
            }
        }
    }

    pub fn in_memory(numbering: NumberingConfig) -> Self {
        let sequences = Arc::new(InMemorySequenceAllocator::new());
        Self {
            invoices: Arc::new(InMemoryInvoiceStore::with_sequences(sequences.clone())),
            sequences,
            numbering,
        }
    }
}
