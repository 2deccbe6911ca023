//! Staged writes committed atomically

use crate::database::normalize_key;
use std::sync::Arc;
use strata_core::effects::{BatchOp, CrdtStore};
use strata_core::Result;

/// Puts and deletes applied together on [`commit`](Batch::commit).
///
/// Operations apply in staging order, so a delete staged after a put of the
/// same key removes it.
pub struct Batch {
    store: Arc<dyn CrdtStore>,
    ops: Vec<BatchOp>,
}

impl Batch {
    pub(crate) fn new(store: Arc<dyn CrdtStore>) -> Self {
        Self {
            store,
            ops: Vec::new(),
        }
    }

    /// Stage a write
    pub fn put(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        self.ops.push(BatchOp::Put {
            key: normalize_key(key)?,
            value: value.into(),
        });
        Ok(())
    }

    /// Stage a removal
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.ops.push(BatchOp::Delete {
            key: normalize_key(key)?,
        });
        Ok(())
    }

    /// Staged operation count
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every staged operation
    pub async fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.store.apply_batch(self.ops).await?;
        Ok(())
    }
}
