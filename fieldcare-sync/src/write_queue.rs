//! Write queue: submits one reconciled batch as a single unit of work

use crate::error::{SyncError, SyncResult};
use crate::reconcile::{PendingWrite, WriteKind};
use crate::resource::ResourceType;
use crate::storage::{CommitReceipt, Storage};
use std::sync::Arc;

/// Persistence order within a batch. Deletes go last so an upsert never
/// races a delete of a recycled identifier.
fn rank(kind: WriteKind) -> u8 {
    match kind {
        WriteKind::Insert => 0,
        WriteKind::Update => 1,
        WriteKind::Delete => 2,
    }
}

#[derive(Clone)]
pub struct WriteQueue {
    storage: Arc<dyn Storage>,
}

impl WriteQueue {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist a batch for one resource type atomically.
    ///
    /// An empty batch opens no transaction. On any error the transaction is
    /// dropped, which rolls back everything enqueued so far.
    pub async fn submit(
        &self,
        resource: ResourceType,
        mut operations: Vec<PendingWrite>,
    ) -> SyncResult<CommitReceipt> {
        if operations.is_empty() {
            return Ok(CommitReceipt::default());
        }
        if let Some(stray) = operations.iter().find(|op| op.resource() != resource) {
            return Err(SyncError::InvalidOperation(format!(
                "{} write for {} submitted in a {} batch",
                stray.resource(),
                stray.uid(),
                resource
            )));
        }

        // Stable, so the reconciler's order is kept within each kind
        operations.sort_by_key(|op| rank(op.kind()));

        let count = operations.len();
        let mut tx = self.storage.begin_transaction().await?;
        for operation in operations {
            tx.enqueue(operation).await?;
        }
        let receipt = tx.commit().await?;

        tracing::debug!(
            resource = %resource,
            operations = count,
            inserted = receipt.inserted,
            updated = receipt.updated,
            deleted = receipt.deleted,
            skipped = receipt.skipped,
            "Committed write batch"
        );

        Ok(receipt)
    }
}
