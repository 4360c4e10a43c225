use tracing::{debug, warn};

use super::backoff::Backoff;
use super::model::{NewOperation, OperationState, QueuedOperation, now_millis};
use super::store::{StoreError, SyncStore};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Durable per-path FIFO of mutating operations. Enqueue only touches SQLite, so it
/// works the same online and offline.
#[derive(Clone)]
pub struct OfflineOperationQueue {
    store: SyncStore,
    backoff: Backoff,
    max_attempts: u32,
}

impl OfflineOperationQueue {
    pub fn new(store: SyncStore) -> Self {
        Self::with_policy(store, Backoff::default(), DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_policy(store: SyncStore, backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            store,
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn enqueue(&self, op: NewOperation) -> Result<i64, StoreError> {
        let id = self.store.insert_op(&op, now_millis()).await?;
        debug!(folder = %op.folder_id, path = %op.path, op = op.kind.as_str(), id, "queued operation");
        Ok(id)
    }

    pub async fn dequeue_next(&self, folder_id: &str) -> Result<Option<QueuedOperation>, StoreError> {
        self.store.lease_next_op(folder_id, now_millis()).await
    }

    /// Removes a finished operation. Unknown ids are ignored so repeated calls are harmless.
    pub async fn mark_success(&self, id: i64) -> Result<(), StoreError> {
        self.store.delete_op(id).await?;
        Ok(())
    }

    /// Counts a failed attempt. Past the ceiling the operation waits for the user.
    pub async fn mark_failure(
        &self,
        id: i64,
        error: &str,
    ) -> Result<Option<QueuedOperation>, StoreError> {
        self.mark_failure_after(id, error, None).await
    }

    /// Like [`OfflineOperationQueue::mark_failure`], but never retries earlier than a
    /// server-provided `Retry-After`.
    pub async fn mark_failure_after(
        &self,
        id: i64,
        error: &str,
        retry_after_secs: Option<u64>,
    ) -> Result<Option<QueuedOperation>, StoreError> {
        let Some(op) = self.store.get_op(id).await? else {
            return Ok(None);
        };
        let attempt = op.attempt.saturating_add(1);
        if attempt >= self.max_attempts {
            warn!(folder = %op.folder_id, path = %op.path, attempt, error, "operation needs attention");
            self.store
                .update_op_state(id, OperationState::NeedsAttention, attempt, None, Some(error))
                .await?;
        } else {
            let now = now_millis();
            let hinted = retry_after_secs
                .map(|secs| now.saturating_add(secs.saturating_mul(1_000).min(i64::MAX as u64) as i64))
                .unwrap_or(i64::MIN);
            let retry_at = self.backoff.retry_at(now, attempt).max(hinted);
            debug!(folder = %op.folder_id, path = %op.path, attempt, retry_at, "operation scheduled for retry");
            self.store
                .update_op_state(id, OperationState::Pending, attempt, Some(retry_at), Some(error))
                .await?;
        }
        self.store.get_op(id).await
    }

    /// Parks an operation without consuming its retry budget.
    pub async fn mark_needs_attention(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let Some(op) = self.store.get_op(id).await? else {
            return Ok(());
        };
        self.store
            .update_op_state(id, OperationState::NeedsAttention, op.attempt, None, Some(error))
            .await?;
        Ok(())
    }

    /// Returns a leased operation to pending, e.g. after the pass was cancelled.
    pub async fn release(&self, id: i64) -> Result<(), StoreError> {
        self.store.release_op(id).await?;
        Ok(())
    }

    pub async fn retry(&self, id: i64) -> Result<bool, StoreError> {
        self.store.reset_op(id).await
    }

    /// Drops an operation that is not currently running.
    pub async fn cancel(&self, id: i64) -> Result<bool, StoreError> {
        self.store.delete_idle_op(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueuedOperation>, StoreError> {
        self.store.get_op(id).await
    }

    pub async fn list_for_folder(&self, folder_id: &str) -> Result<Vec<QueuedOperation>, StoreError> {
        self.store.list_ops(folder_id).await
    }

    pub async fn list_all(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        self.store.list_all_ops().await
    }

    pub async fn recover_in_flight(&self) -> Result<u64, StoreError> {
        self.store.recover_in_flight_ops().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::model::OperationKind;

    async fn make_queue() -> OfflineOperationQueue {
        let store = SyncStore::in_memory().await.unwrap();
        OfflineOperationQueue::with_policy(store, Backoff::immediate(), 3)
    }

    #[tokio::test]
    async fn mark_success_is_idempotent() {
        let queue = make_queue().await;
        let id = queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "a.txt"))
            .await
            .unwrap();
        queue.dequeue_next("f1").await.unwrap().unwrap();

        queue.mark_success(id).await.unwrap();
        queue.mark_success(id).await.unwrap();
        queue.mark_success(9_999).await.unwrap();
        assert!(queue.list_for_folder("f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failures_hit_the_ceiling_then_user_retry_resets() {
        let queue = make_queue().await;
        let id = queue
            .enqueue(NewOperation::new("f1", OperationKind::Delete, "old.txt"))
            .await
            .unwrap();

        for expected_attempt in 1..=2 {
            let op = queue.dequeue_next("f1").await.unwrap().unwrap();
            let after = queue.mark_failure(op.id, "timeout").await.unwrap().unwrap();
            assert_eq!(after.attempt, expected_attempt);
            assert_eq!(after.state, OperationState::Pending);
        }

        let op = queue.dequeue_next("f1").await.unwrap().unwrap();
        let after = queue.mark_failure(op.id, "timeout").await.unwrap().unwrap();
        assert_eq!(after.state, OperationState::NeedsAttention);
        assert_eq!(after.attempt, 3);
        assert!(queue.dequeue_next("f1").await.unwrap().is_none());

        assert!(queue.retry(id).await.unwrap());
        let op = queue.dequeue_next("f1").await.unwrap().unwrap();
        assert_eq!(op.attempt, 0);
        assert_eq!(op.last_error, None);
    }

    #[tokio::test]
    async fn retry_after_hint_delays_the_next_lease() {
        let queue = make_queue().await;
        let id = queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "a.txt"))
            .await
            .unwrap();
        queue.dequeue_next("f1").await.unwrap().unwrap();
        let after = queue
            .mark_failure_after(id, "429", Some(120))
            .await
            .unwrap()
            .unwrap();
        assert!(after.retry_at.unwrap() >= now_millis() + 100_000);
        assert!(queue.dequeue_next("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_does_not_count_an_attempt() {
        let queue = make_queue().await;
        queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "a.txt"))
            .await
            .unwrap();
        let op = queue.dequeue_next("f1").await.unwrap().unwrap();
        queue.release(op.id).await.unwrap();

        let again = queue.dequeue_next("f1").await.unwrap().unwrap();
        assert_eq!(again.id, op.id);
        assert_eq!(again.attempt, 0);
    }

    #[tokio::test]
    async fn cancel_skips_running_operations() {
        let queue = make_queue().await;
        let running = queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "a.txt"))
            .await
            .unwrap();
        let waiting = queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "b.txt"))
            .await
            .unwrap();
        queue.dequeue_next("f1").await.unwrap().unwrap();

        assert!(!queue.cancel(running).await.unwrap());
        assert!(queue.cancel(waiting).await.unwrap());
        assert_eq!(queue.list_for_folder("f1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backoff_delays_the_next_attempt() {
        let store = SyncStore::in_memory().await.unwrap();
        let queue = OfflineOperationQueue::with_policy(
            store,
            Backoff::new(
                std::time::Duration::from_secs(60),
                std::time::Duration::from_secs(60),
                false,
            ),
            3,
        );
        queue
            .enqueue(NewOperation::new("f1", OperationKind::Upload, "a.txt"))
            .await
            .unwrap();
        let op = queue.dequeue_next("f1").await.unwrap().unwrap();
        let after = queue.mark_failure(op.id, "503").await.unwrap().unwrap();
        assert!(after.retry_at.unwrap() >= now_millis() + 59_000);
        assert!(queue.dequeue_next("f1").await.unwrap().is_none());
    }
}
