use std::collections::HashSet;

use tracing::debug;

use super::{ReplaceBatch, SlotRepository, StoreError};
use crate::limits::MAX_INSERT_BATCH;
use crate::model::*;

/// Publish `slots` as the complete contents of `filter`.
///
/// Rows are split into batches of at most `batch_size` (clamped to
/// `1..=MAX_INSERT_BATCH`) and handed to the repository as one atomic replace.
/// Returns the number of rows written.
pub async fn materialize(
    repo: &dyn SlotRepository,
    filter: ScopeFilter,
    slots: Vec<AvailabilitySlot>,
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = batch_size.clamp(1, MAX_INSERT_BATCH);

    let mut seen = HashSet::with_capacity(slots.len());
    for slot in &slots {
        if !filter.matches(slot) {
            return Err(StoreError::OutOfScope {
                staff_id: slot.staff_id,
                start: slot.start,
            });
        }
        if !seen.insert(slot.key()) {
            return Err(StoreError::DuplicateSlot {
                staff_id: slot.staff_id,
                start: slot.start,
            });
        }
    }

    let total = slots.len();
    let mut batches = Vec::with_capacity(total.div_ceil(batch_size));
    let mut rows = slots.into_iter().peekable();
    while rows.peek().is_some() {
        batches.push(rows.by_ref().take(batch_size).collect::<Vec<_>>());
    }
    debug!(rows = total, batches = batches.len(), "replacing published slots");

    let written = repo.replace(ReplaceBatch { filter, batches }).await?;
    metrics::counter!(crate::observability::SLOTS_WRITTEN_TOTAL).increment(written as u64);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use ulid::Ulid;

    const M: Ms = MINUTE_MS;

    /// Records every replace it receives; optionally fails them all.
    #[derive(Default)]
    struct Recording {
        fail: bool,
        received: Mutex<Vec<ReplaceBatch>>,
    }

    #[async_trait]
    impl SlotRepository for Recording {
        async fn replace(&self, batch: ReplaceBatch) -> Result<usize, StoreError> {
            if self.fail {
                return Err(StoreError::Wal("disk full".into()));
            }
            let rows = batch.row_count();
            self.received.lock().unwrap().push(batch);
            Ok(rows)
        }

        async fn query(&self, _filter: &ScopeFilter) -> Vec<AvailabilitySlot> {
            Vec::new()
        }

        async fn prune_expired(&self, _before: Ms) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn filter() -> ScopeFilter {
        ScopeFilter {
            tenant_id: Some("acme".into()),
            staff_id: None,
            range: Span::new(0, 10_000 * M),
        }
    }

    fn slots(n: usize) -> Vec<AvailabilitySlot> {
        let staff_id = Ulid::from_parts(1, 1);
        (0..n as i64)
            .map(|i| AvailabilitySlot {
                tenant_id: "acme".into(),
                staff_id,
                location_id: Ulid::from_parts(2, 2),
                category_code: "B".into(),
                start: i * 15 * M,
                end: i * 15 * M + 45 * M,
                duration_minutes: 45,
                is_available: true,
            })
            .collect()
    }

    #[tokio::test]
    async fn splits_into_bounded_batches() {
        let repo = Recording::default();
        let written = materialize(&repo, filter(), slots(250), 100).await.unwrap();
        assert_eq!(written, 250);
        let received = repo.received.lock().unwrap();
        assert_eq!(received.len(), 1, "one atomic replace");
        let sizes: Vec<usize> = received[0].batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn batch_size_is_clamped() {
        let repo = Recording::default();
        materialize(&repo, filter(), slots(2500), 50_000).await.unwrap();
        materialize(&repo, filter(), slots(3), 0).await.unwrap();
        let received = repo.received.lock().unwrap();
        let sizes: Vec<usize> = received[0].batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![MAX_INSERT_BATCH, MAX_INSERT_BATCH, 500]);
        assert_eq!(received[1].batches.len(), 3);
    }

    #[tokio::test]
    async fn empty_result_still_clears_scope() {
        let repo = Recording::default();
        assert_eq!(materialize(&repo, filter(), Vec::new(), 1000).await.unwrap(), 0);
        let received = repo.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].batches.is_empty());
    }

    #[tokio::test]
    async fn rejects_rows_outside_scope_before_writing() {
        let repo = Recording::default();
        let mut rows = slots(3);
        rows[1].tenant_id = "beta".into();
        let err = materialize(&repo, filter(), rows, 1000).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfScope { .. }));
        assert!(repo.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_duplicate_keys() {
        let repo = Recording::default();
        let mut rows = slots(2);
        rows.push(rows[0].clone());
        let err = materialize(&repo, filter(), rows, 1000).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSlot { .. }));
    }

    #[tokio::test]
    async fn repository_failure_surfaces() {
        let repo = Recording {
            fail: true,
            ..Default::default()
        };
        let err = materialize(&repo, filter(), slots(5), 1000).await.unwrap_err();
        assert!(matches!(err, StoreError::Wal(_)));
    }
}
