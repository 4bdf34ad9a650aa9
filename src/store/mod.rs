//! The published slot set: the only state the calculator owns.

mod materialize;

pub use materialize::materialize;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::MAX_INSERT_BATCH;
use crate::model::*;
use crate::wal::Wal;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),

    #[error("slot of staff {staff_id} starting at {start} lies outside the replaced scope")]
    OutOfScope { staff_id: Ulid, start: Ms },

    #[error("duplicate slot for staff {staff_id} starting at {start}")]
    DuplicateSlot { staff_id: Ulid, start: Ms },

    #[error("staff {staff_id} is already published under another tenant")]
    TenantMismatch { staff_id: Ulid },

    #[error("insert batch of {0} rows exceeds the limit of {max}", max = MAX_INSERT_BATCH)]
    BatchTooLarge(usize),
}

/// One atomic replacement: drop everything `filter` owns, then insert `batches`.
#[derive(Debug, Clone)]
pub struct ReplaceBatch {
    pub filter: ScopeFilter,
    pub batches: Vec<Vec<AvailabilitySlot>>,
}

impl ReplaceBatch {
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Every row must belong to the scope being replaced and appear only once.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut keys = HashSet::with_capacity(self.row_count());
        for batch in &self.batches {
            if batch.len() > MAX_INSERT_BATCH {
                return Err(StoreError::BatchTooLarge(batch.len()));
            }
            for slot in batch {
                if !self.filter.matches(slot) {
                    return Err(StoreError::OutOfScope {
                        staff_id: slot.staff_id,
                        start: slot.start,
                    });
                }
                if !keys.insert(slot.key()) {
                    return Err(StoreError::DuplicateSlot {
                        staff_id: slot.staff_id,
                        start: slot.start,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Where published slots live. `replace` must be all-or-nothing.
#[async_trait]
pub trait SlotRepository: Send + Sync {
    /// Atomically replace the filter's slots. Returns the number of rows written.
    async fn replace(&self, batch: ReplaceBatch) -> Result<usize, StoreError>;

    /// Published slots matching `filter`, ordered by staff then start.
    async fn query(&self, filter: &ScopeFilter) -> Vec<AvailabilitySlot>;

    /// Drop every slot ending at or before `before`. Returns the number removed.
    async fn prune_expired(&self, before: Ms) -> Result<usize, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    /// All events of one transaction; fsynced before the response.
    Commit {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits for group commit.
/// 1. Block until the first Commit arrives.
/// 2. Drain all immediately available Commits (the batch window).
/// 3. Buffer every event, then a single flush_sync for the whole batch.
/// 4. Respond to each sender with the outcome of its own transaction.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Commit { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Commit { events, response }) => {
                            batch.push((events, response))
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let results = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, results);

                if let Some(other) = deferred {
                    handle_non_commit(&mut wal, other);
                }
            }
            other => handle_non_commit(&mut wal, other),
        }
    }
}

fn copy_error(e: &io::Error) -> io::Error {
    io::Error::new(e.kind(), e.to_string())
}

/// Append every transaction of the batch and fsync once. The result at index `i`
/// belongs to `batch[i]`: transactions buffered before a failed append still
/// commit, the failed one and everything after it do not.
fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> Vec<io::Result<()>> {
    let mut results = Vec::with_capacity(batch.len());
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Some(e) = &append_err {
            results.push(Err(copy_error(e)));
            continue;
        }
        match events.iter().try_for_each(|event| wal.append_buffered(event)) {
            Ok(()) => results.push(Ok(())),
            Err(e) => {
                results.push(Err(copy_error(&e)));
                append_err = Some(e);
            }
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    // A transaction cut short has no commit record and is dropped on replay.
    if let Err(e) = wal.flush_sync() {
        for result in results.iter_mut().filter(|r| r.is_ok()) {
            *result = Err(copy_error(&e));
        }
    }
    results
}

fn respond_batch(batch: Vec<PendingCommit>, results: Vec<io::Result<()>>) {
    for ((_, tx), result) in batch.into_iter().zip(results) {
        let _ = tx.send(result);
    }
}

fn handle_non_commit(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Commit { .. } => unreachable!(),
    }
}

// ── Store ────────────────────────────────────────────────

/// Published slots of one staff member, sorted by start.
///
/// `tenant_id` only changes while the `slots` write lock is held, and only when
/// the entry is empty after a clear.
#[derive(Clone)]
struct StaffEntry {
    tenant_id: String,
    slots: Arc<RwLock<Vec<AvailabilitySlot>>>,
}

fn slot_order(a: &AvailabilitySlot, b: &AvailabilitySlot) -> std::cmp::Ordering {
    (a.start, a.location_id, &a.category_code, a.duration_minutes).cmp(&(
        b.start,
        b.location_id,
        &b.category_code,
        b.duration_minutes,
    ))
}

/// Apply one committed event to plain (unshared) state. Used during replay.
fn apply_event(state: &mut HashMap<Ulid, (String, Vec<AvailabilitySlot>)>, event: Event) {
    match event {
        Event::ScopeCleared { filter, .. } => {
            for (staff_id, (tenant_id, slots)) in state.iter_mut() {
                if filter.matches_staff(tenant_id, staff_id) {
                    slots.retain(|s| !filter.range.contains_instant(s.start));
                }
            }
        }
        Event::SlotsInserted { slots, .. } => {
            for slot in slots {
                let (tenant_id, rows) = state
                    .entry(slot.staff_id)
                    .or_insert_with(|| (slot.tenant_id.clone(), Vec::new()));
                // A committed insert under another tenant means the staff member moved.
                if *tenant_id != slot.tenant_id {
                    tenant_id.clone_from(&slot.tenant_id);
                }
                rows.push(slot);
            }
        }
        Event::SlotsExpired { before, .. } => {
            for (_, slots) in state.values_mut() {
                slots.retain(|s| s.end > before);
            }
        }
        Event::ReplaceCommitted { .. } => {}
    }
}

/// One staff member write-locked by a replace.
struct LockedStaff {
    id: Ulid,
    /// Tag read after the lock was taken.
    tenant_id: String,
    /// Whether the replace's filter owns this staff member.
    owned: bool,
    slots: OwnedRwLockWriteGuard<Vec<AvailabilitySlot>>,
}

/// WAL-backed published slot set.
///
/// Replaces take the per-staff write locks of every staff member they touch, in
/// id order, and readers take read locks in the same order, so no reader sees a
/// half-applied replace. Compaction excludes all replaces via `commit_gate`.
///
/// Replaces and prunes run on a spawned task: once started, the WAL commit and
/// the in-memory apply both happen even if the caller stops waiting.
pub struct SlotStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    staff: DashMap<Ulid, StaffEntry>,
    wal_tx: mpsc::Sender<WalCommand>,
    commit_gate: RwLock<()>,
}

impl SlotStore {
    /// Open the store, replaying committed transactions from `wal_path`.
    /// Must be called inside a Tokio runtime: it spawns the WAL writer.
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let replay = Wal::replay(wal_path)?;
        if replay.torn_tail {
            warn!(
                path = %wal_path.display(),
                valid_len = replay.valid_len,
                "WAL ends in a torn entry; cutting it off"
            );
            Wal::cut_torn_tail(wal_path, replay.valid_len)?;
        }
        if replay.abandoned_txns > 0 {
            warn!(count = replay.abandoned_txns, "discarded uncommitted replace transactions");
        }

        let mut state = HashMap::new();
        let replayed = replay.events.len();
        for event in replay.events {
            apply_event(&mut state, event);
        }

        let staff = DashMap::new();
        let mut published = 0;
        for (staff_id, (tenant_id, mut slots)) in state {
            published += slots.len();
            slots.sort_by(slot_order);
            staff.insert(
                staff_id,
                StaffEntry {
                    tenant_id,
                    slots: Arc::new(RwLock::new(slots)),
                },
            );
        }
        metrics::gauge!(crate::observability::PUBLISHED_SLOTS).set(published as f64);
        info!(
            path = %wal_path.display(),
            events = replayed,
            staff = staff.len(),
            published,
            "slot store opened"
        );

        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(1024);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            inner: Arc::new(StoreInner {
                staff,
                wal_tx,
                commit_gate: RwLock::new(()),
            }),
        })
    }

    pub async fn slots_for_staff(&self, staff_id: &Ulid) -> Vec<AvailabilitySlot> {
        let entry = match self.inner.staff.get(staff_id) {
            Some(e) => e.value().clone(),
            None => return Vec::new(),
        };
        let guard = entry.slots.read().await;
        guard.clone()
    }

    pub async fn slot_count(&self) -> usize {
        let entries: Vec<StaffEntry> =
            self.inner.staff.iter().map(|e| e.value().clone()).collect();
        let mut total = 0;
        for entry in entries {
            total += entry.slots.read().await.len();
        }
        total
    }

    /// Rewrite the WAL as a single committed snapshot of the current slots.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let inner = &self.inner;
        let _gate = inner.commit_gate.write().await;

        let mut ids: Vec<Ulid> = inner.staff.iter().map(|e| *e.key()).collect();
        ids.sort();
        let txn = Ulid::new();
        let mut events = Vec::new();
        for id in ids {
            let Some(entry) = inner.staff.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let guard = entry.slots.read().await;
            for chunk in guard.chunks(MAX_INSERT_BATCH) {
                events.push(Event::SlotsInserted {
                    txn,
                    slots: chunk.to_vec(),
                });
            }
        }
        events.push(Event::ReplaceCommitted { txn });

        let (tx, rx) = oneshot::channel();
        inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl StoreInner {
    async fn wal_commit(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Commit { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// Ids of the entries tagged with a tenant and staff the filter matches.
    fn matching_ids(&self, filter: &ScopeFilter) -> Vec<Ulid> {
        self.staff
            .iter()
            .filter(|e| filter.matches_staff(&e.value().tenant_id, e.key()))
            .map(|e| *e.key())
            .collect()
    }

    /// Entries matching the filter, sorted by staff id.
    fn matching_entries(&self, filter: &ScopeFilter) -> Vec<StaffEntry> {
        let mut entries: Vec<(Ulid, StaffEntry)> = self
            .staff
            .iter()
            .filter(|e| filter.matches_staff(&e.value().tenant_id, e.key()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    fn current_tenant(&self, staff_id: &Ulid) -> Option<String> {
        self.staff.get(staff_id).map(|e| e.value().tenant_id.clone())
    }

    async fn replace(&self, batch: ReplaceBatch) -> Result<usize, StoreError> {
        let _gate = self.commit_gate.read().await;

        // Staff touched: everything the filter owns plus everyone receiving rows.
        let mut incoming: HashMap<Ulid, String> = HashMap::new();
        for slot in batch.batches.iter().flatten() {
            let tenant = incoming
                .entry(slot.staff_id)
                .or_insert_with(|| slot.tenant_id.clone());
            if *tenant != slot.tenant_id {
                return Err(StoreError::TenantMismatch { staff_id: slot.staff_id });
            }
        }
        let mut target_ids = self.matching_ids(&batch.filter);
        target_ids.extend(incoming.keys().copied());
        target_ids.sort();
        target_ids.dedup();

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut locked: Vec<LockedStaff> = Vec::with_capacity(target_ids.len());
        for id in target_ids {
            let entry = self
                .staff
                .entry(id)
                .or_insert_with(|| StaffEntry {
                    tenant_id: incoming.get(&id).cloned().unwrap_or_default(),
                    slots: Arc::new(RwLock::new(Vec::new())),
                })
                .value()
                .clone();
            let slots = entry.slots.write_owned().await;
            let tenant_id = self.current_tenant(&id).unwrap_or(entry.tenant_id);
            let owned = batch.filter.matches_staff(&tenant_id, &id);
            locked.push(LockedStaff {
                id,
                tenant_id,
                owned,
                slots,
            });
        }

        // Rows under a new tenant are only accepted once nothing is left under the old one.
        for staff in &locked {
            if let Some(tenant) = incoming.get(&staff.id)
                && *tenant != staff.tenant_id
            {
                let cleared = staff.slots.is_empty()
                    || (staff.owned
                        && staff
                            .slots
                            .iter()
                            .all(|s| batch.filter.range.contains_instant(s.start)));
                if !cleared {
                    return Err(StoreError::TenantMismatch { staff_id: staff.id });
                }
            }
        }

        let written = batch.row_count();
        let txn = Ulid::new();
        let mut events = Vec::with_capacity(batch.batches.len() + 2);
        events.push(Event::ScopeCleared {
            txn,
            filter: batch.filter.clone(),
        });
        for rows in batch.batches.iter().filter(|b| !b.is_empty()) {
            events.push(Event::SlotsInserted {
                txn,
                slots: rows.clone(),
            });
        }
        events.push(Event::ReplaceCommitted { txn });

        // Durable first; memory only changes once the commit record is on disk.
        self.wal_commit(events).await?;

        let mut removed = 0;
        for staff in locked.iter_mut().filter(|s| s.owned) {
            let before = staff.slots.len();
            staff
                .slots
                .retain(|s| !batch.filter.range.contains_instant(s.start));
            removed += before - staff.slots.len();
        }
        let position: HashMap<Ulid, usize> =
            locked.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        for slot in batch.batches.into_iter().flatten() {
            if let Some(&i) = position.get(&slot.staff_id) {
                locked[i].slots.push(slot);
            }
        }
        for staff in &mut locked {
            staff.slots.sort_by(slot_order);
            if let Some(tenant) = incoming.remove(&staff.id)
                && tenant != staff.tenant_id
                && let Some(mut entry) = self.staff.get_mut(&staff.id)
            {
                entry.tenant_id = tenant;
            }
        }

        metrics::gauge!(crate::observability::PUBLISHED_SLOTS)
            .increment(written as f64 - removed as f64);
        debug!(%txn, removed, written, "replace committed");
        Ok(written)
    }

    async fn prune_expired(&self, before: Ms) -> Result<usize, StoreError> {
        let _gate = self.commit_gate.read().await;

        let mut ids: Vec<Ulid> = self.staff.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.staff.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            guards.push(entry.slots.write_owned().await);
        }

        let expired: usize = guards
            .iter()
            .map(|g| g.iter().filter(|s| s.end <= before).count())
            .sum();
        if expired == 0 {
            return Ok(0);
        }

        let txn = Ulid::new();
        self.wal_commit(vec![
            Event::SlotsExpired { txn, before },
            Event::ReplaceCommitted { txn },
        ])
        .await?;

        for guard in &mut guards {
            guard.retain(|s| s.end > before);
        }
        metrics::gauge!(crate::observability::PUBLISHED_SLOTS).decrement(expired as f64);
        debug!(%txn, expired, before, "expired slots pruned");
        Ok(expired)
    }

    async fn query(&self, filter: &ScopeFilter) -> Vec<AvailabilitySlot> {
        let entries = self.matching_entries(filter);
        let mut guards = Vec::with_capacity(entries.len());
        for entry in entries {
            guards.push(entry.slots.read_owned().await);
        }
        guards
            .iter()
            .flat_map(|g| g.iter())
            .filter(|s| filter.range.contains_instant(s.start))
            .cloned()
            .collect()
    }
}

fn join_failed(e: tokio::task::JoinError) -> StoreError {
    StoreError::Wal(format!("store task failed: {e}"))
}

#[async_trait]
impl SlotRepository for SlotStore {
    async fn replace(&self, batch: ReplaceBatch) -> Result<usize, StoreError> {
        batch.validate()?;
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.replace(batch).await })
            .await
            .map_err(join_failed)?
    }

    async fn query(&self, filter: &ScopeFilter) -> Vec<AvailabilitySlot> {
        self.inner.query(filter).await
    }

    async fn prune_expired(&self, before: Ms) -> Result<usize, StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.prune_expired(before).await })
            .await
            .map_err(join_failed)?
    }
}
