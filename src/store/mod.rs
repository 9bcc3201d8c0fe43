//! Authoritative set of committed bookings.
//!
//! Every resource has its own `RwLock<ResourceState>`; a commit holds the
//! write side across the overlap check, the WAL append and the in-memory
//! insert, so commits on one resource are linearizable while commits on
//! different resources proceed in parallel.

mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::StoreError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub wal_path: PathBuf,
    /// Upper bound on waiting for a resource's exclusion scope.
    pub lock_timeout: Duration,
}

impl StoreConfig {
    pub fn new(wal_path: PathBuf) -> Self {
        Self {
            wal_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(Control),
}

pub(super) enum Control {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    Shutdown {
        response: oneshot::Sender<io::Result<()>>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush + fsync for the whole batch, then answer every sender.
/// 4. A control command found while draining runs after the batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let control = match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        WalCommand::Control(control) => {
                            pending = Some(control);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
                match pending {
                    Some(control) => control,
                    None => continue,
                }
            }
            WalCommand::Control(control) => control,
        };
        if !handle_control(&mut wal, control) {
            break;
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    // Any failure rolls the whole batch back out of the log.
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false once the writer should stop.
fn handle_control(wal: &mut Wal, control: Control) -> bool {
    match control {
        Control::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
            true
        }
        Control::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
            true
        }
        Control::Shutdown { response } => {
            let _ = response.send(wal.flush_sync());
            false
        }
    }
}

/// Send an event to the writer and wait until it is durable.
async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::Closed)?;
    rx.await
        .map_err(|_| StoreError::Closed)?
        .map_err(|e| StoreError::WalError(e.to_string()))
}

/// Apply an event to a ResourceState (no locking, caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, ResourceId>) {
    match event {
        Event::BookingCommitted { booking } => {
            index.insert(booking.id, booking.resource_id.clone());
            rs.insert_booking(booking.clone());
        }
        Event::BookingCancelled { id, .. } => {
            rs.remove_booking(*id);
            index.remove(id);
        }
    }
}

/// Exclusive access to one resource for a commit.
pub(super) struct CommitGuard {
    _gate: OwnedRwLockReadGuard<()>,
    state: OwnedRwLockWriteGuard<ResourceState>,
}

pub struct BookingStore {
    resources: DashMap<ResourceId, SharedResourceState>,
    /// Reverse lookup: booking id → resource id.
    booking_index: Arc<DashMap<Ulid, ResourceId>>,
    catalog: Arc<dyn Catalog>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every commit and exclusively by compaction, so a
    /// snapshot never misses an append in flight.
    commit_gate: Arc<RwLock<()>>,
    lock_timeout: Duration,
    writer: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    wal_fault: Arc<std::sync::atomic::AtomicBool>,
}

impl BookingStore {
    /// Replay the WAL and start the writer task. Must run inside a Tokio runtime.
    pub fn open(config: StoreConfig, catalog: Arc<dyn Catalog>) -> Result<Self, StoreError> {
        let replay = Wal::replay(&config.wal_path)?;
        if replay.discarded_tail {
            warn!(
                "discarded torn or corrupt tail of {} after {} bytes",
                config.wal_path.display(),
                replay.valid_len
            );
            Wal::truncate(&config.wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&config.wal_path)?;

        let booking_index = Arc::new(DashMap::new());
        let mut states: HashMap<ResourceId, ResourceState> = HashMap::new();
        for event in &replay.events {
            let rs = states
                .entry(event.resource_id().clone())
                .or_insert_with_key(|id| ResourceState::new(id.clone()));
            if let Event::BookingCommitted { booking } = event
                && let Err(e) = conflict::check_no_conflict(rs, &booking.span)
            {
                error!("replay: skipping booking {} on {}: {e}", booking.id, rs.id);
                continue;
            }
            apply_to_resource(rs, event, &booking_index);
        }
        for id in states.keys() {
            if !catalog.resource_exists(id) {
                warn!("replay: bookings reference resource {id} missing from catalog");
            }
        }

        let resources: DashMap<ResourceId, SharedResourceState> = states
            .into_iter()
            .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
            .collect();
        info!(
            "store opened: {} bookings on {} resources from {}",
            booking_index.len(),
            resources.len(),
            config.wal_path.display()
        );

        #[cfg(test)]
        let wal_fault = wal.fault_switch();
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        let writer = tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            resources,
            booking_index,
            catalog,
            wal_tx,
            commit_gate: Arc::new(RwLock::new(())),
            lock_timeout: config.lock_timeout,
            writer: Mutex::new(Some(writer)),
            #[cfg(test)]
            wal_fault,
        })
    }

    /// Flush and stop the WAL writer. Later mutations fail with `Closed`.
    pub async fn close(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .wal_tx
            .send(WalCommand::Control(Control::Shutdown { response: tx }))
            .await;
        let flushed = match sent {
            Ok(()) => rx.await.map_err(|_| StoreError::Closed)?,
            Err(_) => Ok(()), // already closed
        };
        let writer = self.writer.lock().await.take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            error!("WAL writer task failed: {e}");
        }
        flushed.map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Get or lazily create the lock scope for a resource.
    fn resource_state(&self, id: &ResourceId) -> SharedResourceState {
        self.resources
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.clone()))))
            .clone()
    }

    fn busy(&self, id: &ResourceId) -> StoreError {
        StoreError::Busy {
            resource_id: id.clone(),
            waited: self.lock_timeout,
        }
    }

    /// Acquire the commit gate and the resource's write lock, bounded by
    /// `lock_timeout`. Dropping the future before it resolves has no effect.
    pub(super) async fn lock_for_commit(&self, id: &ResourceId) -> Result<CommitGuard, StoreError> {
        let rs = self.resource_state(id);
        let gate = self.commit_gate.clone();
        let started = Instant::now();
        let acquire = async move {
            let gate = gate.read_owned().await;
            let state = rs.write_owned().await;
            CommitGuard { _gate: gate, state }
        };
        let guard = tokio::time::timeout(self.lock_timeout, acquire)
            .await
            .map_err(|_| self.busy(id))?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    pub(super) async fn lock_for_read(
        &self,
        rs: SharedResourceState,
        id: &ResourceId,
    ) -> Result<OwnedRwLockReadGuard<ResourceState>, StoreError> {
        tokio::time::timeout(self.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| self.busy(id))
    }

    /// WAL-append then apply, on a task of its own: once the lock is held a
    /// dropped caller cannot leave the log and memory disagreeing.
    pub(super) async fn persist_and_apply(
        &self,
        guard: CommitGuard,
        event: Event,
    ) -> Result<(), StoreError> {
        let wal_tx = self.wal_tx.clone();
        let index = self.booking_index.clone();
        tokio::spawn(async move {
            let mut guard = guard;
            wal_append(&wal_tx, event.clone()).await?;
            apply_to_resource(&mut guard.state, &event, &index);
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(|e| StoreError::WalError(format!("commit task failed: {e}")))?
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Control(Control::AppendsSinceCompact { response: tx });
        if self.wal_tx.send(cmd).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL with one `BookingCommitted` per live booking.
    /// Returns the number of events written.
    pub async fn compact_wal(&self) -> Result<usize, StoreError> {
        let _gate = self.commit_gate.write().await;

        let states: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            events.extend(
                guard
                    .bookings
                    .iter()
                    .cloned()
                    .map(|booking| Event::BookingCommitted { booking }),
            );
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(Control::Compact { events, response: tx }))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await
            .map_err(|_| StoreError::Closed)?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        Ok(count)
    }
}
