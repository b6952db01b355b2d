mod availability;
mod booking_link;
mod catalog;
mod conflict;
mod day_lock;
mod error;
mod ledger;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use booking_link::{NewLink, check_link};
pub use catalog::{NewService, NewStaff};
pub use day_lock::{DayKey, DayLockGuard, DayLockManager};
pub use error::{EngineError, LinkError};
pub use ledger::PaymentRequest;
pub use mutations::NewAppointment;
pub use queries::EngineStats;
pub use store::{Booked, StaffSchedule, Store};

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::wal::Wal;

use store::event_business_id;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit.
///
/// Every append that is already queued when the first one arrives joins the
/// same batch and shares a single fsync. A non-append command closes the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut trailing = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    trailing = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(other) = trailing {
            handle_non_append(&mut wal, other);
        }
    }
    debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = write_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: a batch that fails anywhere is cut back out of the file,
/// so none of its frames can replay after a restart.
fn write_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!(path = %wal.path().display(), error = %e, "WAL batch failed, rolling back");
        if let Err(rollback) = wal.rollback() {
            error!(path = %wal.path().display(), error = %rollback, "WAL rollback failed");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Run `fut` on its own task so a caller that goes away mid-operation cannot
/// leave locks or a half-applied decision behind.
pub(crate) async fn detach<T, F>(fut: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| EngineError::Internal(format!("scheduling task failed: {e}")))?
}

/// Scheduling state and write path of a single business.
pub struct Engine {
    pub business_id: Ulid,
    pub(super) store: Store,
    pub(super) day_locks: DayLockManager,
    pub(super) link_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    /// Held across the duplicate check and the insert of a payment.
    pub(super) ledger_lock: Mutex<()>,
    /// Serializes catalog writes that enforce name/email uniqueness.
    pub(super) catalog_lock: Mutex<()>,
    /// Writers share it; compaction takes it exclusively so no append can
    /// slip between the snapshot and the file swap.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) lock_timeout: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("business_id", &self.business_id)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Replay `wal_path` into a fresh store and start the WAL writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(
        business_id: Ulid,
        wal_path: PathBuf,
        clock: Arc<dyn Clock>,
        lock_timeout: Duration,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new(business_id);
        for event in &events {
            store.apply(event);
        }
        if !events.is_empty() {
            info!(business_id = %business_id, events = events.len(), "replayed WAL");
        }

        Ok(Self {
            business_id,
            store,
            day_locks: DayLockManager::new(),
            link_locks: DashMap::new(),
            ledger_lock: Mutex::new(()),
            catalog_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal_tx,
            clock,
            lock_timeout,
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `event` durable, then apply it to the in-memory store.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        if let Some(owner) = event_business_id(&event) {
            self.ensure_owned(owner, self.business_id)?;
        }
        let _gate = self.commit_gate.read().await;
        self.wal_append(&event).await?;
        self.store.apply(&event);
        Ok(())
    }

    /// Reject any record whose business is not this engine's.
    pub(super) fn ensure_owned(&self, owner: Ulid, id: Ulid) -> Result<(), EngineError> {
        if owner != self.business_id {
            return Err(EngineError::CrossTenant(id));
        }
        Ok(())
    }

    pub(super) fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn day_locks(&self) -> &DayLockManager {
        &self.day_locks
    }

    // ── Compaction ───────────────────────────────────────

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as a snapshot of current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot();
        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(business_id = %self.business_id, events = count, "compacted WAL");
        Ok(())
    }
}
