mod conflict;
mod error;
mod mutations;
mod queries;
mod report;
mod store;

pub use error::EngineError;
pub use report::utilization_row;
pub use store::{SharedEventState, SharedResourceState, Store};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};

use crate::model::Record;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(record, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                // Flush what we have before compaction or counters see the WAL.
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut appended = 0u64;
    let mut result = Ok(());
    for (record, _) in batch {
        if let Err(e) = wal.append_buffered(record) {
            result = Err(e);
            break;
        }
        appended += 1;
    }
    if result.is_ok() {
        result = wal.flush_sync();
    }

    // Every caller in the batch sees the error and leaves memory untouched,
    // so none of its records may survive to the next replay.
    if result.is_err()
        && let Err(e) = wal.discard_unsynced(appended)
    {
        tracing::error!("WAL rollback failed, log may hold unacknowledged records: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            match &result {
                Ok(()) => tracing::info!("WAL compacted to {} records", records.len()),
                Err(e) => tracing::error!("WAL compaction failed: {e}"),
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let mut batch = vec![(record, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The allocation engine: entity store, conflict checking, allocation and
/// reporting over a WAL-backed in-memory state.
///
/// Lock order: commit gate, then event, then resources in ascending id order.
pub struct Engine {
    pub store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Every mutation holds this shared across WAL append + apply; compaction
    /// takes it exclusively so its snapshot and the log swap see no mutation
    /// half-applied.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::from_records(&records);
        tracing::info!(
            events = store.event_count(),
            resources = store.resource_count(),
            allocations = store.allocation_count(),
            "replayed {} WAL records from {}",
            records.len(),
            wal_path.display()
        );

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    /// Enter the mutation path. Held until the mutation is applied.
    pub(super) async fn begin_commit(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Write a record to the WAL via the background group-commit writer.
    /// Returns once the record is fsynced.
    pub(super) async fn wal_append(&self, record: Record) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
