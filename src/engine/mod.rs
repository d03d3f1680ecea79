mod admission;
mod catalog;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod recurring;
mod store;
#[cfg(test)]
mod tests;
mod txn;

pub use admission::BookingRequest;
pub use catalog::SlotEdit;
pub use conflict::{Replacement, Resolution};
pub use error::{Closure, EngineError, ErrorKind};
pub use ledger::count_counted;
pub use recurring::SeriesRequest;
pub use store::Store;
pub use txn::Transaction;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard, RwLock};
use ulid::Ulid;

use crate::calendar::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::outbox::Outbox;
use crate::wal::Wal;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// A slot and every booking ever made against it, keyed by date.
#[derive(Debug)]
pub struct SlotState {
    pub slot: Slot,
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: BTreeMap::new(),
        }
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.bookings.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn booking(&self, date: NaiveDate, id: Ulid) -> Option<&Booking> {
        self.bookings_on(date).iter().find(|b| b.id == id)
    }

    pub(super) fn booking_mut(&mut self, date: NaiveDate, id: Ulid) -> Option<&mut Booking> {
        self.bookings.get_mut(&date)?.iter_mut().find(|b| b.id == id)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
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

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single fsync for the whole batch; a failed batch is truncated back off the file.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(events, _)| events.as_slice()))
        .inspect_err(|e| tracing::error!("WAL batch of {} failed: {e}", batch.len()))
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let result = wal.append_batch([events.as_slice()]);
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub(super) store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) outbox: Outbox,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes catalog changes that validate against other slots, and compaction.
    pub(super) catalog_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            outbox,
            clock,
            catalog_lock: Mutex::new(()),
        };

        // We're the sole owner of every lock here, so try_write always succeeds.
        // Never block: this may run inside an async context.
        for event in &events {
            match event {
                Event::SlotCreated { slot } => engine.store.insert_slot(slot.clone()),
                other => match other.slot_id() {
                    Some(slot_id) => {
                        if let Some(state) = engine.store.get_slot(&slot_id) {
                            let mut guard = state
                                .try_write()
                                .map_err(|_| io::Error::other("replay: slot lock contended"))?;
                            engine.store.apply_event(&mut guard, other);
                        }
                    }
                    None => engine.store.apply_catalog(other),
                },
            }
        }
        tracing::debug!(events = events.len(), slots = engine.store.slot_count(), "replayed WAL");

        Ok(engine)
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn get_slot_state(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.store.get_slot(id)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Write one transaction's events to the WAL via the group-commit writer.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply for a catalog event. The caller proves it holds the catalog lock.
    pub(super) async fn persist_catalog(
        &self,
        _held: &MutexGuard<'_, ()>,
        event: Event,
    ) -> Result<(), EngineError> {
        self.wal_append(std::slice::from_ref(&event)).await?;
        match &event {
            Event::SlotCreated { slot } => {
                self.store.insert_slot(slot.clone());
                self.notify.send(slot.id, &event);
            }
            other => self.store.apply_catalog(other),
        }
        Ok(())
    }
}
