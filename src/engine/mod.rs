mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use conflict::{any_conflict, conflicts, first_conflict};
pub use error::{ErrorKind, PermanentError, StoreError};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use conflict::check_no_conflict;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

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

/// Owns the WAL. Blocks for the first append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            // The whole batch fails together; none of it may reach a later flush.
            wal.discard_unsynced();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

type DurableAck = oneshot::Receiver<io::Result<()>>;

/// How to take back an in-memory apply whose WAL write failed.
enum Undo {
    Remove(ReservationId),
    Restore(Reservation),
    Rename(Option<String>),
}

/// Shared state the commit path mutates outside the equipment locks. Cheap to
/// clone into the task that settles a commit.
#[derive(Clone)]
pub(super) struct Ledger {
    pub(super) equipment: Arc<DashMap<ResourceId, SharedEquipmentState>>,
    /// Primary index: reservation id → equipment holding it.
    pub(super) reservation_index: Arc<DashMap<ReservationId, ResourceId>>,
    pub(super) requester_index: Arc<DashMap<RequesterId, Vec<ReservationId>>>,
    pub(super) notify: Arc<NotifyHub>,
}

impl Ledger {
    fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            equipment: Arc::new(DashMap::new()),
            reservation_index: Arc::new(DashMap::new()),
            requester_index: Arc::new(DashMap::new()),
            notify,
        }
    }

    /// Apply an event that lives under one equipment lock. Registration and
    /// retirement are handled at the map level and return `None`.
    fn apply(&self, es: &mut EquipmentState, event: &Event) -> Option<Undo> {
        match event {
            Event::ReservationCreated {
                id,
                resource_id,
                requester_id,
                span,
            } => {
                let reservation = Reservation {
                    id: *id,
                    resource_id: *resource_id,
                    requester_id: requester_id.clone(),
                    span: *span,
                };
                self.index(&reservation);
                es.insert_reservation(reservation);
                Some(Undo::Remove(*id))
            }
            Event::ReservationCancelled { id, .. } => {
                let removed = es.remove_reservation(*id)?;
                self.unindex(&removed);
                Some(Undo::Restore(removed))
            }
            Event::EquipmentRenamed { name, .. } => {
                Some(Undo::Rename(std::mem::replace(&mut es.name, name.clone())))
            }
            Event::EquipmentRegistered { .. } | Event::EquipmentRetired { .. } => None,
        }
    }

    fn revert(&self, es: &mut EquipmentState, undo: Undo) {
        match undo {
            Undo::Remove(id) => {
                if let Some(r) = es.remove_reservation(id) {
                    self.unindex(&r);
                }
            }
            Undo::Restore(r) => {
                self.index(&r);
                es.insert_reservation(r);
            }
            Undo::Rename(name) => es.name = name,
        }
    }

    fn index(&self, r: &Reservation) {
        self.reservation_index.insert(r.id, r.resource_id);
        self.requester_index
            .entry(r.requester_id.clone())
            .or_default()
            .push(r.id);
    }

    fn unindex(&self, r: &Reservation) {
        self.reservation_index.remove(&r.id);
        if let Some(mut ids) = self.requester_index.get_mut(&r.requester_id) {
            ids.retain(|id| *id != r.id);
        }
        self.requester_index
            .remove_if(&r.requester_id, |_, ids| ids.is_empty());
    }

    /// Tell subscribers about a durable event.
    fn publish(&self, event: &Event) {
        self.notify.send(event);
        match event {
            Event::EquipmentRetired { id } => {
                self.notify.remove(id);
                metrics::gauge!(crate::observability::EQUIPMENT_ACTIVE).set(self.equipment.len() as f64);
            }
            Event::EquipmentRegistered { .. } => {
                metrics::gauge!(crate::observability::EQUIPMENT_ACTIVE).set(self.equipment.len() as f64);
            }
            _ => {}
        }
    }
}

/// The reservation store: per-equipment state behind its own lock, backed by a
/// group-committed WAL (or nothing, for an ephemeral engine).
pub struct Engine {
    pub(super) ledger: Ledger,
    pub(super) wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Serializes register/retire/compaction. Always taken before any equipment lock.
    pub(super) registry: Arc<Mutex<()>>,
}

impl Engine {
    /// Open a durable engine, replaying the WAL at `wal_path`. Must be called
    /// inside a tokio runtime: the WAL writer runs as a spawned task.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replayed = Wal::replay(&wal_path)?;
        if replayed.torn_tail {
            warn!("WAL {} ended with a torn frame; discarded", wal_path.display());
            Wal::truncate(&wal_path, replayed.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self::build(Some(wal_tx), notify);
        engine.replay(&replayed.events);
        Ok(engine)
    }

    /// Same admission logic, no persistence.
    pub fn ephemeral(notify: Arc<NotifyHub>) -> Self {
        Self::build(None, notify)
    }

    fn build(wal_tx: Option<mpsc::Sender<WalCommand>>, notify: Arc<NotifyHub>) -> Self {
        Self {
            ledger: Ledger::new(notify),
            wal_tx,
            registry: Arc::new(Mutex::new(())),
        }
    }

    /// Fold the log into fresh state. Runs before the engine is shared, so it
    /// builds plain `EquipmentState`s and wraps them in locks at the end.
    fn replay(&self, events: &[Event]) {
        let ledger = &self.ledger;
        let mut states: BTreeMap<ResourceId, EquipmentState> = BTreeMap::new();
        for event in events {
            match event {
                Event::EquipmentRegistered { id, name } => {
                    states.insert(*id, EquipmentState::new(*id, name.clone()));
                }
                Event::EquipmentRetired { id } => {
                    if let Some(es) = states.remove(id) {
                        es.reservations.iter().for_each(|r| ledger.unindex(r));
                    }
                }
                Event::ReservationCreated { id, resource_id, span, .. } => {
                    let Some(es) = states.get_mut(resource_id) else {
                        warn!("replay: reservation {id} references unknown equipment {resource_id}");
                        continue;
                    };
                    if ledger.reservation_index.contains_key(id) {
                        warn!("replay: duplicate reservation {id}, skipped");
                        continue;
                    }
                    if let Err(e) = check_no_conflict(es, span) {
                        warn!("replay: reservation {id} skipped: {e}");
                        continue;
                    }
                    ledger.apply(es, event);
                }
                Event::ReservationCancelled { resource_id: id, .. } | Event::EquipmentRenamed { id, .. } => {
                    if let Some(es) = states.get_mut(id) {
                        ledger.apply(es, event);
                    }
                }
            }
        }
        for (id, es) in states {
            ledger.equipment.insert(id, Arc::new(RwLock::new(es)));
        }
        metrics::gauge!(crate::observability::EQUIPMENT_ACTIVE).set(ledger.equipment.len() as f64);
    }

    /// Hand an event to the WAL writer. Returns the durability acknowledgement
    /// to await, or `None` for an ephemeral engine.
    ///
    /// Cancel-safe: if the caller is dropped before this resolves, the event
    /// was not queued.
    pub(super) async fn wal_submit(&self, event: &Event) -> Result<Option<DurableAck>, StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(None);
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Transient("WAL writer shut down".into()))?;
        Ok(Some(rx))
    }

    async fn await_durable(ack: DurableAck) -> Result<(), StoreError> {
        ack.await
            .map_err(|_| StoreError::Transient("WAL writer dropped response".into()))?
            .map_err(StoreError::from)
    }

    /// Finish a commit whose event is already queued and applied in memory:
    /// wait for the WAL, then publish the event or run `undo`.
    ///
    /// The wait runs on its own task, which owns `held` (the caller's locks)
    /// until the outcome is known. A caller dropped mid-commit therefore
    /// cannot leave memory disagreeing with the log.
    pub(super) async fn settle<G, F>(
        &self,
        pending: Option<DurableAck>,
        event: Event,
        held: G,
        undo: F,
    ) -> Result<(), StoreError>
    where
        G: Send + 'static,
        F: FnOnce(&Ledger, G) + Send + 'static,
    {
        let Some(ack) = pending else {
            self.ledger.publish(&event);
            return Ok(());
        };
        let ledger = self.ledger.clone();
        tokio::spawn(async move {
            let result = Self::await_durable(ack).await;
            match &result {
                Ok(()) => {
                    ledger.publish(&event);
                    drop(held);
                }
                Err(e) => {
                    warn!(equipment = %event.resource_id(), "commit rolled back: {e}");
                    undo(&ledger, held);
                }
            }
            result
        })
        .await
        .map_err(|e| StoreError::Transient(format!("commit task failed: {e}")))?
    }

    /// Queue and apply an event under its equipment's write lock, then settle
    /// it. The apply follows the queueing with no await in between.
    pub(super) async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<EquipmentState>,
        event: Event,
    ) -> Result<(), StoreError> {
        let pending = self.wal_submit(&event).await?;
        let undo = self.ledger.apply(&mut guard, &event);
        self.settle(pending, event, guard, move |ledger, mut guard| {
            if let Some(undo) = undo {
                ledger.revert(&mut guard, undo);
            }
        })
        .await
    }

    pub(super) fn equipment_state(&self, id: &ResourceId) -> Option<SharedEquipmentState> {
        self.ledger.equipment.get(id).map(|e| e.value().clone())
    }

    /// Write-lock live equipment. Retired equipment reads as unknown, even to
    /// a caller that fetched its state before retirement.
    pub(super) async fn resolve_equipment_write(
        &self,
        id: ResourceId,
    ) -> Result<OwnedRwLockWriteGuard<EquipmentState>, StoreError> {
        let state = self
            .equipment_state(&id)
            .ok_or(PermanentError::UnknownEquipment(id))?;
        let guard = state.write_owned().await;
        if guard.retired {
            return Err(PermanentError::UnknownEquipment(id).into());
        }
        Ok(guard)
    }

    /// Lookup reservation → equipment, acquire its write lock, and confirm the
    /// reservation is still there once the lock is held.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: ReservationId,
    ) -> Result<OwnedRwLockWriteGuard<EquipmentState>, StoreError> {
        let resource_id = self
            .ledger
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let state = self
            .equipment_state(&resource_id)
            .ok_or(StoreError::NotFound(id))?;
        let guard = state.write_owned().await;
        if guard.find(id).is_none() {
            return Err(StoreError::NotFound(id));
        }
        Ok(guard)
    }
}
