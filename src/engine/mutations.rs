use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, span_from_instants};
use super::{Engine, PermanentError, StoreError, WalCommand};

impl Engine {
    pub async fn register_equipment(
        &self,
        id: ResourceId,
        name: Option<String>,
    ) -> Result<(), StoreError> {
        check_name(name.as_deref())?;
        let registry = self.registry.clone().lock_owned().await;
        if self.ledger.equipment.contains_key(&id) {
            return Err(PermanentError::EquipmentExists(id).into());
        }
        if self.ledger.equipment.len() >= MAX_EQUIPMENT {
            return Err(PermanentError::LimitExceeded("too much equipment").into());
        }

        let event = Event::EquipmentRegistered { id, name: name.clone() };
        let pending = self.wal_submit(&event).await?;
        self.ledger
            .equipment
            .insert(id, Arc::new(RwLock::new(EquipmentState::new(id, name))));
        self.settle(pending, event, registry, move |ledger, _registry| {
            ledger.equipment.remove(&id);
        })
        .await?;
        info!(equipment = %id, "equipment registered");
        Ok(())
    }

    /// Refused while the equipment still holds reservations.
    pub async fn retire_equipment(&self, id: ResourceId) -> Result<(), StoreError> {
        let registry = self.registry.clone().lock_owned().await;
        let state = self
            .equipment_state(&id)
            .ok_or(PermanentError::UnknownEquipment(id))?;
        let mut guard = state.clone().write_owned().await;
        if !guard.reservations.is_empty() {
            return Err(PermanentError::EquipmentInUse(id).into());
        }

        let event = Event::EquipmentRetired { id };
        let pending = self.wal_submit(&event).await?;
        guard.retired = true;
        self.ledger.equipment.remove(&id);
        self.settle(pending, event, (registry, guard), move |ledger, (_registry, mut guard)| {
            guard.retired = false;
            ledger.equipment.insert(id, state);
        })
        .await?;
        info!(equipment = %id, "equipment retired");
        Ok(())
    }

    /// Replace the display name. `None` clears it.
    pub async fn rename_equipment(&self, id: ResourceId, name: Option<String>) -> Result<(), StoreError> {
        check_name(name.as_deref())?;
        let guard = self.resolve_equipment_write(id).await?;
        self.commit(guard, Event::EquipmentRenamed { id, name }).await?;
        info!(equipment = %id, "equipment renamed");
        Ok(())
    }

    /// Admit and commit a reservation. Concurrent creates for the same
    /// equipment serialize on its write lock; at most one of several
    /// overlapping requests is admitted.
    pub async fn create_reservation(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError> {
        let started = Instant::now();
        let result = self.admit(resource_id, requester_id, start, end).await;
        let outcome = match &result {
            Ok(_) => "admitted",
            Err(e) => e.label(),
        };
        metrics::counter!(observability::RESERVATION_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::STORE_OP_DURATION_SECONDS, "op" => "create")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn admit(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError> {
        let span = span_from_instants(start, end)?;
        if requester_id.as_str().is_empty() || requester_id.as_str().len() > MAX_REQUESTER_LEN {
            return Err(PermanentError::InvalidRequester.into());
        }
        let guard = self.resolve_equipment_write(resource_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_EQUIPMENT {
            return Err(PermanentError::LimitExceeded("too many reservations on equipment").into());
        }

        if let Err(e) = check_no_conflict(&guard, &span) {
            debug!(equipment = %resource_id, start = span.start, end = span.end, "rejected: {e}");
            return Err(e);
        }

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            resource_id,
            requester_id: requester_id.clone(),
            span,
        };
        self.commit(guard, event).await?;
        info!(reservation = %id, equipment = %resource_id, requester = %requester_id, "reservation created");
        Ok(id)
    }

    /// Physically removes the reservation. Ownership is the caller's concern.
    pub async fn cancel_reservation(&self, id: ReservationId) -> Result<(), StoreError> {
        let started = Instant::now();
        let guard = self.resolve_reservation_write(id).await?;
        let resource_id = guard.id;
        self.commit(guard, Event::ReservationCancelled { id, resource_id })
            .await?;
        metrics::counter!(observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        metrics::histogram!(observability::STORE_OP_DURATION_SECONDS, "op" => "cancel")
            .record(started.elapsed().as_secs_f64());
        info!(reservation = %id, equipment = %resource_id, "reservation cancelled");
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds read locks on every equipment until the swap completes, so no
    /// commit can land in the old log after its snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _registry = self.registry.lock().await;

        let mut ids: Vec<ResourceId> = self.ledger.equipment.iter().map(|e| *e.key()).collect();
        ids.sort();

        let mut guards = Vec::with_capacity(ids.len());
        let mut events = Vec::new();
        for id in ids {
            let Some(state) = self.equipment_state(&id) else { continue };
            let guard = state.read_owned().await;
            if guard.retired {
                continue;
            }
            events.push(Event::EquipmentRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            events.extend(guard.reservations.iter().map(|r| Event::ReservationCreated {
                id: r.id,
                resource_id: r.resource_id,
                requester_id: r.requester_id.clone(),
                span: r.span,
            }));
            guards.push(guard);
        }

        let kept = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Transient("WAL writer dropped response".into()))??;
        drop(guards);

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = kept, "WAL compacted");
        Ok(())
    }

    /// Compact once the log has grown by `threshold` appends. Returns whether it ran.
    pub async fn compact_if_needed(&self, threshold: u64) -> Result<bool, StoreError> {
        if self.wal_tx.is_none() || self.wal_appends_since_compact().await < threshold {
            return Ok(false);
        }
        self.compact_wal().await?;
        Ok(true)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else { return 0 };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_name(name: Option<&str>) -> Result<(), StoreError> {
    if name.is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(PermanentError::LimitExceeded("equipment name too long").into());
    }
    Ok(())
}
