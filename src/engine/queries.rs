use futures::future::join_all;
use tokio::sync::broadcast;

use crate::model::*;

use super::{Engine, PermanentError, StoreError};

impl Engine {
    pub async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        let resource_id = self
            .ledger
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let state = self
            .equipment_state(&resource_id)
            .ok_or(StoreError::NotFound(id))?;
        let guard = state.read().await;
        guard.find(id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Ordered by start. Unknown equipment has no reservations.
    pub async fn reservations_for_equipment(&self, resource_id: ResourceId) -> Vec<Reservation> {
        match self.equipment_state(&resource_id) {
            Some(state) => state.read().await.reservations.clone(),
            None => Vec::new(),
        }
    }

    /// Ordered by start, then equipment id.
    pub async fn reservations_for_requester(&self, requester_id: &RequesterId) -> Vec<Reservation> {
        let ids = self
            .ledger
            .requester_index
            .get(requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        // Ids cancelled between the index read and the lookup drop out as NotFound.
        let mut out: Vec<Reservation> = join_all(ids.into_iter().map(|id| self.get_reservation(id)))
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        out.sort_by_key(|r| (r.span.start, r.resource_id));
        out
    }

    pub async fn list_equipment(&self) -> Vec<EquipmentInfo> {
        let states: Vec<_> = self.ledger.equipment.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for state in states {
            out.push(state.read().await.info());
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn equipment(&self, id: ResourceId) -> Result<EquipmentInfo, StoreError> {
        let state = self
            .equipment_state(&id)
            .ok_or(PermanentError::UnknownEquipment(id))?;
        Ok(state.read().await.info())
    }

    /// Case-insensitive substring match on the name, ordered by id. Unnamed
    /// equipment never matches.
    pub async fn equipment_by_name(&self, query: &str) -> Vec<EquipmentInfo> {
        let needle = query.to_lowercase();
        self.list_equipment()
            .await
            .into_iter()
            .filter(|e| e.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&needle)))
            .collect()
    }

    /// Subscribe to committed events for one piece of equipment.
    pub fn subscribe(&self, resource_id: ResourceId) -> broadcast::Receiver<Event> {
        self.ledger.notify.subscribe(resource_id)
    }
}
