use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::{Engine, StoreError};
use crate::model::*;

/// Admission control and lifecycle over reservation records.
///
/// Implementations own their records exclusively and classify every failure
/// into a [`StoreError`]. None of them authorize: the caller checks ownership
/// before `cancel`, and resolves the requester from its own session.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Admit and persist `[start, end)` on `resource_id` as one atomic unit.
    async fn create(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError>;

    /// Ordered by start ascending.
    async fn list_by_resource(&self, resource_id: ResourceId) -> Result<Vec<Reservation>, StoreError>;

    async fn list_by_requester(&self, requester_id: &RequesterId) -> Result<Vec<Reservation>, StoreError>;

    async fn get(&self, id: ReservationId) -> Result<Reservation, StoreError>;

    /// A second cancel of the same id is `NotFound`.
    async fn cancel(&self, id: ReservationId) -> Result<(), StoreError>;
}

#[async_trait]
impl ReservationStore for Engine {
    async fn create(
        &self,
        resource_id: ResourceId,
        requester_id: RequesterId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ReservationId, StoreError> {
        self.create_reservation(resource_id, requester_id, start, end).await
    }

    async fn list_by_resource(&self, resource_id: ResourceId) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_for_equipment(resource_id).await)
    }

    async fn list_by_requester(&self, requester_id: &RequesterId) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_for_requester(requester_id).await)
    }

    async fn get(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.get_reservation(id).await
    }

    async fn cancel(&self, id: ReservationId) -> Result<(), StoreError> {
        self.cancel_reservation(id).await
    }
}

/// Run a store operation under the caller's deadline. Expiry is reported as
/// `Transient`; the store itself never times out.
pub async fn with_deadline<T, F>(deadline: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, op)
        .await
        .map_err(|_| StoreError::Transient(format!("deadline of {deadline:?} elapsed")))?
}
