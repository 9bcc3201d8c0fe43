use ulid::Ulid;

use crate::model::*;

use super::{BookingStore, StoreError};

impl BookingStore {
    /// Committed bookings of one resource, ordered by start. The snapshot is
    /// taken under the resource's read lock, so it never shows a half-applied
    /// commit.
    pub async fn list_for_resource(&self, id: &ResourceId) -> Result<Vec<Booking>, StoreError> {
        let rs = match self.resources.get(id) {
            Some(entry) => entry.value().clone(),
            None if self.catalog.resource_exists(id) => return Ok(Vec::new()),
            None => return Err(StoreError::NotFound(id.clone())),
        };
        let guard = self.lock_for_read(rs, id).await?;
        Ok(guard.bookings.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let resource_id = self.booking_index.get(&id)?.value().clone();
        let rs = self.resources.get(&resource_id)?.value().clone();
        let guard = rs.read().await;
        guard.bookings.iter().find(|b| b.id == id).cloned()
    }

    /// Live bookings across every resource.
    pub fn booking_count(&self) -> usize {
        self.booking_index.len()
    }
}
