use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::conflict::find_conflict;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_event(&self, id: Ulid) -> Result<EventInfo, EngineError> {
        let ev = self.store.get_event(&id).ok_or(EngineError::NotFound(id))?;
        let ev = ev.read().await;
        if ev.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(ev.info())
    }

    pub async fn list_events(&self) -> Vec<EventInfo> {
        let mut events = Vec::new();
        for id in self.store.event_ids() {
            if let Ok(info) = self.get_event(id).await {
                events.push(info);
            }
        }
        events
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let rs = rs.read().await;
        if rs.deleted {
            return Err(EngineError::NotFound(id));
        }
        Ok(rs.info())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut resources = Vec::new();
        for id in self.store.resource_ids() {
            if let Ok(info) = self.get_resource(id).await {
                resources.push(info);
            }
        }
        resources
    }

    pub fn get_allocation(&self, id: Ulid) -> Result<AllocationInfo, EngineError> {
        let link = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
        Ok(AllocationInfo {
            id,
            event_id: link.event_id,
            resource_id: link.resource_id,
        })
    }

    /// Allocations of one resource, ordered by event start.
    pub async fn allocations_for_resource(&self, resource_id: Ulid) -> Result<Vec<AllocationInfo>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let rs = rs.read().await;
        if rs.deleted {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(rs
            .bookings
            .iter()
            .map(|b| AllocationInfo {
                id: b.allocation_id,
                event_id: b.event_id,
                resource_id,
            })
            .collect())
    }

    /// One allocation with its event and resource resolved.
    pub async fn get_allocation_view(&self, id: Ulid) -> Result<AllocationView, EngineError> {
        let link = self.get_allocation(id)?;
        // A concurrent cascade can remove either side after the lookup.
        let event = self
            .get_event(link.event_id)
            .await
            .map_err(|_| EngineError::NotFound(id))?;
        let resource = self
            .get_resource(link.resource_id)
            .await
            .map_err(|_| EngineError::NotFound(id))?;
        Ok(AllocationView { id, event, resource })
    }

    /// Every allocation with its event and resource resolved, grouped by
    /// resource in listing order and by event start within a resource.
    pub async fn list_allocations(&self) -> Vec<AllocationView> {
        let mut views = Vec::new();
        for rid in self.store.resource_ids() {
            // Snapshot under the resource lock, then release it before taking
            // event locks: writers lock events first.
            let (resource, bookings) = {
                let Some(rs) = self.store.get_resource(&rid) else { continue };
                let rs = rs.read().await;
                if rs.deleted {
                    continue;
                }
                (rs.info(), rs.bookings.clone())
            };
            for booking in bookings {
                // Skips allocations cascaded away since the snapshot.
                let Ok(event) = self.get_event(booking.event_id).await else { continue };
                views.push(AllocationView {
                    id: booking.allocation_id,
                    event,
                    resource: resource.clone(),
                });
            }
        }
        views
    }

    /// Whether allocating `[start, end)` on `resource_id` would conflict with
    /// an existing allocation. An unknown resource has no allocations.
    pub async fn has_conflict(
        &self,
        resource_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        if start >= end {
            return Err(EngineError::Validation("start must be before end".into()));
        }
        let span = Span::new(calendar::to_ms(start), calendar::to_ms(end));
        let Some(rs) = self.store.get_resource(&resource_id) else {
            return Ok(false);
        };
        let rs = rs.read().await;
        Ok(!rs.deleted && find_conflict(&rs, &span, None).is_some())
    }
}
