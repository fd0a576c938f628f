use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::conflict::find_conflict;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedEventState = Arc<RwLock<EventState>>;

/// In-memory entity store. Events and resources live behind their own locks;
/// allocations are join records indexed both ways:
/// resource → allocations via `ResourceState::bookings`,
/// event → allocations via `event_allocations`.
pub struct Store {
    events: DashMap<Ulid, SharedEventState>,
    resources: DashMap<Ulid, SharedResourceState>,
    allocations: DashMap<Ulid, AllocationLink>,
    event_allocations: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            resources: DashMap::new(),
            allocations: DashMap::new(),
            event_allocations: DashMap::new(),
        }
    }

    // ── Events ───────────────────────────────────────────────

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn get_event(&self, id: &Ulid) -> Option<SharedEventState> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn insert_event(&self, state: EventState) {
        self.events.insert(state.id, Arc::new(RwLock::new(state)));
    }

    pub fn remove_event(&self, id: &Ulid) {
        self.events.remove(id);
        self.event_allocations.remove(id);
    }

    /// All event ids in ascending (creation) order.
    pub fn event_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.events.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, state: ResourceState) {
        self.resources.insert(state.id, Arc::new(RwLock::new(state)));
    }

    pub fn remove_resource(&self, id: &Ulid) {
        self.resources.remove(id);
    }

    /// All resource ids in ascending (creation) order. This is the listing
    /// order of resources everywhere, the utilization report included.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Allocation index ─────────────────────────────────────

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn get_allocation(&self, id: &Ulid) -> Option<AllocationLink> {
        self.allocations.get(id).map(|e| *e.value())
    }

    /// Allocations referencing `event_id`, in allocation order.
    pub fn allocations_of_event(&self, event_id: &Ulid) -> Vec<(Ulid, AllocationLink)> {
        let ids = self
            .event_allocations
            .get(event_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.get_allocation(&id).map(|link| (id, link)))
            .collect()
    }

    /// Distinct resources `event_id` is allocated to, ascending. Callers lock
    /// them in this order.
    pub fn resources_of_event(&self, event_id: &Ulid) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .allocations_of_event(event_id)
            .into_iter()
            .map(|(_, link)| link.resource_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Record a new allocation on its resource (caller holds the write lock)
    /// and in both indexes.
    pub fn attach(&self, rs: &mut ResourceState, id: Ulid, event_id: Ulid, span: Span) {
        rs.insert_booking(Booking {
            allocation_id: id,
            event_id,
            span,
        });
        self.allocations.insert(
            id,
            AllocationLink {
                event_id,
                resource_id: rs.id,
            },
        );
        self.event_allocations.entry(event_id).or_default().push(id);
    }

    /// Remove an allocation from its resource (caller holds the write lock)
    /// and from both indexes.
    pub fn detach(&self, rs: &mut ResourceState, id: Ulid) -> Option<AllocationLink> {
        rs.remove_booking(id);
        self.unlink(id)
    }

    /// Drop an allocation from the indexes only.
    pub fn unlink(&self, id: Ulid) -> Option<AllocationLink> {
        let (_, link) = self.allocations.remove(&id)?;
        if let Some(mut ids) = self.event_allocations.get_mut(&link.event_id) {
            ids.retain(|a| *a != id);
        }
        Some(link)
    }

    // ── Replay & snapshot ────────────────────────────────────

    /// Rebuild a store from WAL records. Records referencing entities that no
    /// longer exist are skipped.
    pub fn from_records(records: &[Record]) -> Self {
        let store = Self::new();
        for record in records {
            store.replay(record);
        }
        store
    }

    // The store is not shared yet, so try_read/try_write never contend. Never
    // use blocking_read/blocking_write: replay may run inside the runtime.
    fn replay(&self, record: &Record) {
        match record {
            Record::EventCreated {
                id,
                title,
                description,
                span,
            } => {
                self.insert_event(EventState::new(*id, title.clone(), description.clone(), *span));
            }
            Record::EventUpdated {
                id,
                title,
                description,
                span,
            } => {
                let Some(ev) = self.get_event(id) else { return };
                let Ok(mut ev) = ev.try_write() else { return };
                ev.title = title.clone();
                ev.description = description.clone();
                ev.span = *span;
                for rid in self.resources_of_event(id) {
                    if let Some(rs) = self.get_resource(&rid)
                        && let Ok(mut rs) = rs.try_write()
                    {
                        rs.retime_event(*id, *span);
                    }
                }
            }
            Record::EventDeleted { id } => {
                for (alloc_id, link) in self.allocations_of_event(id) {
                    match self.get_resource(&link.resource_id) {
                        Some(rs) => {
                            if let Ok(mut rs) = rs.try_write() {
                                self.detach(&mut rs, alloc_id);
                            }
                        }
                        None => {
                            self.unlink(alloc_id);
                        }
                    }
                }
                self.remove_event(id);
            }
            Record::ResourceCreated { id, name, kind } => {
                self.insert_resource(ResourceState::new(*id, name.clone(), kind.clone()));
            }
            Record::ResourceDeleted { id } => {
                if let Some(rs) = self.get_resource(id)
                    && let Ok(rs) = rs.try_read()
                {
                    for booking in &rs.bookings {
                        self.unlink(booking.allocation_id);
                    }
                }
                self.remove_resource(id);
            }
            Record::AllocationCreated {
                id,
                event_id,
                resource_id,
            } => {
                let Some(ev) = self.get_event(event_id) else { return };
                let Ok(ev) = ev.try_read() else { return };
                let span = ev.span;
                drop(ev);
                if let Some(rs) = self.get_resource(resource_id)
                    && let Ok(mut rs) = rs.try_write()
                {
                    if let Some(b) = find_conflict(&rs, &span, None) {
                        tracing::warn!(
                            %id,
                            %resource_id,
                            existing = %b.allocation_id,
                            "skipping overlapping allocation in WAL replay"
                        );
                        return;
                    }
                    self.attach(&mut rs, *id, *event_id, span);
                }
            }
            Record::AllocationDeleted { id } => {
                let Some(link) = self.get_allocation(id) else { return };
                if let Some(rs) = self.get_resource(&link.resource_id)
                    && let Ok(mut rs) = rs.try_write()
                {
                    self.detach(&mut rs, *id);
                }
            }
        }
    }

    /// The minimal record sequence that recreates the current state: events,
    /// then resources, then allocations.
    pub async fn snapshot(&self) -> Vec<Record> {
        let mut records = Vec::new();
        let mut allocations = Vec::new();

        for id in self.event_ids() {
            let Some(ev) = self.get_event(&id) else { continue };
            let ev = ev.read().await;
            records.push(Record::EventCreated {
                id: ev.id,
                title: ev.title.clone(),
                description: ev.description.clone(),
                span: ev.span,
            });
        }
        for id in self.resource_ids() {
            let Some(rs) = self.get_resource(&id) else { continue };
            let rs = rs.read().await;
            records.push(Record::ResourceCreated {
                id: rs.id,
                name: rs.name.clone(),
                kind: rs.kind.clone(),
            });
            allocations.extend(rs.bookings.iter().map(|b| Record::AllocationCreated {
                id: b.allocation_id,
                event_id: b.event_id,
                resource_id: rs.id,
            }));
        }

        records.extend(allocations);
        records
    }
}
