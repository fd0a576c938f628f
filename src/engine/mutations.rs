use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_text};
use super::{Engine, EngineError, WalCommand};

fn parse_event_span(start_date: Option<&str>, end_date: Option<&str>) -> Result<Span, EngineError> {
    let start = calendar::parse_date("start_date", start_date)?;
    let end = calendar::parse_date("end_date", end_date)?;
    calendar::day_span(start, end)
}

fn validate_event_text(title: &str, description: &str) -> Result<(), EngineError> {
    validate_text("title", title, MAX_TITLE_LEN, true)?;
    validate_text("description", description, MAX_DESCRIPTION_LEN, false)
}

impl Engine {
    // ── Events ───────────────────────────────────────────────

    /// Create an event spanning 00:00 of `start_date` to 23:59 of `end_date`.
    pub async fn create_event(
        &self,
        title: &str,
        description: &str,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<EventInfo, EngineError> {
        validate_event_text(title, description)?;
        let span = parse_event_span(start_date, end_date)?;
        if self.store.event_count() >= MAX_EVENTS {
            return Err(EngineError::LimitExceeded("too many events"));
        }

        let _commit = self.begin_commit().await;
        let id = Ulid::new();
        self.wal_append(Record::EventCreated {
            id,
            title: title.to_string(),
            description: description.to_string(),
            span,
        })
        .await?;
        let state = EventState::new(id, title.to_string(), description.to_string(), span);
        let info = state.info();
        self.store.insert_event(state);
        tracing::debug!(%id, "event created");
        Ok(info)
    }

    /// Replace an event's fields. Moving the event re-checks every resource it
    /// is allocated to; an overlap there rejects the whole update.
    /// Replace every field of an event. Rejected with `Conflict` if the new
    /// span collides on any resource the event is allocated to.
    pub async fn update_event(
        &self,
        id: Ulid,
        title: &str,
        description: &str,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<EventInfo, EngineError> {
        validate_event_text(title, description)?;
        let span = parse_event_span(start_date, end_date)?;
        self.rewrite_event(id, |_| Ok((title.to_string(), description.to_string(), span)))
            .await
    }

    /// Update only the fields present in `changes`. The merge with the current
    /// values happens under the event's write lock.
    pub async fn patch_event(&self, id: Ulid, changes: &EventChanges) -> Result<EventInfo, EngineError> {
        self.rewrite_event(id, |ev| {
            let title = changes.title.as_deref().unwrap_or(&ev.title);
            let description = changes.description.as_deref().unwrap_or(&ev.description);
            validate_event_text(title, description)?;
            let start = match changes.start_date.as_deref() {
                Some(raw) => calendar::parse_date("start_date", Some(raw))?,
                None => calendar::date_of(ev.span.start),
            };
            let end = match changes.end_date.as_deref() {
                Some(raw) => calendar::parse_date("end_date", Some(raw))?,
                None => calendar::date_of(ev.span.end),
            };
            let span = calendar::day_span(start, end)?;
            Ok((title.to_string(), description.to_string(), span))
        })
        .await
    }

    async fn rewrite_event(
        &self,
        id: Ulid,
        resolve: impl FnOnce(&EventState) -> Result<(String, String, Span), EngineError>,
    ) -> Result<EventInfo, EngineError> {
        let _commit = self.begin_commit().await;
        let ev = self.store.get_event(&id).ok_or(EngineError::NotFound(id))?;
        let mut ev = ev.write().await;
        if ev.deleted {
            return Err(EngineError::NotFound(id));
        }
        let (title, description, span) = resolve(&*ev)?;

        let mut resources = self.lock_event_resources(id).await;
        if span != ev.span {
            for rs in &resources {
                check_no_conflict(rs, &span, Some(id))?;
            }
        }

        self.wal_append(Record::EventUpdated {
            id,
            title: title.clone(),
            description: description.clone(),
            span,
        })
        .await?;
        ev.title = title;
        ev.description = description;
        ev.span = span;
        for rs in &mut resources {
            rs.retime_event(id, span);
        }
        tracing::debug!(%id, "event updated");
        Ok(ev.info())
    }

    /// Delete an event and every allocation referencing it.
    pub async fn delete_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.begin_commit().await;
        let ev = self.store.get_event(&id).ok_or(EngineError::NotFound(id))?;
        let mut ev = ev.write().await;
        if ev.deleted {
            return Err(EngineError::NotFound(id));
        }
        let mut resources = self.lock_event_resources(id).await;

        self.wal_append(Record::EventDeleted { id }).await?;
        let mut cascaded = 0usize;
        for (alloc_id, link) in self.store.allocations_of_event(&id) {
            match resources.iter_mut().find(|rs| rs.id == link.resource_id) {
                Some(rs) => self.store.detach(rs, alloc_id),
                None => self.store.unlink(alloc_id),
            };
            cascaded += 1;
        }
        ev.deleted = true;
        self.store.remove_event(&id);
        tracing::debug!(%id, cascaded, "event deleted");
        Ok(())
    }

    /// Write-lock every live resource the event is allocated to, in ascending
    /// id order. Caller holds the event's write lock, so the set can't grow.
    async fn lock_event_resources(&self, event_id: Ulid) -> Vec<OwnedRwLockWriteGuard<ResourceState>> {
        let mut guards = Vec::new();
        for rid in self.store.resources_of_event(&event_id) {
            let Some(rs) = self.store.get_resource(&rid) else { continue };
            let guard = rs.write_owned().await;
            if !guard.deleted {
                guards.push(guard);
            }
        }
        guards
    }

    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, name: &str, kind: &str) -> Result<ResourceInfo, EngineError> {
        validate_text("name", name, MAX_NAME_LEN, true)?;
        validate_text("type", kind, MAX_KIND_LEN, false)?;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }

        let _commit = self.begin_commit().await;
        let id = Ulid::new();
        self.wal_append(Record::ResourceCreated {
            id,
            name: name.to_string(),
            kind: kind.to_string(),
        })
        .await?;
        let state = ResourceState::new(id, name.to_string(), kind.to_string());
        let info = state.info();
        self.store.insert_resource(state);
        tracing::debug!(%id, "resource created");
        Ok(info)
    }

    /// Delete a resource and every allocation of it.
    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.begin_commit().await;
        let rs = self.store.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut rs = rs.write().await;
        if rs.deleted {
            return Err(EngineError::NotFound(id));
        }

        self.wal_append(Record::ResourceDeleted { id }).await?;
        let cascaded = rs.bookings.len();
        for booking in rs.bookings.drain(..) {
            self.store.unlink(booking.allocation_id);
        }
        rs.deleted = true;
        self.store.remove_resource(&id);
        tracing::debug!(%id, cascaded, "resource deleted");
        Ok(())
    }

    // ── Allocations ──────────────────────────────────────────

    /// Commit `resource_id` to `event_id` for the event's full span, unless the
    /// resource is already allocated during an overlapping interval.
    ///
    /// Check and commit run under the resource's write lock, so two concurrent
    /// attempts on one resource can never both pass the check.
    pub async fn allocate(&self, event_id: Ulid, resource_id: Ulid) -> Result<AllocationInfo, EngineError> {
        let view = self.allocate_view(event_id, resource_id).await?;
        Ok(AllocationInfo {
            id: view.id,
            event_id,
            resource_id,
        })
    }

    /// Allocate and return the committed allocation with its event and
    /// resource as they were while the locks were held.
    pub async fn allocate_view(&self, event_id: Ulid, resource_id: Ulid) -> Result<AllocationView, EngineError> {
        let _commit = self.begin_commit().await;
        let ev = self
            .store
            .get_event(&event_id)
            .ok_or(EngineError::NotFound(event_id))?;
        let ev = ev.read().await;
        if ev.deleted {
            return Err(EngineError::NotFound(event_id));
        }
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let mut rs = rs.write().await;
        if rs.deleted {
            return Err(EngineError::NotFound(resource_id));
        }
        if rs.bookings.len() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }

        if let Err(e) = check_no_conflict(&rs, &ev.span, None) {
            tracing::info!(%event_id, %resource_id, "allocation rejected: {e}");
            return Err(e);
        }

        let id = Ulid::new();
        self.wal_append(Record::AllocationCreated {
            id,
            event_id,
            resource_id,
        })
        .await?;
        self.store.attach(&mut rs, id, event_id, ev.span);
        metrics::counter!(crate::observability::ALLOCATIONS_TOTAL).increment(1);
        tracing::debug!(%id, %event_id, %resource_id, "allocation committed");
        Ok(AllocationView {
            id,
            event: ev.info(),
            resource: rs.info(),
        })
    }

    pub async fn delete_allocation(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.begin_commit().await;
        let link = self.store.get_allocation(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .get_resource(&link.resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut rs = rs.write().await;
        // A cascade may have removed it while we waited for the lock.
        if rs.deleted || self.store.get_allocation(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        self.wal_append(Record::AllocationDeleted { id }).await?;
        self.store.detach(&mut rs, id);
        tracing::debug!(%id, "allocation deleted");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the records needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let records = self.store.snapshot().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
