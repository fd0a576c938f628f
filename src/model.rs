use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar;

/// Milliseconds on the naive (offset-free) timeline. The only stored time type.
pub type Ms = i64;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Fractional hours, unrounded.
    pub fn hours(&self) -> f64 {
        self.duration_ms() as f64 / MS_PER_HOUR
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// An allocation as seen from its resource: the allocated event's span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Booking {
    pub allocation_id: Ulid,
    pub event_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    /// Allocations of this resource, sorted by `span.start`. Never overlapping.
    pub bookings: Vec<Booking>,
    /// Set under the write lock right before the resource leaves the store.
    pub deleted: bool,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, kind: String) -> Self {
        Self {
            id,
            name,
            kind,
            bookings: Vec::new(),
            deleted: false,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, allocation_id: Ulid) -> Option<Booking> {
        let pos = self
            .bookings
            .iter()
            .position(|b| b.allocation_id == allocation_id)?;
        Some(self.bookings.remove(pos))
    }

    /// Move every booking of `event_id` to the event's new span.
    pub fn retime_event(&mut self, event_id: Ulid, span: Span) {
        let (moved, kept): (Vec<Booking>, Vec<Booking>) = self
            .bookings
            .drain(..)
            .partition(|b| b.event_id == event_id);
        self.bookings = kept;
        for booking in moved {
            self.insert_booking(Booking { span, ..booking });
        }
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub span: Span,
    pub deleted: bool,
}

impl EventState {
    pub fn new(id: Ulid, title: String, description: String, span: Span) -> Self {
        Self {
            id,
            title,
            description,
            span,
            deleted: false,
        }
    }

    pub fn info(&self) -> EventInfo {
        EventInfo {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            start: calendar::from_ms(self.span.start),
            end: calendar::from_ms(self.span.end),
        }
    }
}

/// Join record: which event a resource is committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationLink {
    pub event_id: Ulid,
    pub resource_id: Ulid,
}

/// WAL record format. Flat, no nesting.
///
/// Deletes of events and resources imply the cascade; no separate
/// `AllocationDeleted` is written for the dependent allocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    EventCreated {
        id: Ulid,
        title: String,
        description: String,
        span: Span,
    },
    EventUpdated {
        id: Ulid,
        title: String,
        description: String,
        span: Span,
    },
    EventDeleted {
        id: Ulid,
    },
    ResourceCreated {
        id: Ulid,
        name: String,
        kind: String,
    },
    ResourceDeleted {
        id: Ulid,
    },
    AllocationCreated {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
    },
    AllocationDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
}

/// A partial event update. `None` keeps the current value.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EventChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub resource_id: Ulid,
}

/// An allocation with its event and resource resolved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationView {
    pub id: Ulid,
    pub event: EventInfo,
    pub resource: ResourceInfo,
}

/// One row of the utilization report.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceUtilization {
    pub resource_id: Ulid,
    pub name: String,
    pub kind: String,
    /// Booked hours within the range, rounded to 2 decimals.
    pub hours: f64,
    /// Allocations whose event starts within the range.
    pub bookings: u32,
    /// Allocations whose event starts after the evaluation date, regardless of range.
    pub upcoming: u32,
}
