use chrono::NaiveDate;

use crate::calendar;
use crate::model::*;

use super::{Engine, EngineError};

/// Aggregate one resource's bookings.
///
/// A booking counts toward `hours` and `bookings` when its event's start date
/// lies in `[start_date, end_date]`. It counts toward `upcoming` when that
/// start date is after `today`, independently of the range.
pub fn utilization_row(
    rs: &ResourceState,
    start_date: NaiveDate,
    end_date: NaiveDate,
    today: NaiveDate,
) -> ResourceUtilization {
    let mut hours = 0.0;
    let mut bookings = 0u32;
    let mut upcoming = 0u32;

    for booking in &rs.bookings {
        let event_date = calendar::date_of(booking.span.start);
        if start_date <= event_date && event_date <= end_date {
            hours += booking.span.hours();
            bookings += 1;
        }
        if event_date > today {
            upcoming += 1;
        }
    }

    ResourceUtilization {
        resource_id: rs.id,
        name: rs.name.clone(),
        kind: rs.kind.clone(),
        hours: calendar::round_hours(hours),
        bookings,
        upcoming,
    }
}

impl Engine {
    /// Utilization per resource over `[start_date, end_date]`, with upcoming
    /// bookings counted against the local calendar date.
    pub async fn utilization_report(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<ResourceUtilization>, EngineError> {
        self.utilization_report_as_of(start_date, end_date, calendar::today())
            .await
    }

    /// Same as [`Engine::utilization_report`] with an explicit evaluation date.
    /// One row per resource in listing order; resources without allocations
    /// get a zero row.
    pub async fn utilization_report_as_of(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<ResourceUtilization>, EngineError> {
        if end_date < start_date {
            return Err(EngineError::Validation(format!(
                "report end date {} is before start date {}",
                calendar::format_date(end_date),
                calendar::format_date(start_date)
            )));
        }

        let mut rows = Vec::new();
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else { continue };
            let rs = rs.read().await;
            if rs.deleted {
                continue;
            }
            rows.push(utilization_row(&rs, start_date, end_date, today));
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn book(rs: &mut ResourceState, from: &str, to: &str) {
        rs.insert_booking(Booking {
            allocation_id: Ulid::new(),
            event_id: Ulid::new(),
            span: calendar::day_span(d(from), d(to)).unwrap(),
        });
    }

    fn room() -> ResourceState {
        ResourceState::new(Ulid::new(), "Room A".into(), "room".into())
    }

    #[test]
    fn empty_resource_yields_zero_row() {
        let rs = room();
        let row = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-01-10"));
        assert_eq!(row.name, "Room A");
        assert_eq!(row.kind, "room");
        assert_eq!(row.hours, 0.0);
        assert_eq!(row.bookings, 0);
        assert_eq!(row.upcoming, 0);
    }

    #[test]
    fn same_day_event_counts_nearly_24_hours() {
        let mut rs = room();
        book(&mut rs, "2024-01-15", "2024-01-15");
        let row = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-03-01"));
        assert_eq!(row.hours, 23.98);
        assert_eq!(row.bookings, 1);
        assert_eq!(row.upcoming, 0);
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let mut rs = room();
        book(&mut rs, "2024-01-01", "2024-01-01");
        book(&mut rs, "2024-01-31", "2024-01-31");
        book(&mut rs, "2024-02-01", "2024-02-01");
        let row = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-06-01"));
        assert_eq!(row.bookings, 2);
        assert_eq!(row.hours, 47.97);
    }

    #[test]
    fn range_filter_uses_start_date_only() {
        // Starts before the range, ends inside it: excluded, and all its hours
        // would count if it started inside.
        let mut rs = room();
        book(&mut rs, "2023-12-30", "2024-01-02");
        let row = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-06-01"));
        assert_eq!(row.bookings, 0);
        assert_eq!(row.hours, 0.0);

        let row = utilization_row(&rs, d("2023-12-30"), d("2023-12-30"), d("2024-06-01"));
        assert_eq!(row.bookings, 1);
        assert_eq!(row.hours, 95.98);
    }

    #[test]
    fn upcoming_is_independent_of_range() {
        let mut rs = room();
        book(&mut rs, "2024-01-15", "2024-01-15");
        book(&mut rs, "2024-02-01", "2024-02-01");

        let before = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-01-20"));
        assert_eq!(before.bookings, 1);
        assert_eq!(before.upcoming, 1);

        let on_the_day = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2024-02-01"));
        assert_eq!(on_the_day.upcoming, 0);

        let early = utilization_row(&rs, d("2024-01-01"), d("2024-01-31"), d("2023-12-01"));
        assert_eq!(early.upcoming, 2);
    }

    #[test]
    fn hours_are_rounded_only_at_the_end() {
        // Three bookings of 20 minutes each: 3 × 0.333… = 1.0, whereas rounding
        // per booking would give 0.99.
        let mut rs = room();
        for hour in [9, 11, 13] {
            let day = d("2024-01-10");
            let start = calendar::to_ms(day.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap()));
            rs.insert_booking(Booking {
                allocation_id: Ulid::new(),
                event_id: Ulid::new(),
                span: Span::new(start, start + 20 * 60_000),
            });
        }
        let row = utilization_row(&rs, d("2024-01-10"), d("2024-01-10"), d("2024-01-01"));
        assert_eq!(row.hours, 1.0);
        assert_eq!(row.bookings, 3);
    }
}
