use std::collections::HashSet;

use chrono::NaiveDate;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_GENERATION_DAYS;
use crate::model::*;

use super::{Engine, EngineError};

/// Slot boundaries for one operating day, back to back from `open`. A trailing
/// remainder shorter than one slot is dropped, never truncated.
pub fn carve_day(open: TimeOfDay, close: TimeOfDay, duration_minutes: u16) -> Vec<(TimeOfDay, TimeOfDay)> {
    let step = u32::from(duration_minutes);
    if step == 0 {
        return Vec::new();
    }
    let close = u32::from(close.minutes());
    let mut start = u32::from(open.minutes());
    let mut out = Vec::new();
    while start + step <= close {
        let bounds = u16::try_from(start)
            .ok()
            .and_then(TimeOfDay::from_minutes)
            .zip(u16::try_from(start + step).ok().and_then(TimeOfDay::from_minutes));
        match bounds {
            Some(pair) => out.push(pair),
            None => break,
        }
        start += step;
    }
    out
}

impl Engine {
    /// Expand the resource's weekly templates into slots for every date in
    /// `[from, to]`. Slots that already exist (same resource, date and start)
    /// are left untouched; returns how many were newly created.
    pub async fn generate_slots(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<usize, EngineError> {
        if !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        if from > to {
            return Err(EngineError::InvertedRange { from, to });
        }
        if (to - from).num_days() + 1 > MAX_GENERATION_DAYS {
            return Err(EngineError::LimitExceeded("date range too wide"));
        }

        let _gate = self.enter().await;
        // Held for the whole call: materializations of one resource run one at a time.
        let guard = self.lock_resource(resource_id).await?;

        let mut new_slots = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            let Some(template) = &guard.templates[usize::from(day_of_week(date))] else {
                continue;
            };
            let existing: HashSet<TimeOfDay> = self
                .days
                .get(&(resource_id, date))
                .map(|day| day.iter().map(|(start, _)| *start).collect())
                .unwrap_or_default();

            for (start, end) in carve_day(template.open, template.close, template.slot_duration_minutes) {
                if existing.contains(&start) {
                    continue;
                }
                new_slots.push(SlotRecord {
                    id: Ulid::new(),
                    resource_id,
                    date,
                    start,
                    end,
                    max_capacity: template.max_capacity,
                    booked_count: 0,
                });
            }
        }

        let created = new_slots.len();
        if created == 0 {
            info!("no new slots for resource {resource_id} between {from} and {to}");
            return Ok(0);
        }

        let event = Event::SlotsMaterialized {
            resource_id,
            slots: new_slots,
        };
        self.persist_slot_event(&event).await?;
        drop(guard);

        metrics::counter!(crate::observability::SLOTS_MATERIALIZED_TOTAL).increment(created as u64);
        info!("{created} slots created for resource {resource_id} between {from} and {to}");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        TimeOfDay::parse(s).unwrap()
    }

    #[test]
    fn carve_exact_fit() {
        let slots = carve_day(t("09:00"), t("11:00"), 30);
        let rendered: Vec<String> = slots.iter().map(|(s, e)| format!("{s}-{e}")).collect();
        assert_eq!(rendered, ["09:00-09:30", "09:30-10:00", "10:00-10:30", "10:30-11:00"]);
    }

    #[test]
    fn carve_drops_trailing_overrun() {
        let slots = carve_day(t("09:00"), t("10:00"), 40);
        assert_eq!(slots, vec![(t("09:00"), t("09:40"))]);
    }

    #[test]
    fn carve_duration_longer_than_day_yields_nothing() {
        assert!(carve_day(t("09:00"), t("09:20"), 30).is_empty());
    }

    #[test]
    fn carve_ends_at_last_minute() {
        let slots = carve_day(t("23:00"), t("23:59"), 20);
        assert_eq!(
            slots,
            vec![(t("23:00"), t("23:20")), (t("23:20"), t("23:40"))]
        );
    }

    #[test]
    fn carve_huge_duration_does_not_overflow() {
        assert!(carve_day(t("00:00"), t("23:59"), u16::MAX).is_empty());
    }
}
