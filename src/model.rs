use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day with minute precision, `00:00`..=`23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if hour >= 24 || minute >= 60 {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    /// Strict zero-padded `HH:MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let shaped = s.len() == 5
            && s.bytes()
                .enumerate()
                .all(|(i, b)| if i == 2 { b == b':' } else { b.is_ascii_digit() });
        if !shaped {
            return None;
        }
        let time = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
        Self::from_hm(u16::try_from(time.hour()).ok()?, u16::try_from(time.minute()).ok()?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.0 / 60), u32::from(self.0 % 60), 0)
            .unwrap_or_default()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Day of week with 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// ISO-8601 UTC timestamp with millisecond precision, e.g. `2025-01-06T09:00:00.000Z`.
pub fn iso_timestamp(date: NaiveDate, time: TimeOfDay) -> String {
    NaiveDateTime::new(date, time.to_naive_time())
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Recurring weekly operating hours of one resource on one weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub day_of_week: u8,
    pub open: TimeOfDay,
    pub close: TimeOfDay,
    pub slot_duration_minutes: u16,
    pub max_capacity: u32,
}

/// Partial template update. `resource_id` and `day_of_week` are the template's
/// identity: they may be restated but never changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplatePatch {
    pub resource_id: Option<Ulid>,
    pub day_of_week: Option<u8>,
    pub open: Option<TimeOfDay>,
    pub close: Option<TimeOfDay>,
    pub slot_duration_minutes: Option<u16>,
    pub max_capacity: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Indexed by day of week (0 = Sunday).
    pub templates: [Option<Template>; 7],
}

impl ResourceState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            templates: Default::default(),
        }
    }

    pub fn template(&self, id: &Ulid) -> Option<&Template> {
        self.templates.iter().flatten().find(|t| t.id == *id)
    }

    pub fn has_templates(&self) -> bool {
        self.templates.iter().any(Option::is_some)
    }
}

/// Persisted form of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub max_capacity: u32,
    pub booked_count: u32,
}

/// Live slot. Everything except the booked count is frozen at materialization.
///
/// `booked` is only written while `lock` is held; readers load it without
/// locking and get an advisory value that always satisfies the bounds.
#[derive(Debug)]
pub struct SlotCell {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub max_capacity: u32,
    booked: AtomicU32,
    pub(crate) lock: tokio::sync::Mutex<()>,
}

pub type SharedSlot = Arc<SlotCell>;

impl SlotCell {
    pub fn from_record(record: &SlotRecord) -> Self {
        Self {
            id: record.id,
            resource_id: record.resource_id,
            date: record.date,
            start: record.start,
            end: record.end,
            max_capacity: record.max_capacity,
            booked: AtomicU32::new(record.booked_count),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn booked_count(&self) -> u32 {
        self.booked.load(Ordering::Acquire)
    }

    pub(crate) fn store_booked(&self, count: u32) {
        self.booked.store(count, Ordering::Release);
    }

    /// The count after applying `delta`, or `None` if it would leave `[0, max_capacity]`.
    pub fn checked_apply(&self, delta: i32) -> Option<u32> {
        let next = i64::from(self.booked_count()) + i64::from(delta);
        if next < 0 || next > i64::from(self.max_capacity) {
            return None;
        }
        u32::try_from(next).ok()
    }

    pub fn to_record(&self) -> SlotRecord {
        SlotRecord {
            id: self.id,
            resource_id: self.resource_id,
            date: self.date,
            start: self.start,
            end: self.end,
            max_capacity: self.max_capacity,
            booked_count: self.booked_count(),
        }
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            resource_id: self.resource_id,
            date: self.date,
            start: self.start,
            end: self.end,
            max_capacity: self.max_capacity,
            booked_count: self.booked_count(),
        }
    }
}

/// Dedup ledger entry: an external capacity event that has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: Ulid,
    pub slot_id: Ulid,
    pub applied_at: Ms,
}

/// A capacity event that could not be applied and awaits an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub event_id: Ulid,
    pub slot_id: Ulid,
    pub delta: i32,
    pub reason: String,
    pub rejected_at: Ms,
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        id: Ulid,
        name: Option<String>,
    },
    ResourceDeleted {
        id: Ulid,
    },
    TemplateCreated {
        template: Template,
    },
    TemplateUpdated {
        template: Template,
    },
    TemplateRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    SlotsMaterialized {
        resource_id: Ulid,
        slots: Vec<SlotRecord>,
    },
    CapacityChanged {
        slot_id: Ulid,
        delta: i32,
        booked_count: u32,
        /// Set when the change came from an external capacity event.
        event_id: Option<Ulid>,
        at: Ms,
    },
    ProcessedEventsRestored {
        entries: Vec<ProcessedEvent>,
    },
    ProcessedEventsPruned {
        before: Ms,
    },
    EventDeadLettered {
        letter: DeadLetter,
    },
    DeadLetterAcknowledged {
        event_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub max_capacity: u32,
    pub booked_count: u32,
}

impl SlotInfo {
    pub fn is_available(&self) -> bool {
        self.booked_count < self.max_capacity
    }
}

/// Normalized slot reference handed to the booking orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDetail {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub max_capacity: u32,
    pub is_available: bool,
}

impl From<&SlotInfo> for SlotDetail {
    fn from(slot: &SlotInfo) -> Self {
        Self {
            id: slot.id,
            resource_id: slot.resource_id,
            date: slot.date.format("%Y-%m-%d").to_string(),
            start_time: iso_timestamp(slot.date, slot.start),
            end_time: iso_timestamp(slot.date, slot.end),
            max_capacity: slot.max_capacity,
            is_available: slot.is_available(),
        }
    }
}
