use chrono::NaiveDate;
use tokio::sync::MutexGuard;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    CAPACITY_CHANGES_TOTAL, DEAD_LETTERED_TOTAL, DUPLICATE_EVENTS_TOTAL, LEDGER_BUSY_TOTAL,
};

use super::{now_ms, Engine, EngineError};

/// Result of applying an external capacity event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(SlotInfo),
    /// The event id was already applied (or dead-lettered); nothing changed.
    Duplicate,
    /// The slot does not exist (any more). Nothing changed.
    UnknownSlot,
}

fn outcome_label(result: &Result<SlotInfo, EngineError>) -> &'static str {
    match result {
        Ok(_) => "applied",
        Err(EngineError::CapacityViolation { .. }) => "violation",
        Err(EngineError::Busy(_)) => "busy",
        Err(_) => "error",
    }
}

fn party_delta(party_size: u32) -> Result<i32, EngineError> {
    if party_size == 0 {
        return Err(EngineError::Validation("party size must be at least 1".into()));
    }
    if party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party size too large"));
    }
    i32::try_from(party_size).map_err(|_| EngineError::LimitExceeded("party size too large"))
}

/// Cut `reason` to the storage limit without splitting a character.
fn clip_reason(mut reason: String) -> String {
    if reason.len() > MAX_DEAD_LETTER_REASON_LEN {
        let mut end = MAX_DEAD_LETTER_REASON_LEN;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

impl Engine {
    /// Acquire the slot's mutex within the lock policy, or fail `Busy`.
    async fn lock_slot<'a>(&self, cell: &'a SlotCell) -> Result<MutexGuard<'a, ()>, EngineError> {
        let mut backoff = self.policy.backoff;
        for attempt in 0..=self.policy.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            if let Ok(guard) = tokio::time::timeout(self.policy.lock_timeout, cell.lock.lock()).await {
                return Ok(guard);
            }
            debug!("slot {} lock attempt {} timed out", cell.id, attempt + 1);
        }
        metrics::counter!(LEDGER_BUSY_TOTAL).increment(1);
        warn!(
            "slot {} still locked after {} attempts",
            cell.id,
            self.policy.retries + 1
        );
        Err(EngineError::Busy(cell.id))
    }

    /// Bounded read-modify-write. Caller holds the slot lock.
    async fn commit_delta(
        &self,
        cell: &SlotCell,
        delta: i32,
        event_id: Option<Ulid>,
    ) -> Result<SlotInfo, EngineError> {
        let booked = cell.booked_count();
        let next = cell
            .checked_apply(delta)
            .ok_or(EngineError::CapacityViolation {
                slot_id: cell.id,
                booked,
                delta,
                max_capacity: cell.max_capacity,
            })?;

        let event = Event::CapacityChanged {
            slot_id: cell.id,
            delta,
            booked_count: next,
            event_id,
            at: now_ms(),
        };
        self.persist_slot_event(&event).await?;
        Ok(cell.info())
    }

    /// Atomically add `delta` to the slot's booked count. `Ok(None)` when the
    /// slot does not exist.
    pub async fn apply_capacity_change(
        &self,
        slot_id: Ulid,
        delta: i32,
    ) -> Result<Option<SlotInfo>, EngineError> {
        let _gate = self.enter().await;
        let Some(cell) = self.get_slot_cell(&slot_id) else {
            warn!("capacity change {delta:+} for unknown slot {slot_id}");
            metrics::counter!(CAPACITY_CHANGES_TOTAL, "outcome" => "unknown_slot").increment(1);
            return Ok(None);
        };

        let _lock = self.lock_slot(&cell).await?;
        let result = self.commit_delta(&cell, delta, None).await;
        metrics::counter!(CAPACITY_CHANGES_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result.map(Some)
    }

    /// Resolve and commit in one critical section: the slot must belong to
    /// `resource_id`, fall on `date` and have room for `party_size`.
    pub async fn reserve(
        &self,
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
        party_size: u32,
    ) -> Result<SlotInfo, EngineError> {
        let delta = party_delta(party_size)?;
        let _gate = self.enter().await;
        let cell = self
            .get_slot_cell(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;

        let _lock = self.lock_slot(&cell).await?;
        if cell.resource_id != resource_id {
            return Err(EngineError::NotFound(slot_id));
        }
        if cell.date != date {
            return Err(EngineError::DateMismatch {
                slot_id,
                expected: date,
                actual: cell.date,
            });
        }
        let result = self.commit_delta(&cell, delta, None).await;
        metrics::counter!(CAPACITY_CHANGES_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        let slot = result?;
        info!(
            "reserved {party_size} on slot {slot_id} ({}/{})",
            slot.booked_count, slot.max_capacity
        );
        Ok(slot)
    }

    /// Give back `party_size` places on a slot.
    pub async fn release(
        &self,
        slot_id: Ulid,
        party_size: u32,
    ) -> Result<Option<SlotInfo>, EngineError> {
        let delta = party_delta(party_size)?;
        self.apply_capacity_change(slot_id, -delta).await
    }

    /// Apply an external capacity event at most once per event id. The dedup
    /// check and the change are made under the same slot lock and persisted as
    /// a single WAL record.
    pub async fn apply_capacity_event(
        &self,
        event_id: Ulid,
        slot_id: Ulid,
        delta: i32,
    ) -> Result<EventOutcome, EngineError> {
        let _gate = self.enter().await;
        if self.dead_letters.contains_key(&event_id) {
            metrics::counter!(DUPLICATE_EVENTS_TOTAL).increment(1);
            return Ok(EventOutcome::Duplicate);
        }
        let Some(cell) = self.get_slot_cell(&slot_id) else {
            warn!("capacity event {event_id} for unknown slot {slot_id}, skipped");
            metrics::counter!(CAPACITY_CHANGES_TOTAL, "outcome" => "unknown_slot").increment(1);
            return Ok(EventOutcome::UnknownSlot);
        };

        let _lock = self.lock_slot(&cell).await?;
        if self.processed.contains_key(&event_id) {
            debug!("capacity event {event_id} already applied");
            metrics::counter!(DUPLICATE_EVENTS_TOTAL).increment(1);
            return Ok(EventOutcome::Duplicate);
        }
        let result = self.commit_delta(&cell, delta, Some(event_id)).await;
        metrics::counter!(CAPACITY_CHANGES_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        result.map(EventOutcome::Applied)
    }

    /// Park a capacity event that could not be applied. Recording the same
    /// event id twice keeps the first letter.
    pub async fn record_dead_letter(&self, letter: DeadLetter) -> Result<(), EngineError> {
        let _gate = self.enter().await;
        if self.dead_letters.contains_key(&letter.event_id) {
            return Ok(());
        }
        let letter = DeadLetter {
            reason: clip_reason(letter.reason),
            ..letter
        };
        self.persist_slot_event(&Event::EventDeadLettered { letter }).await?;
        metrics::counter!(DEAD_LETTERED_TOTAL).increment(1);
        Ok(())
    }

    /// Operator acknowledgement: drop the dead letter. The event id is no
    /// longer treated as a duplicate afterwards.
    pub async fn acknowledge_dead_letter(&self, event_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.enter().await;
        if !self.dead_letters.contains_key(&event_id) {
            return Err(EngineError::NotFound(event_id));
        }
        self.persist_slot_event(&Event::DeadLetterAcknowledged { event_id })
            .await?;
        info!("dead letter {event_id} acknowledged");
        Ok(())
    }

    /// Forget processed event ids applied before `before`. Returns how many.
    pub async fn prune_processed(&self, before: Ms) -> Result<usize, EngineError> {
        let _gate = self.enter().await;
        let stale = self
            .processed
            .iter()
            .filter(|e| e.value().applied_at < before)
            .count();
        if stale == 0 {
            return Ok(0);
        }
        self.persist_slot_event(&Event::ProcessedEventsPruned { before })
            .await?;
        Ok(stale)
    }
}
