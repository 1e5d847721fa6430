use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::engine::{now_ms, Engine, EngineError, EventOutcome};
use crate::model::{DeadLetter, SlotInfo};
use crate::observability::EVENTS_REJECTED_TOTAL;

/// A capacity change announced by another service, e.g. a booking made or
/// cancelled elsewhere. `id` is unique per event and survives redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityEvent {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub delta: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied(SlotInfo),
    Duplicate,
    UnknownSlot,
    /// Rejected and parked for an operator; carries the reason.
    DeadLettered(String),
}

/// Apply one event. Never fails: anything that cannot be applied ends up in
/// the tenant's dead-letter list.
pub async fn handle(engine: &Engine, event: CapacityEvent) -> Outcome {
    match engine
        .apply_capacity_event(event.id, event.slot_id, event.delta)
        .await
    {
        Ok(EventOutcome::Applied(slot)) => {
            debug!(
                "capacity event {} applied to slot {}: {}/{}",
                event.id, slot.id, slot.booked_count, slot.max_capacity
            );
            Outcome::Applied(slot)
        }
        Ok(EventOutcome::Duplicate) => Outcome::Duplicate,
        Ok(EventOutcome::UnknownSlot) => Outcome::UnknownSlot,
        Err(e) => dead_letter(engine, &event, e).await,
    }
}

async fn dead_letter(engine: &Engine, event: &CapacityEvent, cause: EngineError) -> Outcome {
    let reason = cause.to_string();
    error!(
        "capacity event {} ({:+} on slot {}) rejected: {reason}",
        event.id, event.delta, event.slot_id
    );
    let letter = DeadLetter {
        event_id: event.id,
        slot_id: event.slot_id,
        delta: event.delta,
        reason: reason.clone(),
        rejected_at: now_ms(),
    };
    if let Err(e) = engine.record_dead_letter(letter).await {
        error!("capacity event {} could not be dead-lettered: {e}", event.id);
    }
    Outcome::DeadLettered(reason)
}

/// Sending side of a tenant's capacity event queue.
#[derive(Clone)]
pub struct CapacityInlet {
    tx: mpsc::Sender<CapacityEvent>,
}

impl CapacityInlet {
    /// Enqueue without waiting for the outcome. Fails when the queue is full
    /// so the sender knows to redeliver.
    pub fn submit(&self, event: CapacityEvent) -> Result<(), EngineError> {
        self.tx.try_send(event).map_err(|e| {
            metrics::counter!(EVENTS_REJECTED_TOTAL).increment(1);
            match e {
                mpsc::error::TrySendError::Full(ev) => {
                    warn!("capacity event queue full, refusing {}", ev.id);
                    EngineError::LimitExceeded("capacity event queue full")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    EngineError::LimitExceeded("capacity event consumer stopped")
                }
            }
        })
    }
}

/// Start the per-tenant consumer task draining a queue of `capacity` events.
pub fn spawn(engine: Arc<Engine>, capacity: usize) -> CapacityInlet {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(run(engine, rx));
    CapacityInlet { tx }
}

async fn run(engine: Arc<Engine>, mut rx: mpsc::Receiver<CapacityEvent>) {
    while let Some(event) = rx.recv().await {
        handle(&engine, event).await;
    }
    debug!("capacity event queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LockPolicy;
    use crate::model::{parse_date, TimeOfDay};
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("teesheet_test_consumer");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn engine_with_slot(name: &str) -> (Arc<Engine>, Ulid) {
        engine_with_policy(name, LockPolicy::default()).await
    }

    /// Engine with one Monday slot of capacity 2; returns the slot id.
    async fn engine_with_policy(name: &str, policy: LockPolicy) -> (Arc<Engine>, Ulid) {
        let engine = Arc::new(Engine::new(test_wal_path(name), policy).unwrap());
        let rid = Ulid::new();
        engine.create_resource(rid, None).await.unwrap();
        engine
            .create_template(
                Ulid::new(),
                rid,
                1,
                TimeOfDay::parse("08:00").unwrap(),
                TimeOfDay::parse("08:10").unwrap(),
                10,
                2,
            )
            .await
            .unwrap();
        let monday = parse_date("2025-01-06").unwrap();
        engine.generate_slots(rid, monday, monday).await.unwrap();
        let slot_id = engine.list_available(rid, monday).unwrap()[0].id;
        (engine, slot_id)
    }

    fn event(slot_id: Ulid, delta: i32) -> CapacityEvent {
        CapacityEvent {
            id: Ulid::new(),
            slot_id,
            delta,
        }
    }

    #[tokio::test]
    async fn redelivery_is_duplicate() {
        let (engine, slot_id) = engine_with_slot("redelivery.wal").await;
        let ev = event(slot_id, 1);

        assert!(matches!(handle(&engine, ev.clone()).await, Outcome::Applied(_)));
        assert_eq!(handle(&engine, ev).await, Outcome::Duplicate);
        assert_eq!(engine.get_slot(&slot_id).unwrap().booked_count, 1);
    }

    #[tokio::test]
    async fn unknown_slot_not_dead_lettered() {
        let (engine, _) = engine_with_slot("unknown_slot.wal").await;
        assert_eq!(handle(&engine, event(Ulid::new(), 1)).await, Outcome::UnknownSlot);
        assert!(engine.list_dead_letters().is_empty());
    }

    #[tokio::test]
    async fn violation_dead_lettered_once() {
        let (engine, slot_id) = engine_with_slot("violation.wal").await;
        let ev = event(slot_id, 3);

        match handle(&engine, ev.clone()).await {
            Outcome::DeadLettered(reason) => assert!(reason.contains("capacity violation")),
            other => panic!("expected DeadLettered, got {other:?}"),
        }
        // Redelivery of a parked event is not retried.
        assert_eq!(handle(&engine, ev.clone()).await, Outcome::Duplicate);

        let letters = engine.list_dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].event_id, ev.id);
        assert_eq!(letters[0].delta, 3);
        assert_eq!(engine.get_slot(&slot_id).unwrap().booked_count, 0);
    }

    #[tokio::test]
    async fn busy_slot_dead_lettered() {
        let policy = LockPolicy {
            lock_timeout: Duration::from_millis(10),
            retries: 1,
            backoff: Duration::from_millis(1),
        };
        let (engine, slot_id) = engine_with_policy("busy.wal", policy).await;

        let cell = engine.get_slot_cell(&slot_id).unwrap();
        let _held = cell.lock.lock().await;
        match handle(&engine, event(slot_id, 1)).await {
            Outcome::DeadLettered(reason) => assert!(reason.contains("busy")),
            other => panic!("expected DeadLettered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inlet_feeds_consumer_task() {
        let (engine, slot_id) = engine_with_slot("inlet.wal").await;
        let inlet = spawn(engine.clone(), 8);
        inlet.submit(event(slot_id, 1)).unwrap();
        inlet.submit(event(slot_id, 1)).unwrap();

        for _ in 0..100 {
            if engine.get_slot(&slot_id).unwrap().booked_count == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("consumer did not apply queued events");
    }

    #[tokio::test]
    async fn full_inlet_refuses() {
        let (tx, _rx) = mpsc::channel(1);
        let inlet = CapacityInlet { tx };
        inlet.submit(event(Ulid::new(), 1)).unwrap();
        let err = inlet.submit(event(Ulid::new(), 1)).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded(_)));
    }
}
