mod error;
mod ledger;
mod materialize;
mod queries;
mod templates;

pub use error::{EngineError, ErrorKind};
pub use ledger::EventOutcome;
pub use materialize::carve_day;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock, RwLockReadGuard};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Bounds on how long a ledger call waits for a contended slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Wait per acquisition attempt.
    pub lock_timeout: Duration,
    /// Attempts after the first before giving up with `Busy`.
    pub retries: u32,
    /// Sleep before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(250),
            retries: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// fsync once and answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One tenant's slot engine: resources, templates, materialized slots and the
/// capacity ledger, persisted through a group-committed WAL.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) slots: DashMap<Ulid, SharedSlot>,
    /// (resource, date) → slots of that day as (start, slot id), sorted by start.
    pub(super) days: DashMap<(Ulid, NaiveDate), Vec<(TimeOfDay, Ulid)>>,
    /// Reverse lookup: template id → resource id.
    pub(super) template_to_resource: DashMap<Ulid, Ulid>,
    pub(super) processed: DashMap<Ulid, ProcessedEvent>,
    pub(super) dead_letters: DashMap<Ulid, DeadLetter>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared while they append; compaction takes it
    /// exclusively so its snapshot can't miss a concurrent write.
    commit_gate: RwLock<()>,
    pub(super) policy: LockPolicy,
}

/// Apply a template event to its resource (caller holds the write lock).
fn apply_template_event(rs: &mut ResourceState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::TemplateCreated { template } | Event::TemplateUpdated { template } => {
            if let Some(slot) = rs.templates.get_mut(usize::from(template.day_of_week)) {
                *slot = Some(template.clone());
                index.insert(template.id, template.resource_id);
            }
        }
        Event::TemplateRemoved { id, .. } => {
            for slot in rs.templates.iter_mut() {
                if slot.as_ref().is_some_and(|t| t.id == *id) {
                    *slot = None;
                }
            }
            index.remove(id);
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: LockPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            slots: DashMap::new(),
            days: DashMap::new(),
            template_to_resource: DashMap::new(),
            processed: DashMap::new(),
            dead_letters: DashMap::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
            policy,
        };

        // Sole owner of every lock during replay: try_write always succeeds.
        // Never block here, this may run inside an async context.
        for event in &events {
            match event {
                Event::ResourceCreated { id, name } => {
                    let rs = ResourceState::new(*id, name.clone());
                    engine.resources.insert(*id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    engine.resources.remove(id);
                }
                Event::TemplateCreated { template } | Event::TemplateUpdated { template } => {
                    engine.replay_template_event(template.resource_id, event);
                }
                Event::TemplateRemoved { resource_id, .. } => {
                    engine.replay_template_event(*resource_id, event);
                }
                other => engine.apply_slot_event(other),
            }
        }

        tracing::info!(
            "engine replayed {} events from {}: {} resources, {} slots",
            events.len(),
            wal_path.display(),
            engine.resources.len(),
            engine.slots.len()
        );
        Ok(engine)
    }

    fn replay_template_event(&self, resource_id: Ulid, event: &Event) {
        if let Some(entry) = self.resources.get(&resource_id) {
            let rs = entry.value().clone();
            let mut guard = rs.try_write().expect("replay: uncontended write");
            apply_template_event(&mut guard, event, &self.template_to_resource);
        }
    }

    /// Apply an event whose state lives outside the resource locks.
    pub(super) fn apply_slot_event(&self, event: &Event) {
        match event {
            Event::SlotsMaterialized { slots, .. } => {
                for record in slots {
                    self.index_slot(Arc::new(SlotCell::from_record(record)));
                }
            }
            Event::CapacityChanged {
                slot_id,
                booked_count,
                event_id,
                at,
                ..
            } => {
                if let Some(cell) = self.slots.get(slot_id) {
                    cell.store_booked(*booked_count);
                }
                if let Some(event_id) = event_id {
                    self.processed.insert(
                        *event_id,
                        ProcessedEvent {
                            event_id: *event_id,
                            slot_id: *slot_id,
                            applied_at: *at,
                        },
                    );
                }
            }
            Event::ProcessedEventsRestored { entries } => {
                for entry in entries {
                    self.processed.insert(entry.event_id, entry.clone());
                }
            }
            Event::ProcessedEventsPruned { before } => {
                self.processed.retain(|_, p| p.applied_at >= *before);
            }
            Event::EventDeadLettered { letter } => {
                self.dead_letters.insert(letter.event_id, letter.clone());
            }
            Event::DeadLetterAcknowledged { event_id } => {
                self.dead_letters.remove(event_id);
            }
            Event::ResourceCreated { .. }
            | Event::ResourceDeleted { .. }
            | Event::TemplateCreated { .. }
            | Event::TemplateUpdated { .. }
            | Event::TemplateRemoved { .. } => {}
        }
    }

    fn index_slot(&self, cell: SharedSlot) {
        let mut day = self.days.entry((cell.resource_id, cell.date)).or_default();
        let pos = day.partition_point(|(start, _)| *start < cell.start);
        if day.get(pos).is_some_and(|(start, _)| *start == cell.start) {
            return;
        }
        day.insert(pos, (cell.start, cell.id));
        drop(day);
        self.slots.insert(cell.id, cell);
    }

    /// Shared side of the commit gate. Take it before any resource or slot lock.
    pub(super) async fn enter(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply a template event under the caller's write lock.
    pub(super) async fn persist_template_event(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_template_event(rs, event, &self.template_to_resource);
        Ok(())
    }

    pub(super) async fn persist_slot_event(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_slot_event(event);
        Ok(())
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_slot_cell(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Write-lock a resource, failing if it was deleted while we waited.
    pub(super) async fn lock_resource(
        &self,
        id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write_owned().await;
        if !self.resources.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Rewrite the WAL as a snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        let resources: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        for rs in resources {
            let guard = rs.read().await;
            events.push(Event::ResourceCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            for template in guard.templates.iter().flatten() {
                events.push(Event::TemplateCreated {
                    template: template.clone(),
                });
            }
        }

        let mut by_resource: std::collections::HashMap<Ulid, Vec<SlotRecord>> =
            std::collections::HashMap::new();
        for entry in self.slots.iter() {
            by_resource
                .entry(entry.resource_id)
                .or_default()
                .push(entry.to_record());
        }
        for (resource_id, slots) in by_resource {
            events.push(Event::SlotsMaterialized { resource_id, slots });
        }

        let entries: Vec<ProcessedEvent> =
            self.processed.iter().map(|e| e.value().clone()).collect();
        if !entries.is_empty() {
            events.push(Event::ProcessedEventsRestored { entries });
        }
        for letter in self.dead_letters.iter() {
            events.push(Event::EventDeadLettered {
                letter: letter.value().clone(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
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
