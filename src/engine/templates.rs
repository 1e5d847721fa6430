use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Shape checks that don't need any state.
fn validate_template_fields(
    day_of_week: u8,
    open: TimeOfDay,
    close: TimeOfDay,
    slot_duration_minutes: u16,
    max_capacity: u32,
) -> Result<(), EngineError> {
    if day_of_week > 6 {
        return Err(EngineError::Validation(format!(
            "day_of_week must be 0-6, got {day_of_week}"
        )));
    }
    if slot_duration_minutes < MIN_SLOT_DURATION_MINUTES {
        return Err(EngineError::Validation(format!(
            "slot duration must be at least {MIN_SLOT_DURATION_MINUTES} minutes, got {slot_duration_minutes}"
        )));
    }
    if max_capacity == 0 {
        return Err(EngineError::Validation("max capacity must be at least 1".into()));
    }
    if max_capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("max capacity too large"));
    }
    if open >= close {
        return Err(EngineError::InvalidHours { open, close });
    }
    Ok(())
}

impl Engine {
    // ── Resource registry ────────────────────────────────────

    pub async fn create_resource(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        let _gate = self.enter().await;

        // Published write-locked: anyone reaching it before the WAL append
        // lands waits here and sees NotFound if the append fails.
        let rs = Arc::new(RwLock::new(ResourceState::new(id, name.clone())));
        let guard = rs.clone().write_owned().await;
        match self.resources.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(rs);
            }
        }

        let event = Event::ResourceCreated { id, name };
        if let Err(e) = self.wal_append(&event).await {
            self.resources.remove(&id);
            return Err(e);
        }
        drop(guard);
        info!("resource {id} registered");
        Ok(())
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.enter().await;
        let guard = self.lock_resource(id).await?;
        if guard.has_templates() || self.days.iter().any(|e| e.key().0 == id) {
            return Err(EngineError::ResourceInUse(id));
        }

        self.wal_append(&Event::ResourceDeleted { id }).await?;
        self.resources.remove(&id);
        drop(guard);
        info!("resource {id} deleted");
        Ok(())
    }

    // ── Template store ───────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_template(
        &self,
        id: Ulid,
        resource_id: Ulid,
        day_of_week: u8,
        open: TimeOfDay,
        close: TimeOfDay,
        slot_duration_minutes: u16,
        max_capacity: u32,
    ) -> Result<Template, EngineError> {
        validate_template_fields(day_of_week, open, close, slot_duration_minutes, max_capacity)?;

        let _gate = self.enter().await;
        let mut guard = self.lock_resource(resource_id).await?;
        if guard.templates[usize::from(day_of_week)].is_some() {
            return Err(EngineError::TemplateExists {
                resource_id,
                day_of_week,
            });
        }
        // Template ids are global across resources; claim it before awaiting.
        match self.template_to_resource.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(resource_id);
            }
        }

        let template = Template {
            id,
            resource_id,
            day_of_week,
            open,
            close,
            slot_duration_minutes,
            max_capacity,
        };
        let event = Event::TemplateCreated {
            template: template.clone(),
        };
        if let Err(e) = self.persist_template_event(&mut guard, &event).await {
            self.template_to_resource.remove(&id);
            return Err(e);
        }
        info!(
            "template {id} created for resource {resource_id} day {day_of_week}: {open}-{close} every {slot_duration_minutes}m x{max_capacity}"
        );
        Ok(template)
    }

    /// Merge `patch` into the template. Already-materialized slots keep the
    /// capacity they were created with.
    pub async fn update_template(
        &self,
        id: Ulid,
        patch: TemplatePatch,
    ) -> Result<Template, EngineError> {
        let _gate = self.enter().await;
        let resource_id = self
            .template_to_resource
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_resource(resource_id).await?;
        let current = guard.template(&id).cloned().ok_or(EngineError::NotFound(id))?;

        if patch.resource_id.is_some_and(|r| r != current.resource_id)
            || patch.day_of_week.is_some_and(|d| d != current.day_of_week)
        {
            return Err(EngineError::IdentityChange(id));
        }

        let merged = Template {
            open: patch.open.unwrap_or(current.open),
            close: patch.close.unwrap_or(current.close),
            slot_duration_minutes: patch
                .slot_duration_minutes
                .unwrap_or(current.slot_duration_minutes),
            max_capacity: patch.max_capacity.unwrap_or(current.max_capacity),
            ..current
        };
        validate_template_fields(
            merged.day_of_week,
            merged.open,
            merged.close,
            merged.slot_duration_minutes,
            merged.max_capacity,
        )?;

        let event = Event::TemplateUpdated {
            template: merged.clone(),
        };
        self.persist_template_event(&mut guard, &event).await?;
        info!("template {id} updated");
        Ok(merged)
    }

    pub async fn remove_template(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.enter().await;
        let resource_id = self
            .template_to_resource
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = self.lock_resource(resource_id).await?;
        if guard.template(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::TemplateRemoved { id, resource_id };
        self.persist_template_event(&mut guard, &event).await?;
        info!("template {id} removed from resource {resource_id}");
        Ok(resource_id)
    }
}
