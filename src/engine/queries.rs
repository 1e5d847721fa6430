use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    /// Every slot of the resource on `date`, ordered by start time. Reads the
    /// booked counts without taking slot locks, so the view is advisory.
    pub fn list_available(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        if !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }
        // Clone the ids out so no map guard is held while reading cells.
        let ids: Vec<Ulid> = match self.days.get(&(resource_id, date)) {
            Some(day) => day.iter().map(|(_, id)| *id).collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.get_slot_cell(id))
            .map(|cell| cell.info())
            .collect())
    }

    /// Check that `slot_id` belongs to `resource_id` and falls on `date`, and
    /// describe it for the booking flow.
    pub fn resolve(
        &self,
        resource_id: Ulid,
        slot_id: Ulid,
        date: NaiveDate,
    ) -> Result<SlotDetail, EngineError> {
        let cell = self
            .get_slot_cell(&slot_id)
            .filter(|c| c.resource_id == resource_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        if cell.date != date {
            return Err(EngineError::DateMismatch {
                slot_id,
                expected: date,
                actual: cell.date,
            });
        }
        Ok(SlotDetail::from(&cell.info()))
    }

    pub fn get_slot(&self, slot_id: &Ulid) -> Option<SlotInfo> {
        self.get_slot_cell(slot_id).map(|cell| cell.info())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let all: Vec<SharedResourceState> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(all.len());
        for rs in all {
            let guard = rs.read().await;
            out.push(ResourceInfo {
                id: guard.id,
                name: guard.name.clone(),
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    pub async fn get_template(&self, id: &Ulid) -> Option<Template> {
        let resource_id = *self.template_to_resource.get(id)?.value();
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.template(id).cloned()
    }

    /// Templates of one resource, Sunday first.
    pub async fn list_templates(&self, resource_id: Ulid) -> Result<Vec<Template>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.templates.iter().flatten().cloned().collect())
    }

    pub async fn template_for_day(&self, resource_id: Ulid, day_of_week: u8) -> Option<Template> {
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.templates.get(usize::from(day_of_week))?.clone()
    }

    /// Oldest first.
    pub fn list_dead_letters(&self) -> Vec<DeadLetter> {
        let mut out: Vec<DeadLetter> = self.dead_letters.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|l| (l.rejected_at, l.event_id));
        out
    }
}
