// entity_index.rs - Generation-checked entity index
//
// Maps an entity's recyclable index to its generation and current storage
// location. Slot 0 is reserved so Entity::NULL can never be alive. Deleting
// a slot bumps its generation before it returns to the free list, which is
// what invalidates stale handles.

use crate::entity::{Entity, WILDCARD_INDEX};
use crate::error::{EcsError, EcsResult};
use crate::table::TableId;

/// Current storage location of a live entity.
///
/// `table` is `None` for an entity that has no ids yet (or was created
/// inside a deferred region and not yet placed); such entities occupy no
/// table row.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub table: Option<TableId>,
    pub row: u32,
}

impl Record {
    pub const EMPTY: Record = Record {
        table: None,
        row: 0,
    };
}

#[derive(Clone)]
struct Slot {
    generation: u16,
    alive: bool,
    record: Record,
}

impl Slot {
    const DEAD: Slot = Slot {
        generation: 0,
        alive: false,
        record: Record::EMPTY,
    };
}

/// Bidirectional map from entity handles to live records.
pub struct EntityIndex {
    slots: Vec<Slot>,
    free: Vec<u32>,
    alive: usize,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.push(Slot::DEAD); // reserved: Entity::NULL
        Self {
            slots,
            free: Vec::new(),
            alive: 0,
        }
    }

    /// Allocate a fresh handle, recycling a freed index when one exists.
    ///
    /// A recycled index comes back with the generation that was bumped at
    /// delete time, so the new handle never collides with the old one.
    pub fn create(&mut self) -> Entity {
        let entity = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            slot.record = Record::EMPTY;
            Entity::from_parts(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            debug_assert!(index < WILDCARD_INDEX, "entity index space exhausted");
            self.slots.push(Slot {
                generation: 0,
                alive: true,
                record: Record::EMPTY,
            });
            Entity::from_parts(index, 0)
        };
        self.alive += 1;
        entity
    }

    /// Revive a specific handle supplied by the host (e.g. persisted ids).
    ///
    /// Fails if the slot is occupied by a live entity; intermediate slots
    /// created by growing toward a high index join the free list.
    pub fn create_with(&mut self, entity: Entity) -> EcsResult<Entity> {
        let index = entity.index();
        if index == 0 || index >= WILDCARD_INDEX {
            return Err(EcsError::IndexOccupied(index));
        }
        while self.slots.len() <= index as usize {
            self.free.push(self.slots.len() as u32);
            self.slots.push(Slot::DEAD);
        }
        let slot = &mut self.slots[index as usize];
        if slot.alive {
            return Err(EcsError::IndexOccupied(index));
        }
        self.free.retain(|&i| i != index);
        slot.generation = entity.generation();
        slot.alive = true;
        slot.record = Record::EMPTY;
        self.alive += 1;
        Ok(entity)
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        match self.slots.get(entity.index() as usize) {
            Some(slot) => slot.alive && slot.generation == entity.generation(),
            None => false,
        }
    }

    /// Live handle currently occupying `index`, if any.
    pub fn entity_at(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index as usize)?;
        slot.alive.then(|| Entity::from_parts(index, slot.generation))
    }

    pub fn record(&self, entity: Entity) -> EcsResult<Record> {
        match self.slots.get(entity.index() as usize) {
            Some(slot) if slot.alive && slot.generation == entity.generation() => Ok(slot.record),
            _ => Err(EcsError::NotAlive(entity)),
        }
    }

    pub fn set_record(&mut self, entity: Entity, record: Record) -> EcsResult<()> {
        match self.slots.get_mut(entity.index() as usize) {
            Some(slot) if slot.alive && slot.generation == entity.generation() => {
                slot.record = record;
                Ok(())
            }
            _ => Err(EcsError::NotAlive(entity)),
        }
    }

    /// Update only the row of a live entity's record. Used by swap-remove
    /// fixups, where the archetype is unchanged.
    pub(crate) fn fix_row(&mut self, entity: Entity, row: u32) {
        let slot = &mut self.slots[entity.index() as usize];
        debug_assert!(slot.alive && slot.generation == entity.generation());
        slot.record.row = row;
    }

    /// Free the slot, bump its generation, and return the old record.
    ///
    /// A second delete of the same handle reports `NotAlive` and changes
    /// nothing.
    pub fn delete(&mut self, entity: Entity) -> EcsResult<Record> {
        let index = entity.index();
        match self.slots.get_mut(index as usize) {
            Some(slot) if slot.alive && slot.generation == entity.generation() => {
                let record = slot.record;
                slot.alive = false;
                slot.generation = slot.generation.wrapping_add(1);
                slot.record = Record::EMPTY;
                self.free.push(index);
                self.alive -= 1;
                Ok(record)
            }
            _ => Err(EcsError::NotAlive(entity)),
        }
    }

    /// Number of live entities.
    pub fn alive_count(&self) -> usize {
        self.alive
    }
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_entities_are_alive_until_deleted() {
        let mut index = EntityIndex::new();
        let e = index.create();
        assert!(index.is_alive(e));
        index.delete(e).unwrap();
        assert!(!index.is_alive(e));
    }

    #[test]
    fn null_is_never_alive() {
        let index = EntityIndex::new();
        assert!(!index.is_alive(Entity::NULL));
    }

    #[test]
    fn recycled_index_gets_greater_generation() {
        let mut index = EntityIndex::new();
        let old = index.create();
        index.delete(old).unwrap();
        let reused = index.create();
        assert_eq!(reused.index(), old.index());
        assert!(reused.generation() > old.generation());
        assert!(index.is_alive(reused));
        assert!(!index.is_alive(old));
    }

    #[test]
    fn double_delete_is_rejected_without_corruption() {
        let mut index = EntityIndex::new();
        let e = index.create();
        index.delete(e).unwrap();
        assert_eq!(index.delete(e), Err(EcsError::NotAlive(e)));
        // The freed slot is still usable exactly once.
        let next = index.create();
        assert_eq!(next.index(), e.index());
        assert_eq!(index.alive_count(), 1);
    }

    #[test]
    fn record_mutation_requires_liveness() {
        let mut index = EntityIndex::new();
        let e = index.create();
        let record = Record {
            table: Some(3),
            row: 9,
        };
        index.set_record(e, record).unwrap();
        assert_eq!(index.record(e).unwrap(), record);

        index.delete(e).unwrap();
        assert_eq!(index.set_record(e, record), Err(EcsError::NotAlive(e)));
        assert_eq!(index.record(e), Err(EcsError::NotAlive(e)));
    }

    #[test]
    fn explicit_index_creation() {
        let mut index = EntityIndex::new();
        let wanted = Entity::from_parts(10, 4);
        let created = index.create_with(wanted).unwrap();
        assert_eq!(created, wanted);
        assert!(index.is_alive(wanted));
        // The grown gap slots are recyclable.
        let filler = index.create();
        assert!(filler.index() < 10);
        // A second claim on the live slot fails.
        assert_eq!(
            index.create_with(Entity::from_parts(10, 9)),
            Err(EcsError::IndexOccupied(10))
        );
    }
}
