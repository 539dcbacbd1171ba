//! Slot table: running-task reservations and memory accounting.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// An admitted execution context holding a memory reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Slot identifier.
    pub id: Uuid,
    /// Task bound to the slot.
    pub task_id: Uuid,
    /// Memory reserved for the task, in MB.
    pub allocated_memory_mb: u64,
    /// When the slot was created.
    pub started_at: DateTime<Utc>,
}

/// Active slots keyed by task identifier.
///
/// The sum of allocated memory across active slots must never exceed the
/// current budget; the scheduler enforces this at admission time and this
/// table is the accounting source of truth.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: HashMap<Uuid, Slot>,
}

impl SlotTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot for a task. Returns the slot identifier.
    pub fn allocate(&mut self, task_id: Uuid, memory_mb: u64) -> Uuid {
        let slot = Slot {
            id: Uuid::new_v4(),
            task_id,
            allocated_memory_mb: memory_mb,
            started_at: Utc::now(),
        };
        let slot_id = slot.id;
        self.slots.insert(task_id, slot);
        slot_id
    }

    /// Release the slot bound to a task, returning it if present.
    pub fn release(&mut self, task_id: Uuid) -> Option<Slot> {
        self.slots.remove(&task_id)
    }

    /// Whether a task holds a slot.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.slots.contains_key(&task_id)
    }

    /// Number of active slots.
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// Sum of reserved memory across active slots, in MB.
    pub fn memory_in_use_mb(&self) -> u64 {
        self.slots
            .values()
            .fold(0_u64, |acc, s| acc.saturating_add(s.allocated_memory_mb))
    }

    /// Task identifiers of all active slots.
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.slots.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_release_accounting() {
        let mut table = SlotTable::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        table.allocate(a, 4096);
        table.allocate(b, 2048);
        assert_eq!(table.active_count(), 2);
        assert_eq!(table.memory_in_use_mb(), 6144);
        assert!(table.contains(a));

        let released = table.release(a).expect("slot present");
        assert_eq!(released.task_id, a);
        assert_eq!(released.allocated_memory_mb, 4096);
        assert_eq!(table.memory_in_use_mb(), 2048);
        assert_eq!(table.active_count(), 1);

        assert!(table.release(a).is_none());
    }

    #[test]
    fn test_release_unknown_task_is_none() {
        let mut table = SlotTable::new();
        assert!(table.release(Uuid::new_v4()).is_none());
        assert_eq!(table.memory_in_use_mb(), 0);
    }
}
