//! Incarnation tracking for pages, sections and indexes.
//!
//! Pass 1 counts every state change an object goes through in the log.
//! Later passes count again; a record's effect is current only when the
//! later count has caught up with the pass 1 total, i.e. the record is the
//! object's last incarnation.

use std::collections::HashMap;

use crate::types::{ObjectState, TableSpaceId};
use crate::util::SparseArray;

#[derive(Debug, Clone, Copy, Default)]
struct RecoveryObject {
    pass1_count: u32,
    current_count: u32,
    state: ObjectState,
}

/// Incarnation counters for one kind of object, per table space.
#[derive(Debug, Default)]
pub struct RecoveryObjects {
    spaces: HashMap<TableSpaceId, SparseArray<RecoveryObject>>,
}

impl RecoveryObjects {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn object(&mut self, table_space_id: TableSpaceId, id: u32) -> &mut RecoveryObject {
        self.spaces
            .entry(table_space_id)
            .or_default()
            .get_or_insert(id)
    }

    /// Records that the log moves object `id` into `state`.
    ///
    /// In pass 1 returns true the first time the object is seen. In later
    /// passes returns true while the record belongs to the object's last
    /// incarnation.
    pub fn bump(&mut self, table_space_id: TableSpaceId, id: u32, state: ObjectState, pass1: bool) -> bool {
        let object = self.object(table_space_id, id);
        if object.state != state {
            if pass1 {
                object.pass1_count += 1;
            } else {
                object.current_count += 1;
            }
            object.state = state;
        }
        if pass1 {
            object.pass1_count == 1
        } else {
            object.pass1_count == object.current_count
        }
    }

    /// Rewinds the per-pass counters before another pass over the log.
    pub fn reset(&mut self) {
        for objects in self.spaces.values_mut() {
            let touched: Vec<u32> = objects
                .iter()
                .filter(|(_, o)| o.pass1_count > 0 || o.current_count > 0)
                .map(|(id, _)| id)
                .collect();
            for id in touched {
                if let Some(object) = objects.get_mut(id) {
                    object.current_count = 0;
                    object.state = ObjectState::Unknown;
                }
            }
        }
    }

    /// Returns true unless the object was marked inactive.
    #[must_use]
    pub fn is_object_active(&self, table_space_id: TableSpaceId, id: u32) -> bool {
        self.spaces
            .get(&table_space_id)
            .and_then(|objects| objects.get(id))
            .map_or(true, |o| o.pass1_count == o.current_count)
    }

    /// Forgets any history so the object counts as active.
    pub fn set_active(&mut self, table_space_id: TableSpaceId, id: u32) {
        let object = self.object(table_space_id, id);
        object.pass1_count = 0;
        object.current_count = 0;
    }

    /// Marks the object inactive so pending work against it is skipped.
    pub fn set_inactive(&mut self, table_space_id: TableSpaceId, id: u32) {
        let object = self.object(table_space_id, id);
        object.pass1_count = 0;
        object.current_count = 1;
    }

    /// Drops every counter.
    pub fn clear(&mut self) {
        self.spaces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_last_incarnation_is_current() {
        let mut objects = RecoveryObjects::new();
        // Pass 1: page 9 is used twice, freed, used again.
        assert!(objects.bump(0, 9, ObjectState::InUse, true));
        // Same state again: still the first incarnation.
        assert!(objects.bump(0, 9, ObjectState::InUse, true));
        assert!(!objects.bump(0, 9, ObjectState::Deleted, true));
        assert!(!objects.bump(0, 9, ObjectState::InUse, true));

        objects.reset();
        // Pass 2 replays the same sequence.
        assert!(!objects.bump(0, 9, ObjectState::InUse, false));
        assert!(!objects.bump(0, 9, ObjectState::InUse, false));
        assert!(!objects.is_object_active(0, 9));
        assert!(!objects.bump(0, 9, ObjectState::Deleted, false));
        assert!(objects.bump(0, 9, ObjectState::InUse, false));
        assert!(objects.is_object_active(0, 9));
    }

    #[test]
    fn test_table_spaces_are_independent() {
        let mut objects = RecoveryObjects::new();
        objects.bump(0, 4, ObjectState::InUse, true);
        objects.bump(0, 4, ObjectState::Deleted, true);
        objects.bump(1, 4, ObjectState::InUse, true);
        objects.reset();

        assert!(!objects.bump(0, 4, ObjectState::InUse, false));
        assert!(objects.bump(1, 4, ObjectState::InUse, false));
    }

    #[test]
    fn test_inactive_objects() {
        let mut objects = RecoveryObjects::new();
        assert!(objects.is_object_active(0, 12));
        objects.set_inactive(0, 12);
        assert!(!objects.is_object_active(0, 12));
        objects.set_active(0, 12);
        assert!(objects.is_object_active(0, 12));
    }
}
