// id_record.rs - Per-id bookkeeping
//
// For every distinct id (and every wildcard pair bucket) this tracks which
// tables currently contain the id, plus the queries monitoring it. The
// table lists and the tables' own id lists are kept bidirectionally
// consistent by the store; that consistency is what makes
// "all tables containing X" an O(1) amortized lookup.
//
// Pair ids are indexed three times: under the full (relationship, target)
// id, under (relationship, *), and under (*, target). The last bucket is
// the reverse index used to find every pair naming an entity as target.

use crate::entity::{Entity, Id};
use crate::query::QueryId;
use crate::table::TableId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Bookkeeping for one id or wildcard bucket.
#[derive(Default)]
pub struct IdRecord {
    tables: Vec<TableId>,
    positions: HashMap<TableId, usize>,
    monitors: Vec<QueryId>,
}

impl IdRecord {
    /// Tables containing this id, in registration order. The slice is a
    /// restartable sequence: callers may re-borrow and rescan at any time.
    #[inline]
    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    pub fn is_unused(&self) -> bool {
        self.tables.is_empty() && self.monitors.is_empty()
    }

    fn insert_table(&mut self, table: TableId) -> bool {
        match self.positions.entry(table) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.tables.len());
                self.tables.push(table);
                true
            }
        }
    }

    fn remove_table(&mut self, table: TableId) -> bool {
        let Some(position) = self.positions.remove(&table) else {
            return false;
        };
        self.tables.swap_remove(position);
        if let Some(&moved) = self.tables.get(position) {
            self.positions.insert(moved, position);
        }
        true
    }
}

/// Table of id records, keyed by exact id and by wildcard pattern.
#[derive(Default)]
pub struct IdIndex {
    records: HashMap<Id, IdRecord>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create the record for `id`. For a concrete pair this also
    /// ensures both wildcard buckets exist.
    pub fn ensure(&mut self, id: Id) -> &mut IdRecord {
        if id.is_pair() && !id.has_wildcard() {
            for bucket in Self::pair_buckets(id) {
                self.records.entry(bucket).or_default();
            }
        }
        self.records.entry(id).or_default()
    }

    pub fn record(&self, id: Id) -> Option<&IdRecord> {
        self.records.get(&id)
    }

    /// Tables containing the exact id, or, for a wildcard pattern, every
    /// table containing any id matching the pattern.
    pub fn tables_for(&self, id_or_pattern: Id) -> &[TableId] {
        self.record(id_or_pattern).map(|r| r.tables()).unwrap_or(&[])
    }

    /// Note that `table` now contains `id`. Returns the monitors whose
    /// queries must be marked dirty.
    pub fn register_table(&mut self, id: Id, table: TableId) -> Vec<QueryId> {
        let mut dirty = Vec::new();
        self.touch(id, table, true, &mut dirty);
        if id.is_pair() && !id.has_wildcard() {
            for bucket in Self::pair_buckets(id) {
                self.touch(bucket, table, true, &mut dirty);
            }
        }
        dirty
    }

    /// Note that `table` no longer contains `id`. Returns the monitors
    /// whose queries must be marked dirty.
    pub fn unregister_table(&mut self, id: Id, table: TableId) -> Vec<QueryId> {
        let mut dirty = Vec::new();
        self.touch(id, table, false, &mut dirty);
        if id.is_pair() && !id.has_wildcard() {
            for bucket in Self::pair_buckets(id) {
                self.touch(bucket, table, false, &mut dirty);
            }
        }
        dirty
    }

    fn touch(&mut self, id: Id, table: TableId, insert: bool, dirty: &mut Vec<QueryId>) {
        let record = self.records.entry(id).or_default();
        let changed = if insert {
            record.insert_table(table)
        } else {
            record.remove_table(table)
        };
        if changed {
            for &query in &record.monitors {
                if !dirty.contains(&query) {
                    dirty.push(query);
                }
            }
        }
    }

    /// Attach a query monitor to `id`. The registration is a weak
    /// back-reference; the query must detach itself on release.
    pub fn add_monitor(&mut self, id: Id, query: QueryId) {
        let record = self.ensure(id);
        if !record.monitors.contains(&query) {
            record.monitors.push(query);
        }
    }

    pub fn remove_monitor(&mut self, id: Id, query: QueryId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.monitors.retain(|&q| q != query);
        }
    }

    /// Reclaim records that reference no tables and carry no monitors.
    ///
    /// Deliberately not done eagerly on the last unregister, to avoid
    /// thrashing during interleaved add/remove sequences.
    pub fn compact(&mut self) {
        self.records.retain(|_, record| !record.is_unused());
    }

    fn pair_buckets(id: Id) -> [Id; 2] {
        let relationship = Entity::from_parts(id.relationship_index(), 0);
        let target = Entity::from_parts(id.target_index(), 0);
        [
            Id::pair_wildcard_target(relationship),
            Id::pair_wildcard_relationship(target),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn id(index: u32) -> Id {
        Id::of(Entity::from_parts(index, 0))
    }

    #[test]
    fn registration_is_idempotent_and_ordered() {
        let mut index = IdIndex::new();
        index.register_table(id(1), 7);
        index.register_table(id(1), 9);
        index.register_table(id(1), 7);
        assert_eq!(index.tables_for(id(1)), &[7, 9]);
    }

    #[test]
    fn unregister_keeps_remaining_tables() {
        let mut index = IdIndex::new();
        for table in [3, 4, 5] {
            index.register_table(id(2), table);
        }
        index.unregister_table(id(2), 3);
        let mut tables = index.tables_for(id(2)).to_vec();
        tables.sort_unstable();
        assert_eq!(tables, vec![4, 5]);
        // The record itself survives the last unregister.
        index.unregister_table(id(2), 4);
        index.unregister_table(id(2), 5);
        assert!(index.record(id(2)).is_some());
        index.compact();
        assert!(index.record(id(2)).is_none());
    }

    #[test]
    fn pair_registration_fills_wildcard_buckets() {
        let mut index = IdIndex::new();
        let rel = Entity::from_parts(10, 0);
        let alpha = Entity::from_parts(20, 0);
        let beta = Entity::from_parts(21, 0);
        index.register_table(Id::pair(rel, alpha), 1);
        index.register_table(Id::pair(rel, beta), 2);

        assert_eq!(index.tables_for(Id::pair(rel, alpha)), &[1]);
        assert_eq!(index.tables_for(Id::pair_wildcard_target(rel)), &[1, 2]);
        assert_eq!(index.tables_for(Id::pair_wildcard_relationship(beta)), &[2]);

        index.unregister_table(Id::pair(rel, alpha), 1);
        assert_eq!(index.tables_for(Id::pair_wildcard_target(rel)), &[2]);
        assert!(index.tables_for(Id::pair_wildcard_relationship(alpha)).is_empty());
    }

    #[test]
    fn monitors_fire_only_on_membership_change() {
        let mut index = IdIndex::new();
        index.add_monitor(id(5), 42);
        let dirty = index.register_table(id(5), 1);
        assert_eq!(dirty, vec![42]);
        // Same table again: no membership change, no dirty monitors.
        let dirty = index.register_table(id(5), 1);
        assert!(dirty.is_empty());
        // An unrelated id never reaches this monitor.
        let dirty = index.register_table(id(6), 2);
        assert!(dirty.is_empty());

        index.remove_monitor(id(5), 42);
        let dirty = index.unregister_table(id(5), 1);
        assert!(dirty.is_empty());
    }
}
