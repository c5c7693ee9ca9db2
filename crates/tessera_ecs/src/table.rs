// table.rs - Archetype table store
//
// A table is the column-oriented storage block shared by all entities with
// the same sorted id-set. Row i across every column and the entity list
// describes the same entity; removal is swap-remove, which requires fixing
// the moved entity's index record before the operation completes. Both the
// swap-remove and the cross-table move perform that fixup inside a single
// function so no observer ever sees a half-updated record.

use crate::column::Column;
use crate::component::ComponentRegistry;
use crate::entity::{Entity, Id};
use crate::entity_index::{EntityIndex, Record};
use crate::error::EcsResult;
use std::collections::HashMap;
use tracing::debug;

pub type TableId = u32;

/// Structural properties of a table, computed once at creation.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct TableFlags(u8);

impl TableFlags {
    pub const HAS_PAIRS: TableFlags = TableFlags(1 << 0);
    pub const HAS_CHILD_OF: TableFlags = TableFlags(1 << 1);
    pub const IS_PREFAB: TableFlags = TableFlags(1 << 2);

    #[inline]
    pub fn contains(self, other: TableFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn set(&mut self, other: TableFlags) {
        self.0 |= other.0;
    }
}

/// Column-oriented storage for one archetype.
pub struct Table {
    id: TableId,
    ids: Box<[Id]>,
    columns: Vec<Column>,
    /// Position in `ids` -> position in `columns`, `None` for dataless ids.
    column_map: Box<[Option<u32>]>,
    entities: Vec<Entity>,
    flags: TableFlags,
    retired: bool,
}

impl Table {
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Sorted ids this table contains. Empty once the table is retired.
    #[inline]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// Entity occupying each row, 1:1 with column rows.
    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn flags(&self) -> TableFlags {
        self.flags
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    #[inline]
    pub fn contains(&self, id: Id) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Wildcard-aware containment test.
    pub fn matches(&self, pattern: Id) -> bool {
        if !pattern.has_wildcard() {
            return self.contains(pattern);
        }
        self.ids.iter().any(|id| id.matches(pattern))
    }

    /// First concrete id matching a (possibly wildcard) pattern.
    pub fn first_matching(&self, pattern: Id) -> Option<Id> {
        if !pattern.has_wildcard() {
            return self.contains(pattern).then_some(pattern);
        }
        self.ids.iter().copied().find(|id| id.matches(pattern))
    }

    /// All concrete ids matching a pattern, in id order.
    pub fn matching_ids<'a>(&'a self, pattern: Id) -> impl Iterator<Item = Id> + 'a {
        self.ids
            .iter()
            .copied()
            .filter(move |id| id.matches(pattern))
    }

    fn column_position(&self, id: Id) -> Option<usize> {
        let position = self.ids.binary_search(&id).ok()?;
        self.column_map[position].map(|c| c as usize)
    }

    /// Column storing `id`'s data, if the id carries data in this table.
    pub fn column(&self, id: Id) -> Option<&Column> {
        self.column_position(id).map(|c| &self.columns[c])
    }

    pub fn column_mut(&mut self, id: Id) -> Option<&mut Column> {
        let position = self.column_position(id)?;
        Some(&mut self.columns[position])
    }

    /// Typed view of a column. The caller must pass the id the type was
    /// registered under.
    ///
    /// # Safety
    /// `T` must be the exact type registered for `id`.
    pub unsafe fn column_slice<T>(&self, id: Id) -> Option<&[T]> {
        let column = self.column(id)?;
        debug_assert_eq!(column.element_size(), std::mem::size_of::<T>());
        if column.is_empty() {
            return Some(&[]);
        }
        // SAFETY: the column buffer holds len initialized values whose
        // layout the caller vouches matches T.
        Some(unsafe { std::slice::from_raw_parts(column.ptr(0) as *const T, column.len()) })
    }
}

/// The set of all instantiated archetypes, keyed by exact id-set.
///
/// Tables are created lazily on first use and never removed from the slot
/// vector; retiring an empty table frees its storage and leaves a husk so
/// that table ids stay stable and iteration order stays creation order.
pub struct TableStore {
    tables: Vec<Table>,
    by_ids: HashMap<Box<[Id]>, TableId>,
}

impl TableStore {
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            by_ids: HashMap::new(),
        }
    }

    #[inline]
    pub fn get(&self, table: TableId) -> &Table {
        &self.tables[table as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, table: TableId) -> &mut Table {
        &mut self.tables[table as usize]
    }

    /// Live tables in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| !t.retired)
    }

    /// Return the table for this exact sorted id-set, creating it if this
    /// combination was never instantiated. The second value reports whether
    /// a new table was created (the caller then registers it with every
    /// relevant id record).
    pub fn find_or_create(
        &mut self,
        ids: &[Id],
        registry: &ComponentRegistry,
        child_of: Entity,
        prefab: Entity,
    ) -> (TableId, bool) {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must be sorted and unique");
        if let Some(&table) = self.by_ids.get(ids) {
            return (table, false);
        }

        let mut columns = Vec::new();
        let mut column_map = Vec::with_capacity(ids.len());
        let mut flags = TableFlags::default();
        for &id in ids {
            if id.is_pair() {
                flags.set(TableFlags::HAS_PAIRS);
                if id.relationship_index() == child_of.index() {
                    flags.set(TableFlags::HAS_CHILD_OF);
                }
            } else if id == Id::of(prefab) {
                flags.set(TableFlags::IS_PREFAB);
            }
            match registry.info(id) {
                Some(info) if info.size > 0 => {
                    column_map.push(Some(columns.len() as u32));
                    columns.push(Column::new(info));
                }
                _ => column_map.push(None),
            }
        }

        let table_id = self.tables.len() as TableId;
        let ids: Box<[Id]> = ids.into();
        self.by_ids.insert(ids.clone(), table_id);
        self.tables.push(Table {
            id: table_id,
            ids,
            columns,
            column_map: column_map.into_boxed_slice(),
            entities: Vec::new(),
            flags,
            retired: false,
        });
        debug!(table = table_id, ids = ?self.tables[table_id as usize].ids, "created table");
        (table_id, true)
    }

    /// Append `entity` to `table`, default-constructing every column value,
    /// and write its record back into the entity index.
    ///
    /// On allocation failure every partially appended column is rolled back
    /// and the store is left in its pre-operation state.
    pub fn append_entity(
        &mut self,
        table: TableId,
        entity: Entity,
        index: &mut EntityIndex,
    ) -> EcsResult<u32> {
        let t = &mut self.tables[table as usize];
        debug_assert!(!t.retired);
        let mut pushed = 0;
        for column in &mut t.columns {
            if let Err(err) = column.push_default() {
                for column in t.columns[..pushed].iter_mut() {
                    column.pop_drop();
                }
                return Err(err);
            }
            pushed += 1;
        }
        let row = t.entities.len() as u32;
        t.entities.push(entity);
        if let Err(err) = index.set_record(
            entity,
            Record {
                table: Some(table),
                row,
            },
        ) {
            t.entities.pop();
            for column in &mut t.columns {
                column.pop_drop();
            }
            return Err(err);
        }
        Ok(row)
    }

    /// Remove `row` from `table` by swapping the last row into the hole.
    ///
    /// The removed row's values are dropped. If a different entity moved
    /// into `row`, its index record is updated here, before returning;
    /// the column move and the record fixup are a single operation.
    pub fn remove_row(&mut self, table: TableId, row: u32, index: &mut EntityIndex) {
        let t = &mut self.tables[table as usize];
        let row = row as usize;
        debug_assert!(row < t.entities.len());
        for column in &mut t.columns {
            column.swap_remove(row, true);
        }
        t.entities.swap_remove(row);
        if let Some(&moved) = t.entities.get(row) {
            index.fix_row(moved, row as u32);
        }
    }

    /// Move `entity` from (`from`, `row`) into `to`.
    ///
    /// Values for ids common to both tables move bitwise; ids only in `from`
    /// are dropped; ids only in `to` are default-constructed. The entity's
    /// record and the swapped neighbour's record are both updated before
    /// this returns. On allocation failure nothing is moved.
    pub fn move_entity(
        &mut self,
        entity: Entity,
        from: TableId,
        row: u32,
        to: TableId,
        index: &mut EntityIndex,
    ) -> EcsResult<u32> {
        debug_assert_ne!(from, to);
        let (src, dst) = self.pair_mut(from, to);
        let row = row as usize;
        debug_assert!(row < src.entities.len());
        debug_assert_eq!(src.entities[row], entity);

        // Build the destination row first; this is the only fallible part.
        // `built` remembers whether each push was a move (forget on unwind)
        // or a default (drop on unwind).
        let mut built: Vec<bool> = Vec::with_capacity(dst.columns.len());
        let mut failed = None;
        for (position, &id) in dst.ids.iter().enumerate() {
            let Some(dst_column) = dst.column_map[position] else {
                continue;
            };
            let result = match src.column_position(id) {
                Some(src_column) => {
                    let src_ptr = src.columns[src_column].ptr(row);
                    built.push(true);
                    dst.columns[dst_column as usize].push_moved_from(src_ptr)
                }
                None => {
                    built.push(false);
                    dst.columns[dst_column as usize].push_default()
                }
            };
            if let Err(err) = result {
                built.pop();
                failed = Some(err);
                break;
            }
        }
        if let Some(err) = failed {
            let mut column = built.len();
            for was_move in built.into_iter().rev() {
                column -= 1;
                if was_move {
                    dst.columns[column].pop_forget();
                } else {
                    dst.columns[column].pop_drop();
                }
            }
            return Err(err);
        }

        // Source cleanup cannot fail: forget moved values, drop the rest.
        for (position, &id) in src.ids.iter().enumerate() {
            let Some(src_column) = src.column_map[position] else {
                continue;
            };
            let moved_out = dst.column_position(id).is_some();
            src.columns[src_column as usize].swap_remove(row, !moved_out);
        }

        let new_row = dst.entities.len() as u32;
        dst.entities.push(entity);
        src.entities.swap_remove(row);
        if let Some(&swapped) = src.entities.get(row) {
            index.fix_row(swapped, row as u32);
        }
        index.set_record(
            entity,
            Record {
                table: Some(to),
                row: new_row,
            },
        )?;
        Ok(new_row)
    }

    /// Free an empty table's storage and forget its id-set.
    ///
    /// Returns the ids it used to contain so the caller can unregister it
    /// from every id record. The slot itself remains (retired) so table ids
    /// stay stable.
    pub fn retire(&mut self, table: TableId) -> Vec<Id> {
        let t = &mut self.tables[table as usize];
        debug_assert!(t.is_empty(), "only empty tables can be retired");
        if t.retired {
            return Vec::new();
        }
        let ids = std::mem::take(&mut t.ids);
        self.by_ids.remove(&ids);
        t.columns.clear();
        t.column_map = Box::new([]);
        t.entities = Vec::new();
        t.retired = true;
        debug!(table, "retired empty table");
        ids.into_vec()
    }

    fn pair_mut(&mut self, a: TableId, b: TableId) -> (&mut Table, &mut Table) {
        debug_assert_ne!(a, b);
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (head, tail) = self.tables.split_at_mut(b);
            (&mut head[a], &mut tail[0])
        } else {
            let (head, tail) = self.tables.split_at_mut(a);
            (&mut tail[0], &mut head[b])
        }
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::TypeInfo;

    fn fixture() -> (TableStore, ComponentRegistry, EntityIndex, Entity, Entity) {
        let mut index = EntityIndex::new();
        let child_of = index.create();
        let prefab = index.create();
        (
            TableStore::new(),
            ComponentRegistry::new(),
            index,
            child_of,
            prefab,
        )
    }

    #[test]
    fn find_or_create_is_keyed_by_exact_id_set() {
        let (mut store, registry, mut index, child_of, prefab) = fixture();
        let a = Id::of(index.create());
        let b = Id::of(index.create());
        let mut ids = vec![a, b];
        ids.sort_unstable();

        let (t1, created1) = store.find_or_create(&ids, &registry, child_of, prefab);
        let (t2, created2) = store.find_or_create(&ids, &registry, child_of, prefab);
        assert!(created1);
        assert!(!created2);
        assert_eq!(t1, t2);

        let (t3, _) = store.find_or_create(&ids[..1], &registry, child_of, prefab);
        assert_ne!(t1, t3);
    }

    #[test]
    fn flags_reflect_the_id_set() {
        let (mut store, registry, mut index, child_of, prefab) = fixture();
        let parent = index.create();
        let mut ids = vec![Id::of(prefab), Id::pair(child_of, parent)];
        ids.sort_unstable();
        let (table, _) = store.find_or_create(&ids, &registry, child_of, prefab);
        let flags = store.get(table).flags();
        assert!(flags.contains(TableFlags::HAS_PAIRS));
        assert!(flags.contains(TableFlags::HAS_CHILD_OF));
        assert!(flags.contains(TableFlags::IS_PREFAB));
    }

    #[test]
    fn swap_remove_fixes_the_moved_entity_record() {
        let (mut store, mut registry, mut index, child_of, prefab) = fixture();
        let comp = index.create();
        registry.register(Id::of(comp), TypeInfo::of::<u64>("Value"));
        let ids = [Id::of(comp)];
        let (table, _) = store.find_or_create(&ids, &registry, child_of, prefab);

        let e1 = index.create();
        let e2 = index.create();
        let e3 = index.create();
        for e in [e1, e2, e3] {
            store.append_entity(table, e, &mut index).unwrap();
        }
        // Rows are [e1, e2, e3]; removing row 0 must move e3 into it.
        store.remove_row(table, 0, &mut index);
        let t = store.get(table);
        assert_eq!(t.entities(), &[e3, e2]);
        assert_eq!(index.record(e3).unwrap().row, 0);
        assert_eq!(index.record(e2).unwrap().row, 1);
    }

    #[test]
    fn move_entity_preserves_shared_column_data() {
        let (mut store, mut registry, mut index, child_of, prefab) = fixture();
        let comp = index.create();
        let tag = index.create();
        registry.register(Id::of(comp), TypeInfo::of::<u64>("Value"));

        let (src, _) = store.find_or_create(&[Id::of(comp)], &registry, child_of, prefab);
        let mut ids = vec![Id::of(comp), Id::of(tag)];
        ids.sort_unstable();
        let (dst, _) = store.find_or_create(&ids, &registry, child_of, prefab);

        let e = index.create();
        let row = store.append_entity(src, e, &mut index).unwrap();
        // SAFETY: the column was registered as u64.
        unsafe {
            *(store
                .get_mut(src)
                .column_mut(Id::of(comp))
                .unwrap()
                .ptr(row as usize) as *mut u64) = 777;
        }

        let new_row = store.move_entity(e, src, row, dst, &mut index).unwrap();
        assert!(store.get(src).is_empty());
        assert_eq!(store.get(dst).entities(), &[e]);
        assert_eq!(
            index.record(e).unwrap(),
            Record {
                table: Some(dst),
                row: new_row
            }
        );
        let value = unsafe {
            store
                .get(dst)
                .column_slice::<u64>(Id::of(comp))
                .unwrap()[new_row as usize]
        };
        assert_eq!(value, 777);
    }

    #[test]
    fn retired_tables_match_nothing() {
        let (mut store, registry, mut index, child_of, prefab) = fixture();
        let tag = Id::of(index.create());
        let (table, _) = store.find_or_create(&[tag], &registry, child_of, prefab);
        let former = store.retire(table);
        assert_eq!(former, vec![tag]);
        assert!(store.get(table).is_retired());
        assert!(!store.get(table).matches(tag));
        // The same id-set now creates a fresh table.
        let (fresh, created) = store.find_or_create(&[tag], &registry, child_of, prefab);
        assert!(created);
        assert_ne!(fresh, table);
    }
}
