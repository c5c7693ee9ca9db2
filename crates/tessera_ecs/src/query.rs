// query.rs - Query state, term matching, and iteration
//
// A query declares a term list; its state caches the currently-matching
// table list. The cache is marked dirty through monitors on the ids the
// terms reference and is rebuilt lazily before the next iteration, never by
// rescanning the whole table store. Iteration yields tables in creation
// order; callers must not assume entity-id order.

use crate::entity::{Entity, Id};
use crate::entity_index::EntityIndex;
use crate::error::{EcsError, EcsResult};
use crate::table::{Table, TableId, TableStore};

pub type QueryId = u32;

/// How a term constrains matching.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TermOper {
    /// The id (or pattern) must be present.
    And,
    /// The id (or pattern) must be absent.
    Not,
    /// Never constrains matching; declares interest for column access.
    Optional,
}

/// Where a term looks for its id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TermSrc {
    /// On the matched entity's own table.
    This,
    /// On an ancestor reached by following the relationship's target chain.
    Up(Entity),
}

/// One predicate of a query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Term {
    pub id: Id,
    pub oper: TermOper,
    pub src: TermSrc,
}

impl Term {
    pub fn new(id: impl Into<Id>) -> Self {
        Self {
            id: id.into(),
            oper: TermOper::And,
            src: TermSrc::This,
        }
    }
}

/// Term list under construction. Built fluently, consumed by
/// `World::query`.
#[derive(Clone, Debug, Default)]
pub struct QueryDesc {
    pub(crate) terms: Vec<Term>,
}

impl QueryDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `id` to be present.
    pub fn with(mut self, id: impl Into<Id>) -> Self {
        self.terms.push(Term::new(id));
        self
    }

    /// Require `id` to be absent.
    pub fn without(mut self, id: impl Into<Id>) -> Self {
        self.terms.push(Term {
            id: id.into(),
            oper: TermOper::Not,
            src: TermSrc::This,
        });
        self
    }

    /// Declare optional interest in `id`.
    pub fn optional(mut self, id: impl Into<Id>) -> Self {
        self.terms.push(Term {
            id: id.into(),
            oper: TermOper::Optional,
            src: TermSrc::This,
        });
        self
    }

    /// Require `id` on an ancestor reached through `relationship`.
    pub fn with_up(mut self, id: impl Into<Id>, relationship: Entity) -> Self {
        self.terms.push(Term {
            id: id.into(),
            oper: TermOper::And,
            src: TermSrc::Up(relationship),
        });
        self
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}

/// Handle to a registered query. Generation-checked so a released query's
/// slot can be reused without stale handles resolving.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueryHandle {
    pub(crate) index: QueryId,
    pub(crate) generation: u32,
}

/// Registered query state: term list plus the cached match list.
pub struct QueryState {
    pub(crate) terms: Vec<Term>,
    /// Matching tables, ascending table id (= creation order).
    pub(crate) tables: Vec<TableId>,
    pub(crate) dirty: bool,
    /// Ids this query registered monitors under (detached on release).
    pub(crate) monitored: Vec<Id>,
    /// Up-terms depend on ancestor placement, which monitors do not see;
    /// such queries rematch before every iteration.
    pub(crate) has_up: bool,
}

impl QueryState {
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn matched_tables(&self) -> &[TableId] {
        &self.tables
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_up(&self) -> bool {
        self.has_up
    }
}

struct QuerySlot {
    generation: u32,
    state: Option<QueryState>,
}

/// Slab of registered queries, owned by the world.
#[derive(Default)]
pub struct QuerySet {
    slots: Vec<QuerySlot>,
    free: Vec<QueryId>,
}

impl QuerySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: QueryState) -> QueryHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(state);
            QueryHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as QueryId;
            self.slots.push(QuerySlot {
                generation: 0,
                state: Some(state),
            });
            QueryHandle {
                index,
                generation: 0,
            }
        }
    }

    pub fn get(&self, handle: QueryHandle) -> EcsResult<&QueryState> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.as_ref())
            .ok_or(EcsError::StaleQuery)
    }

    pub fn get_mut(&mut self, handle: QueryHandle) -> EcsResult<&mut QueryState> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.as_mut())
            .ok_or(EcsError::StaleQuery)
    }

    /// Release the slot, bumping its generation, and hand back the state so
    /// the caller can deregister its monitors.
    pub fn remove(&mut self, handle: QueryHandle) -> EcsResult<QueryState> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(EcsError::StaleQuery)?;
        let state = slot.state.take().ok_or(EcsError::StaleQuery)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(state)
    }

    /// Flip the dirty flag of a query named by a monitor.
    pub fn mark_dirty(&mut self, query: QueryId) {
        if let Some(slot) = self.slots.get_mut(query as usize) {
            if let Some(state) = slot.state.as_mut() {
                state.dirty = true;
            }
        }
    }

    /// Mark every registered query dirty (used after compaction).
    pub fn mark_all_dirty(&mut self) {
        for slot in &mut self.slots {
            if let Some(state) = slot.state.as_mut() {
                state.dirty = true;
            }
        }
    }
}

/// Ancestor chains longer than this are treated as cycles and stop.
const MAX_UP_DEPTH: usize = 64;

/// Test one table against a full term list.
pub(crate) fn table_matches(
    terms: &[Term],
    table: &Table,
    store: &TableStore,
    index: &EntityIndex,
) -> bool {
    if table.is_retired() {
        return false;
    }
    terms.iter().all(|term| {
        let present = match term.src {
            TermSrc::This => table.matches(term.id),
            TermSrc::Up(relationship) => ancestor_matches(table, relationship, term.id, store, index),
        };
        match term.oper {
            TermOper::And => present,
            TermOper::Not => !present,
            TermOper::Optional => true,
        }
    })
}

/// Walk the relationship target chain upward looking for `pattern`.
///
/// A table's pair id fixes the target for every row, so traversal is
/// per-table. Bounded by MAX_UP_DEPTH as a cycle guard.
fn ancestor_matches(
    table: &Table,
    relationship: Entity,
    pattern: Id,
    store: &TableStore,
    index: &EntityIndex,
) -> bool {
    let up_pattern = Id::pair_wildcard_target(relationship);
    let mut current = table;
    for _ in 0..MAX_UP_DEPTH {
        let Some(pair) = current.first_matching(up_pattern) else {
            return false;
        };
        let Some(target) = index.entity_at(pair.target_index()) else {
            return false;
        };
        let Ok(record) = index.record(target) else {
            return false;
        };
        let Some(parent_table) = record.table else {
            return false;
        };
        let parent = store.get(parent_table);
        if parent.matches(pattern) {
            return true;
        }
        current = parent;
    }
    false
}

/// Pull-based cursor over a query's matched tables.
///
/// Finite and not restartable; re-invoke `World::query_iter` to scan again.
/// May be abandoned between `next` calls with no cleanup. Empty tables are
/// skipped.
pub struct QueryIter<'w> {
    store: &'w TableStore,
    tables: std::vec::IntoIter<TableId>,
}

impl<'w> QueryIter<'w> {
    pub(crate) fn new(store: &'w TableStore, tables: Vec<TableId>) -> Self {
        Self {
            store,
            tables: tables.into_iter(),
        }
    }

    /// Flatten into the matched entities, in table order then row order.
    pub fn entities(self) -> impl Iterator<Item = Entity> + 'w {
        let store = self.store;
        self.tables
            .flat_map(move |table| store.get(table).entities().iter().copied())
    }
}

impl<'w> Iterator for QueryIter<'w> {
    type Item = &'w Table;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let table = self.tables.next()?;
            let table = self.store.get(table);
            if !table.is_empty() {
                return Some(table);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state() -> QueryState {
        QueryState {
            terms: Vec::new(),
            tables: Vec::new(),
            dirty: false,
            monitored: Vec::new(),
            has_up: false,
        }
    }

    #[test]
    fn released_handles_go_stale() {
        let mut set = QuerySet::new();
        let handle = set.insert(empty_state());
        assert!(set.get(handle).is_ok());
        set.remove(handle).unwrap();
        assert_eq!(set.get(handle).err(), Some(EcsError::StaleQuery));

        // The slot is reused under a new generation.
        let reused = set.insert(empty_state());
        assert_eq!(reused.index, handle.index);
        assert_ne!(reused.generation, handle.generation);
        assert!(set.get(reused).is_ok());
        assert_eq!(set.get(handle).err(), Some(EcsError::StaleQuery));
    }

    #[test]
    fn mark_dirty_targets_one_query() {
        let mut set = QuerySet::new();
        let a = set.insert(empty_state());
        let b = set.insert(empty_state());
        set.mark_dirty(a.index);
        assert!(set.get(a).unwrap().is_dirty());
        assert!(!set.get(b).unwrap().is_dirty());
    }
}
