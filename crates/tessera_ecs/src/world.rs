// world.rs - The world: entry point tying storage, queries, and staging together
//
// Every operation takes the world explicitly; there is no ambient or
// thread-local world. Structural mutations (add, remove, despawn, set) go
// through one funnel that consults the exclusive-access token and the
// deferred stage before touching storage, so the single-writer contract and
// the replay ordering are enforced in exactly one place.

use crate::column::Column;
use crate::component::{Component, ComponentRegistry, TypeInfo};
use crate::entity::{Entity, Id, WILDCARD_INDEX};
use crate::entity_index::{EntityIndex, Record};
use crate::error::{EcsError, EcsResult};
use crate::graph::TableGraph;
use crate::id_record::IdIndex;
use crate::query::{
    table_matches, QueryDesc, QueryHandle, QueryIter, QuerySet, QueryState, TermOper, TermSrc,
};
use crate::stage::{Command, CommandBuffer, StagedValue};
use crate::table::{Table, TableId, TableStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::{mem, ptr};
use tracing::{debug, trace, warn};

/// Tunables read once at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Entity slots reserved up front.
    pub initial_entity_capacity: usize,
    /// Separator used by `path_of` and `lookup`.
    pub path_separator: char,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            initial_entity_capacity: 1024,
            path_separator: '.',
        }
    }
}

/// Entities every world starts with.
#[derive(Copy, Clone, Debug)]
pub struct Builtins {
    /// Relationship placing an entity under a parent.
    pub child_of: Entity,
    /// Tag marking template entities that regular queries may filter out.
    pub prefab: Entity,
}

#[derive(Default)]
struct NameIndex {
    by_entity: HashMap<u32, String>,
    /// (parent index or 0 for root scope, name) -> entity index.
    by_scope: HashMap<(u32, String), u32>,
}

pub struct World {
    config: WorldConfig,
    index: EntityIndex,
    registry: ComponentRegistry,
    ids: IdIndex,
    tables: TableStore,
    graph: TableGraph,
    queries: QuerySet,
    stage: CommandBuffer,
    names: NameIndex,
    /// Thread holding exclusive access, when the host declared one.
    exclusive: Option<ThreadId>,
    builtins: Builtins,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let mut index = EntityIndex::with_capacity(config.initial_entity_capacity);
        let child_of = index.create();
        let prefab = index.create();
        let mut world = Self {
            config,
            index,
            registry: ComponentRegistry::new(),
            ids: IdIndex::new(),
            tables: TableStore::new(),
            graph: TableGraph::new(),
            queries: QuerySet::new(),
            stage: CommandBuffer::new(),
            names: NameIndex::default(),
            exclusive: None,
            builtins: Builtins { child_of, prefab },
        };
        // An empty world has no names to collide with.
        let _ = world.set_name(child_of, "ChildOf");
        let _ = world.set_name(prefab, "Prefab");
        debug!(?child_of, ?prefab, "world initialized");
        world
    }

    #[inline]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    #[inline]
    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    // ---- entity lifecycle ----------------------------------------------

    /// Allocate a live entity with no ids. Not a structural change: the
    /// entity occupies no table row until its first add, so this works the
    /// same inside and outside deferred regions.
    pub fn spawn(&mut self) -> Entity {
        self.index.create()
    }

    /// Allocate and name in one step; the allocation is rolled back if the
    /// name is taken.
    pub fn spawn_named(&mut self, name: &str) -> EcsResult<Entity> {
        let entity = self.index.create();
        if let Err(err) = self.set_name(entity, name) {
            let _ = self.index.delete(entity);
            return Err(err);
        }
        Ok(entity)
    }

    /// Revive a specific handle, e.g. one read back from persisted state.
    pub fn spawn_with_id(&mut self, entity: Entity) -> EcsResult<Entity> {
        self.guard_structural()?;
        self.index.create_with(entity)
    }

    pub fn despawn(&mut self, entity: Entity) -> EcsResult<()> {
        self.guard_structural()?;
        if self.stage.is_deferred() {
            return self.stage.push(Command::Despawn { entity });
        }
        self.apply_despawn(entity)
    }

    #[inline]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.index.is_alive(entity)
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.index.alive_count()
    }

    // ---- component registration ----------------------------------------

    /// Register a component from an explicit descriptor. The descriptor's
    /// name becomes the backing entity's name.
    pub fn register_component(&mut self, info: TypeInfo) -> EcsResult<Entity> {
        self.guard_structural()?;
        let entity = self.index.create();
        if let Err(err) = self.set_name(entity, &info.name) {
            let _ = self.index.delete(entity);
            return Err(err);
        }
        debug!(name = %info.name, ?entity, "registered component");
        self.registry.register(Id::of(entity), info);
        Ok(entity)
    }

    /// Register a Rust type under `name`. Idempotent per type; the
    /// descriptor is derived, nothing else is implicit.
    pub fn register<T: Component>(&mut self, name: &str) -> EcsResult<Entity> {
        if let Some(existing) = self.registry.entity_of::<T>() {
            return Ok(existing);
        }
        let entity = self.register_component(TypeInfo::of::<T>(name))?;
        self.registry.bind_type::<T>(entity);
        Ok(entity)
    }

    /// Entity backing the Rust type `T`, registering it under its type name
    /// on first use by the typed accessors.
    pub fn component<T: Component>(&mut self) -> EcsResult<Entity> {
        if let Some(existing) = self.registry.entity_of::<T>() {
            return Ok(existing);
        }
        let full = std::any::type_name::<T>();
        let short = full.rsplit("::").next().unwrap_or(full);
        match self.register::<T>(short) {
            Err(EcsError::NameTaken(_)) => self.register::<T>(full),
            other => other,
        }
    }

    pub fn type_info(&self, id: Id) -> Option<&TypeInfo> {
        self.registry.info(id)
    }

    pub fn is_component(&self, id: Id) -> bool {
        self.registry.is_component(id)
    }

    // ---- structural mutation -------------------------------------------

    /// Add `id` to `entity`. Adding an id the entity already has is a no-op.
    pub fn add(&mut self, entity: Entity, id: impl Into<Id>) -> EcsResult<()> {
        let id = id.into();
        self.guard_structural()?;
        if self.stage.is_deferred() {
            return self.stage.push(Command::Add { entity, id });
        }
        self.apply_add(entity, id)
    }

    /// Remove `id` from `entity`. Accepts wildcard patterns, which strip
    /// every matching id. Removing an absent id is a no-op.
    pub fn remove(&mut self, entity: Entity, id: impl Into<Id>) -> EcsResult<()> {
        let id = id.into();
        self.guard_structural()?;
        if self.stage.is_deferred() {
            return self.stage.push(Command::Remove { entity, id });
        }
        self.apply_remove(entity, id)
    }

    /// Wildcard-aware presence test. False for dead entities.
    pub fn has(&self, entity: Entity, id: impl Into<Id>) -> bool {
        let id = id.into();
        let Ok(record) = self.index.record(entity) else {
            return false;
        };
        let Some(table) = record.table else {
            return false;
        };
        self.tables.get(table).matches(id)
    }

    /// Replace `child`'s parent, establishing one if it had none.
    pub fn set_parent(&mut self, child: Entity, parent: Entity) -> EcsResult<()> {
        self.guard_structural()?;
        let strip = Id::pair_wildcard_target(self.builtins.child_of);
        let pair = Id::pair(self.builtins.child_of, parent);
        if self.stage.is_deferred() {
            self.stage.push(Command::Remove {
                entity: child,
                id: strip,
            })?;
            return self.stage.push(Command::Add {
                entity: child,
                id: pair,
            });
        }
        self.apply_remove(child, strip)?;
        self.apply_add(child, pair)
    }

    pub fn parent_of(&self, entity: Entity) -> Option<Entity> {
        let record = self.index.record(entity).ok()?;
        let table = self.tables.get(record.table?);
        let pair = table.first_matching(Id::pair_wildcard_target(self.builtins.child_of))?;
        self.index.entity_at(pair.target_index())
    }

    pub fn children(&self, parent: Entity) -> impl Iterator<Item = Entity> + '_ {
        let pair = Id::pair(self.builtins.child_of, parent);
        self.ids
            .tables_for(pair)
            .iter()
            .flat_map(move |&t| self.tables.get(t).entities().iter().copied())
    }

    pub fn child_count(&self, parent: Entity) -> usize {
        let pair = Id::pair(self.builtins.child_of, parent);
        self.ids
            .tables_for(pair)
            .iter()
            .map(|&t| self.tables.get(t).len())
            .sum()
    }

    /// Despawn every entity carrying `id` (or matching the pattern).
    /// Returns how many were despawned (or queued, inside a deferred
    /// region, where the affected set is captured at call time).
    pub fn delete_with(&mut self, id: impl Into<Id>) -> EcsResult<usize> {
        let id = id.into();
        self.guard_structural()?;
        if self.stage.is_deferred() {
            let targets: Vec<Entity> = self
                .ids
                .tables_for(id)
                .iter()
                .flat_map(|&t| self.tables.get(t).entities().iter().copied())
                .collect();
            let count = targets.len();
            for entity in targets {
                self.stage.push(Command::Despawn { entity })?;
            }
            return Ok(count);
        }
        let mut count = 0;
        // Despawning can move other entities between tables, so rescan the
        // id's table list until no populated table remains.
        loop {
            let next = self
                .ids
                .tables_for(id)
                .iter()
                .copied()
                .find(|&t| !self.tables.get(t).is_empty());
            let Some(table) = next else {
                break;
            };
            while let Some(&entity) = self.tables.get(table).entities().last() {
                self.apply_despawn(entity)?;
                count += 1;
            }
        }
        Ok(count)
    }

    // ---- typed and raw value access ------------------------------------

    /// Write a value, adding the component first if absent. The previous
    /// value, if any, is dropped.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> EcsResult<()> {
        self.guard_structural()?;
        let component = self.component::<T>()?;
        let id = Id::of(component);
        let size = mem::size_of::<T>();
        let mut bytes = vec![0u8; size].into_boxed_slice();
        // SAFETY: the buffer is exactly `size` bytes; after the copy the
        // buffer owns the value and `value` must not be dropped again.
        unsafe {
            ptr::copy_nonoverlapping((&value as *const T).cast::<u8>(), bytes.as_mut_ptr(), size);
        }
        mem::forget(value);
        if self.stage.is_deferred() {
            // The staged value carries its drop hook so the bytes are
            // disposed even if the command never replays.
            let drop_fn = self.registry.info(id).and_then(|info| info.drop_fn);
            let value = StagedValue::new(bytes, drop_fn);
            return self.stage.push(Command::Set { entity, id, value });
        }
        self.apply_set(entity, id, bytes)
    }

    /// Shared borrow of `entity`'s value of `T`, if present.
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let component = self.registry.entity_of::<T>()?;
        let id = Id::of(component);
        let record = self.index.record(entity).ok()?;
        let table = self.tables.get(record.table?);
        if mem::size_of::<T>() == 0 {
            return table.contains(id).then(|| {
                // SAFETY: zero-sized values need no backing storage.
                unsafe { &*ptr::NonNull::<T>::dangling().as_ptr() }
            });
        }
        let column = table.column(id)?;
        // SAFETY: the column was built from T's descriptor.
        Some(unsafe { &*(column.ptr(record.row as usize) as *const T) })
    }

    /// Mutable borrow of `entity`'s value of `T`, default-constructing it
    /// first if absent. The implicit add is a structural change and is
    /// rejected inside deferred regions.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> EcsResult<&mut T> {
        let component = self.component::<T>()?;
        let id = Id::of(component);
        if mem::size_of::<T>() == 0 {
            self.ensure_present(entity, id)?;
            // SAFETY: zero-sized values need no backing storage.
            return Ok(unsafe { &mut *ptr::NonNull::<T>::dangling().as_ptr() });
        }
        let value = self.ensure_value_ptr(entity, id)?;
        // SAFETY: the column was built from T's descriptor.
        Ok(unsafe { &mut *value.cast::<T>() })
    }

    /// Untyped read of a sized component's storage.
    pub fn value_ptr(&self, entity: Entity, id: Id) -> Option<*const u8> {
        let record = self.index.record(entity).ok()?;
        let column = self.tables.get(record.table?).column(id)?;
        Some(column.ptr(record.row as usize) as *const u8)
    }

    /// Untyped write access, adding the component first if absent.
    pub fn ensure_value_ptr(&mut self, entity: Entity, id: Id) -> EcsResult<*mut u8> {
        if !self.registry.is_sized_component(id) {
            return Err(EcsError::NotAComponent(id));
        }
        self.ensure_present(entity, id)?;
        let record = self.index.record(entity)?;
        let table = record.table.ok_or(EcsError::NotAComponent(id))?;
        let column = self
            .tables
            .get_mut(table)
            .column_mut(id)
            .ok_or(EcsError::NotAComponent(id))?;
        Ok(column.ptr(record.row as usize))
    }

    fn ensure_present(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        if self.has(entity, id) {
            return Ok(());
        }
        self.guard_structural()?;
        if self.stage.is_deferred() {
            return Err(EcsError::DeferredStructuralChange);
        }
        self.apply_add(entity, id)
    }

    // ---- queries --------------------------------------------------------

    /// Register a query. Terms are validated up front: unresolvable ids are
    /// creation-time errors, never silent empty matches.
    pub fn query(&mut self, desc: QueryDesc) -> EcsResult<QueryHandle> {
        let terms = desc.terms;
        if terms.is_empty() {
            return Err(EcsError::InvalidTerm {
                index: 0,
                reason: "a query needs at least one term",
            });
        }
        if !terms
            .iter()
            .any(|t| t.oper == TermOper::And && t.src == TermSrc::This)
        {
            return Err(EcsError::InvalidTerm {
                index: 0,
                reason: "a query needs a required term on the matched entity",
            });
        }
        for (position, term) in terms.iter().enumerate() {
            self.validate_term_id(position, term.id)?;
            if let TermSrc::Up(relationship) = term.src {
                if !self.index.is_alive(relationship) {
                    return Err(EcsError::InvalidTerm {
                        index: position,
                        reason: "traversal relationship is not alive",
                    });
                }
            }
        }

        let has_up = terms.iter().any(|t| matches!(t.src, TermSrc::Up(_)));
        let mut monitored: Vec<Id> = Vec::new();
        for term in &terms {
            if !monitored.contains(&term.id) {
                monitored.push(term.id);
            }
            if let TermSrc::Up(relationship) = term.src {
                let bucket = Id::pair_wildcard_target(relationship);
                if !monitored.contains(&bucket) {
                    monitored.push(bucket);
                }
            }
        }

        let handle = self.queries.insert(QueryState {
            terms,
            tables: Vec::new(),
            dirty: true,
            monitored: monitored.clone(),
            has_up,
        });
        for &id in &monitored {
            self.ids.add_monitor(id, handle.index);
        }
        self.rematch(handle)?;
        debug!(query = handle.index, "registered query");
        Ok(handle)
    }

    /// Iterate the query's matched tables. Rebuilds the match cache first
    /// when it is dirty; queries with upward terms always rebuild, because
    /// ancestor placement changes are invisible to id monitors.
    pub fn query_iter(&mut self, handle: QueryHandle) -> EcsResult<QueryIter<'_>> {
        let needs_rematch = {
            let state = self.queries.get(handle)?;
            state.is_dirty() || state.has_up()
        };
        if needs_rematch {
            self.rematch(handle)?;
        }
        let tables = self.queries.get(handle)?.matched_tables().to_vec();
        Ok(QueryIter::new(&self.tables, tables))
    }

    /// Matched entities, flattened. Convenience over `query_iter`.
    pub fn query_entities(&mut self, handle: QueryHandle) -> EcsResult<Vec<Entity>> {
        Ok(self.query_iter(handle)?.entities().collect())
    }

    /// Release a query, detaching its monitors. The handle goes stale.
    pub fn query_release(&mut self, handle: QueryHandle) -> EcsResult<()> {
        let state = self.queries.remove(handle)?;
        for id in state.monitored {
            self.ids.remove_monitor(id, handle.index);
        }
        Ok(())
    }

    pub fn query_state(&self, handle: QueryHandle) -> EcsResult<&QueryState> {
        self.queries.get(handle)
    }

    fn validate_term_id(&self, position: usize, id: Id) -> EcsResult<()> {
        if id == Id::WILDCARD {
            return Err(EcsError::InvalidTerm {
                index: position,
                reason: "a bare wildcard term matches everything",
            });
        }
        if id.is_pair() {
            let relationship = id.relationship_index();
            if relationship != WILDCARD_INDEX && self.index.entity_at(relationship).is_none() {
                return Err(EcsError::InvalidTerm {
                    index: position,
                    reason: "pair relationship is not alive",
                });
            }
            let target = id.target_index();
            if target != WILDCARD_INDEX && self.index.entity_at(target).is_none() {
                return Err(EcsError::InvalidTerm {
                    index: position,
                    reason: "pair target is not alive",
                });
            }
        } else if self.index.entity_at(id.entity_index()).is_none() {
            return Err(EcsError::InvalidTerm {
                index: position,
                reason: "term id is not alive",
            });
        }
        Ok(())
    }

    fn rematch(&mut self, handle: QueryHandle) -> EcsResult<()> {
        let state = self.queries.get(handle)?;
        // Seed from the required term with the fewest candidate tables.
        let seed = state
            .terms()
            .iter()
            .filter(|t| t.oper == TermOper::And && t.src == TermSrc::This)
            .min_by_key(|t| self.ids.tables_for(t.id).len())
            .map(|t| t.id)
            .ok_or(EcsError::InvalidTerm {
                index: 0,
                reason: "a query needs a required term on the matched entity",
            })?;
        let mut matched: Vec<TableId> = self
            .ids
            .tables_for(seed)
            .iter()
            .copied()
            .filter(|&t| table_matches(state.terms(), self.tables.get(t), &self.tables, &self.index))
            .collect();
        // Ascending table id is creation order.
        matched.sort_unstable();
        let count = matched.len();
        let state = self.queries.get_mut(handle)?;
        state.tables = matched;
        state.dirty = false;
        trace!(query = handle.index, tables = count, "rematched query");
        Ok(())
    }

    // ---- deferred regions ----------------------------------------------

    /// Open a deferred region. Nests; only the outermost close replays.
    pub fn defer_begin(&mut self) {
        self.stage.begin();
    }

    /// Close a deferred region. Closing the outermost region replays every
    /// recorded command in order. Replay keeps going past individual
    /// failures; the first error is returned after the queue drains.
    pub fn defer_end(&mut self) -> EcsResult<()> {
        if !self.stage.end() {
            return Ok(());
        }
        if !self.stage.is_empty() {
            debug!(queued = self.stage.len(), "replaying deferred commands");
        }
        let commands = self.stage.drain();
        let mut first_error = None;
        for command in commands {
            let result = match command {
                Command::Add { entity, id } => self.apply_add(entity, id),
                Command::Remove { entity, id } => self.apply_remove(entity, id),
                Command::Set { entity, id, value } => {
                    self.apply_set(entity, id, value.into_bytes())
                }
                Command::Despawn { entity } => self.apply_despawn(entity),
            };
            if let Err(err) = result {
                warn!(?err, "deferred command failed during replay");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.stage.is_deferred()
    }

    // ---- exclusive access ----------------------------------------------

    /// Declare that the calling thread owns all mutation until
    /// `end_exclusive`. Mutating calls from other threads then fail instead
    /// of corrupting state.
    pub fn begin_exclusive(&mut self) -> EcsResult<()> {
        match self.exclusive {
            Some(owner) if owner != thread::current().id() => Err(EcsError::ExclusiveAccess),
            _ => {
                self.exclusive = Some(thread::current().id());
                Ok(())
            }
        }
    }

    pub fn end_exclusive(&mut self) -> EcsResult<()> {
        match self.exclusive {
            Some(owner) if owner == thread::current().id() => {
                self.exclusive = None;
                Ok(())
            }
            _ => Err(EcsError::ExclusiveAccess),
        }
    }

    fn guard_structural(&self) -> EcsResult<()> {
        if let Some(owner) = self.exclusive {
            if owner != thread::current().id() {
                warn!("structural mutation from a thread that does not hold exclusive access");
                return Err(EcsError::ExclusiveAccess);
            }
        }
        Ok(())
    }

    // ---- names and paths -----------------------------------------------

    /// Name `entity` within its parent's scope (root scope when it has no
    /// parent). Names are unique per scope.
    pub fn set_name(&mut self, entity: Entity, name: &str) -> EcsResult<()> {
        self.index.record(entity)?;
        let scope = self.name_scope(entity);
        let key = (scope, name.to_string());
        if let Some(&occupant) = self.names.by_scope.get(&key) {
            if occupant != entity.index() {
                return Err(EcsError::NameTaken(name.to_string()));
            }
        }
        if let Some(previous) = self.names.by_entity.insert(entity.index(), name.to_string()) {
            self.names.by_scope.remove(&(scope, previous));
        }
        self.names.by_scope.insert(key, entity.index());
        Ok(())
    }

    pub fn name_of(&self, entity: Entity) -> Option<&str> {
        if !self.index.is_alive(entity) {
            return None;
        }
        self.names.by_entity.get(&entity.index()).map(String::as_str)
    }

    /// Full path from the root, segments joined by the configured
    /// separator. Unnamed entities contribute `#<index>` segments.
    pub fn path_of(&self, entity: Entity) -> Option<String> {
        if !self.index.is_alive(entity) {
            return None;
        }
        let mut segments = Vec::new();
        let mut current = entity;
        for _ in 0..=MAX_PATH_DEPTH {
            let segment = self
                .names
                .by_entity
                .get(&current.index())
                .cloned()
                .unwrap_or_else(|| format!("#{}", current.index()));
            segments.push(segment);
            match self.parent_of(current) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        segments.reverse();
        Some(segments.join(&self.config.path_separator.to_string()))
    }

    /// Resolve a path of names, scope by scope, from the root.
    pub fn lookup(&self, path: &str) -> Option<Entity> {
        let mut scope = 0u32;
        for segment in path.split(self.config.path_separator) {
            scope = *self.names.by_scope.get(&(scope, segment.to_string()))?;
        }
        if scope == 0 {
            return None;
        }
        self.index.entity_at(scope)
    }

    /// Scope key for `entity`'s name: its parent's index, 0 at the root.
    ///
    /// Reads the pair target index straight off the table, with no
    /// liveness check: during despawn cleanup the parent is already gone
    /// from the entity index, yet the old scope key must still resolve so
    /// the name can be moved out of it.
    fn name_scope(&self, entity: Entity) -> u32 {
        let Ok(record) = self.index.record(entity) else {
            return 0;
        };
        let Some(table) = record.table else {
            return 0;
        };
        self.tables
            .get(table)
            .first_matching(Id::pair_wildcard_target(self.builtins.child_of))
            .map(|pair| pair.target_index())
            .unwrap_or(0)
    }

    /// Captured before a parent change so the scoped name key can follow
    /// the entity to its new scope.
    fn scope_before_reparent(&self, entity: Entity, id: Id) -> Option<u32> {
        if !id.is_pair() || id.relationship_index() != self.builtins.child_of.index() {
            return None;
        }
        if !self.names.by_entity.contains_key(&entity.index()) {
            return None;
        }
        Some(self.name_scope(entity))
    }

    fn rescope_name(&mut self, entity: Entity, old_scope: u32) {
        let Some(name) = self.names.by_entity.get(&entity.index()).cloned() else {
            return;
        };
        let new_scope = self.name_scope(entity);
        if new_scope == old_scope {
            return;
        }
        self.names.by_scope.remove(&(old_scope, name.clone()));
        match self.names.by_scope.entry((new_scope, name)) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entity.index());
            }
            std::collections::hash_map::Entry::Occupied(_) => {
                warn!(?entity, "name collided after reparent; path lookup will not find it");
            }
        }
    }

    // ---- storage maintenance -------------------------------------------

    /// Retire empty tables and reclaim unused id records. Table reclamation
    /// is deliberately not done eagerly when the last row leaves; churny
    /// workloads would otherwise rebuild the same table every frame.
    pub fn compact(&mut self) -> EcsResult<()> {
        self.guard_structural()?;
        if self.stage.is_deferred() {
            return Err(EcsError::DeferredStructuralChange);
        }
        let empty: Vec<TableId> = self
            .tables
            .iter()
            .filter(|t| t.is_empty())
            .map(Table::id)
            .collect();
        let retired = empty.len();
        for table in empty {
            self.retire_table(table);
        }
        self.ids.compact();
        self.queries.mark_all_dirty();
        debug!(retired, "compacted storage");
        Ok(())
    }

    // ---- introspection --------------------------------------------------

    /// Current (table, row) of a live entity that occupies a row.
    pub fn location(&self, entity: Entity) -> Option<(TableId, u32)> {
        let record = self.index.record(entity).ok()?;
        Some((record.table?, record.row))
    }

    #[inline]
    pub fn table(&self, table: TableId) -> &Table {
        self.tables.get(table)
    }

    /// Live archetypes in creation order.
    pub fn archetypes(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter()
    }

    /// Tables currently containing `id` (or matching the pattern).
    pub fn tables_with(&self, id: impl Into<Id>) -> &[TableId] {
        self.ids.tables_for(id.into())
    }

    // ---- internals ------------------------------------------------------

    fn resolve_for_add(&self, id: Id) -> EcsResult<()> {
        if id.has_wildcard() {
            return Err(EcsError::UnresolvedId(id));
        }
        if id.is_pair() {
            if self.index.entity_at(id.relationship_index()).is_none()
                || self.index.entity_at(id.target_index()).is_none()
            {
                return Err(EcsError::UnresolvedId(id));
            }
        } else if self.index.entity_at(id.entity_index()).is_none() {
            return Err(EcsError::UnresolvedId(id));
        }
        Ok(())
    }

    fn apply_add(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        let record = self.index.record(entity)?;
        self.resolve_for_add(id)?;
        let from = record.table;
        let to = match self.graph.add_edge(from, id) {
            Some(to) => to,
            None => {
                let to = self.table_with_added(from, id)?;
                self.graph.cache_add_edge(from, id, to);
                to
            }
        };
        if Some(to) == from {
            return Ok(());
        }
        let old_scope = self.scope_before_reparent(entity, id);
        match from {
            Some(f) => {
                self.tables.move_entity(entity, f, record.row, to, &mut self.index)?;
            }
            None => {
                self.tables.append_entity(to, entity, &mut self.index)?;
            }
        }
        if let Some(old_scope) = old_scope {
            self.rescope_name(entity, old_scope);
        }
        Ok(())
    }

    fn apply_remove(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        if id.has_wildcard() {
            let record = self.index.record(entity)?;
            let Some(table) = record.table else {
                return Ok(());
            };
            let matching: Vec<Id> = self.tables.get(table).matching_ids(id).collect();
            for concrete in matching {
                self.apply_remove(entity, concrete)?;
            }
            return Ok(());
        }

        let record = self.index.record(entity)?;
        let Some(from) = record.table else {
            return Ok(());
        };
        if !self.tables.get(from).contains(id) {
            return Ok(());
        }
        let to = match self.graph.remove_edge(from, id) {
            Some(to) => to,
            None => {
                let to = self.table_with_removed(from, id);
                self.graph.cache_remove_edge(from, id, to);
                to
            }
        };
        let old_scope = self.scope_before_reparent(entity, id);
        match to {
            Some(t) => {
                self.tables.move_entity(entity, from, record.row, t, &mut self.index)?;
            }
            None => {
                self.tables.remove_row(from, record.row, &mut self.index);
                self.index.set_record(entity, Record::EMPTY)?;
            }
        }
        if let Some(old_scope) = old_scope {
            self.rescope_name(entity, old_scope);
        }
        Ok(())
    }

    fn table_with_added(&mut self, from: Option<TableId>, id: Id) -> EcsResult<TableId> {
        let mut ids: Vec<Id> = match from {
            Some(t) => self.tables.get(t).ids().to_vec(),
            None => Vec::new(),
        };
        match ids.binary_search(&id) {
            // Already present; the transition is the identity.
            Ok(_) => Ok(from.ok_or(EcsError::UnresolvedId(id))?),
            Err(position) => {
                ids.insert(position, id);
                let (to, created) = self.tables.find_or_create(
                    &ids,
                    &self.registry,
                    self.builtins.child_of,
                    self.builtins.prefab,
                );
                if created {
                    self.register_new_table(to);
                }
                Ok(to)
            }
        }
    }

    fn table_with_removed(&mut self, from: TableId, id: Id) -> Option<TableId> {
        let mut ids = self.tables.get(from).ids().to_vec();
        if let Ok(position) = ids.binary_search(&id) {
            ids.remove(position);
        }
        if ids.is_empty() {
            return None;
        }
        let (to, created) = self.tables.find_or_create(
            &ids,
            &self.registry,
            self.builtins.child_of,
            self.builtins.prefab,
        );
        if created {
            self.register_new_table(to);
        }
        Some(to)
    }

    fn register_new_table(&mut self, table: TableId) {
        let ids = self.tables.get(table).ids().to_vec();
        for id in ids {
            for query in self.ids.register_table(id, table) {
                self.queries.mark_dirty(query);
            }
        }
    }

    fn retire_table(&mut self, table: TableId) {
        let former = self.tables.retire(table);
        for id in former {
            for query in self.ids.unregister_table(id, table) {
                self.queries.mark_dirty(query);
            }
        }
        self.graph.purge_table(table);
    }

    fn apply_despawn(&mut self, entity: Entity) -> EcsResult<()> {
        // Liveness check up front; the name needs the parent scope, which
        // is only reachable while the record is intact.
        let record = self.index.record(entity)?;
        if let Some(name) = self.names.by_entity.remove(&entity.index()) {
            let scope = self.name_scope(entity);
            self.names.by_scope.remove(&(scope, name));
        }
        self.index.delete(entity)?;
        if let Some(table) = record.table {
            self.tables.remove_row(table, record.row, &mut self.index);
        }
        self.cleanup_pairs_referencing(entity)
    }

    /// Strip every pair naming `entity` as relationship or target from the
    /// surviving entities, then retire the emptied tables so the wildcard
    /// buckets shrink.
    fn cleanup_pairs_referencing(&mut self, entity: Entity) -> EcsResult<()> {
        let buckets = [
            Id::pair_wildcard_relationship(entity),
            Id::pair_wildcard_target(entity),
        ];
        for bucket in buckets {
            loop {
                let Some(&table) = self.ids.tables_for(bucket).first() else {
                    break;
                };
                let Some(pair) = self.tables.get(table).first_matching(bucket) else {
                    break;
                };
                while let Some(&occupant) = self.tables.get(table).entities().last() {
                    self.apply_remove(occupant, pair)?;
                }
                self.retire_table(table);
            }
        }
        Ok(())
    }

    fn apply_set(&mut self, entity: Entity, id: Id, bytes: Box<[u8]>) -> EcsResult<()> {
        let (size, drop_fn) = match self.registry.info(id) {
            Some(info) => (info.size, info.drop_fn),
            None => return Err(EcsError::NotAComponent(id)),
        };
        if size != bytes.len() {
            return Err(EcsError::SizeMismatch {
                expected: size,
                actual: bytes.len(),
            });
        }
        let result = self.write_value(entity, id, &bytes);
        if result.is_err() {
            if let Some(drop_fn) = drop_fn {
                // SAFETY: the value never left the buffer; drop it here so
                // a failed replay does not leak it.
                unsafe { drop_fn(bytes.as_ptr().cast_mut()) };
            }
        }
        result
    }

    fn write_value(&mut self, entity: Entity, id: Id, bytes: &[u8]) -> EcsResult<()> {
        self.apply_add(entity, id)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let record = self.index.record(entity)?;
        let table = record.table.ok_or(EcsError::NotAComponent(id))?;
        let column: &mut Column = self
            .tables
            .get_mut(table)
            .column_mut(id)
            .ok_or(EcsError::NotAComponent(id))?;
        column.replace_from(record.row as usize, bytes.as_ptr());
        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Parent chains longer than this are treated as cycles by `path_of`.
const MAX_PATH_DEPTH: usize = 64;
