// component.rs - Runtime component registration
//
// Components are registered explicitly against a world-owned registry, keyed
// by the id of their backing entity. The descriptor carries the memory layout
// plus construct/drop function pointers so columns can manage values of types
// the compiler never sees. A typed convenience wrapper derives the descriptor
// from a Rust type; it is a thin layer, not a hidden side effect of first use.

use crate::entity::{Entity, Id};
use std::any::TypeId;
use std::collections::HashMap;
use std::{mem, ptr};

/// Marker for Rust types usable as typed components.
///
/// `Default` supplies the default-construct hook used when an entity enters
/// a column without an explicit value.
pub trait Component: Default + Send + Sync + 'static {}

impl<T: Default + Send + Sync + 'static> Component for T {}

/// Layout and lifecycle hooks for one registered component.
///
/// `size == 0` is legal and describes a dataless component (equivalent to a
/// tag, but still enumerable through the registry). Hooks are optional: a
/// missing `default_fn` zero-initializes, a missing `drop_fn` means the
/// payload is plain data. Moves between columns are always bitwise, matching
/// Rust move semantics, so no move hook exists.
#[derive(Clone)]
pub struct TypeInfo {
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub default_fn: Option<unsafe fn(*mut u8)>,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
}

impl TypeInfo {
    /// Descriptor for a raw (host-defined) component layout.
    pub fn from_layout(name: impl Into<String>, size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        assert!(size % align == 0, "size must be a multiple of alignment");
        Self {
            name: name.into(),
            size,
            align,
            default_fn: None,
            drop_fn: None,
        }
    }

    /// Descriptor derived from a Rust type.
    pub fn of<T: Component>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>().max(1),
            default_fn: Some(default_in_place::<T>),
            drop_fn: if mem::needs_drop::<T>() {
                Some(drop_in_place_erased::<T>)
            } else {
                None
            },
        }
    }

    #[inline]
    pub fn is_zero_sized(&self) -> bool {
        self.size == 0
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

unsafe fn default_in_place<T: Default>(dst: *mut u8) {
    // SAFETY: caller guarantees `dst` is valid, aligned, uninitialized
    // storage for one `T`.
    unsafe { ptr::write(dst.cast::<T>(), T::default()) }
}

unsafe fn drop_in_place_erased<T>(slot: *mut u8) {
    // SAFETY: caller guarantees `slot` holds an initialized `T` that is not
    // referenced elsewhere.
    unsafe { ptr::drop_in_place(slot.cast::<T>()) }
}

/// World-owned registry of component descriptors.
///
/// An id with no entry here is a pure tag: legal in archetypes, but it
/// carries no column. Entries are never removed while the world lives;
/// component entities are pinned against deletion by the world layer.
#[derive(Default)]
pub struct ComponentRegistry {
    infos: HashMap<Id, TypeInfo>,
    by_type: HashMap<TypeId, Entity>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a descriptor to `id`. Re-registration must agree on layout.
    pub fn register(&mut self, id: Id, info: TypeInfo) {
        if let Some(prev) = self.infos.get(&id) {
            assert_eq!(
                (prev.size, prev.align),
                (info.size, info.align),
                "component {:?} re-registered with a different layout",
                id
            );
            return;
        }
        self.infos.insert(id, info);
    }

    /// Remember which entity backs the Rust type `T`.
    pub fn bind_type<T: 'static>(&mut self, entity: Entity) {
        self.by_type.insert(TypeId::of::<T>(), entity);
    }

    /// Entity backing the Rust type `T`, if registered.
    pub fn entity_of<T: 'static>(&self) -> Option<Entity> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    #[inline]
    pub fn info(&self, id: Id) -> Option<&TypeInfo> {
        self.infos.get(&id)
    }

    /// True if `id` carries data (registered with non-zero size).
    #[inline]
    pub fn is_sized_component(&self, id: Id) -> bool {
        self.infos.get(&id).is_some_and(|i| i.size > 0)
    }

    #[inline]
    pub fn is_component(&self, id: Id) -> bool {
        self.infos.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    #[derive(Default)]
    struct Position {
        _x: f32,
        _y: f32,
    }

    #[test]
    fn typed_descriptor_matches_layout() {
        let info = TypeInfo::of::<Position>("Position");
        assert_eq!(info.size, mem::size_of::<Position>());
        assert_eq!(info.align, mem::align_of::<Position>());
        assert!(info.default_fn.is_some());
        assert!(info.drop_fn.is_none());
    }

    #[test]
    fn drop_hook_present_only_when_needed() {
        let with_drop = TypeInfo::of::<Vec<u8>>("Buffer");
        assert!(with_drop.drop_fn.is_some());
        let plain = TypeInfo::of::<u64>("Counter");
        assert!(plain.drop_fn.is_none());
    }

    #[test]
    fn registry_distinguishes_tags_from_components() {
        let mut registry = ComponentRegistry::new();
        let comp = Entity::from_bits(1);
        let tag = Entity::from_bits(2);
        registry.register(Id::of(comp), TypeInfo::of::<Position>("Position"));

        assert!(registry.is_sized_component(Id::of(comp)));
        assert!(!registry.is_component(Id::of(tag)));
    }

    #[test]
    fn type_binding_round_trips() {
        let mut registry = ComponentRegistry::new();
        let entity = Entity::from_bits(7);
        registry.register(Id::of(entity), TypeInfo::of::<Position>("Position"));
        registry.bind_type::<Position>(entity);
        assert_eq!(registry.entity_of::<Position>(), Some(entity));
        assert_eq!(registry.entity_of::<u32>(), None);
    }
}
