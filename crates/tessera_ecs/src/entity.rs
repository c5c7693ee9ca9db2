// entity.rs - Entity handles and id encoding
//
// Entities are lightweight 64-bit handles. The low 32 bits are a recyclable
// index, bits 32..48 a generation counter, and the top bit flags a pair
// encoding (relationship, target) instead of a plain id.

use std::fmt;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const GENERATION_SHIFT: u32 = 32;
const GENERATION_MASK: u64 = 0xFFFF << GENERATION_SHIFT;
const PAIR_FLAG: u64 = 1 << 63;

/// Index reserved for the `*` wildcard in pair patterns.
///
/// Kept to 31 bits so it fits the relationship field of a pair encoding,
/// whose top bit is the pair flag. The sequential index allocator never
/// reaches this value.
pub const WILDCARD_INDEX: u32 = 0x7FFF_FFFF;

/// Entity handle (generation-indexed for safety).
///
/// Two handles name the same logical entity iff both index and generation
/// match. A stale handle (generation mismatch after recycling) is detected
/// by the entity index, never silently treated as valid.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(u64);

impl Entity {
    /// The null handle. Never alive in any world.
    pub const NULL: Entity = Entity(0);

    pub(crate) const fn from_parts(index: u32, generation: u16) -> Self {
        Entity((index as u64) | ((generation as u64) << GENERATION_SHIFT))
    }

    #[inline]
    pub fn index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    #[inline]
    pub fn generation(self) -> u16 {
        ((self.0 & GENERATION_MASK) >> GENERATION_SHIFT) as u16
    }

    /// Serialize to the raw 64-bit representation.
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Deserialize from the raw 64-bit representation.
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Entity(bits)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

/// Identifier that can appear in an archetype: a plain entity-backed id
/// (component or tag) or a pair encoding `(relationship, target)`.
///
/// Plain ids carry only the entity index; generations are stripped so that
/// an id compares equal regardless of which handle produced it. Pair ids set
/// the top bit and pack the relationship index in bits 32..64 and the target
/// index in the low 32 bits, mirroring the handle layout.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    /// Id naming any plain id or pair (used only as a pattern).
    pub const WILDCARD: Id = Id(WILDCARD_INDEX as u64);

    /// Plain id for an entity-backed component or tag.
    #[inline]
    pub fn of(entity: Entity) -> Self {
        Id(entity.index() as u64)
    }

    /// Pair id `(relationship, target)`.
    #[inline]
    pub fn pair(relationship: Entity, target: Entity) -> Self {
        Id(PAIR_FLAG | ((relationship.index() as u64) << 32) | target.index() as u64)
    }

    /// Pattern matching every pair with the given relationship.
    #[inline]
    pub fn pair_wildcard_target(relationship: Entity) -> Self {
        Id(PAIR_FLAG | ((relationship.index() as u64) << 32) | WILDCARD_INDEX as u64)
    }

    /// Pattern matching every pair naming `target` as the target.
    #[inline]
    pub fn pair_wildcard_relationship(target: Entity) -> Self {
        Id(PAIR_FLAG | ((WILDCARD_INDEX as u64) << 32) | target.index() as u64)
    }

    #[inline]
    pub fn is_pair(self) -> bool {
        self.0 & PAIR_FLAG != 0
    }

    /// Index of the plain id's backing entity. Meaningless for pairs.
    #[inline]
    pub fn entity_index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// Relationship index of a pair id. Meaningless for plain ids.
    #[inline]
    pub fn relationship_index(self) -> u32 {
        ((self.0 >> 32) & 0x7FFF_FFFF) as u32
    }

    /// Target index of a pair id. Meaningless for plain ids.
    #[inline]
    pub fn target_index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    /// True if any side of the id is the wildcard index.
    pub fn has_wildcard(self) -> bool {
        if self.is_pair() {
            self.relationship_index() == WILDCARD_INDEX || self.target_index() == WILDCARD_INDEX
        } else {
            self.entity_index() == WILDCARD_INDEX
        }
    }

    /// Test a concrete id against a pattern that may contain wildcards.
    ///
    /// Exact ids match themselves; `(R, *)` matches every pair with
    /// relationship `R`; `(*, T)` every pair targeting `T`; the bare
    /// wildcard matches everything.
    pub fn matches(self, pattern: Id) -> bool {
        if self == pattern || pattern == Id::WILDCARD {
            return true;
        }
        if !pattern.has_wildcard() || self.is_pair() != pattern.is_pair() {
            return false;
        }
        if !self.is_pair() {
            return pattern.entity_index() == WILDCARD_INDEX;
        }
        let rel_ok = pattern.relationship_index() == WILDCARD_INDEX
            || pattern.relationship_index() == self.relationship_index();
        let tgt_ok = pattern.target_index() == WILDCARD_INDEX
            || pattern.target_index() == self.target_index();
        rel_ok && tgt_ok
    }

    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Id(bits)
    }
}

impl From<Entity> for Id {
    fn from(entity: Entity) -> Self {
        Id::of(entity)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pair() {
            let rel = self.relationship_index();
            let tgt = self.target_index();
            match (rel == WILDCARD_INDEX, tgt == WILDCARD_INDEX) {
                (true, true) => write!(f, "Id(*, *)"),
                (true, false) => write!(f, "Id(*, {tgt})"),
                (false, true) => write!(f, "Id({rel}, *)"),
                (false, false) => write!(f, "Id({rel}, {tgt})"),
            }
        } else if self.entity_index() == WILDCARD_INDEX {
            write!(f, "Id(*)")
        } else {
            write!(f, "Id({})", self.entity_index())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_round_trips_through_bits() {
        let e = Entity::from_parts(42, 7);
        assert_eq!(e.index(), 42);
        assert_eq!(e.generation(), 7);
        assert_eq!(Entity::from_bits(e.to_bits()), e);
    }

    #[test]
    fn plain_ids_strip_generation() {
        let a = Entity::from_parts(9, 0);
        let b = Entity::from_parts(9, 3);
        assert_eq!(Id::of(a), Id::of(b));
        assert!(!Id::of(a).is_pair());
    }

    #[test]
    fn pair_encoding_keeps_both_sides() {
        let rel = Entity::from_parts(5, 1);
        let tgt = Entity::from_parts(11, 2);
        let id = Id::pair(rel, tgt);
        assert!(id.is_pair());
        assert_eq!(id.relationship_index(), 5);
        assert_eq!(id.target_index(), 11);
    }

    #[test]
    fn wildcard_patterns_match() {
        let rel = Entity::from_parts(5, 0);
        let other_rel = Entity::from_parts(6, 0);
        let tgt = Entity::from_parts(11, 0);
        let id = Id::pair(rel, tgt);

        assert!(id.matches(Id::pair_wildcard_target(rel)));
        assert!(id.matches(Id::pair_wildcard_relationship(tgt)));
        assert!(id.matches(Id::WILDCARD));
        assert!(!id.matches(Id::pair_wildcard_target(other_rel)));
        // A pair pattern never matches a plain id.
        assert!(!Id::of(tgt).matches(Id::pair_wildcard_target(rel)));
    }
}
