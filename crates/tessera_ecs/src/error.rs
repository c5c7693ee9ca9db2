// error.rs - Error taxonomy for the storage and matching core
//
// Invalid handles and unregistered ids are contract violations reported to
// the caller; allocation failures leave the store in its pre-operation
// state; zero matching archetypes is a normal query outcome, not an error.

use crate::entity::{Entity, Id};
use thiserror::Error;

/// Result alias used across the crate.
pub type EcsResult<T> = Result<T, EcsError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EcsError {
    #[error("entity {0:?} is not alive")]
    NotAlive(Entity),

    #[error("id {0:?} does not name a registered component")]
    NotAComponent(Id),

    #[error("id {0:?} is not resolvable in this world")]
    UnresolvedId(Id),

    #[error("allocation of {bytes} bytes failed")]
    AllocFailed { bytes: usize },

    #[error("structural mutation attempted without holding exclusive access")]
    ExclusiveAccess,

    #[error("query term {index} is invalid: {reason}")]
    InvalidTerm { index: usize, reason: &'static str },

    #[error("query handle is stale or released")]
    StaleQuery,

    #[error("name '{0}' is already taken in its scope")]
    NameTaken(String),

    #[error("entity index {0} is occupied by a live entity")]
    IndexOccupied(u32),

    #[error("component value has {actual} bytes, layout expects {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("operation needs an immediate structural change, but a deferred region is active")]
    DeferredStructuralChange,
}
