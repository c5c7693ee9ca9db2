// lib.rs - tessera_ecs crate root
//
//! Archetype-based entity storage and query matching.
//!
//! Entities are generation-checked 64-bit handles; components and
//! relationship pairs are plain ids backed by entities. Entities with the
//! same id-set share a column-oriented table, queries cache their matching
//! tables and rebuild lazily through id monitors, and structural mutation
//! can be staged in deferred regions and replayed in order.
//!
//! Everything hangs off [`World`]; there is no global or thread-local
//! state.
//!
//! ```
//! use tessera_ecs::{QueryDesc, World};
//!
//! #[derive(Default, Debug, PartialEq)]
//! struct Health(u32);
//!
//! let mut world = World::new();
//! let hero = world.spawn_named("hero").unwrap();
//! world.set(hero, Health(100)).unwrap();
//!
//! let health = world.register::<Health>("Health").unwrap();
//! let wounded = world.query(QueryDesc::new().with(health)).unwrap();
//! assert_eq!(world.query_entities(wounded).unwrap(), vec![hero]);
//! ```

mod column;
mod component;
mod entity;
mod entity_index;
mod error;
mod graph;
mod id_record;
mod query;
mod stage;
mod table;
mod world;

pub use component::{Component, TypeInfo};
pub use entity::{Entity, Id, WILDCARD_INDEX};
pub use error::{EcsError, EcsResult};
pub use query::{QueryDesc, QueryHandle, QueryIter, QueryState, Term, TermOper, TermSrc};
pub use table::{Table, TableFlags, TableId};
pub use world::{Builtins, World, WorldConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
