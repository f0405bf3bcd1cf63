//! Entity and index caches, and the layer that fills them.
//!
//! Every entity lives exactly once in an [`EntityCache`], keyed by the string
//! form of its id. An [`Index`] holds references to those same entities, so
//! a merge through any path is visible through every index that lists it.
//! [`CacheLayer`] decides when a slot needs fetching and applies results.

mod entities;
mod indexes;
mod layer;
mod state;

pub use entities::{entity_key, Entity, EntityCache, EntityRef, IntoKey};
pub use indexes::{Index, IndexCache};
pub use layer::{CacheLayer, CacheState};
pub use state::{FetchState, SlotStatus};
