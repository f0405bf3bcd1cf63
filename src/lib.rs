//! Reactive entity and index cache for REST-style JSON APIs.
//!
//! A store is defined once per resource with [`define_api_store`] and read
//! through handles:
//!
//! - [`ApiStore::show`] returns a [`ShowHandle`] for one entity by id.
//! - [`ApiStore::index`] returns an [`IndexHandle`] for one parameter set.
//! - [`ApiStore::store`], [`ApiStore::update`] and [`ApiStore::destroy`]
//!   write through the API and then update the caches.
//!
//! Reading a handle never blocks. A missing or invalidated slot is fetched
//! in the background and the handle reads `None` until the result lands.
//! Every entity is cached exactly once, so the same id read through a show
//! handle or any index is the same [`EntityRef`].

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod params;
pub mod reactive;
pub mod store;

pub use api::{ApiAction, CustomAction, HttpQueue, JsonApi, MemoryApi, ResourceApi, UrlFormatter};
pub use cache::{Entity, EntityRef, FetchState, Index, SlotStatus};
pub use error::StoreError;
pub use params::{Param, Params};
pub use reactive::{Computed, Scope, Signal, Source};
pub use store::{
  define_api_store, define_single_api_store, ActionOutcome, ApiSource, ApiStore, IndexHandle,
  ShowHandle, StoreDefinition, StoreOptions,
};
