//! Steve resource store: per-type caches kept live over the subscribe socket.
//!
//! A [`ResourceStore`] owns one [`TypeCache`] per canonical type, the watch
//! bookkeeping and the change queue. Socket events are handled by a single
//! pump task which also drives the periodic flush while the socket is up.

#![forbid(unsafe_code)]

mod queue;
mod resource;
mod store;
mod type_cache;
mod watch;

pub use queue::ChangeQueue;
pub use resource::{Resource, ResourceState};
pub use store::{ResourceStore, StoreEvent};
pub use type_cache::TypeCache;
pub use watch::WatchBook;

pub(crate) use steve_core::lock;
