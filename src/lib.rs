//! Client-side resource mirror.
//!
//! A [`Reflector`] keeps a local [`Store`] synchronized with the authoritative
//! state of a remote resource collection. One bulk list seeds the store at a
//! known version, then a continuous watch stream keeps it current, with
//! periodic forced resyncs and an optional reset protocol that forces a
//! re-list under a new hashkey range.

pub mod bounds;
pub mod client;
pub mod pager;
pub mod reflector;
pub mod resource;
pub mod store;
pub mod version;

pub use bounds::Bounds;
pub use client::{ListOptions, ListerWatcher, WatchEvent, WatchStream};
pub use reflector::{Config, Reflector};
pub use resource::{ObjectList, ObjectMeta, Resource};
pub use store::Store;
pub use version::VersionTracker;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;
