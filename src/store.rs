use super::resource::Resource;

/// The destination a reflector syncs into.
///
/// Implementations must be internally thread safe: the orchestrator applies
/// watch events while the resync worker may call [`Store::resync`]
/// concurrently.
pub trait Store<R: Resource>: Send + Sync {
    fn add(&self, object: R) -> crate::Result<()>;

    fn update(&self, object: R) -> crate::Result<()>;

    fn delete(&self, object: R) -> crate::Result<()>;

    /// Replaces the store's content wholesale with `items` as of `version`.
    fn replace(&self, items: Vec<R>, version: &str) -> crate::Result<()>;

    /// Re-emits every cached item to downstream consumers without consulting
    /// the server.
    fn resync(&self) -> crate::Result<()>;
}
