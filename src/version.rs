use std::sync::{Arc, RwLock};

/// Shared holder of the last resource version observed while syncing.
///
/// Thread safe, but not synchronized with the store: a reader may observe a
/// version the store has already moved past.
#[derive(Clone, Debug, Default)]
pub struct VersionTracker(Arc<RwLock<String>>);

impl VersionTracker {
    pub fn get(&self) -> String {
        self.0.read().expect("version lock poisoned").clone()
    }

    pub(crate) fn set(&self, version: &str) {
        let mut guard = self.0.write().expect("version lock poisoned");
        version.clone_into(&mut guard);
    }
}
