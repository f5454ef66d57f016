//! The active-generation pointer.
//!
//! The only mutable retrieval state in the process. Readers clone the `Arc`
//! under a short read lock and then search without holding any lock, so a
//! search always runs against exactly one generation even if
//! [`ActiveIndex::activate`] swaps the pointer mid-query.

use parking_lot::RwLock;
use std::sync::Arc;

use super::Generation;

#[derive(Debug)]
pub struct ActiveIndex {
    current: RwLock<Arc<Generation>>,
}

impl ActiveIndex {
    pub fn new(generation: Generation) -> Self {
        Self {
            current: RwLock::new(Arc::new(generation)),
        }
    }

    /// The generation active right now.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.current.read().clone()
    }

    /// Make `generation` active and return the one it replaced.
    ///
    /// Any `snapshot` taken after this returns sees `generation`.
    pub fn activate(&self, generation: Arc<Generation>) -> Arc<Generation> {
        let mut current = self.current.write();
        std::mem::replace(&mut *current, generation)
    }
}
