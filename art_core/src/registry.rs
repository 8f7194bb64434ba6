//! Registry of routing-table roots, keyed by rtableid.
//!
//! An explicit object rather than a process-wide global: whatever context
//! embeds the engine owns the registry and its teardown.

use crate::errors::Error;
use crate::types::ArtRoot;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

pub struct RootRegistry<R> {
    roots: DashMap<u32, Arc<ArtRoot<R>>>,
}

impl<R> RootRegistry<R> {
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
        }
    }

    /// Register a freshly created root under its rtableid.
    pub fn register(&self, root: ArtRoot<R>) -> Result<Arc<ArtRoot<R>>, Error> {
        match self.roots.entry(root.rtableid()) {
            Entry::Occupied(_) => Err(Error::TableExists),
            Entry::Vacant(slot) => {
                debug!("registry: rtableid={} registered", root.rtableid());
                let root = Arc::new(root);
                slot.insert(Arc::clone(&root));
                Ok(root)
            }
        }
    }

    pub fn get(&self, rtableid: u32) -> Option<Arc<ArtRoot<R>>> {
        self.roots.get(&rtableid).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the registry's reference; the root is freed once the last
    /// outstanding handle goes away.
    pub fn unregister(&self, rtableid: u32) -> Result<Arc<ArtRoot<R>>, Error> {
        let (_, root) = self.roots.remove(&rtableid).ok_or(Error::NoSuchTable)?;
        debug!("registry: rtableid={rtableid} unregistered");
        Ok(root)
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Registered rtableids, for dump tooling.
    pub fn rtableids(&self) -> Vec<u32> {
        self.roots.iter().map(|entry| *entry.key()).collect()
    }
}

impl<R> Default for RootRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}
