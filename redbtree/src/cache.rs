use std::{fmt::Debug, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;

use crate::node::Node;

/// A configurable cache of decoded nodes, keyed by file offset.
///
/// Nodes are written once and never mutated on disk, which makes them safe
/// to cache; the engine evicts an offset whenever the extent holding it is
/// freed or one of its pointer slots is overwritten in place. The cache is
/// purely an optimization: every operation behaves identically without it.
#[derive(Clone)]
#[must_use]
pub struct NodeCache {
    cache: Arc<Mutex<LruCache<u64, Arc<Node>>>>,
    capacity: usize,
}

impl NodeCache {
    /// Creates a cache holding up to `capacity` decoded nodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            capacity,
        }
    }

    /// Remembers the decoded node stored at `offset`.
    pub(crate) fn insert(&self, offset: u64, node: Arc<Node>) {
        let mut cache = self.cache.lock();
        cache.put(offset, node);
    }

    /// Looks up a previously decoded node at `offset`.
    pub(crate) fn get(&self, offset: u64) -> Option<Arc<Node>> {
        let mut cache = self.cache.lock();
        cache.get(&offset).cloned()
    }

    /// Forgets the node at `offset`. Called when the offset is freed or its
    /// on-disk image changes.
    pub(crate) fn evict(&self, offset: u64) {
        let mut cache = self.cache.lock();
        cache.pop(&offset);
    }
}

impl Debug for NodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
