//! Ordered host set: insertion order preserved, newest at the head,
//! O(1) membership and removal.

use lru::LruCache;

use crate::host::Host;

/// The ordered list backing each host cache.
///
/// Backed by an unbounded LRU map where "most recently inserted" is the
/// head. Capacity enforcement is a policy decision of the owning cache, so
/// the list itself never evicts.
pub struct HostList {
    inner: LruCache<Host, ()>,
}

impl HostList {
    pub fn new() -> Self {
        Self {
            inner: LruCache::unbounded(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, host: &Host) -> bool {
        self.inner.contains(host)
    }

    /// Insert at the head. The host must not already be present.
    pub fn prepend(&mut self, host: Host) {
        debug_assert!(!self.contains(&host), "duplicate insert of {host}");
        self.inner.put(host, ());
    }

    /// Remove a host wherever it sits. Returns whether it was present.
    pub fn remove(&mut self, host: &Host) -> bool {
        self.inner.pop(host).is_some()
    }

    /// Newest entry.
    pub fn head(&self) -> Option<Host> {
        self.inner.iter().next().map(|(h, _)| *h)
    }

    /// Entry right after the newest one.
    pub fn after_head(&self) -> Option<Host> {
        self.inner.iter().nth(1).map(|(h, _)| *h)
    }

    /// Oldest entry.
    pub fn tail(&self) -> Option<Host> {
        self.inner.peek_lru().map(|(h, _)| *h)
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.inner.iter().map(|(h, _)| h)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Drain into a vector, newest first.
    pub fn take_all(&mut self) -> Vec<Host> {
        let hosts: Vec<Host> = self.iter().copied().collect();
        self.inner.clear();
        hosts
    }

    /// Refill from a newest-first vector. The list must be empty.
    pub fn refill(&mut self, newest_first: Vec<Host>) {
        debug_assert!(self.is_empty());
        for host in newest_first.into_iter().rev() {
            self.inner.put(host, ());
        }
    }

    /// Exchange the contents of two lists in O(1).
    pub fn swap(a: &mut HostList, b: &mut HostList) {
        std::mem::swap(&mut a.inner, &mut b.inner);
    }
}

impl Default for HostList {
    fn default() -> Self {
        Self::new()
    }
}
