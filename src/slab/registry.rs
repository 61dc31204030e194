//! The global cache registry: every live cache, size-sorted, under its own
//! leaf lock so diagnostics never reenter a cache's lock.

use std::sync::Mutex;

use super::KmemCache;

static REGISTRY: Mutex<Vec<&'static KmemCache>> = Mutex::new(Vec::new());

pub(crate) fn insert(cache: &'static KmemCache) {
    let mut list = REGISTRY.lock().unwrap();
    let pos = list.partition_point(|c| {
        (c.obj_size(), c.name()) <= (cache.obj_size(), cache.name())
    });
    list.insert(pos, cache);
}

pub(crate) fn remove(cache: &'static KmemCache) {
    let mut list = REGISTRY.lock().unwrap();
    if let Some(i) = list.iter().position(|c| core::ptr::eq(*c, cache)) {
        list.remove(i);
    }
}

/// All registered caches in size order.
pub(crate) fn snapshot() -> Vec<&'static KmemCache> {
    REGISTRY.lock().unwrap().clone()
}
