//! External-memory cache (C8): maps client-provided allocations on demand,
//! bounded to a fixed number of slots, evicting idle entries LRU-first.

use std::collections::HashMap;
use std::sync::Mutex;

use acdb_core::{AcdbError, Result};

use crate::shmem::ShmemHandle;

/// Fixed number of cacheable external-memory slots.
pub const CACHE_CAPACITY: usize = 32;

/// Client-supplied identity for an external allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternAlloc {
    pub alloc_handle: u64,
    pub alloc_size: usize,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    alloc: ExternAlloc,
    shmem: ShmemHandle,
    num_in_flight: u32,
    last_used: u64,
}

struct State {
    slots: Vec<Option<Entry>>,
    by_alloc: HashMap<ExternAlloc, usize>,
    age: u64,
}

/// LRU cache over a fixed number of external-memory mappings.
pub struct ExternMemCache {
    state: Mutex<State>,
}

impl Default for ExternMemCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternMemCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slots: vec![None; CACHE_CAPACITY],
                by_alloc: HashMap::new(),
                age: 0,
            }),
        }
    }

    /// Returns `(shmem handle, slot index)` for `alloc`, mapping it if
    /// this is the first request. Concurrent callers for the same
    /// allocation observe a single mapping: the first caller maps and
    /// inserts, later callers just bump the refcount.
    pub fn get_entry(
        &self,
        alloc: ExternAlloc,
        map_fn: impl FnOnce() -> Result<ShmemHandle>,
    ) -> Result<(ShmemHandle, usize)> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.age += 1;
        let age = state.age;

        if let Some(&index) = state.by_alloc.get(&alloc) {
            let entry = state.slots[index].as_mut().expect("indexed slot is occupied");
            entry.num_in_flight += 1;
            entry.last_used = age;
            return Ok((entry.shmem, index));
        }

        let index = match state.slots.iter().position(|s| s.is_none()) {
            Some(i) => i,
            None => self.evict_lru(&mut state).ok_or(AcdbError::NoResource)?,
        };

        let shmem = map_fn()?;
        state.slots[index] = Some(Entry {
            alloc,
            shmem,
            num_in_flight: 1,
            last_used: age,
        });
        state.by_alloc.insert(alloc, index);
        Ok((shmem, index))
    }

    /// Finds an idle (`num_in_flight == 0`) slot with the oldest
    /// `last_used` and frees it for reuse.
    fn evict_lru(&self, state: &mut State) -> Option<usize> {
        let candidate = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i, e)))
            .filter(|(_, e)| e.num_in_flight == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i)?;
        let evicted = state.slots[candidate].take().expect("candidate slot occupied");
        state.by_alloc.remove(&evicted.alloc);
        tracing::debug!(
            alloc_handle = evicted.alloc.alloc_handle,
            slot = candidate,
            "evicting idle external-mem cache entry"
        );
        Some(candidate)
    }

    /// Marks one outstanding send against `index` as complete, returning a
    /// copy of the entry. The caller is expected to have already matched
    /// the completion to this index via its own token bookkeeping.
    pub fn buf_done(&self, index: usize) -> Result<ExternAlloc> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        let entry = state
            .slots
            .get_mut(index)
            .and_then(|s| s.as_mut())
            .ok_or(AcdbError::Handle)?;
        entry.num_in_flight = entry.num_in_flight.saturating_sub(1);
        Ok(entry.alloc)
    }

    /// Number of occupied slots, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("cache lock poisoned")
            .slots
            .iter()
            .filter(|s| s.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u64) -> ShmemHandle {
        // ShmemHandle's field is private to this crate; route through a
        // real allocation instead of constructing one directly.
        let mgr = crate::shmem::ShmemManager::new();
        let (h, _) = mgr
            .alloc(16, crate::shmem::AllocFlags::default(), &[acdb_core::ProcDomain(n as u8)])
            .unwrap();
        h
    }

    #[test]
    fn first_get_entry_maps_later_ones_share() {
        let cache = ExternMemCache::new();
        let alloc = ExternAlloc {
            alloc_handle: 1,
            alloc_size: 64,
        };
        let mut calls = 0;
        let (h1, i1) = cache.get_entry(alloc, || {
            calls += 1;
            Ok(handle(1))
        }).unwrap();
        let (h2, i2) = cache.get_entry(alloc, || {
            calls += 1;
            Ok(handle(2))
        }).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(i1, i2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn eviction_only_targets_idle_entries() {
        let cache = ExternMemCache::new();
        for i in 0..CACHE_CAPACITY {
            let alloc = ExternAlloc {
                alloc_handle: i as u64,
                alloc_size: 8,
            };
            cache.get_entry(alloc, || Ok(handle(1))).unwrap();
        }
        // every slot has num_in_flight == 1; nothing is idle.
        let overflow = ExternAlloc {
            alloc_handle: 9999,
            alloc_size: 8,
        };
        let err = cache.get_entry(overflow, || Ok(handle(1))).unwrap_err();
        assert!(matches!(err, AcdbError::NoResource));
    }

    #[test]
    fn eviction_succeeds_once_an_entry_is_idle() {
        let cache = ExternMemCache::new();
        for i in 0..CACHE_CAPACITY {
            let alloc = ExternAlloc {
                alloc_handle: i as u64,
                alloc_size: 8,
            };
            let (_, idx) = cache.get_entry(alloc, || Ok(handle(1))).unwrap();
            if i == 0 {
                cache.buf_done(idx).unwrap();
            }
        }
        let overflow = ExternAlloc {
            alloc_handle: 9999,
            alloc_size: 8,
        };
        assert!(cache.get_entry(overflow, || Ok(handle(1))).is_ok());
    }
}
