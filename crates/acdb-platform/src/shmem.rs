//! Shared-memory manager (C4): allocation, external mapping, and the SSR
//! abort/re-map rules that guard both.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use acdb_core::{AcdbError, ProcDomain, Result};

/// Allocation flags controlling how a shmem request is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags {
    /// Force a single allocation into one mapped region rather than a
    /// scatter-gather list.
    pub dedicated_page: bool,
    /// Disable caching on the satellite side of the mapping.
    pub uncached: bool,
    /// Read-only from the satellite's perspective; `false` means
    /// read-write.
    pub read_only: bool,
}

/// Handle returned by [`ShmemManager::alloc`] / [`ShmemManager::map_extern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmemHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Owned,
    Extern,
}

struct Region {
    kind: Kind,
    size: usize,
    proc_mask: Vec<ProcDomain>,
    mapped: bool,
}

struct State {
    next_handle: u64,
    regions: HashMap<ShmemHandle, Region>,
    /// Subsystems currently signalled down; map/unmap to them aborts with
    /// `SUBSYS_RESET` until the matching up-notification clears the entry
    /// and the region is explicitly re-mapped.
    down: HashMap<ProcDomain, bool>,
}

/// Owns every shared-memory allocation and external mapping for one
/// runtime instance. `virt_ptr` from the contract is represented as the
/// owned byte buffer itself (`Vec<u8>`) since there is no real DSP address
/// space on the host side of this workspace.
pub struct ShmemManager {
    state: Mutex<State>,
    /// Signalled whenever a subsystem's down-flag clears, so blocked
    /// `map_extern` callers can retry.
    remap_ready: Condvar,
}

impl Default for ShmemManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmemManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                regions: HashMap::new(),
                down: HashMap::new(),
            }),
            remap_ready: Condvar::new(),
        }
    }

    /// Allocates `size` bytes mapped to every domain in `proc_mask`.
    pub fn alloc(
        &self,
        size: usize,
        _flags: AllocFlags,
        proc_mask: &[ProcDomain],
    ) -> Result<(ShmemHandle, Vec<u8>)> {
        if proc_mask.iter().any(|p| self.is_down(*p)) {
            return Err(AcdbError::SubsysReset);
        }
        let mut state = self.state.lock().expect("shmem lock poisoned");
        let handle = ShmemHandle(state.next_handle);
        state.next_handle += 1;
        state.regions.insert(
            handle,
            Region {
                kind: Kind::Owned,
                size,
                proc_mask: proc_mask.to_vec(),
                mapped: true,
            },
        );
        Ok((handle, vec![0u8; size]))
    }

    /// Maps a client-provided external allocation for `proc`. Blocks while
    /// `proc` is signalled down, waking on the matching up-notification —
    /// map operations are held until the subsystem they target is back up.
    pub fn map_extern(&self, size: usize, proc: ProcDomain) -> Result<ShmemHandle> {
        let mut state = self.state.lock().expect("shmem lock poisoned");
        while state.down.get(&proc).copied().unwrap_or(false) {
            state = self
                .remap_ready
                .wait(state)
                .expect("shmem condvar poisoned");
        }
        let handle = ShmemHandle(state.next_handle);
        state.next_handle += 1;
        state.regions.insert(
            handle,
            Region {
                kind: Kind::Extern,
                size,
                proc_mask: vec![proc],
                mapped: true,
            },
        );
        Ok(handle)
    }

    /// Unmaps `handle` without freeing its backing allocation (only
    /// meaningful for [`Kind::Extern`] regions, mirrored for owned regions
    /// as a no-op beyond clearing the mapped flag).
    pub fn unmap(&self, handle: ShmemHandle) -> Result<()> {
        let mut state = self.state.lock().expect("shmem lock poisoned");
        let region = state.regions.get_mut(&handle).ok_or(AcdbError::Handle)?;
        if region.proc_mask.iter().any(|p| {
            state
                .down
                .get(p)
                .copied()
                .unwrap_or(false)
        }) {
            return Err(AcdbError::SubsysReset);
        }
        region.mapped = false;
        Ok(())
    }

    /// Frees `handle` entirely.
    pub fn free(&self, handle: ShmemHandle) -> Result<()> {
        let mut state = self.state.lock().expect("shmem lock poisoned");
        state.regions.remove(&handle).ok_or(AcdbError::Handle)?;
        Ok(())
    }

    pub fn region_size(&self, handle: ShmemHandle) -> Result<usize> {
        let state = self.state.lock().expect("shmem lock poisoned");
        Ok(state.regions.get(&handle).ok_or(AcdbError::Handle)?.size)
    }

    fn is_down(&self, proc: ProcDomain) -> bool {
        self.state
            .lock()
            .expect("shmem lock poisoned")
            .down
            .get(&proc)
            .copied()
            .unwrap_or(false)
    }

    /// Marks `proc` down: any in-flight or future map/unmap to it aborts
    /// with `SUBSYS_RESET` until [`Self::notify_up`] clears it.
    pub fn notify_down(&self, proc: ProcDomain) {
        let mut state = self.state.lock().expect("shmem lock poisoned");
        state.down.insert(proc, true);
        tracing::warn!(proc_domain = proc.0, "subsystem down, aborting in-flight shmem ops");
    }

    /// Clears the down-flag for `proc` and wakes anything blocked in
    /// `map_extern`. Pre-allocated entries for `proc` must still be
    /// explicitly re-mapped by the caller before any further command
    /// targets it — this only unblocks new map attempts.
    pub fn notify_up(&self, proc: ProcDomain) {
        let mut state = self.state.lock().expect("shmem lock poisoned");
        state.down.insert(proc, false);
        drop(state);
        tracing::info!(proc_domain = proc.0, "subsystem up, unblocking map_extern");
        self.remap_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let mgr = ShmemManager::new();
        let (handle, buf) = mgr.alloc(128, AllocFlags::default(), &[ProcDomain(1)]).unwrap();
        assert_eq!(buf.len(), 128);
        mgr.free(handle).unwrap();
        assert!(matches!(mgr.free(handle), Err(AcdbError::Handle)));
    }

    #[test]
    fn alloc_to_down_subsystem_aborts() {
        let mgr = ShmemManager::new();
        mgr.notify_down(ProcDomain(2));
        let err = mgr.alloc(64, AllocFlags::default(), &[ProcDomain(2)]).unwrap_err();
        assert!(matches!(err, AcdbError::SubsysReset));
    }

    #[test]
    fn unmap_to_down_subsystem_aborts() {
        let mgr = ShmemManager::new();
        let (handle, _) = mgr.alloc(64, AllocFlags::default(), &[ProcDomain(3)]).unwrap();
        mgr.notify_down(ProcDomain(3));
        assert!(matches!(mgr.unmap(handle), Err(AcdbError::SubsysReset)));
    }

    #[test]
    fn notify_up_clears_down_flag() {
        let mgr = ShmemManager::new();
        mgr.notify_down(ProcDomain(4));
        mgr.notify_up(ProcDomain(4));
        assert!(mgr.alloc(16, AllocFlags::default(), &[ProcDomain(4)]).is_ok());
    }
}
