//! Subgraph pool (C5): a global table keyed by `sg_id` guaranteeing a
//! shared subgraph is opened on the wire at most once and closed exactly
//! once when the last reference drops.

use std::collections::HashMap;
use std::sync::Mutex;

use acdb_core::{AcdbError, ProcDomain, Result, SubgraphId};

/// Whether a pool operation's caller is now responsible for sending the
/// matching wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireAction {
    /// First acquire / last release: the caller must issue OPEN / CLOSE.
    SendCommand,
    /// Another holder already has this open: nothing to send.
    NoOp,
}

struct SubgraphEntry {
    open_refcount: u32,
    persist_cal: HashMap<ProcDomain, Vec<u8>>,
}

/// Connection pool entries are keyed the same way as subgraphs, just over
/// the `(src, dst)` pair instead of a single `sg_id`.
type ConnKey = (SubgraphId, SubgraphId);

struct State {
    subgraphs: HashMap<SubgraphId, SubgraphEntry>,
    connections: HashMap<ConnKey, u32>,
}

/// Global subgraph/connection reference-count table. Invariant: the sum
/// over graphs of `sg_id ∈ graph.sg_ids` equals `open_refcount` for
/// `sg_id`.
pub struct SubgraphPool {
    state: Mutex<State>,
}

impl Default for SubgraphPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SubgraphPool {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                subgraphs: HashMap::new(),
                connections: HashMap::new(),
            }),
        }
    }

    /// Increments `sg_id`'s open-refcount, creating the entry on first
    /// use. Returns `SendCommand` only for the caller that took the
    /// refcount from 0 to 1.
    pub fn acquire(&self, sg_id: SubgraphId) -> WireAction {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let entry = state.subgraphs.entry(sg_id).or_insert(SubgraphEntry {
            open_refcount: 0,
            persist_cal: HashMap::new(),
        });
        entry.open_refcount += 1;
        if entry.open_refcount == 1 {
            WireAction::SendCommand
        } else {
            WireAction::NoOp
        }
    }

    /// Decrements `sg_id`'s refcount. Returns `SendCommand` when this
    /// release brought it to zero (the caller must issue CLOSE); the
    /// entry is dropped from the table at that point.
    pub fn release(&self, sg_id: SubgraphId) -> Result<WireAction> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let entry = state.subgraphs.get_mut(&sg_id).ok_or(AcdbError::Handle)?;
        entry.open_refcount = entry.open_refcount.saturating_sub(1);
        if entry.open_refcount == 0 {
            state.subgraphs.remove(&sg_id);
            Ok(WireAction::SendCommand)
        } else {
            Ok(WireAction::NoOp)
        }
    }

    pub fn open_refcount(&self, sg_id: SubgraphId) -> u32 {
        self.state
            .lock()
            .expect("pool lock poisoned")
            .subgraphs
            .get(&sg_id)
            .map_or(0, |e| e.open_refcount)
    }

    pub fn acquire_conn(&self, src: SubgraphId, dst: SubgraphId) -> WireAction {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let count = state.connections.entry((src, dst)).or_insert(0);
        *count += 1;
        if *count == 1 {
            WireAction::SendCommand
        } else {
            WireAction::NoOp
        }
    }

    pub fn release_conn(&self, src: SubgraphId, dst: SubgraphId) -> Result<WireAction> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let count = state.connections.get_mut(&(src, dst)).ok_or(AcdbError::Handle)?;
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.connections.remove(&(src, dst));
            Ok(WireAction::SendCommand)
        } else {
            Ok(WireAction::NoOp)
        }
    }

    /// Registers a persistent-cal blob for `sg_id` on `proc_id`. Per
    /// invariant 7, this data must be detached before the subgraph's
    /// backing shmem may change — enforced by callers, not the pool
    /// itself, since the pool has no visibility into shmem lifetime.
    pub fn attach_persist_cal(
        &self,
        sg_id: SubgraphId,
        proc_id: ProcDomain,
        blob: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let entry = state.subgraphs.get_mut(&sg_id).ok_or(AcdbError::Handle)?;
        entry.persist_cal.insert(proc_id, blob);
        Ok(())
    }

    pub fn detach_persist_cal(&self, sg_id: SubgraphId, proc_id: ProcDomain) -> Result<()> {
        let mut state = self.state.lock().expect("pool lock poisoned");
        let entry = state.subgraphs.get_mut(&sg_id).ok_or(AcdbError::Handle)?;
        entry.persist_cal.remove(&proc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquire_sends_open_later_ones_are_noop() {
        let pool = SubgraphPool::new();
        assert_eq!(pool.acquire(SubgraphId(1)), WireAction::SendCommand);
        assert_eq!(pool.acquire(SubgraphId(1)), WireAction::NoOp);
        assert_eq!(pool.open_refcount(SubgraphId(1)), 2);
    }

    #[test]
    fn release_to_zero_sends_close() {
        let pool = SubgraphPool::new();
        pool.acquire(SubgraphId(1));
        pool.acquire(SubgraphId(1));
        assert_eq!(pool.release(SubgraphId(1)).unwrap(), WireAction::NoOp);
        assert_eq!(pool.release(SubgraphId(1)).unwrap(), WireAction::SendCommand);
        assert_eq!(pool.open_refcount(SubgraphId(1)), 0);
    }

    #[test]
    fn release_unknown_subgraph_errors() {
        let pool = SubgraphPool::new();
        assert!(matches!(pool.release(SubgraphId(99)), Err(AcdbError::Handle)));
    }

    #[test]
    fn connections_follow_the_same_refcount_rule() {
        let pool = SubgraphPool::new();
        let (a, b) = (SubgraphId(1), SubgraphId(2));
        assert_eq!(pool.acquire_conn(a, b), WireAction::SendCommand);
        assert_eq!(pool.acquire_conn(a, b), WireAction::NoOp);
        assert_eq!(pool.release_conn(a, b).unwrap(), WireAction::NoOp);
        assert_eq!(pool.release_conn(a, b).unwrap(), WireAction::SendCommand);
    }
}
