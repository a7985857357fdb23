//! The process-wide runtime context: owns the shared-resource locks in
//! their required acquisition order so a caller cannot take them out of
//! sequence without restructuring this struct itself.
//!
//! Order: `graph_hdl_lock → open_close_lock → start_stop_lock → subgraph
//! pool → data-path lock`. Each field below appears in exactly that order;
//! a method that needs more than one of them takes them top-to-bottom.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use acdb_core::{AcdbError, ProcDomain, Result};
use acdb_resilience::servreg::{DownEffect, SsrCoordinator};

use crate::pool::SubgraphPool;
use crate::state::GraphStateMachine;

/// Opaque handle into the global graph-handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphHandle(u64);

pub struct RuntimeContext {
    /// 1. Global graph-handle list.
    graph_hdl_lock: Mutex<HashMap<GraphHandle, Arc<GraphStateMachine>>>,
    /// 2. Serializes open/close across the whole context (on top of each
    /// graph's own Group-1/Group-3 signals, this guards handle-table
    /// mutation itself).
    open_close_lock: Mutex<()>,
    /// 3. Serializes start/stop across the whole context.
    start_stop_lock: Mutex<()>,
    /// 4. The subgraph pool.
    pool: Arc<SubgraphPool>,
    /// 5. Reserved ordering slot for the data-path lock; the data-path
    /// engine itself lives alongside each graph's dispatcher in
    /// `acdb-io` and is not duplicated here — this mutex exists purely
    /// to preserve the documented acquisition order for any context-level
    /// code that touches both graph bookkeeping and a data path in the
    /// same call.
    data_path_lock: Mutex<()>,

    next_handle: Mutex<u64>,

    /// SSR coordinator fanning subsystem up/down notifications out to
    /// every graph this context currently owns.
    ssr: SsrCoordinator,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(ProcDomain(0))
    }
}

impl RuntimeContext {
    pub fn new(master: ProcDomain) -> Self {
        Self {
            graph_hdl_lock: Mutex::new(HashMap::new()),
            open_close_lock: Mutex::new(()),
            start_stop_lock: Mutex::new(()),
            pool: Arc::new(SubgraphPool::new()),
            data_path_lock: Mutex::new(()),
            next_handle: Mutex::new(1),
            ssr: SsrCoordinator::new(master, &[master]),
        }
    }

    pub fn pool(&self) -> Arc<SubgraphPool> {
        self.pool.clone()
    }

    /// Registers `graph` under a freshly minted handle. Takes
    /// `open_close_lock` before `graph_hdl_lock` is mutated, per the
    /// declared order.
    pub fn register_graph(&self, graph: Arc<GraphStateMachine>) -> GraphHandle {
        let _open_close = self.open_close_lock.lock().expect("open_close lock poisoned");
        let mut next = self.next_handle.lock().expect("next_handle lock poisoned");
        let handle = GraphHandle(*next);
        *next += 1;
        drop(next);
        self.graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .insert(handle, graph);
        handle
    }

    pub fn get_graph(&self, handle: GraphHandle) -> Result<Arc<GraphStateMachine>> {
        self.graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .get(&handle)
            .cloned()
            .ok_or(AcdbError::Handle)
    }

    /// Closes and deregisters `handle`, acquiring `open_close_lock` then
    /// `start_stop_lock` before touching the handle table, matching the
    /// declared lock order.
    pub fn close_and_remove(&self, handle: GraphHandle) -> Result<()> {
        let _open_close = self.open_close_lock.lock().expect("open_close lock poisoned");
        let _start_stop = self.start_stop_lock.lock().expect("start_stop lock poisoned");
        let graph = self
            .graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .get(&handle)
            .cloned()
            .ok_or(AcdbError::Handle)?;
        graph.close()?;
        self.graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .remove(&handle);
        Ok(())
    }

    /// Runs `f` with the data-path ordering slot held, after the pool
    /// lock's position in the order has implicitly already been respected
    /// by `f` itself touching only the pool's own internal lock.
    pub fn with_data_path_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.data_path_lock.lock().expect("data_path lock poisoned");
        f()
    }

    /// Reports `domain` down, flipping every currently registered graph to
    /// `Error` (master) or `ErrorAllowCleanup` (satellite), the integration
    /// point the coordinator itself has no visibility to perform on its
    /// own. Returns whether the caller should escalate to a
    /// servreg-initiated restart (see [`SsrCoordinator::notify_down`]).
    pub fn notify_subsystem_down(&self, domain: ProcDomain) -> bool {
        let graphs: Vec<_> = self
            .graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .values()
            .cloned()
            .collect();
        self.ssr.notify_down(domain, |effect| {
            let is_master = effect == DownEffect::MasterDown;
            for graph in &graphs {
                graph.on_subsystem_down(is_master);
            }
        })
    }

    /// Reports `domain` up, clearing every registered graph's SSR signal.
    pub fn notify_subsystem_up(&self, domain: ProcDomain) {
        let graphs: Vec<_> = self
            .graph_hdl_lock
            .lock()
            .expect("graph_hdl lock poisoned")
            .values()
            .cloned()
            .collect();
        self.ssr.notify_up(domain);
        for graph in &graphs {
            graph.on_subsystem_up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Timeouts;
    use acdb_core::ProcDomain;
    use acdb_io::{Dispatcher, MockTransport, Response, ResponseStatus};

    fn test_graph(pool: Arc<SubgraphPool>) -> Arc<GraphStateMachine> {
        let transport = Arc::new(MockTransport::new(|packet| Response {
            token: packet.token,
            status: ResponseStatus::Ok,
            payload: Vec::new(),
        }));
        let dispatcher = Dispatcher::new(transport);
        Arc::new(GraphStateMachine::new(
            dispatcher,
            pool,
            1,
            2,
            ProcDomain(0),
            ProcDomain(1),
            Timeouts::default(),
        ))
    }

    #[test]
    fn register_and_fetch_round_trip() {
        let ctx = RuntimeContext::new(ProcDomain(0));
        let graph = test_graph(ctx.pool());
        let handle = ctx.register_graph(graph);
        assert!(ctx.get_graph(handle).is_ok());
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let ctx = RuntimeContext::new(ProcDomain(0));
        assert!(matches!(ctx.get_graph(GraphHandle(404)), Err(AcdbError::Handle)));
    }

    #[test]
    fn close_and_remove_drops_the_handle() {
        let ctx = RuntimeContext::new(ProcDomain(0));
        let graph = test_graph(ctx.pool());
        let handle = ctx.register_graph(graph);
        ctx.close_and_remove(handle).unwrap();
        assert!(matches!(ctx.get_graph(handle), Err(AcdbError::Handle)));
    }

    #[test]
    fn subsystem_down_fans_out_to_every_registered_graph() {
        let master = ProcDomain(0);
        let ctx = RuntimeContext::new(master);
        let graph = test_graph(ctx.pool());
        ctx.register_graph(graph.clone());

        ctx.notify_subsystem_down(master);
        assert_eq!(graph.state(), crate::state::GraphState::Error);

        ctx.notify_subsystem_up(master);
        // on_subsystem_up only clears the ssr signal, not the error state;
        // confirm it ran by checking a fresh down/up cycle still works.
        ctx.notify_subsystem_down(master);
        assert_eq!(graph.state(), crate::state::GraphState::Error);
    }

    #[test]
    fn satellite_down_flips_graphs_to_allow_cleanup_and_escalates() {
        let master = ProcDomain(0);
        let satellite = ProcDomain(1);
        let ctx = RuntimeContext::new(master);
        let graph = test_graph(ctx.pool());
        ctx.register_graph(graph.clone());

        let escalate = ctx.notify_subsystem_down(satellite);
        assert!(escalate);
        assert_eq!(graph.state(), crate::state::GraphState::ErrorAllowCleanup);
    }
}
