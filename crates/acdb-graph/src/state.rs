//! Graph lifecycle state machine (C6): the public operations, the three
//! command signal groups, and RTGM's two-phase prepare/change sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use acdb_core::{AcdbError, CalKeyVector, GraphKeyVector, ProcDomain, Result, SubgraphId, TagId};
use acdb_io::{CommandRequest, Dispatcher, Opcode};
use acdb_resilience::error_detection::{Decision, ErrorDetector, ErrorEvent};

use crate::pool::{SubgraphPool, WireAction};
use crate::signal::Signal;

/// Per-opcode timeouts, grouped the way the wire protocol groups them
/// ("OPEN: large; START/STOP: medium; generic: default").
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub open_close: Duration,
    pub start_stop: Duration,
    pub generic: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open_close: Duration::from_secs(5),
            start_stop: Duration::from_secs(2),
            generic: Duration::from_millis(500),
        }
    }
}

/// Graph lifecycle states, including the two SSR-driven error states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Closed,
    Opened,
    Prepared,
    Started,
    Suspended,
    Stopped,
    /// Master processor domain went down.
    Error,
    /// A satellite went down; the master can still drive cleanup.
    ErrorAllowCleanup,
}

/// The computed delta an RTGM prepare-change phase hands to its matching
/// change phase.
#[derive(Debug, Clone, Default)]
pub struct RtgmPlan {
    pub to_close: Vec<SubgraphId>,
    pub to_open: Vec<SubgraphId>,
    pub new_gkv: GraphKeyVector,
    /// Whether the graph was in `Started` state when `prepare_change`
    /// snapshotted it, not whether it was *ever* started — a graph
    /// stopped before an RTGM change must not be resurrected by it.
    was_started: bool,
}

struct Ports {
    src_port: u32,
    dst_port: u32,
    src_domain: ProcDomain,
    dst_domain: ProcDomain,
}

/// One graph instance. Holds its own sg list, key vectors, lifecycle
/// state, and the three command signals.
pub struct GraphStateMachine {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<SubgraphPool>,
    ports: Ports,
    timeouts: Timeouts,

    sg_ids: Mutex<Vec<SubgraphId>>,
    gkv: Mutex<GraphKeyVector>,
    ckv: Mutex<CalKeyVector>,
    state: Mutex<GraphState>,

    group1: Signal,
    group2: Signal,

    close_signal: AtomicBool,
    ssr_signal: AtomicBool,

    /// RTGM/non-RTGM coordination counter and flag.
    num_rtgm_in_prog: Mutex<u32>,
    client_op_in_prog: Mutex<bool>,
    rtgm_gate: std::sync::Condvar,

    /// Per-graph rolling timeout/duplicate counters feeding restart
    /// decisions; a timed-out send reports here before its error
    /// propagates to the caller.
    errors: Mutex<ErrorDetector>,
}

impl GraphStateMachine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        pool: Arc<SubgraphPool>,
        src_port: u32,
        dst_port: u32,
        src_domain: ProcDomain,
        dst_domain: ProcDomain,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            dispatcher,
            pool,
            ports: Ports {
                src_port,
                dst_port,
                src_domain,
                dst_domain,
            },
            timeouts,
            sg_ids: Mutex::new(Vec::new()),
            gkv: Mutex::new(GraphKeyVector::default()),
            ckv: Mutex::new(CalKeyVector::default()),
            state: Mutex::new(GraphState::Closed),
            group1: Signal::new(),
            group2: Signal::new(),
            close_signal: AtomicBool::new(false),
            ssr_signal: AtomicBool::new(false),
            num_rtgm_in_prog: Mutex::new(0),
            client_op_in_prog: Mutex::new(false),
            rtgm_gate: std::sync::Condvar::new(),
            errors: Mutex::new(ErrorDetector::new()),
        }
    }

    pub fn state(&self) -> GraphState {
        *self.state.lock().expect("graph state lock poisoned")
    }

    fn send_group1(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        self.group1.acquire();
        let result = self.send(opcode, payload, self.timeout_for(opcode));
        self.group1.release();
        result
    }

    fn send_group2(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        self.group2.acquire();
        let result = self.send(opcode, payload, self.timeouts.generic);
        self.group2.release();
        result
    }

    /// Group 3 (CLOSE) bypasses both signals entirely so a recovery close
    /// can proceed even if Group 1 is believed stuck.
    fn send_group3(&self, opcode: Opcode, payload: Vec<u8>) -> Result<()> {
        self.send(opcode, payload, self.timeouts.open_close)
    }

    fn timeout_for(&self, opcode: Opcode) -> Duration {
        match opcode {
            Opcode::GraphOpen | Opcode::GraphClose => self.timeouts.open_close,
            Opcode::GraphStart | Opcode::GraphStop => self.timeouts.start_stop,
            _ => self.timeouts.generic,
        }
    }

    fn send(&self, opcode: Opcode, payload: Vec<u8>, timeout: Duration) -> Result<()> {
        let request = CommandRequest {
            opcode,
            src_port: self.ports.src_port,
            dst_port: self.ports.dst_port,
            src_domain: self.ports.src_domain,
            dst_domain: self.ports.dst_domain,
            buffer_index: 0,
            payload,
        };
        let result = self
            .dispatcher
            .send_command(request, timeout, &self.close_signal, &self.ssr_signal);
        if matches!(result, Err(AcdbError::Timeout)) {
            self.report_timeout(opcode);
        }
        result.map(|_resp| ())
    }

    /// Feeds a timed-out send into the rolling error-detection window and
    /// acts on its verdict. OPEN/CLOSE timeouts always restart; other
    /// opcodes only restart once they pile up within the window. A
    /// generic satellite-failed response carries no more specific
    /// classification than the timeout itself and is not separately
    /// reported, matching how an unmatched error code leaves the window
    /// untouched.
    fn report_timeout(&self, opcode: Opcode) {
        let event = if opcode.timeout_is_fatal() {
            ErrorEvent::OpenOrCloseTimeout
        } else {
            ErrorEvent::GenericTimeout
        };
        let decision = self
            .errors
            .lock()
            .expect("error-detector lock poisoned")
            .report(event, Instant::now());
        if decision == Decision::Restart {
            self.on_subsystem_down(false);
        }
    }

    /// Blocks while an RTGM is in progress on this graph, then marks a
    /// non-RTGM client op in progress. Pairs with [`Self::end_client_op`].
    fn begin_client_op(&self) {
        let mut rtgm = self.num_rtgm_in_prog.lock().expect("rtgm lock poisoned");
        while *rtgm > 0 {
            rtgm = self.rtgm_gate.wait(rtgm).expect("rtgm condvar poisoned");
        }
        drop(rtgm);
        *self.client_op_in_prog.lock().expect("client-op lock poisoned") = true;
    }

    fn end_client_op(&self) {
        *self.client_op_in_prog.lock().expect("client-op lock poisoned") = false;
        self.rtgm_gate.notify_all();
    }

    /// Opens `sg_ids` under `gkv`/`ckv`, acquiring each subgraph from the
    /// pool and sending OPEN only for subgraphs newly brought to
    /// refcount 1.
    pub fn open(
        &self,
        sg_ids: Vec<SubgraphId>,
        gkv: GraphKeyVector,
        ckv: Option<CalKeyVector>,
    ) -> Result<()> {
        self.begin_client_op();
        let result = (|| {
            for sg_id in &sg_ids {
                if self.pool.acquire(*sg_id) == WireAction::SendCommand {
                    self.send_group1(Opcode::GraphOpen, sg_id.0.to_le_bytes().to_vec())?;
                }
            }
            *self.sg_ids.lock().expect("sg_ids lock poisoned") = sg_ids;
            *self.gkv.lock().expect("gkv lock poisoned") = gkv;
            if let Some(ckv) = ckv {
                *self.ckv.lock().expect("ckv lock poisoned") = ckv;
            }
            *self.state.lock().expect("state lock poisoned") = GraphState::Opened;
            Ok(())
        })();
        self.end_client_op();
        if result.is_ok() {
            tracing::info!(sg_ids = ?self.sg_ids.lock().expect("sg_ids lock poisoned"), "graph opened");
        }
        result
    }

    /// Adds subgraphs to an already-open graph, same refcount discipline
    /// as `open`.
    pub fn add_graph(&self, extra_sg_ids: Vec<SubgraphId>, new_ckv: CalKeyVector) -> Result<()> {
        self.begin_client_op();
        let result = (|| {
            for sg_id in &extra_sg_ids {
                if self.pool.acquire(*sg_id) == WireAction::SendCommand {
                    self.send_group1(Opcode::GraphOpen, sg_id.0.to_le_bytes().to_vec())?;
                }
            }
            self.sg_ids
                .lock()
                .expect("sg_ids lock poisoned")
                .extend(extra_sg_ids);
            *self.ckv.lock().expect("ckv lock poisoned") = new_ckv;
            Ok(())
        })();
        self.end_client_op();
        result
    }

    /// RTGM phase 1: closes subgraphs/connections no longer needed and
    /// computes the reopen list. Does not open anything yet, yielding to
    /// the host to update the ACDB on disk in between.
    pub fn prepare_change(&self, new_gkv: GraphKeyVector, new_sg_ids: Vec<SubgraphId>) -> Result<RtgmPlan> {
        *self.num_rtgm_in_prog.lock().expect("rtgm lock poisoned") += 1;
        while *self.client_op_in_prog.lock().expect("client-op lock poisoned") {
            std::thread::yield_now();
        }

        let current = self.sg_ids.lock().expect("sg_ids lock poisoned").clone();
        let to_close: Vec<SubgraphId> = current
            .iter()
            .filter(|sg| !new_sg_ids.contains(sg))
            .copied()
            .collect();
        let to_open: Vec<SubgraphId> = new_sg_ids
            .iter()
            .filter(|sg| !current.contains(sg))
            .copied()
            .collect();

        for sg_id in &to_close {
            // Persistent cal must be detached before the subgraph's
            // backing shmem can move; harmless no-op if none was attached.
            let _ = self.pool.detach_persist_cal(*sg_id, self.ports.dst_domain);
            if self.pool.release(*sg_id)? == WireAction::SendCommand {
                self.send_group3(Opcode::GraphClose, sg_id.0.to_le_bytes().to_vec())?;
            }
        }

        let was_started = *self.state.lock().expect("state lock poisoned") == GraphState::Started;

        Ok(RtgmPlan {
            to_close,
            to_open,
            new_gkv,
            was_started,
        })
    }

    /// RTGM phase 2: opens the pruned-plus-reopen list, applies the new
    /// CKV, optionally pushes a tag-data blob, and restarts the graph (in
    /// the order it was stopped) if it had been running.
    pub fn apply_change(
        &self,
        plan: RtgmPlan,
        new_ckv: CalKeyVector,
        tag_data: Option<Vec<u8>>,
    ) -> Result<()> {
        let result = (|| {
            for sg_id in &plan.to_open {
                if self.pool.acquire(*sg_id) == WireAction::SendCommand {
                    self.send_group1(Opcode::GraphOpen, sg_id.0.to_le_bytes().to_vec())?;
                }
            }
            {
                let mut sg_ids = self.sg_ids.lock().expect("sg_ids lock poisoned");
                sg_ids.retain(|sg| !plan.to_close.contains(sg));
                sg_ids.extend(plan.to_open.iter().copied());
            }
            *self.gkv.lock().expect("gkv lock poisoned") = plan.new_gkv;
            *self.ckv.lock().expect("ckv lock poisoned") = new_ckv;

            if let Some(blob) = tag_data {
                self.send_group2(Opcode::SetCfg, blob)?;
            }

            if plan.was_started {
                self.send_group1(Opcode::GraphStart, Vec::new())?;
            }
            Ok(())
        })();

        *self.num_rtgm_in_prog.lock().expect("rtgm lock poisoned") -= 1;
        self.rtgm_gate.notify_all();
        result
    }

    pub fn remove_graph(&self, sg_ids: Vec<SubgraphId>) -> Result<()> {
        self.begin_client_op();
        let result = (|| {
            for sg_id in &sg_ids {
                if self.pool.release(*sg_id)? == WireAction::SendCommand {
                    self.send_group3(Opcode::GraphClose, sg_id.0.to_le_bytes().to_vec())?;
                }
            }
            self.sg_ids
                .lock()
                .expect("sg_ids lock poisoned")
                .retain(|sg| !sg_ids.contains(sg));
            Ok(())
        })();
        self.end_client_op();
        result
    }

    pub fn set_cal(&self, ckv: CalKeyVector, payload: Vec<u8>) -> Result<()> {
        self.begin_client_op();
        let result = (|| {
            self.send_group2(Opcode::SetCfg, payload)?;
            *self.ckv.lock().expect("ckv lock poisoned") = ckv;
            Ok(())
        })();
        self.end_client_op();
        result
    }

    pub fn set_config(&self, _tag: TagId, payload: Vec<u8>) -> Result<()> {
        self.send_group2(Opcode::SetCfg, payload)
    }

    pub fn set_tagged_custom_config(&self, _tag: TagId, payload: Vec<u8>) -> Result<()> {
        self.send_group2(Opcode::SetCfg, payload)
    }

    /// As [`Self::set_tagged_custom_config`], but also attaches `payload`
    /// to every open subgraph as persistent cal so it survives a later
    /// RTGM close/reopen of that subgraph, rather than being dropped with
    /// the rest of its non-persistent config.
    pub fn set_tagged_custom_config_persist(&self, tag: TagId, payload: Vec<u8>) -> Result<()> {
        self.set_tagged_custom_config(tag, payload.clone())?;
        for sg_id in self.sg_ids.lock().expect("sg_ids lock poisoned").iter() {
            self.pool
                .attach_persist_cal(*sg_id, self.ports.dst_domain, payload.clone())?;
        }
        Ok(())
    }

    pub fn get_custom_config(&self, payload: Vec<u8>) -> Result<()> {
        self.send_group2(Opcode::GetCfg, payload)
    }

    pub fn get_tagged_custom_config(&self, _tag: TagId, payload: Vec<u8>) -> Result<()> {
        self.send_group2(Opcode::GetCfg, payload)
    }

    pub fn prepare(&self) -> Result<()> {
        self.send_group1(Opcode::GraphPrepare, Vec::new())?;
        *self.state.lock().expect("state lock poisoned") = GraphState::Prepared;
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.send_group1(Opcode::GraphStart, Vec::new())?;
        *self.state.lock().expect("state lock poisoned") = GraphState::Started;
        Ok(())
    }

    /// Local-only pause: the wire protocol has no dedicated SUSPEND
    /// opcode, so this just transitions state under the Group-1 gate.
    pub fn suspend(&self) -> Result<()> {
        self.group1.acquire();
        *self.state.lock().expect("state lock poisoned") = GraphState::Suspended;
        self.group1.release();
        Ok(())
    }

    /// `scope` optionally restricts STOP to a subset of subgraphs; `None`
    /// stops the whole graph.
    pub fn stop(&self, scope: Option<Vec<SubgraphId>>) -> Result<()> {
        let payload = scope
            .unwrap_or_default()
            .iter()
            .flat_map(|sg| sg.0.to_le_bytes())
            .collect();
        self.send_group1(Opcode::GraphStop, payload)?;
        *self.state.lock().expect("state lock poisoned") = GraphState::Stopped;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.send_group2(Opcode::GraphFlush, Vec::new())
    }

    /// Always permitted (Group 3), even if Group 1 is believed stuck, so
    /// recovery can proceed.
    pub fn close(&self) -> Result<()> {
        self.close_signal.store(true, Ordering::SeqCst);
        self.group1.release();
        self.group2.release();

        let sg_ids = self.sg_ids.lock().expect("sg_ids lock poisoned").clone();
        for sg_id in &sg_ids {
            if self.pool.release(*sg_id)? == WireAction::SendCommand {
                self.send_group3(Opcode::GraphClose, sg_id.0.to_le_bytes().to_vec())?;
            }
        }
        self.sg_ids.lock().expect("sg_ids lock poisoned").clear();
        *self.state.lock().expect("state lock poisoned") = GraphState::Closed;
        self.close_signal.store(false, Ordering::SeqCst);
        tracing::info!(?sg_ids, "graph closed");
        Ok(())
    }

    pub fn register_custom_event(&self, payload: Vec<u8>) -> Result<()> {
        self.send_group2(Opcode::RegisterModuleEvents, payload)
    }

    /// An SSR DOWN on the master flips this graph to `Error`; a satellite
    /// DOWN flips it to `ErrorAllowCleanup`. Also sets the ssr-mask so any
    /// outstanding signal wait aborts with `SUBSYS_RESET`.
    pub fn on_subsystem_down(&self, is_master: bool) {
        self.ssr_signal.store(true, Ordering::SeqCst);
        *self.state.lock().expect("state lock poisoned") = if is_master {
            GraphState::Error
        } else {
            GraphState::ErrorAllowCleanup
        };
        tracing::warn!(is_master, "subsystem down, graph flipped to error state");
    }

    pub fn on_subsystem_up(&self) {
        self.ssr_signal.store(false, Ordering::SeqCst);
        tracing::info!("subsystem up");
    }

    pub fn gkv(&self) -> GraphKeyVector {
        self.gkv.lock().expect("gkv lock poisoned").clone()
    }

    pub fn ckv(&self) -> CalKeyVector {
        self.ckv.lock().expect("ckv lock poisoned").clone()
    }

    pub fn sg_ids(&self) -> Vec<SubgraphId> {
        self.sg_ids.lock().expect("sg_ids lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acdb_core::KeyValue;
    use acdb_io::{MockTransport, Response, ResponseStatus};

    fn graph() -> GraphStateMachine {
        let transport = Arc::new(MockTransport::new(|packet| Response {
            token: packet.token,
            status: ResponseStatus::Ok,
            payload: Vec::new(),
        }));
        let dispatcher = Dispatcher::new(transport);
        let pool = Arc::new(SubgraphPool::new());
        GraphStateMachine::new(
            dispatcher,
            pool,
            1,
            2,
            ProcDomain(0),
            ProcDomain(1),
            Timeouts::default(),
        )
    }

    #[test]
    fn open_then_close_round_trip() {
        let g = graph();
        let gkv = GraphKeyVector::new(vec![KeyValue::new(1, 1)]);
        g.open(vec![SubgraphId(1), SubgraphId(2)], gkv, None).unwrap();
        assert_eq!(g.state(), GraphState::Opened);
        g.close().unwrap();
        assert_eq!(g.state(), GraphState::Closed);
        assert!(g.sg_ids().is_empty());
    }

    #[test]
    fn start_then_stop_transitions_state() {
        let g = graph();
        let gkv = GraphKeyVector::default();
        g.open(vec![SubgraphId(1)], gkv, None).unwrap();
        g.prepare().unwrap();
        assert_eq!(g.state(), GraphState::Prepared);
        g.start().unwrap();
        assert_eq!(g.state(), GraphState::Started);
        g.stop(None).unwrap();
        assert_eq!(g.state(), GraphState::Stopped);
    }

    #[test]
    fn rtgm_prepare_then_apply_updates_sg_set() {
        let g = graph();
        g.open(vec![SubgraphId(1), SubgraphId(2)], GraphKeyVector::default(), None)
            .unwrap();
        let plan = g
            .prepare_change(GraphKeyVector::default(), vec![SubgraphId(2), SubgraphId(3)])
            .unwrap();
        assert_eq!(plan.to_close, vec![SubgraphId(1)]);
        assert_eq!(plan.to_open, vec![SubgraphId(3)]);
        g.apply_change(plan, CalKeyVector::default(), None).unwrap();
        let mut sg_ids = g.sg_ids();
        sg_ids.sort_by_key(|s| s.0);
        assert_eq!(sg_ids, vec![SubgraphId(2), SubgraphId(3)]);
    }

    #[test]
    fn ssr_down_flips_state_for_master_vs_satellite() {
        let g = graph();
        g.on_subsystem_down(true);
        assert_eq!(g.state(), GraphState::Error);
        g.on_subsystem_down(false);
        assert_eq!(g.state(), GraphState::ErrorAllowCleanup);
    }

    #[test]
    fn rtgm_apply_does_not_resurrect_a_stopped_graph() {
        let sent_opcodes = Arc::new(Mutex::new(Vec::new()));
        let sent_opcodes_cb = sent_opcodes.clone();
        let transport = Arc::new(MockTransport::new(move |packet| {
            sent_opcodes_cb.lock().unwrap().push(packet.opcode);
            Response {
                token: packet.token,
                status: ResponseStatus::Ok,
                payload: Vec::new(),
            }
        }));
        let dispatcher = Dispatcher::new(transport);
        let pool = Arc::new(SubgraphPool::new());
        let g = GraphStateMachine::new(
            dispatcher,
            pool,
            1,
            2,
            ProcDomain(0),
            ProcDomain(1),
            Timeouts::default(),
        );

        g.open(vec![SubgraphId(1), SubgraphId(2)], GraphKeyVector::default(), None)
            .unwrap();
        g.start().unwrap();
        g.stop(None).unwrap();
        assert_eq!(g.state(), GraphState::Stopped);

        sent_opcodes.lock().unwrap().clear();
        let plan = g
            .prepare_change(GraphKeyVector::default(), vec![SubgraphId(2), SubgraphId(3)])
            .unwrap();
        g.apply_change(plan, CalKeyVector::default(), None).unwrap();

        assert!(
            !sent_opcodes.lock().unwrap().contains(&Opcode::GraphStart),
            "a stopped graph must not be restarted by an RTGM change"
        );
    }

    #[test]
    fn repeated_generic_timeouts_trigger_a_local_restart() {
        struct SilentTransport;
        impl acdb_io::Transport for SilentTransport {
            fn send(&self, _packet: acdb_io::Packet) -> Result<()> {
                Ok(())
            }
            fn set_receive_handler(&self, _handler: Box<dyn Fn(Response) + Send + Sync>) {}
        }
        let dispatcher = Dispatcher::new(Arc::new(SilentTransport));
        let pool = Arc::new(SubgraphPool::new());
        let mut timeouts = Timeouts::default();
        timeouts.generic = Duration::from_millis(5);
        let g = GraphStateMachine::new(
            dispatcher,
            pool,
            1,
            2,
            ProcDomain(0),
            ProcDomain(1),
            timeouts,
        );

        for _ in 0..acdb_resilience::error_detection::MAX_TIMEOUTS_IN_PERIOD {
            let _ = g.set_config(TagId(0), Vec::new());
        }

        assert_eq!(g.state(), GraphState::ErrorAllowCleanup);
    }
}
