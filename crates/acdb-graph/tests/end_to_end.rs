//! End-to-end scenarios driven against a [`MockTransport`], exercising the
//! graph pool, lifecycle, and RTGM together the way a real client would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use acdb_core::{CalKeyVector, GraphKeyVector, KeyValue, ProcDomain, SubgraphId};
use acdb_graph::{GraphStateMachine, SubgraphPool, Timeouts};
use acdb_io::{Dispatcher, MockTransport, Response, ResponseStatus};

fn graph_with_pool(pool: Arc<SubgraphPool>) -> Arc<GraphStateMachine> {
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

/// Scenario 1: open + stream + close leaves pool refcounts at 0.
#[test]
fn open_stream_close() {
    let pool = Arc::new(SubgraphPool::new());
    let graph = graph_with_pool(pool.clone());
    let gkv = GraphKeyVector::new(vec![KeyValue::new(10, 100), KeyValue::new(11, 1)]);
    let sg_ids = vec![SubgraphId(0x1001), SubgraphId(0x1002)];

    graph.open(sg_ids.clone(), gkv, Some(CalKeyVector::default())).unwrap();
    assert_eq!(pool.open_refcount(SubgraphId(0x1001)), 1);
    assert_eq!(pool.open_refcount(SubgraphId(0x1002)), 1);

    graph.start().unwrap();

    let engine = acdb_io::DataPathEngine::new(acdb_io::TransferMode::Blocking, 2, 0).unwrap();
    for _ in 0..3 {
        let token = engine.acquire_buffer().unwrap();
        engine.stage_write(token.buffer_index as usize, &[0u8; 4096]).unwrap();
        let written = engine.read_staged(token.buffer_index as usize).unwrap();
        assert_eq!(written.len(), 4096);
        engine.release_buffer(token);
    }

    graph.close().unwrap();
    assert_eq!(pool.open_refcount(SubgraphId(0x1001)), 0);
    assert_eq!(pool.open_refcount(SubgraphId(0x1002)), 0);
}

/// Scenario 2: a subgraph shared between two graphs is opened on the wire
/// exactly once and closed only when both graphs release it.
#[test]
fn shared_subgraph_open_once_close_last() {
    let pool = Arc::new(SubgraphPool::new());
    let open_sends = Arc::new(AtomicUsize::new(0));
    let open_sends_clone = open_sends.clone();

    let transport = Arc::new(MockTransport::new(move |packet| {
        if matches!(packet.opcode, acdb_io::Opcode::GraphOpen) {
            open_sends_clone.fetch_add(1, Ordering::SeqCst);
        }
        Response {
            token: packet.token,
            status: ResponseStatus::Ok,
            payload: Vec::new(),
        }
    }));
    let dispatcher = Dispatcher::new(transport);

    let graph_a = Arc::new(GraphStateMachine::new(
        dispatcher.clone(),
        pool.clone(),
        1,
        2,
        ProcDomain(0),
        ProcDomain(1),
        Timeouts::default(),
    ));
    let graph_b = Arc::new(GraphStateMachine::new(
        dispatcher,
        pool.clone(),
        3,
        4,
        ProcDomain(0),
        ProcDomain(1),
        Timeouts::default(),
    ));

    let shared = SubgraphId(0x2000);
    graph_a
        .open(vec![shared, SubgraphId(0x2001)], GraphKeyVector::default(), None)
        .unwrap();
    graph_b
        .open(vec![shared, SubgraphId(0x2002)], GraphKeyVector::default(), None)
        .unwrap();

    assert_eq!(pool.open_refcount(shared), 2);
    // Only graph_a's open of 0x2000 should have hit the wire.
    assert_eq!(open_sends.load(Ordering::SeqCst), 4); // {0x2000,0x2001} + {0x2002} (0x2000 shared once)

    graph_a.close().unwrap();
    assert_eq!(pool.open_refcount(shared), 1);

    graph_b.close().unwrap();
    assert_eq!(pool.open_refcount(shared), 0);
}

/// Scenario 3: an SSR DOWN on the master flips the graph to `Error` and
/// subsequent close succeeds locally without touching the wire's refcount
/// bookkeeping incorrectly.
#[test]
fn ssr_storm_flips_graph_to_error() {
    let pool = Arc::new(SubgraphPool::new());
    let graph = graph_with_pool(pool.clone());
    graph
        .open(vec![SubgraphId(1)], GraphKeyVector::default(), None)
        .unwrap();
    graph.start().unwrap();

    graph.on_subsystem_down(true);
    assert_eq!(graph.state(), acdb_graph::GraphState::Error);

    graph.close().unwrap();
    assert_eq!(graph.state(), acdb_graph::GraphState::Closed);
    assert_eq!(pool.open_refcount(SubgraphId(1)), 0);
}

/// Scenario 6: RTGM prepare-change closes only the removed subgraph; the
/// matching change-graph opens the added one, applies the new CKV, and
/// restarts the graph since it was running.
#[test]
fn rtgm_removes_c_adds_d_and_restarts() {
    let pool = Arc::new(SubgraphPool::new());
    let graph = graph_with_pool(pool.clone());

    let (a, b, c, d) = (SubgraphId(1), SubgraphId(2), SubgraphId(3), SubgraphId(4));
    let k1 = GraphKeyVector::new(vec![KeyValue::new(1, 1)]);
    let k2 = GraphKeyVector::new(vec![KeyValue::new(1, 2)]);

    graph.open(vec![a, b, c], k1, None).unwrap();
    graph.prepare().unwrap();
    graph.start().unwrap();

    let plan = graph.prepare_change(k2, vec![a, b, d]).unwrap();
    assert_eq!(plan.to_close, vec![c]);
    assert_eq!(plan.to_open, vec![d]);
    assert_eq!(pool.open_refcount(c), 0);

    graph
        .apply_change(plan, CalKeyVector::new(vec![KeyValue::new(2, 5)]), Some(vec![1, 2, 3]))
        .unwrap();

    assert_eq!(pool.open_refcount(a), 1);
    assert_eq!(pool.open_refcount(b), 1);
    assert_eq!(pool.open_refcount(c), 0);
    assert_eq!(pool.open_refcount(d), 1);
    assert_eq!(graph.state(), acdb_graph::GraphState::Started);
}
