//! Drives a full open → start → write → close graph lifecycle against an
//! in-process loopback transport, for exercising the runtime without real
//! satellite hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use acdb_core::{GraphKeyVector, ProcDomain};
use acdb_graph::{GraphStateMachine, SubgraphPool, Timeouts};
use acdb_io::{DataPathEngine, Dispatcher, MockTransport, Response, ResponseStatus, TransferMode};
use clap::Args;

use super::common::parse_sg_ids;

#[derive(Args)]
pub struct SimulateArgs {
    /// Comma-separated subgraph IDs to open.
    #[arg(long, value_parser = parse_sg_ids, default_value = "1,2")]
    sg_ids: Vec<acdb_core::SubgraphId>,

    /// Number of shared-memory buffers in the data path.
    #[arg(long, default_value_t = 4)]
    num_buffs: usize,

    /// Number of buffer write cycles to run before closing.
    #[arg(long, default_value_t = 8)]
    iterations: usize,

    /// Bytes to stage per buffer.
    #[arg(long, default_value_t = 4096)]
    buffer_size: usize,
}

pub fn run(args: SimulateArgs) -> anyhow::Result<()> {
    let transport = Arc::new(MockTransport::new(|packet| Response {
        token: packet.token,
        status: ResponseStatus::Ok,
        payload: Vec::new(),
    }));
    let dispatcher = Dispatcher::new(transport);
    let pool = Arc::new(SubgraphPool::new());
    let graph = Arc::new(GraphStateMachine::new(
        dispatcher,
        pool,
        1,
        2,
        ProcDomain(0),
        ProcDomain(1),
        Timeouts::default(),
    ));

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nstopping...");
        r.store(false, Ordering::SeqCst);
    })?;

    println!("opening {:?}", args.sg_ids);
    graph.open(args.sg_ids.clone(), GraphKeyVector::default(), None)?;
    graph.start()?;
    println!("started");

    let engine = DataPathEngine::new(TransferMode::Blocking, args.num_buffs, 0)?;
    engine.configure_read();

    let written = Arc::new(AtomicUsize::new(0));
    for i in 0..args.iterations {
        if !running.load(Ordering::SeqCst) {
            println!("interrupted after {i} iterations");
            break;
        }
        let token = engine.acquire_buffer()?;
        let data = vec![0u8; args.buffer_size];
        engine.stage_write(token.buffer_index as usize, &data)?;
        let staged = engine.read_staged(token.buffer_index as usize)?;
        engine.release_buffer(token);
        written.fetch_add(staged.len(), Ordering::SeqCst);
    }

    println!(
        "wrote {} bytes across {} iterations",
        written.load(Ordering::SeqCst),
        args.iterations
    );

    graph.close()?;
    println!("closed, state = {:?}", graph.state());

    Ok(())
}
