//! Packet/command dispatcher (C9): builds wire packets, tracks the token
//! each send is waiting on, and classifies the eventual outcome against
//! close/SSR signals and the opcode's timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use acdb_core::{AcdbError, ProcDomain, Result, Token};

use crate::opcode::Opcode;
use crate::packet::{Packet, Response, ResponseStatus};
use crate::transport::Transport;

/// How often the wait loop re-checks the close/SSR signals while waiting
/// for a response or for the opcode timeout to elapse.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Description of one outgoing command, everything [`Dispatcher::send_command`]
/// needs besides the timeout and cancellation signals.
pub struct CommandRequest {
    pub opcode: Opcode,
    pub src_port: u32,
    pub dst_port: u32,
    pub src_domain: ProcDomain,
    pub dst_domain: ProcDomain,
    /// Data-path buffer index packed into the low 12 bits of the token;
    /// `0` for non-data-path commands.
    pub buffer_index: u16,
    pub payload: Vec<u8>,
}

/// Builds packets and classifies their responses for one transport. One
/// dispatcher instance is shared by every graph using that transport.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u32, mpsc::Sender<Response>>>,
    debug_counter: AtomicU32,
}

impl Dispatcher {
    /// Wraps `transport`, registering this dispatcher's own receive
    /// handler. The returned `Arc` must be kept alive for as long as
    /// responses are expected — the handler only runs while it exists.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            transport: transport.clone(),
            pending: Mutex::new(HashMap::new()),
            debug_counter: AtomicU32::new(0),
        });
        let weak = Arc::downgrade(&dispatcher);
        transport.set_receive_handler(Box::new(move |response| {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_response(response);
            }
        }));
        dispatcher
    }

    fn on_response(&self, response: Response) {
        let raw = response.token.encode();
        let sender = self.pending.lock().expect("dispatcher lock poisoned").remove(&raw);
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::warn!(token = raw, "late duplicate response, dropping");
            }
        }
    }

    /// Sends `request` and waits up to `timeout` for its response,
    /// returning early with `ABORTED`/`SUBSYS_RESET` if `close_signal` /
    /// `ssr_signal` become set first. A transport-level send failure
    /// propagates immediately with no retry at this layer — callers that
    /// need to escalate repeated timeouts to a forced restart do so by
    /// feeding this method's `Err` results into an error-detection engine
    /// of their own.
    pub fn send_command(
        &self,
        request: CommandRequest,
        timeout: Duration,
        close_signal: &AtomicBool,
        ssr_signal: &AtomicBool,
    ) -> Result<Response> {
        let debug = self.debug_counter.fetch_add(1, Ordering::Relaxed);
        let token = Token::new(request.buffer_index, debug);
        let raw_token = token.encode();

        let packet = Packet {
            src_port: request.src_port,
            dst_port: request.dst_port,
            src_domain: request.src_domain,
            dst_domain: request.dst_domain,
            opcode: request.opcode,
            token,
            payload: request.payload,
        };

        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .expect("dispatcher lock poisoned")
            .insert(raw_token, tx);

        tracing::debug!(opcode = ?packet.opcode, token = raw_token, "sending command");

        if let Err(e) = self.transport.send(packet) {
            self.pending.lock().expect("dispatcher lock poisoned").remove(&raw_token);
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if close_signal.load(Ordering::SeqCst) {
                self.pending.lock().expect("dispatcher lock poisoned").remove(&raw_token);
                return Err(AcdbError::Aborted);
            }
            if ssr_signal.load(Ordering::SeqCst) {
                self.pending.lock().expect("dispatcher lock poisoned").remove(&raw_token);
                return Err(AcdbError::SubsysReset);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.pending.lock().expect("dispatcher lock poisoned").remove(&raw_token);
                tracing::warn!(opcode = ?request.opcode, token = raw_token, "command timed out");
                return Err(AcdbError::Timeout);
            }
            match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
                Ok(response) => {
                    tracing::debug!(token = raw_token, status = ?response.status, "command completed");
                    return match response.status {
                        ResponseStatus::Ok => Ok(response),
                        ResponseStatus::Failed => Err(AcdbError::Failed),
                    };
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(AcdbError::Failed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn req(opcode: Opcode) -> CommandRequest {
        CommandRequest {
            opcode,
            src_port: 1,
            dst_port: 2,
            src_domain: ProcDomain(0),
            dst_domain: ProcDomain(1),
            buffer_index: 0,
            payload: Vec::new(),
        }
    }

    #[test]
    fn successful_round_trip() {
        let transport = Arc::new(MockTransport::echoing());
        let dispatcher = Dispatcher::new(transport);
        let close = AtomicBool::new(false);
        let ssr = AtomicBool::new(false);
        let resp = dispatcher
            .send_command(req(Opcode::GraphOpen), Duration::from_millis(200), &close, &ssr)
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
    }

    #[test]
    fn close_signal_aborts_wait() {
        let transport = Arc::new(MockTransport::new(|_| {
            // never respond
            std::thread::sleep(Duration::from_secs(10));
            Response {
                token: Token::new(0, 0),
                status: ResponseStatus::Ok,
                payload: Vec::new(),
            }
        }));
        let dispatcher = Dispatcher::new(transport);
        let close = Arc::new(AtomicBool::new(false));
        let ssr = AtomicBool::new(false);
        let close_clone = close.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            close_clone.store(true, Ordering::SeqCst);
        });
        let err = dispatcher
            .send_command(req(Opcode::GraphStart), Duration::from_secs(5), &close, &ssr)
            .unwrap_err();
        assert!(matches!(err, AcdbError::Aborted));
    }

    #[test]
    fn transport_failure_propagates_without_retry() {
        let transport = Arc::new(MockTransport::echoing());
        transport.set_fail_sends(true);
        let dispatcher = Dispatcher::new(transport);
        let close = AtomicBool::new(false);
        let ssr = AtomicBool::new(false);
        let err = dispatcher
            .send_command(req(Opcode::SetCfg), Duration::from_millis(50), &close, &ssr)
            .unwrap_err();
        assert!(matches!(err, AcdbError::Failed));
    }

    #[test]
    fn timeout_when_no_response_arrives() {
        struct SilentTransport;
        impl Transport for SilentTransport {
            fn send(&self, _packet: Packet) -> Result<()> {
                Ok(())
            }
            fn set_receive_handler(&self, _handler: Box<dyn Fn(Response) + Send + Sync>) {}
        }
        let dispatcher = Dispatcher::new(Arc::new(SilentTransport));
        let close = AtomicBool::new(false);
        let ssr = AtomicBool::new(false);
        let err = dispatcher
            .send_command(req(Opcode::GraphStop), Duration::from_millis(30), &close, &ssr)
            .unwrap_err();
        assert!(matches!(err, AcdbError::Timeout));
    }
}
