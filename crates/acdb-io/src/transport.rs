//! The wire transport collaborator (a packet router living outside this
//! workspace) is modeled as a trait so the dispatcher can be driven by a
//! real transport in production and by an in-memory loopback in tests.

use std::sync::Mutex;

use acdb_core::{AcdbError, Result};

use crate::packet::{Packet, Response};

/// Anything that can carry packets to a satellite and deliver its
/// responses back. Implementations must be safe to share across the
/// dispatcher's callback threads.
pub trait Transport: Send + Sync {
    /// Sends `packet`. A transport-level failure (not a timeout, not a
    /// satellite-reported error) is surfaced immediately with no retry at
    /// this layer.
    fn send(&self, packet: Packet) -> Result<()>;

    /// Registers the callback the transport invokes for every response it
    /// receives, replacing any previously registered callback.
    fn set_receive_handler(&self, handler: Box<dyn Fn(Response) + Send + Sync>);
}

/// Test-only loopback transport: `send` immediately hands the packet to a
/// configurable responder closure and delivers the resulting [`Response`]
/// to the registered receive handler, synchronously, on the calling
/// thread.
pub struct MockTransport {
    responder: Box<dyn Fn(&Packet) -> Response + Send + Sync>,
    handler: Mutex<Option<Box<dyn Fn(Response) + Send + Sync>>>,
    /// When set, `send` fails immediately instead of invoking the
    /// responder, for exercising the no-retry-on-transport-failure path.
    fail_sends: Mutex<bool>,
}

impl MockTransport {
    pub fn new(responder: impl Fn(&Packet) -> Response + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            handler: Mutex::new(None),
            fail_sends: Mutex::new(false),
        }
    }

    /// An echo transport: every packet gets an `Ok` response with an empty
    /// payload, used by tests that only care about command sequencing.
    pub fn echoing() -> Self {
        Self::new(|packet| Response {
            token: packet.token,
            status: crate::packet::ResponseStatus::Ok,
            payload: Vec::new(),
        })
    }

    /// Makes every subsequent `send` fail with a transport error, until
    /// called again with `false`.
    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().expect("mock transport lock poisoned") = fail;
    }
}

impl Transport for MockTransport {
    fn send(&self, packet: Packet) -> Result<()> {
        if *self.fail_sends.lock().expect("mock transport lock poisoned") {
            return Err(AcdbError::Failed);
        }
        let response = (self.responder)(&packet);
        let handler = self.handler.lock().expect("mock transport lock poisoned");
        if let Some(handler) = handler.as_ref() {
            handler(response);
        }
        Ok(())
    }

    fn set_receive_handler(&self, handler: Box<dyn Fn(Response) + Send + Sync>) {
        *self.handler.lock().expect("mock transport lock poisoned") = Some(handler);
    }
}
