//! Data-path engine (C7): moves PCM/encoded buffers to and from a
//! satellite under one of four transfer modes, tracking an availability
//! bitmask of up to `num_buffs` engine-owned buffers.
//!
//! Buffer counts are bounded to `1..=32` since the availability mask is a
//! single `u32`; an out-of-range count is rejected at construction rather
//! than surfacing as a confusing timeout or resource error later.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use acdb_core::{AcdbError, Result, Token};

/// One of the four transfer modes selectable in the read/write
/// configuration. `PushPull` is modeled as a distinct mode but its
/// two dedicated pages are out of scope for this workspace's buffer
/// bookkeeping — it carries no metadata and is tracked only as a
/// configuration choice client code can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Engine pre-allocates N buffers; client uses the engine's own
    /// pointers, returned by the buff-info queries.
    Shmem,
    /// Engine pre-allocates N shmem buffers; client passes its own bytes;
    /// engine copies in/out and blocks on availability.
    Blocking,
    /// As `Blocking` but returns `NoResource` instead of blocking when no
    /// buffer is free.
    NonBlocking,
    /// Client provides its own allocations, mapped on demand via the
    /// external-memory cache (C8).
    ExternMem,
    /// Two dedicated pages (data + position), no metadata, for very
    /// low-overhead streaming.
    PushPull,
}

/// Render outcome surfaced to the client when an EOS event completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Rendered,
    Dropped,
}

struct State {
    /// Bit `i` set means buffer `i` is currently in flight.
    buff_used_status: u32,
    curr_buff_index: usize,
    metadata_queue: VecDeque<Vec<u8>>,
}

/// Bookkeeping for one configured read or write direction. `num_buffs`
/// must be `<= 32` since the availability mask is a single `u32`.
pub struct DataPathEngine {
    mode: TransferMode,
    num_buffs: usize,
    max_metadata_size: usize,
    buffers: Vec<Mutex<Vec<u8>>>,
    state: Mutex<State>,
    buffer_freed: Condvar,
}

impl DataPathEngine {
    pub fn new(mode: TransferMode, num_buffs: usize, max_metadata_size: usize) -> Result<Self> {
        if num_buffs == 0 {
            return Err(AcdbError::BadParam("num_buffs must be at least 1".into()));
        }
        if num_buffs > 32 {
            return Err(AcdbError::BadParam(
                "num_buffs must be at most 32, the availability bitmask only covers 32 buffers".into(),
            ));
        }
        Ok(Self {
            mode,
            num_buffs,
            max_metadata_size,
            buffers: (0..num_buffs).map(|_| Mutex::new(Vec::new())).collect(),
            state: Mutex::new(State {
                buff_used_status: 0,
                curr_buff_index: 0,
                metadata_queue: VecDeque::with_capacity(num_buffs * 2),
            }),
            buffer_freed: Condvar::new(),
        })
    }

    pub fn mode(&self) -> TransferMode {
        self.mode
    }

    /// Read kick-start: on first configure of a heap-backed read path,
    /// every allocated buffer is considered already pushed to the
    /// satellite so responses can flow before any client `read` call.
    pub fn configure_read(&self) {
        let mut state = self.state.lock().expect("datapath lock poisoned");
        state.buff_used_status = if self.num_buffs == 32 {
            u32::MAX
        } else {
            (1u32 << self.num_buffs) - 1
        };
    }

    /// Claims the next free buffer by round-robin index, per the
    /// `curr_buff_index` rule. `Blocking` mode waits for one to free up;
    /// `NonBlocking` fails immediately with `NoResource`; `Shmem` and
    /// `ExternMem` don't route through this bookkeeping at all (their
    /// buffers are either fully client-managed or pre-published).
    pub fn acquire_buffer(&self) -> Result<Token> {
        match self.mode {
            TransferMode::Shmem | TransferMode::ExternMem | TransferMode::PushPull => {
                return Err(AcdbError::Unsupported(
                    "acquire_buffer only applies to Blocking/NonBlocking modes".into(),
                ));
            }
            TransferMode::Blocking | TransferMode::NonBlocking => {}
        }

        let mut state = self.state.lock().expect("datapath lock poisoned");
        loop {
            if let Some(index) = self.find_free(&state) {
                state.buff_used_status |= 1 << index;
                state.curr_buff_index = (index + 1) % self.num_buffs;
                return Ok(Token::new(index as u16, 0));
            }
            match self.mode {
                TransferMode::NonBlocking => return Err(AcdbError::NoResource),
                _ => {
                    let (guard, timeout) = self
                        .buffer_freed
                        .wait_timeout(state, Duration::from_secs(5))
                        .expect("datapath condvar poisoned");
                    state = guard;
                    if timeout.timed_out() && self.find_free(&state).is_none() {
                        return Err(AcdbError::Timeout);
                    }
                }
            }
        }
    }

    fn find_free(&self, state: &State) -> Option<usize> {
        (0..self.num_buffs)
            .map(|offset| (state.curr_buff_index + offset) % self.num_buffs)
            .find(|&i| state.buff_used_status & (1 << i) == 0)
    }

    /// Marks `token`'s buffer index free again. Responses whose token
    /// does not correspond to a currently-in-flight buffer are ignored
    /// (already released, or never acquired through this engine).
    pub fn release_buffer(&self, token: Token) {
        let index = token.buffer_index as usize;
        if index >= self.num_buffs {
            return;
        }
        let mut state = self.state.lock().expect("datapath lock poisoned");
        state.buff_used_status &= !(1 << index);
        drop(state);
        self.buffer_freed.notify_all();
    }

    /// Copies `data` into a claimed engine buffer (`Blocking`/`NonBlocking`
    /// modes only) for later hand-off to the dispatcher.
    pub fn stage_write(&self, index: usize, data: &[u8]) -> Result<()> {
        let mut buf = self.buffers.get(index).ok_or(AcdbError::BadParam(format!(
            "buffer index {index} out of range"
        )))?.lock().expect("buffer lock poisoned");
        buf.clear();
        buf.extend_from_slice(data);
        Ok(())
    }

    pub fn read_staged(&self, index: usize) -> Result<Vec<u8>> {
        let buf = self.buffers.get(index).ok_or(AcdbError::BadParam(format!(
            "buffer index {index} out of range"
        )))?.lock().expect("buffer lock poisoned");
        Ok(buf.clone())
    }

    /// Pushes a metadata blob, in-band when it fits within the supplied
    /// packet budget, otherwise out-of-band via the metadata queue. The
    /// queue is capped at `2 * num_buffs` entries.
    pub fn push_metadata(&self, blob: Vec<u8>, packet_budget: usize) -> Result<MetadataPlacement> {
        if self.max_metadata_size == 0 {
            return Err(AcdbError::Unsupported("metadata not configured".into()));
        }
        if blob.len() > self.max_metadata_size {
            return Err(AcdbError::BadParam("metadata exceeds configured max size".into()));
        }
        if blob.len() <= packet_budget {
            return Ok(MetadataPlacement::InBand(blob));
        }
        let mut state = self.state.lock().expect("datapath lock poisoned");
        if state.metadata_queue.len() >= self.num_buffs * 2 {
            return Err(AcdbError::NoResource);
        }
        state.metadata_queue.push_back(blob);
        Ok(MetadataPlacement::OutOfBand)
    }

    /// Pops the oldest queued out-of-band metadata blob, correlated by
    /// FIFO order with data completion.
    pub fn pop_metadata(&self) -> Option<Vec<u8>> {
        self.state
            .lock()
            .expect("datapath lock poisoned")
            .metadata_queue
            .pop_front()
    }

    /// On write, if the client's buffer carries the EOS flag, the engine
    /// issues a dedicated EOS packet after the last write; the eventual
    /// render outcome is surfaced to the client through this mapping.
    pub fn eos_render_status(satellite_dropped: bool) -> RenderStatus {
        if satellite_dropped {
            RenderStatus::Dropped
        } else {
            RenderStatus::Rendered
        }
    }
}

/// Where a metadata blob was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataPlacement {
    InBand(Vec<u8>),
    OutOfBand,
}
