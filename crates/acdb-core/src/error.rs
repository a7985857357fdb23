//! The logical error codes shared across every crate in this workspace.
//!
//! `EOK` is not a variant here; success is `Ok(())` / `Ok(value)` as usual
//! in Rust.

use thiserror::Error;

/// Errors returned by the ACDB runtime.
///
/// Every crate in the workspace re-exports [`Result`] built on this single
/// error type.
#[derive(Debug, Error)]
pub enum AcdbError {
    /// Structural failure (database corruption, allocation failure that
    /// can't be attributed to a more specific cause).
    #[error("operation failed")]
    Failed,

    /// Caller passed an invalid argument, or a sequence of bytes violates a
    /// format invariant (chunk directory corrupt, cursor overflow, etc).
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// A handle (graph, database, shmem allocation, cache entry) does not
    /// refer to a live object.
    #[error("invalid handle")]
    Handle,

    /// Allocation failure.
    #[error("out of memory")]
    NoMemory,

    /// No resource is currently available to satisfy the request (no free
    /// data-path buffer, external-mem cache full with everything in flight).
    #[error("no resource available")]
    NoResource,

    /// The requested operation or mode is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A command did not receive a response within its configured timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// Malformed or truncated I/O data.
    #[error("I/O data error")]
    IoData,

    /// The wait was cancelled by a client-side close.
    #[error("operation aborted")]
    Aborted,

    /// The wait was cancelled by a subsystem restart.
    #[error("subsystem reset")]
    SubsysReset,

    /// A two-call size-negotiation query needs a larger buffer; the required
    /// size is reported back through the call's own out-parameter, not this
    /// variant, which exists for call sites that only need the outcome.
    #[error("caller-provided buffer is too small, {needed} bytes required")]
    NeedMore {
        /// The size the caller must provide on a retry.
        needed: usize,
    },

    /// The operation is a redundant no-op (e.g. re-applying the same CKV);
    /// callers typically treat this as success.
    #[error("already in the requested state")]
    Already,

    /// The referenced object (chunk, subgraph, tag, cal ID) does not exist.
    #[error("does not exist")]
    NotExist,

    /// A command was rejected by the satellite as a duplicate of one
    /// already outstanding.
    #[error("duplicate command")]
    Duplicate,

    /// The object exists but is not in a state that allows the operation
    /// (e.g. read/write before a data-path reconfigure).
    #[error("not ready")]
    NotReady,

    /// Wrapped I/O error from loading a database or writable-directory file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, AcdbError>;
