//! Shared data model, chunked file reader, and key-vector resolver for the
//! audio calibration runtime.
//!
//! This crate has no knowledge of transport, shared memory, or graph
//! lifecycle — it answers one question: given bytes that look like an ACDB
//! database, what do they say. Everything that acts on the answer (the
//! registry, the graph pool, the dispatcher) lives in the crates above
//! this one in the workspace.

pub mod chunked;
pub mod error;
pub mod model;
pub mod resolver;

pub use chunked::{ChunkError, ChunkedFile};
pub use error::{AcdbError, Result};
pub use model::{
    CalKeyVector, Guid, GraphKeyVector, KeyValue, KeyVector, ModuleInstance, ProcDomain,
    SubgraphConnection, SubgraphDef, SubgraphId, TagId, TagKeyVector, Token, WILDCARD_VALUE,
};
pub use resolver::{CalRecord, GraphDef, PersistCalIds, Resolver};
