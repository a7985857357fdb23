//! Data-path engine (C7) and packet/command dispatcher (C9): everything
//! that moves bytes or commands across the wire to a satellite.

pub mod datapath;
pub mod dispatcher;
pub mod opcode;
pub mod packet;
pub mod transport;

pub use datapath::{DataPathEngine, MetadataPlacement, RenderStatus, TransferMode};
pub use dispatcher::{CommandRequest, Dispatcher};
pub use opcode::{Opcode, SignalGroup};
pub use packet::{Packet, Response, ResponseStatus};
pub use transport::{MockTransport, Transport};
