//! Wire opcode enumeration. Numeric assignments are illustrative
//! placeholders for the ones the real transport fixes; what matters here is
//! that the set is closed and every command site names one of these
//! variants rather than a bare integer.

/// A command opcode exchanged with a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Opcode {
    GraphOpen,
    GraphPrepare,
    GraphStart,
    GraphStop,
    GraphFlush,
    GraphClose,
    SetCfg,
    GetCfg,
    RegisterCfg,
    DeregisterCfg,
    RegisterModuleEvents,
    WrDataBufferV2,
    RdDataBufferV2,
    WrEos,
    WrMediaFormat,
    /// Referenced by the wire protocol but not otherwise interpreted by
    /// this runtime.
    GetSpfState,
    /// Referenced by the wire protocol but not otherwise interpreted by
    /// this runtime.
    RequestHwRsc,
    /// Referenced by the wire protocol but not otherwise interpreted by
    /// this runtime.
    ReleaseHwRsc,
}

impl Opcode {
    /// Which signal group serializes this opcode. `None` for
    /// opcodes outside the graph state machine's own command surface
    /// (data-path and uninterpreted opcodes).
    pub fn signal_group(self) -> Option<SignalGroup> {
        use Opcode::*;
        match self {
            GraphOpen | GraphPrepare | GraphStart | GraphStop => Some(SignalGroup::Group1),
            SetCfg | RegisterCfg | GraphFlush | RegisterModuleEvents => Some(SignalGroup::Group2),
            GraphClose => Some(SignalGroup::Group3),
            _ => None,
        }
    }

    /// Whether a timeout on this opcode is immediately fatal (forces a
    /// restart) rather than feeding the error-detection rolling counter.
    pub fn timeout_is_fatal(self) -> bool {
        matches!(self, Opcode::GraphOpen | Opcode::GraphClose)
    }
}

/// The three command serialization groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalGroup {
    /// OPEN, PREPARE, START, STOP, CONFIG_R/W — serialized per graph.
    Group1,
    /// SET_CFG, REGISTER_CFG, FLUSH, REGISTER_MODULE_EVENTS — serialized
    /// per graph.
    Group2,
    /// CLOSE — always permitted, even if Group 1 is believed stuck.
    Group3,
}
