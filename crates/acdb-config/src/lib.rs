//! On-disk runtime configuration for the audio calibration and
//! graph-services runtime: which databases to register at startup, the
//! writable directory for delta persistence, per-opcode timeouts, external-
//! mem cache sizing, and log level.

pub mod config;
pub mod error;
pub mod paths;

pub use config::{DatabaseEntry, RuntimeConfig, TimeoutsMs};
pub use error::ConfigError;
