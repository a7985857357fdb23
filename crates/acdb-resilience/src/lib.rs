//! Error-detection engine (C10) and SSR coordinator (C11): the resilience
//! layer that decides when to restart a processor domain and fans out
//! up/down notifications to the graph runtime.

pub mod error_detection;
pub mod servreg;

pub use error_detection::{
    Decision, ErrorDetector, ErrorEvent, ACCUMULATION_PERIOD, MAX_DUPLICATE_IN_PERIOD,
    MAX_TIMEOUTS_IN_PERIOD, MIN_TIME_ANY_RESTART_MS, MIN_TIME_EDUPLICATE_RESTART_MS,
};
pub use servreg::{DownEffect, ServregListener, SsrCoordinator};
