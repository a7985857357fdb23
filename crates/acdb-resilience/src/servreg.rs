//! SSR coordinator (C11): tracks per-subsystem up/down state and fans the
//! notification out to every graph signal plus an upper-layer callback
//! that flips graph lifecycle state.

use std::collections::HashMap;
use std::sync::Mutex;

use acdb_core::ProcDomain;

/// Collaborator abstraction for the process-domain service registry
/// (this crate only consumes its up/down notifications, it does not
/// implement one). A production binary wires a real servreg client here;
/// tests use an in-process stand-in that calls `notify_down`/`notify_up`
/// directly.
pub trait ServregListener: Send + Sync {
    /// Registers interest in `domain`'s up/down notifications.
    fn register(&self, domain: ProcDomain);
}

/// How the upper layer should react to a subsystem going down, mirroring
/// the master-down vs satellite-down distinction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownEffect {
    /// The master processor domain went down: graphs move to `Error`.
    MasterDown,
    /// A satellite domain went down: graphs move to `ErrorAllowCleanup`,
    /// since the master can still drive an orderly teardown.
    SatelliteDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubsysState {
    Up,
    Down,
}

/// Tracks `ss_supported_flags`/`ss_state_flags` for one master's set of
/// subsystems, and drives the up/down callback fan-out.
pub struct SsrCoordinator {
    master: ProcDomain,
    state: Mutex<HashMap<ProcDomain, SubsysState>>,
}

impl SsrCoordinator {
    pub fn new(master: ProcDomain, supported: &[ProcDomain]) -> Self {
        let mut map = HashMap::new();
        for domain in supported {
            map.insert(*domain, SubsysState::Up);
        }
        Self {
            master,
            state: Mutex::new(map),
        }
    }

    /// Reports `domain` down, invoking `on_down` with the right
    /// [`DownEffect`] for every currently-registered graph the caller
    /// passes along. For a dynamic satellite, a down event on it is also
    /// reported to the caller so it can trigger a servreg-initiated
    /// master restart — that escalation is the caller's responsibility,
    /// signaled by the returned `bool`.
    pub fn notify_down(&self, domain: ProcDomain, mut on_down: impl FnMut(DownEffect)) -> bool {
        let mut state = self.state.lock().expect("ssr lock poisoned");
        state.insert(domain, SubsysState::Down);
        let effect = if domain == self.master {
            DownEffect::MasterDown
        } else {
            DownEffect::SatelliteDown
        };
        tracing::warn!(proc_domain = domain.0, ?effect, "subsystem down");
        on_down(effect);
        effect == DownEffect::SatelliteDown
    }

    /// Reports `domain` up. The caller is responsible for scheduling
    /// shmem re-map and bootup-module reload on the graph's next open —
    /// this only clears the tracked state.
    pub fn notify_up(&self, domain: ProcDomain) {
        let mut state = self.state.lock().expect("ssr lock poisoned");
        state.insert(domain, SubsysState::Up);
        tracing::info!(proc_domain = domain.0, "subsystem up");
    }

    pub fn is_down(&self, domain: ProcDomain) -> bool {
        self.state
            .lock()
            .expect("ssr lock poisoned")
            .get(&domain)
            .is_some_and(|s| *s == SubsysState::Down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_down_reports_master_effect() {
        let master = ProcDomain(0);
        let sat = ProcDomain(1);
        let coord = SsrCoordinator::new(master, &[master, sat]);
        let mut seen = None;
        coord.notify_down(master, |effect| seen = Some(effect));
        assert_eq!(seen, Some(DownEffect::MasterDown));
    }

    #[test]
    fn satellite_down_reports_satellite_effect_and_escalates() {
        let master = ProcDomain(0);
        let sat = ProcDomain(1);
        let coord = SsrCoordinator::new(master, &[master, sat]);
        let mut seen = None;
        let escalate = coord.notify_down(sat, |effect| seen = Some(effect));
        assert_eq!(seen, Some(DownEffect::SatelliteDown));
        assert!(escalate);
    }

    #[test]
    fn notify_up_clears_down_state() {
        let master = ProcDomain(0);
        let coord = SsrCoordinator::new(master, &[master]);
        coord.notify_down(master, |_| {});
        assert!(coord.is_down(master));
        coord.notify_up(master);
        assert!(!coord.is_down(master));
    }
}
