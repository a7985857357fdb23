//! Manually-reset signal primitive backing the three command groups: a
//! command's signal must be free before the matching command can be
//! issued, and is held busy until its reply (or an abort/SSR event)
//! arrives.

use std::sync::{Condvar, Mutex};

/// A single-slot gate: at most one command per group may be outstanding
/// at a time.
#[derive(Default)]
pub struct Signal {
    busy: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the signal is free, then marks it busy. Pairs with
    /// [`Signal::release`], which must be called once the command
    /// completes (success, timeout, abort, or SSR).
    pub fn acquire(&self) {
        let mut busy = self.busy.lock().expect("signal lock poisoned");
        while *busy {
            busy = self.cv.wait(busy).expect("signal condvar poisoned");
        }
        *busy = true;
    }

    pub fn release(&self) {
        *self.busy.lock().expect("signal lock poisoned") = false;
        self.cv.notify_all();
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().expect("signal lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_acquire_blocks_until_release() {
        let signal = Arc::new(Signal::new());
        signal.acquire();
        let s2 = signal.clone();
        let handle = std::thread::spawn(move || {
            s2.acquire();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        signal.release();
        handle.join().unwrap();
    }
}
