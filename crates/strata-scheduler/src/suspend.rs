use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::{CancellationToken, Cancelled};

#[derive(Debug, Default)]
struct SuspendState {
    suspended: Mutex<bool>,
    resumed: Condvar,
}

/// Cooperative pause flag shared between a controller and background workers.
///
/// Workers call [`SuspendSignal::park_while_suspended`] before each unit of work. A
/// signal built with [`SuspendSignal::unsupported`] never parks and reports that it
/// cannot pause, which disables concurrent prefetch.
#[derive(Debug, Clone)]
pub struct SuspendSignal {
    state: Option<Arc<SuspendState>>,
}

impl Default for SuspendSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendSignal {
    pub fn new() -> Self {
        Self {
            state: Some(Arc::new(SuspendState::default())),
        }
    }

    pub fn unsupported() -> Self {
        Self { state: None }
    }

    pub fn supports_suspend(&self) -> bool {
        self.state.is_some()
    }

    pub fn suspend(&self) {
        if let Some(state) = &self.state {
            *state.suspended.lock() = true;
        }
    }

    pub fn resume(&self) {
        if let Some(state) = &self.state {
            *state.suspended.lock() = false;
            state.resumed.notify_all();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| *state.suspended.lock())
    }

    /// Block while suspended. Wakes periodically to observe `token`.
    pub fn park_while_suspended(&self, token: &CancellationToken) -> Result<(), Cancelled> {
        let Some(state) = &self.state else {
            return Cancelled::check(token);
        };
        let mut suspended = state.suspended.lock();
        while *suspended {
            Cancelled::check(token)?;
            state
                .resumed
                .wait_for(&mut suspended, Duration::from_millis(50));
        }
        drop(suspended);
        Cancelled::check(token)
    }
}
