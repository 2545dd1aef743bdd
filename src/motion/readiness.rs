//! Device readiness tracking.
//!
//! The device is ready when no motor move task is outstanding and no centring
//! procedure is running. The state lives in a `watch` channel so observers can
//! subscribe; the blocking wait itself polls at a fixed interval.

use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of what currently keeps the device busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessState {
    /// Motor move tasks that have not completed yet.
    pub moves_outstanding: usize,
    /// True while a centring procedure task is in flight.
    pub centring_running: bool,
}

impl ReadinessState {
    /// True when nothing is outstanding.
    pub fn is_idle(&self) -> bool {
        self.moves_outstanding == 0 && !self.centring_running
    }
}

/// Shared readiness state.
#[derive(Debug)]
pub struct Readiness {
    sender: watch::Sender<ReadinessState>,
}

impl Default for Readiness {
    fn default() -> Self {
        let (sender, _) = watch::channel(ReadinessState::default());
        Self { sender }
    }
}

impl Readiness {
    /// Fresh, idle readiness state.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current state.
    pub fn state(&self) -> ReadinessState {
        *self.sender.borrow()
    }

    /// Subscribe to readiness changes.
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.sender.subscribe()
    }

    /// Register an outstanding move. The returned guard releases it on drop, so an
    /// aborted or panicking move task still releases readiness.
    pub fn begin_move(self: &Arc<Self>) -> MoveGuard {
        self.sender
            .send_modify(|state| state.moves_outstanding += 1);
        MoveGuard {
            readiness: Arc::clone(self),
        }
    }

    /// Mark a centring procedure as started or finished.
    pub fn set_centring_running(&self, running: bool) {
        self.sender
            .send_if_modified(|state| {
                let changed = state.centring_running != running;
                state.centring_running = running;
                changed
            });
    }
}

/// Releases one outstanding move when dropped.
#[derive(Debug)]
pub struct MoveGuard {
    readiness: Arc<Readiness>,
}

impl Drop for MoveGuard {
    fn drop(&mut self) {
        self.readiness.sender.send_modify(|state| {
            state.moves_outstanding = state.moves_outstanding.saturating_sub(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let readiness = Readiness::new();
        let first = readiness.begin_move();
        let second = readiness.begin_move();
        assert_eq!(readiness.state().moves_outstanding, 2);
        assert!(!readiness.state().is_idle());

        drop(first);
        assert_eq!(readiness.state().moves_outstanding, 1);
        drop(second);
        assert!(readiness.state().is_idle());
    }

    #[test]
    fn test_centring_flag() {
        let readiness = Readiness::new();
        readiness.set_centring_running(true);
        assert!(!readiness.state().is_idle());
        readiness.set_centring_running(false);
        assert!(readiness.state().is_idle());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let readiness = Readiness::new();
        let mut rx = readiness.subscribe();
        let guard = readiness.begin_move();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().moves_outstanding, 1);
        drop(guard);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_idle());
    }
}
