//! Centring lifecycle events.
//!
//! [`StatusPublisher`] is a stateless emitter over a Tokio `broadcast` channel. Every
//! event carrying a status owns its own copy of the [`CentringStatus`] taken at
//! emission time, so a subscriber can never observe a record changing under it.
//!
//! ```text
//! DiffractometerActor --[CentringEvent]--> broadcast::channel ---> GUI / logging / tests
//! ```

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::centring::{CentringMethod, CentringStatus};

/// A lifecycle transition of the centring engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CentringEvent {
    /// A session began.
    Started {
        /// Variant being run.
        method: CentringMethod,
    },
    /// The procedure resolved a target and the sample is moving to it.
    Moving,
    /// The sample reached the centred position.
    Successful {
        /// Variant that produced the result.
        method: CentringMethod,
        /// Status snapshot at emission time.
        status: CentringStatus,
    },
    /// The session ended without a usable result.
    Failed {
        /// Variant that failed, if a session was active.
        method: Option<CentringMethod>,
        /// Status snapshot at emission time (always invalid).
        status: CentringStatus,
    },
    /// The user accepted or rejected the last result.
    Accepted {
        /// True on acceptance, false on rejection.
        accepted: bool,
        /// Status snapshot at emission time.
        status: CentringStatus,
    },
    /// Free-form progress text; empty clears the message.
    ProgressMessage(String),
}

impl CentringEvent {
    /// True for events that end a session (success, failure, accept/reject).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CentringEvent::Successful { .. }
                | CentringEvent::Failed { .. }
                | CentringEvent::Accepted { .. }
        )
    }
}

/// Emits [`CentringEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    sender: broadcast::Sender<CentringEvent>,
}

impl StatusPublisher {
    /// Create a publisher buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<CentringEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: CentringEvent) {
        debug!("Centring event: {:?}", event);
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// A session started.
    pub fn centring_started(&self, method: CentringMethod) {
        self.emit(CentringEvent::Started { method });
    }

    /// The sample is moving to the resolved target.
    pub fn centring_moving(&self) {
        self.emit(CentringEvent::Moving);
    }

    /// A session succeeded.
    pub fn centring_successful(&self, method: CentringMethod, status: &CentringStatus) {
        self.emit(CentringEvent::Successful {
            method,
            status: status.clone(),
        });
    }

    /// A session failed.
    pub fn centring_failed(&self, method: Option<CentringMethod>, status: &CentringStatus) {
        self.emit(CentringEvent::Failed {
            method,
            status: status.clone(),
        });
    }

    /// The last result was accepted or rejected.
    pub fn centring_accepted(&self, accepted: bool, status: &CentringStatus) {
        self.emit(CentringEvent::Accepted {
            accepted,
            status: status.clone(),
        });
    }

    /// Update the progress message.
    pub fn progress_message(&self, text: impl Into<String>) {
        self.emit(CentringEvent::ProgressMessage(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_every_subscriber() {
        let publisher = StatusPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.centring_started(CentringMethod::Manual);
        publisher.progress_message("Manual 3 click centring...");

        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.recv().await.unwrap(),
                CentringEvent::Started {
                    method: CentringMethod::Manual
                }
            );
            assert_eq!(
                rx.recv().await.unwrap(),
                CentringEvent::ProgressMessage("Manual 3 click centring...".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_source() {
        let publisher = StatusPublisher::new(8);
        let mut rx = publisher.subscribe();

        let mut status = CentringStatus::invalid();
        publisher.centring_failed(Some(CentringMethod::Automatic), &status);
        status.valid = true;

        match rx.recv().await.unwrap() {
            CentringEvent::Failed { status, .. } => assert!(!status.valid),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let publisher = StatusPublisher::new(1);
        publisher.centring_moving();
    }

    #[test]
    fn test_terminal_events() {
        assert!(!CentringEvent::Moving.is_terminal());
        assert!(CentringEvent::Accepted {
            accepted: false,
            status: CentringStatus::invalid()
        }
        .is_terminal());
    }
}
