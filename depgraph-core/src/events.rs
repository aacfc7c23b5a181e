//! Progress events emitted by the release engine.
//!
//! Consumers (CLI progress output, a future web view) subscribe to a
//! broadcast channel; emitting never blocks the engine and an absent
//! subscriber is not an error.

use crate::types::{CommandState, ProjectId, ReleaseState};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum ReleaseEvent {
    ReleaseStarted {
        release_id: Uuid,
        root_project: ProjectId,
    },
    CommandTransitioned {
        project: ProjectId,
        command_index: usize,
        state: CommandState,
    },
    ProjectReleased {
        project: ProjectId,
    },
    ProjectFailed {
        project: ProjectId,
        message: String,
    },
    ReleaseFinished {
        release_id: Uuid,
        state: ReleaseState,
    },
}

/// Cloneable emit handle plus subscription entry point.
#[derive(Clone)]
pub struct ReleaseEvents {
    sender: broadcast::Sender<ReleaseEvent>,
}

impl ReleaseEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReleaseEvent> {
        self.sender.subscribe()
    }

    /// A lagging subscriber misses events; the engine never waits on
    /// delivery.
    pub fn emit(&self, event: ReleaseEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ReleaseEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_emitted_events() {
        let events = ReleaseEvents::new(8);
        let mut rx = events.subscribe();

        let project = ProjectId::new("com.example", "core");
        events.emit(ReleaseEvent::ProjectReleased {
            project: project.clone(),
        });

        match rx.recv().await.unwrap() {
            ReleaseEvent::ProjectReleased { project: p } => assert_eq!(p, project),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_not_an_error() {
        let events = ReleaseEvents::default();
        events.emit(ReleaseEvent::ReleaseFinished {
            release_id: Uuid::new_v4(),
            state: ReleaseState::Succeeded,
        });
    }
}
