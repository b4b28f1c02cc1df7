//! Event bus for container lifecycle events — an ordered log of state
//! transitions and external events.
//!
//! Uses tokio broadcast channels for pub/sub; subscribers that fall
//! behind will lose messages (lagged) rather than block publishers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::ContainerState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// The container transitioned to a new state.
    StateChange {
        container_id: String,
        state: ContainerState,
    },

    /// A resource allocation step for this container completed.
    ResourceReserved {
        container_id: String,
        resource: String,
    },

    /// A resource allocation step was released (destroy or rollback).
    ResourceReleased {
        container_id: String,
        resource: String,
    },

    /// A helper script ran to completion.
    ScriptRan {
        container_id: String,
        script: String,
        exit_success: bool,
    },

    /// A lifecycle hook point fired.
    HookFired {
        container_id: String,
        point: String,
    },

    /// The container's rootfs diff was committed and exported.
    Committed {
        container_id: String,
        destination: String,
    },
}

/// Broadcasts container lifecycle events to multiple subscribers.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    _receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. If there are no subscribers it is silently
    /// dropped; returns the number of receivers that got it.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn publish_state(&self, container_id: &str, state: ContainerState) -> usize {
        let receivers = self.publish(Event::StateChange {
            container_id: container_id.to_string(),
            state,
        });
        debug!(container_id, ?state, receivers, "published state change");
        receivers
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
