// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Domain Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// The lifecycle manager, agent bus and task coordinator publish here; the
// coordinator, recovery hooks and operators subscribe.
//
// In-memory only: events are lost on restart.

use crate::domain::events::{AgentBusEvent, ContainerLifecycleEvent, TaskLifecycleEvent};
use crate::domain::task::TaskId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified domain event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Container(ContainerLifecycleEvent),
    Agent(AgentBusEvent),
    Task(TaskLifecycleEvent),
}

impl DomainEvent {
    /// The task an event concerns, when it concerns exactly one.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            DomainEvent::Container(event) => Some(event.task_id()),
            DomainEvent::Task(event) => Some(event.task_id()),
            DomainEvent::Agent(AgentBusEvent::Authenticated { task_id, .. }) => *task_id,
            DomainEvent::Agent(AgentBusEvent::MessageReceived { message, .. }) => message.task_id(),
            DomainEvent::Agent(_) => None,
        }
    }
}

/// Event bus for publishing and subscribing to domain events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_container_event(&self, event: ContainerLifecycleEvent) {
        self.publish(DomainEvent::Container(event));
    }

    pub fn publish_agent_event(&self, event: AgentBusEvent) {
        self.publish(DomainEvent::Agent(event));
    }

    pub fn publish_task_event(&self, event: TaskLifecycleEvent) {
        self.publish(DomainEvent::Task(event));
    }

    fn publish(&self, event: DomainEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        let receiver_count = self.sender.send(event).unwrap_or(0);

        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all domain events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe and filter for a single task
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEventReceiver {
        TaskEventReceiver {
            receiver: self.sender.subscribe(),
            task_id,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all domain events
pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until event is available)
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver for events about one task (filtered)
pub struct TaskEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    task_id: TaskId,
}

impl TaskEventReceiver {
    /// Receive the next event concerning this receiver's task
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.task_id() == Some(self.task_id) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{AgentId, AgentRole};
    use crate::domain::container::ContainerId;
    use crate::domain::task::TaskStatus;
    use chrono::Utc;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let task_id = TaskId::new();
        event_bus.publish_container_event(ContainerLifecycleEvent::Spawned {
            container_id: ContainerId::new("c-1"),
            agent_id: AgentId::generate(AgentRole::Coder),
            task_id,
            role: AgentRole::Coder,
            spawned_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Container(ContainerLifecycleEvent::Spawned { task_id: id, .. }) => {
                assert_eq!(id, task_id);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_task_event_filtering() {
        let event_bus = EventBus::new(10);
        let task_id = TaskId::new();
        let other_task_id = TaskId::new();

        let mut receiver = event_bus.subscribe_task(task_id);

        event_bus.publish_task_event(TaskLifecycleEvent::Created {
            task_id: other_task_id,
            created_at: Utc::now(),
        });
        event_bus.publish_agent_event(AgentBusEvent::Disconnected {
            agent_id: AgentId::new("coder-1"),
            reason: "closed".to_string(),
            disconnected_at: Utc::now(),
        });
        event_bus.publish_task_event(TaskLifecycleEvent::StatusChanged {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Assigned,
            changed_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Task(TaskLifecycleEvent::StatusChanged { task_id: id, to, .. }) => {
                assert_eq!(id, task_id);
                assert_eq!(to, TaskStatus::Assigned);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        event_bus.publish_task_event(TaskLifecycleEvent::Created {
            task_id: TaskId::new(),
            created_at: Utc::now(),
        });

        let _ = receiver1.recv().await.unwrap();
        let _ = receiver2.recv().await.unwrap();
    }

    #[test]
    fn test_try_recv_empty() {
        let event_bus = EventBus::new(4);
        let mut receiver = event_bus.subscribe();
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
