// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentRole};
use crate::domain::container::ContainerId;
use crate::domain::message::Message;
use crate::domain::task::{TaskId, TaskStatus};

/// Published by the container lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContainerLifecycleEvent {
    Spawned {
        container_id: ContainerId,
        agent_id: AgentId,
        task_id: TaskId,
        role: AgentRole,
        spawned_at: DateTime<Utc>,
    },
    Terminated {
        container_id: ContainerId,
        task_id: TaskId,
        graceful: bool,
        terminated_at: DateTime<Utc>,
    },
    /// The container stopped without the manager asking it to.
    Died {
        container_id: ContainerId,
        agent_id: AgentId,
        task_id: TaskId,
        reason: String,
        died_at: DateTime<Utc>,
    },
    Unhealthy {
        container_id: ContainerId,
        task_id: TaskId,
        observed_at: DateTime<Utc>,
    },
    /// Containers of a task were force-terminated because its deadline passed.
    DeadlineExceeded {
        task_id: TaskId,
        container_ids: Vec<ContainerId>,
        detected_at: DateTime<Utc>,
    },
}

impl ContainerLifecycleEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            ContainerLifecycleEvent::Spawned { task_id, .. }
            | ContainerLifecycleEvent::Terminated { task_id, .. }
            | ContainerLifecycleEvent::Died { task_id, .. }
            | ContainerLifecycleEvent::Unhealthy { task_id, .. }
            | ContainerLifecycleEvent::DeadlineExceeded { task_id, .. } => *task_id,
        }
    }
}

/// Published by the agent message bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AgentBusEvent {
    Authenticated {
        agent_id: AgentId,
        role: AgentRole,
        task_id: Option<TaskId>,
        container_id: Option<ContainerId>,
        authenticated_at: DateTime<Utc>,
    },
    AuthenticationFailed {
        agent_id: Option<AgentId>,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    Disconnected {
        agent_id: AgentId,
        reason: String,
        disconnected_at: DateTime<Utc>,
    },
    /// A routable message arrived from an authenticated agent.
    MessageReceived {
        agent_id: AgentId,
        message: Message,
    },
}

/// Published by the task coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskLifecycleEvent {
    Created {
        task_id: TaskId,
        created_at: DateTime<Utc>,
    },
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        changed_at: DateTime<Utc>,
    },
}

impl TaskLifecycleEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskLifecycleEvent::Created { task_id, .. }
            | TaskLifecycleEvent::StatusChanged { task_id, .. } => *task_id,
        }
    }
}
