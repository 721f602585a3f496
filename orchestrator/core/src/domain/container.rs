// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Managed Container Types
//!
//! Value objects describing a sandboxed sub-agent container as seen by the
//! lifecycle manager: its identity, the agent configuration it was launched
//! with, and the last observed runtime status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::domain::agent::{AgentId, AgentRole};
use crate::domain::task::{TaskId, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    /// Termination requested by the lifecycle manager and still in flight.
    Stopping,
    Removing,
    Exited,
    Dead,
    Error,
    Unknown,
}

impl ContainerState {
    /// Parse the lowercase state strings reported by container runtimes.
    pub fn from_runtime_str(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            "error" => ContainerState::Error,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ContainerState::Exited | ContainerState::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub health: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerStatus {
    pub fn new(state: ContainerState, health: HealthState) -> Self {
        Self { state, health, error: None }
    }

    pub fn ready(&self) -> bool {
        self.state == ContainerState::Running && self.health == HealthState::Healthy
    }

    /// The runtime reports a state from which the container will not become ready.
    pub fn failed(&self) -> bool {
        matches!(self.state, ContainerState::Error | ContainerState::Exited | ContainerState::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    pub communication: u16,
    pub health: u16,
}

/// Task details a sub-agent is launched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBinding {
    pub task_id: TaskId,
    pub requirements: Vec<String>,
    pub priority: TaskPriority,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub capabilities: Vec<String>,
    pub ports: PortAssignment,
    pub env: HashMap<String, String>,
    pub task_context: TaskBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedContainer {
    pub container_id: ContainerId,
    pub agent_config: AgentConfig,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_health_check: DateTime<Utc>,
}

impl ManagedContainer {
    pub fn task_id(&self) -> TaskId {
        self.agent_config.task_context.task_id
    }

    pub fn role(&self) -> AgentRole {
        self.agent_config.role
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.agent_config.task_context.deadline <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_requires_running_and_healthy() {
        assert!(ContainerStatus::new(ContainerState::Running, HealthState::Healthy).ready());
        assert!(!ContainerStatus::new(ContainerState::Running, HealthState::Starting).ready());
        assert!(!ContainerStatus::new(ContainerState::Created, HealthState::Healthy).ready());
    }

    #[test]
    fn test_failed_states() {
        assert!(ContainerStatus::new(ContainerState::Exited, HealthState::None).failed());
        assert!(ContainerStatus::new(ContainerState::Error, HealthState::None).failed());
        assert!(!ContainerStatus::new(ContainerState::Restarting, HealthState::None).failed());
    }

    #[test]
    fn test_runtime_state_parsing() {
        assert_eq!(ContainerState::from_runtime_str("Running"), ContainerState::Running);
        assert_eq!(ContainerState::from_runtime_str("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::from_runtime_str("???"), ContainerState::Unknown);
    }
}
