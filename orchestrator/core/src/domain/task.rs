// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Aggregate
//!
//! A [`Task`] is one unit of auto-coding work fulfilled by a small team of
//! sub-agents. It is owned by the task coordinator and mutated only through
//! [`Task::transition`] and [`Task::record`].
//!
//! ## State Machine
//!
//! ```text
//! pending ──▶ assigned ──▶ in_progress ◀──▶ review
//!    │           │              │             │
//!    └───────────┴──────────────┴─────────────┴──▶ completed | failed | cancelled
//! ```
//!
//! `completed`, `failed` and `cancelled` are terminal. The timeline is
//! append-only and strictly ordered by append time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::container::ContainerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declaration order is rank order: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Whether the state machine admits `self -> next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() || next == Pending || *self == next {
            return false;
        }
        match self {
            Pending => matches!(next, Assigned | Failed | Cancelled),
            Assigned => matches!(next, InProgress | Completed | Failed | Cancelled),
            InProgress => matches!(next, Review | Completed | Failed | Cancelled),
            Review => matches!(next, InProgress | Completed | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Constraints attached to a task's repository context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConstraints {
    /// Named test suites the task must keep green; their presence requires a tester.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_suites: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub repo_path: String,
    pub branch: String,
    pub base_branch: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub constraints: TaskConstraints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Assigned,
    Started,
    StatusChanged,
    Completed,
    Failed,
    Cancelled,
    ContainerLost,
    DeadlineExceeded,
    AgentError,
}

/// One entry of the task's audit trail. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TaskEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub output: serde_json::Value,
}

/// Request to create a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub requirements: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// Baseline applied when a request carries no acceptance criteria.
pub const DEFAULT_ACCEPTANCE_CRITERIA: [&str; 4] = [
    "Code compiles without errors",
    "All existing tests pass",
    "New functionality is covered by tests",
    "Code follows the project's style conventions",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid task transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_container_ids: Vec<ContainerId>,
    pub context: TaskContext,
    pub timeline: Vec<TaskEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(request: NewTask) -> Self {
        let now = Utc::now();
        let acceptance_criteria = match request.acceptance_criteria {
            Some(criteria) if !criteria.is_empty() => criteria,
            _ => DEFAULT_ACCEPTANCE_CRITERIA.iter().map(|c| c.to_string()).collect(),
        };

        let mut task = Self {
            id: TaskId::new(),
            title: request.title,
            description: request.description,
            requirements: request.requirements,
            acceptance_criteria,
            priority: request.priority,
            status: TaskStatus::Pending,
            assigned_container_ids: Vec::new(),
            context: request.context,
            timeline: Vec::new(),
            result: None,
            created_at: now,
            updated_at: now,
            deadline: request.deadline,
        };
        task.record(TaskEventKind::Created, format!("Task created: {}", task.title), None, None);
        task
    }

    /// Append an entry to the timeline.
    pub fn record(
        &mut self,
        kind: TaskEventKind,
        message: impl Into<String>,
        agent_id: Option<AgentId>,
        data: Option<serde_json::Value>,
    ) {
        let now = Utc::now();
        self.timeline.push(TaskEvent {
            timestamp: now,
            kind,
            agent_id,
            message: message.into(),
            data,
        });
        self.updated_at = now;
    }

    /// Move to `next`, returning the previous status.
    pub fn transition(&mut self, next: TaskStatus) -> Result<TaskStatus, InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition { from: self.status, to: next });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| d <= now).unwrap_or(false)
    }

    /// Wall-clock time between creation and the last update, in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.updated_at - self.created_at).num_milliseconds()
    }
}
