// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Bus Wire Protocol
//!
//! Every frame on the bus is a JSON [`Message`]:
//!
//! ```text
//! { id, type, from, to, timestamp (epoch-ms), data, signature? }
//! ```
//!
//! ## Handshake
//!
//! ```text
//! server ── auth_request  { challenge } ──────────────────────────▶ worker
//! server ◀─ auth_response { agentId, role, signature, containerId?, taskId? } ──
//! server ── auth_success  { agentId } | error { error } ──────────▶ worker
//! ```
//!
//! Typed payloads for the data-carrying message kinds live alongside; use
//! [`Message::payload`] to decode them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{AgentId, AgentRole};
use crate::domain::container::ContainerId;
use crate::domain::task::{TaskContext, TaskId, TaskPriority, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    StatusUpdate,
    ResultReport,
    ErrorReport,
    Ping,
    Pong,
    AuthRequest,
    AuthResponse,
    AuthSuccess,
    Error,
}

impl MessageType {
    /// Kinds the bus forwards between parent and workers.
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            MessageType::TaskAssignment
                | MessageType::StatusUpdate
                | MessageType::ResultReport
                | MessageType::ErrorReport
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    /// Empty when unaddressed.
    #[serde(default)]
    pub to: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType, from: impl Into<String>, to: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            from: from.into(),
            to: to.into(),
            timestamp: Utc::now().timestamp_millis(),
            data,
            signature: None,
        }
    }

    /// Build a message whose `data` is a serialized payload.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, from, to, serde_json::to_value(payload)?))
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    pub fn is_addressed(&self) -> bool {
        !self.to.is_empty()
    }

    /// The `taskId` carried in the payload, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        self.data
            .get("taskId")
            .and_then(|v| v.as_str())
            .and_then(|s| TaskId::from_string(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChallenge {
    pub challenge: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    pub agent_id: AgentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub priority: TaskPriority,
    pub context: TaskContext,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub error: String,
    /// The worker cannot continue; the task should be failed.
    #[serde(default)]
    pub fatal: bool,
}
