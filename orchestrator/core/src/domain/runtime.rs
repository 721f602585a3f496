// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Backend Port
//!
//! [`ExecutionBackend`] is the anti-corruption boundary between the lifecycle
//! manager and whatever actually runs sandboxed processes. The Docker
//! implementation lives in [`crate::infrastructure::runtime`]; an in-process
//! implementation for local runs and tests lives in
//! [`crate::infrastructure::memory_runtime`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::agent::AgentRole;
use crate::domain::container::{ContainerId, ContainerState, ContainerStatus};

/// Label present on every container created for a sub-agent.
pub const LABEL_MANAGED: &str = "autocoder.subagent";
pub const LABEL_TASK_ID: &str = "autocoder.task-id";
pub const LABEL_AGENT_ID: &str = "autocoder.agent-id";
pub const LABEL_ROLE: &str = "autocoder.role";

/// Working directory inside every sub-agent container.
pub const WORKSPACE_DIR: &str = "/workspace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityOptions {
    pub read_only_root_fs: bool,
    pub no_new_privileges: bool,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
}

impl SecurityOptions {
    /// Sandbox posture for a sub-agent. Workers write files, so the root
    /// filesystem stays writable; only the coder gets `DAC_OVERRIDE` back.
    pub fn for_role(role: AgentRole) -> Self {
        let cap_add = match role {
            AgentRole::Coder => vec!["DAC_OVERRIDE".to_string()],
            _ => Vec::new(),
        };
        Self {
            read_only_root_fs: false,
            no_new_privileges: true,
            cap_drop: vec!["ALL".to_string()],
            cap_add,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub command: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub start_period: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub working_dir: String,
    pub security: SecurityOptions,
    pub network: Option<String>,
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: String,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl ExecRequest {
    pub fn in_workspace(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: WORKSPACE_DIR.to_string(),
            attach_stdout: true,
            attach_stderr: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    /// Every label must match (`key=value`).
    pub labels: HashMap<String, String>,
    /// Include stopped containers.
    pub all: bool,
}

impl ContainerFilter {
    pub fn managed() -> Self {
        Self {
            labels: HashMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
            all: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildImageRequest {
    pub name: String,
    pub tag: String,
    pub dockerfile: String,
    pub build_context: PathBuf,
    pub build_args: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

impl BuildImageRequest {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendEventKind {
    Die,
    Destroy,
    HealthStatus,
}

/// Lifecycle notification pushed by the backend. `data` carries runtime
/// attributes such as `health_status` or `exit_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub kind: BackendEventKind,
    pub container_id: ContainerId,
    pub data: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Execution backend unavailable: {0}")]
    Unavailable(String),
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("Image build failed: {0}")]
    ImageBuild(String),
    #[error("Backend operation failed: {0}")]
    Operation(String),
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn ping(&self) -> Result<bool, BackendError>;

    async fn create_container(&self, request: CreateContainerRequest) -> Result<ContainerId, BackendError>;

    async fn start_container(&self, id: &ContainerId) -> Result<(), BackendError>;

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<(), BackendError>;

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), BackendError>;

    async fn container_status(&self, id: &ContainerId) -> Result<ContainerStatus, BackendError>;

    async fn execute_in_container(&self, id: &ContainerId, request: ExecRequest) -> Result<ExecOutput, BackendError>;

    async fn list_containers(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, BackendError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, BackendError>;

    async fn build_image(&self, request: BuildImageRequest) -> Result<(), BackendError>;

    /// Subscribe to container lifecycle notifications.
    fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent>;
}
