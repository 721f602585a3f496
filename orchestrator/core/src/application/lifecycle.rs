// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Container Lifecycle Manager
//!
//! Owns every sandboxed sub-agent container from creation to removal.
//!
//! ## Registry
//!
//! Two indexes live behind one lock and are only ever mutated together:
//!
//! | Index | Key | Value |
//! |-------|-----|-------|
//! | `containers` | container id | [`ManagedContainer`] |
//! | `by_task` | task id | container ids, in spawn order |
//!
//! A container id is in `by_task[t]` exactly when it is in `containers` and
//! its task binding names `t`.
//!
//! ## Spawn
//!
//! ```text
//! allocate ports ─▶ resolve/build image ─▶ create ─▶ start ─▶ poll until running+healthy ─▶ register
//!                                             │          │                │
//!                                             └──────────┴── on failure: force-remove, propagate
//! ```
//!
//! ## Termination
//!
//! Graceful termination signals PID 1 inside the container and polls for an
//! exit. If that fails or times out, or termination is forced, the container
//! is stopped with a short grace period. It is then removed and dropped from
//! both indexes in one step.
//!
//! ## Background
//!
//! - [`ContainerLifecycleManager::spawn_health_monitor`]: refreshes statuses
//!   and force-terminates containers whose deadline has passed.
//! - [`ContainerLifecycleManager::spawn_event_listener`]: reacts to backend
//!   `die`/`destroy`/`health_status` events and hands losses to the
//!   [`RecoveryPolicy`].

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::agent::{AgentId, AgentRole};
use crate::domain::container::{
    AgentConfig, ContainerId, ContainerState, ContainerStatus, HealthState, ManagedContainer, PortAssignment,
    TaskBinding,
};
use crate::domain::events::ContainerLifecycleEvent;
use crate::domain::node_config::{BackendConfig, LifecycleConfig, RoleImages};
use crate::domain::recovery::{LossCause, NoRestartPolicy, RecoveryPolicy};
use crate::domain::runtime::{
    BackendError, BackendEvent, BackendEventKind, BuildImageRequest, ContainerFilter, CreateContainerRequest,
    ExecOutput, ExecRequest, ExecutionBackend, HealthCheckSpec, SecurityOptions, LABEL_AGENT_ID, LABEL_MANAGED,
    LABEL_ROLE, LABEL_TASK_ID, WORKSPACE_DIR,
};
use crate::domain::task::{TaskId, TaskPriority};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Role '{0}' does not run in a sub-agent container")]
    InvalidRole(AgentRole),

    #[error("Port range exhausted")]
    PortsExhausted,

    #[error("Container {container_id} failed to become ready: state {state:?}{}", .reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default())]
    ReadinessFailed {
        container_id: ContainerId,
        state: ContainerState,
        reason: Option<String>,
    },

    #[error("Deadline exceeded: container {container_id} not ready after {timeout:?}")]
    ReadinessTimeout { container_id: ContainerId, timeout: Duration },

    #[error("Container not managed: {0}")]
    NotFound(ContainerId),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Timings and placement for sub-agent containers.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub port_base: u16,
    pub health_check_interval: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll_interval: Duration,
    pub readiness_error_backoff: Duration,
    pub graceful_stop_timeout: Duration,
    pub graceful_poll_interval: Duration,
    pub force_stop_grace: Duration,
    pub default_task_timeout: Duration,
    pub network: Option<String>,
    /// Handed to sub-agents as `AUTOCODER_BUS_URL`.
    pub bus_url: Option<String>,
    pub images: RoleImages,
    pub build_context: PathBuf,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&LifecycleConfig::default(), &BackendConfig::default(), None)
    }
}

impl LifecycleSettings {
    pub fn from_config(lifecycle: &LifecycleConfig, backend: &BackendConfig, bus_url: Option<String>) -> Self {
        Self {
            port_base: lifecycle.port_base,
            health_check_interval: lifecycle.health_check_interval(),
            readiness_timeout: lifecycle.readiness_timeout(),
            readiness_poll_interval: lifecycle.readiness_poll_interval(),
            readiness_error_backoff: lifecycle.readiness_error_backoff(),
            graceful_stop_timeout: lifecycle.graceful_stop_timeout(),
            graceful_poll_interval: Duration::from_secs(1),
            force_stop_grace: lifecycle.force_stop_grace(),
            default_task_timeout: lifecycle.default_task_timeout(),
            network: Some(backend.network.clone()),
            bus_url,
            images: backend.images.clone(),
            build_context: backend.build_context.clone(),
        }
    }
}

/// Parameters for one sub-agent spawn.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task_id: TaskId,
    pub role: AgentRole,
    pub requirements: Vec<String>,
    pub env: HashMap<String, String>,
    pub priority: TaskPriority,
    /// Bounds readiness and sets the container deadline.
    pub timeout: Option<Duration>,
}

impl SpawnRequest {
    pub fn new(task_id: TaskId, role: AgentRole) -> Self {
        Self {
            task_id,
            role,
            requirements: Vec::new(),
            env: HashMap::new(),
            priority: TaskPriority::default(),
            timeout: None,
        }
    }

    pub fn requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one health-check tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthCheckReport {
    pub checked: usize,
    pub expired: Vec<ContainerId>,
}

#[derive(Default)]
struct Registry {
    containers: HashMap<ContainerId, ManagedContainer>,
    by_task: HashMap<TaskId, Vec<ContainerId>>,
}

impl Registry {
    fn insert(&mut self, container: ManagedContainer) {
        self.by_task
            .entry(container.task_id())
            .or_default()
            .push(container.container_id.clone());
        self.containers.insert(container.container_id.clone(), container);
    }

    fn remove(&mut self, id: &ContainerId) -> Option<ManagedContainer> {
        let container = self.containers.remove(id)?;
        let task_id = container.task_id();
        if let Some(ids) = self.by_task.get_mut(&task_id) {
            ids.retain(|c| c != id);
            if ids.is_empty() {
                self.by_task.remove(&task_id);
            }
        }
        Some(container)
    }
}

pub struct ContainerLifecycleManager {
    backend: Arc<dyn ExecutionBackend>,
    event_bus: EventBus,
    recovery: Arc<dyn RecoveryPolicy>,
    settings: LifecycleSettings,
    registry: RwLock<Registry>,
    next_port: AtomicU32,
    image_lock: tokio::sync::Mutex<()>,
}

impl ContainerLifecycleManager {
    pub fn new(backend: Arc<dyn ExecutionBackend>, event_bus: EventBus, settings: LifecycleSettings) -> Self {
        Self {
            backend,
            event_bus,
            recovery: Arc::new(NoRestartPolicy),
            next_port: AtomicU32::new(settings.port_base as u32),
            settings,
            registry: RwLock::new(Registry::default()),
            image_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_recovery_policy(mut self, recovery: Arc<dyn RecoveryPolicy>) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    fn allocate_ports(&self) -> Result<PortAssignment, LifecycleError> {
        let first = self.next_port.fetch_add(2, Ordering::SeqCst);
        let communication = u16::try_from(first).map_err(|_| LifecycleError::PortsExhausted)?;
        let health = u16::try_from(first + 1).map_err(|_| LifecycleError::PortsExhausted)?;
        Ok(PortAssignment { communication, health })
    }

    fn agent_env(&self, request: &SpawnRequest, agent_config: &AgentConfig) -> HashMap<String, String> {
        let binding = &agent_config.task_context;
        let mut env = HashMap::from([
            ("AUTOCODER_AGENT_ID".to_string(), agent_config.agent_id.to_string()),
            ("AUTOCODER_AGENT_ROLE".to_string(), agent_config.role.to_string()),
            ("AUTOCODER_TASK_ID".to_string(), binding.task_id.to_string()),
            ("AUTOCODER_TASK_PRIORITY".to_string(), binding.priority.to_string()),
            ("AUTOCODER_TASK_DEADLINE".to_string(), binding.deadline.to_rfc3339()),
            ("AUTOCODER_COMM_PORT".to_string(), agent_config.ports.communication.to_string()),
            ("AUTOCODER_HEALTH_PORT".to_string(), agent_config.ports.health.to_string()),
            ("AUTOCODER_CAPABILITIES".to_string(), agent_config.capabilities.join(",")),
            (
                "AUTOCODER_REQUIREMENTS".to_string(),
                serde_json::to_string(&binding.requirements).unwrap_or_else(|_| "[]".to_string()),
            ),
        ]);
        if let Some(url) = &self.settings.bus_url {
            env.insert("AUTOCODER_BUS_URL".to_string(), url.clone());
        }
        // Caller-supplied values win
        env.extend(request.env.clone());
        env
    }

    /// Make sure the role's image exists locally, building it if needed.
    async fn ensure_image(&self, role: AgentRole) -> Result<String, LifecycleError> {
        let image = self
            .settings
            .images
            .for_role(role)
            .ok_or(LifecycleError::InvalidRole(role))?;

        // One build at a time so concurrent spawns of the same role build once
        let _guard = self.image_lock.lock().await;

        let present = self
            .backend
            .list_images()
            .await?
            .iter()
            .any(|summary| summary.tags.iter().any(|tag| tag == &image.image));
        if present {
            return Ok(image.image.clone());
        }

        let (name, tag) = split_reference(&image.image);
        info!(role = %role, image = %image.image, "Sub-agent image not found locally, building");
        self.backend
            .build_image(BuildImageRequest {
                name,
                tag,
                dockerfile: image.dockerfile.clone(),
                build_context: self.settings.build_context.clone(),
                build_args: HashMap::new(),
                labels: HashMap::from([
                    (LABEL_MANAGED.to_string(), "true".to_string()),
                    (LABEL_ROLE.to_string(), role.to_string()),
                ]),
            })
            .await?;
        Ok(image.image.clone())
    }

    /// Spawn one sub-agent and wait until it is running and healthy.
    pub async fn spawn_sub_agent(&self, request: SpawnRequest) -> Result<ContainerId, LifecycleError> {
        let role = request.role;
        let result = self.spawn_inner(&request).await;
        if let Err(e) = &result {
            counter!("autocoder_container_spawn_failures_total", "role" => role.as_str()).increment(1);
            warn!(task_id = %request.task_id, role = %role, "Sub-agent spawn failed: {}", e);
        }
        result
    }

    async fn spawn_inner(&self, request: &SpawnRequest) -> Result<ContainerId, LifecycleError> {
        if !request.role.is_sub_agent() {
            return Err(LifecycleError::InvalidRole(request.role));
        }

        let ports = self.allocate_ports()?;
        let agent_id = AgentId::generate(request.role);
        let task_timeout = request.timeout.unwrap_or(self.settings.default_task_timeout);
        let deadline = Utc::now()
            + chrono::Duration::from_std(task_timeout).unwrap_or_else(|_| chrono::Duration::hours(1));

        let mut agent_config = AgentConfig {
            agent_id: agent_id.clone(),
            role: request.role,
            capabilities: request.role.capabilities().iter().map(|c| c.to_string()).collect(),
            ports,
            env: HashMap::new(),
            task_context: TaskBinding {
                task_id: request.task_id,
                requirements: request.requirements.clone(),
                priority: request.priority,
                deadline,
            },
        };
        agent_config.env = self.agent_env(request, &agent_config);

        let image = self.ensure_image(request.role).await?;

        let create = CreateContainerRequest {
            name: format!("autocoder-{}", agent_id),
            image,
            env: agent_config.env.clone(),
            labels: HashMap::from([
                (LABEL_MANAGED.to_string(), "true".to_string()),
                (LABEL_TASK_ID.to_string(), request.task_id.to_string()),
                (LABEL_AGENT_ID.to_string(), agent_id.to_string()),
                (LABEL_ROLE.to_string(), request.role.to_string()),
            ]),
            exposed_ports: vec![ports.communication, ports.health],
            working_dir: WORKSPACE_DIR.to_string(),
            security: SecurityOptions::for_role(request.role),
            network: self.settings.network.clone(),
            health_check: Some(HealthCheckSpec {
                command: vec![
                    "CMD-SHELL".to_string(),
                    format!("curl -fsS http://localhost:{}/health || exit 1", ports.health),
                ],
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                retries: 3,
                start_period: Duration::from_secs(10),
            }),
        };

        let container_id = self.backend.create_container(create).await?;

        let readiness_timeout = request.timeout.unwrap_or(self.settings.readiness_timeout);
        let ready = match self.backend.start_container(&container_id).await {
            Ok(()) => self.wait_until_ready(&container_id, readiness_timeout).await,
            Err(e) => Err(e.into()),
        };

        let status = match ready {
            Ok(status) => status,
            Err(e) => {
                // Never leave a tagged container behind for a spawn that failed
                if let Err(remove_err) = self.backend.remove_container(&container_id, true).await {
                    warn!(container_id = %container_id, "Failed to remove unready container: {}", remove_err);
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let managed = ManagedContainer {
            container_id: container_id.clone(),
            agent_config,
            status,
            created_at: now,
            last_health_check: now,
        };
        let managed_count = {
            let mut registry = self.registry.write();
            registry.insert(managed);
            registry.containers.len()
        };

        counter!("autocoder_containers_spawned_total", "role" => request.role.as_str()).increment(1);
        gauge!("autocoder_containers_managed").set(managed_count as f64);
        info!(
            task_id = %request.task_id,
            container_id = %container_id,
            agent_id = %agent_id,
            role = %request.role,
            comm_port = ports.communication,
            "Sub-agent ready"
        );

        self.event_bus.publish_container_event(ContainerLifecycleEvent::Spawned {
            container_id: container_id.clone(),
            agent_id,
            task_id: request.task_id,
            role: request.role,
            spawned_at: now,
        });

        Ok(container_id)
    }

    async fn wait_until_ready(&self, id: &ContainerId, timeout: Duration) -> Result<ContainerStatus, LifecycleError> {
        let started = Instant::now();
        loop {
            let delay = match self.backend.container_status(id).await {
                Ok(status) if status.ready() => return Ok(status),
                Ok(status) if status.failed() => {
                    return Err(LifecycleError::ReadinessFailed {
                        container_id: id.clone(),
                        state: status.state,
                        reason: status.error,
                    });
                }
                Ok(_) => self.settings.readiness_poll_interval,
                Err(e) => {
                    debug!(container_id = %id, "Status query failed while waiting for readiness: {}", e);
                    self.settings.readiness_error_backoff
                }
            };

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(LifecycleError::ReadinessTimeout {
                    container_id: id.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(delay.min(timeout - elapsed)).await;
        }
    }

    /// Spawn several sub-agents in order. If any spawn fails, the ones already
    /// started by this call are force-terminated before the error is returned.
    pub async fn spawn_sub_agents(&self, requests: Vec<SpawnRequest>) -> Result<Vec<ContainerId>, LifecycleError> {
        let mut spawned = Vec::with_capacity(requests.len());
        for request in requests {
            match self.spawn_sub_agent(request).await {
                Ok(id) => spawned.push(id),
                Err(e) => {
                    if !spawned.is_empty() {
                        warn!("Rolling back {} sibling sub-agent(s) after spawn failure", spawned.len());
                        self.terminate_many(spawned, false).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(spawned)
    }

    /// Stop and remove a managed container.
    pub async fn terminate_sub_agent(&self, id: &ContainerId, graceful: bool) -> Result<(), LifecycleError> {
        let task_id = {
            let mut registry = self.registry.write();
            let container = registry
                .containers
                .get_mut(id)
                .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
            if container.status.state == ContainerState::Stopping {
                debug!(container_id = %id, "Termination already in progress");
                return Ok(());
            }
            container.status.state = ContainerState::Stopping;
            container.task_id()
        };

        let mut stopped_gracefully = false;
        if graceful {
            match self.stop_gracefully(id).await {
                Ok(true) => stopped_gracefully = true,
                Ok(false) => warn!(
                    container_id = %id,
                    "Graceful stop timed out after {:?}, forcing",
                    self.settings.graceful_stop_timeout
                ),
                Err(e) => warn!(container_id = %id, "Graceful stop failed, forcing: {}", e),
            }
        }

        if !stopped_gracefully {
            match self.backend.stop_container(id, self.settings.force_stop_grace).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => warn!(container_id = %id, "Forced stop failed: {}", e),
            }
        }

        let removal = self.backend.remove_container(id, true).await;

        let managed_count = {
            let mut registry = self.registry.write();
            registry.remove(id);
            registry.containers.len()
        };
        gauge!("autocoder_containers_managed").set(managed_count as f64);

        self.event_bus.publish_container_event(ContainerLifecycleEvent::Terminated {
            container_id: id.clone(),
            task_id,
            graceful: stopped_gracefully,
            terminated_at: Utc::now(),
        });

        match removal {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                info!(container_id = %id, task_id = %task_id, graceful = stopped_gracefully, "Sub-agent terminated");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signal PID 1 and wait for the container to exit. `Ok(false)` on timeout.
    async fn stop_gracefully(&self, id: &ContainerId) -> Result<bool, BackendError> {
        self.backend
            .execute_in_container(
                id,
                ExecRequest::in_workspace(vec!["kill".to_string(), "-TERM".to_string(), "1".to_string()]),
            )
            .await?;

        let started = Instant::now();
        loop {
            match self.backend.container_status(id).await {
                Ok(status) if status.state.is_stopped() => return Ok(true),
                Err(BackendError::NotFound(_)) => return Ok(true),
                Ok(_) => {}
                Err(e) => debug!(container_id = %id, "Status query failed during graceful stop: {}", e),
            }
            if started.elapsed() >= self.settings.graceful_stop_timeout {
                return Ok(false);
            }
            tokio::time::sleep(self.settings.graceful_poll_interval).await;
        }
    }

    async fn terminate_many(&self, ids: Vec<ContainerId>, graceful: bool) -> usize {
        let results = join_all(ids.iter().map(|id| self.terminate_sub_agent(id, graceful))).await;
        let mut terminated = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => terminated += 1,
                Err(e) => error!(container_id = %id, "Failed to terminate sub-agent: {}", e),
            }
        }
        terminated
    }

    /// Terminate every container of a task in parallel. Failures are logged;
    /// returns how many terminated cleanly.
    pub async fn terminate_task_containers(&self, task_id: TaskId) -> usize {
        let ids = self.task_container_ids(task_id);
        if ids.is_empty() {
            return 0;
        }
        info!(task_id = %task_id, count = ids.len(), "Terminating task containers");
        self.terminate_many(ids, true).await
    }

    /// Force-terminate everything this manager owns.
    pub async fn terminate_all(&self) -> usize {
        let ids: Vec<ContainerId> = self.registry.read().containers.keys().cloned().collect();
        self.terminate_many(ids, false).await
    }

    /// Query the backend for a managed container's status and record it.
    pub async fn get_container_status(&self, id: &ContainerId) -> Result<ContainerStatus, LifecycleError> {
        if !self.registry.read().containers.contains_key(id) {
            return Err(LifecycleError::NotFound(id.clone()));
        }
        let status = self.backend.container_status(id).await?;
        self.record_status(id, status.clone());
        Ok(status)
    }

    pub fn get_managed_container(&self, id: &ContainerId) -> Option<ManagedContainer> {
        self.registry.read().containers.get(id).cloned()
    }

    pub fn list_managed_containers(&self) -> Vec<ManagedContainer> {
        let mut containers: Vec<ManagedContainer> = self.registry.read().containers.values().cloned().collect();
        containers.sort_by_key(|c| c.created_at);
        containers
    }

    pub fn get_task_containers(&self, task_id: TaskId) -> Vec<ManagedContainer> {
        let registry = self.registry.read();
        registry
            .by_task
            .get(&task_id)
            .map(|ids| ids.iter().filter_map(|id| registry.containers.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn task_container_ids(&self, task_id: TaskId) -> Vec<ContainerId> {
        self.registry.read().by_task.get(&task_id).cloned().unwrap_or_default()
    }

    /// Run a command in the sub-agent's workspace.
    pub async fn execute_in_sub_agent(&self, id: &ContainerId, command: Vec<String>) -> Result<ExecOutput, LifecycleError> {
        if !self.registry.read().containers.contains_key(id) {
            return Err(LifecycleError::NotFound(id.clone()));
        }
        Ok(self
            .backend
            .execute_in_container(id, ExecRequest::in_workspace(command))
            .await?)
    }

    fn record_status(&self, id: &ContainerId, status: ContainerStatus) {
        let mut registry = self.registry.write();
        if let Some(container) = registry.containers.get_mut(id) {
            if container.status.state != ContainerState::Stopping {
                container.status = status;
            }
            container.last_health_check = Utc::now();
        }
    }

    /// One health-check pass: refresh every container's status and
    /// force-terminate those past their deadline.
    pub async fn run_health_check(&self) -> HealthCheckReport {
        let now = Utc::now();
        let mut to_refresh = Vec::new();
        let mut expired: HashMap<TaskId, Vec<ContainerId>> = HashMap::new();
        {
            let registry = self.registry.read();
            for container in registry.containers.values() {
                if container.status.state == ContainerState::Stopping {
                    continue;
                }
                if container.is_past_deadline(now) {
                    expired
                        .entry(container.task_id())
                        .or_default()
                        .push(container.container_id.clone());
                } else {
                    to_refresh.push(container.container_id.clone());
                }
            }
        }

        let statuses = join_all(to_refresh.iter().map(|id| self.backend.container_status(id))).await;
        for (id, status) in to_refresh.iter().zip(statuses) {
            match status {
                Ok(status) => self.record_status(id, status),
                Err(e) => warn!(container_id = %id, "Health check failed: {}", e),
            }
        }

        let mut report = HealthCheckReport {
            checked: to_refresh.len(),
            expired: Vec::new(),
        };

        for (task_id, ids) in expired {
            warn!(task_id = %task_id, count = ids.len(), "Task deadline exceeded, force-terminating containers");
            self.terminate_many(ids.clone(), false).await;
            self.event_bus.publish_container_event(ContainerLifecycleEvent::DeadlineExceeded {
                task_id,
                container_ids: ids.clone(),
                detected_at: now,
            });
            report.expired.extend(ids);
        }

        report
    }

    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.settings.health_check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Health monitor stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        let report = manager.run_health_check().await;
                        debug!(checked = report.checked, expired = report.expired.len(), "Health check tick");
                    }
                }
            }
        })
    }

    /// Consume backend lifecycle events until cancelled.
    pub fn spawn_event_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = manager.backend.subscribe_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = events.recv() => match received {
                        Ok(event) => manager.handle_backend_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Backend event listener lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Backend event stream closed");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub async fn handle_backend_event(&self, event: BackendEvent) {
        match event.kind {
            BackendEventKind::Die | BackendEventKind::Destroy => {
                let reason = match (event.kind, event.data.get("exitCode")) {
                    (BackendEventKind::Die, Some(code)) => format!("exited with code {}", code),
                    (BackendEventKind::Die, None) => "exited".to_string(),
                    _ => "destroyed".to_string(),
                };
                self.on_container_died(&event.container_id, reason).await;
            }
            BackendEventKind::HealthStatus => {
                let health = match event.data.get("health_status").map(String::as_str) {
                    Some("healthy") => HealthState::Healthy,
                    Some("unhealthy") => HealthState::Unhealthy,
                    Some("starting") => HealthState::Starting,
                    _ => return,
                };
                self.on_health_changed(&event.container_id, health).await;
            }
        }
    }

    async fn on_container_died(&self, id: &ContainerId, reason: String) {
        let lost = {
            let mut registry = self.registry.write();
            let unexpected = registry
                .containers
                .get(id)
                .map(|c| c.status.state != ContainerState::Stopping)
                .unwrap_or(false);
            if unexpected {
                registry.remove(id).map(|mut container| {
                    container.status.state = ContainerState::Error;
                    container.status.error = Some(reason.clone());
                    (container, registry.containers.len())
                })
            } else {
                None
            }
        };

        let Some((container, managed_count)) = lost else {
            return;
        };
        gauge!("autocoder_containers_managed").set(managed_count as f64);
        error!(
            container_id = %id,
            task_id = %container.task_id(),
            role = %container.role(),
            "Sub-agent container died unexpectedly: {}",
            reason
        );

        self.event_bus.publish_container_event(ContainerLifecycleEvent::Died {
            container_id: id.clone(),
            agent_id: container.agent_config.agent_id.clone(),
            task_id: container.task_id(),
            reason: reason.clone(),
            died_at: Utc::now(),
        });
        self.recovery
            .on_container_lost(&container, &LossCause::Died { reason })
            .await;
    }

    async fn on_health_changed(&self, id: &ContainerId, health: HealthState) {
        let container = {
            let mut registry = self.registry.write();
            match registry.containers.get_mut(id) {
                Some(container) if container.status.state != ContainerState::Stopping => {
                    container.status.health = health;
                    container.clone()
                }
                _ => return,
            }
        };

        if health != HealthState::Unhealthy {
            return;
        }
        warn!(
            container_id = %id,
            task_id = %container.task_id(),
            role = %container.role(),
            "Sub-agent container reported unhealthy"
        );
        self.event_bus.publish_container_event(ContainerLifecycleEvent::Unhealthy {
            container_id: id.clone(),
            task_id: container.task_id(),
            observed_at: Utc::now(),
        });
        self.recovery.on_container_lost(&container, &LossCause::Unhealthy).await;
    }

    /// Remove leftover sub-agent containers from a previous run that are no
    /// longer running. Returns how many were removed.
    pub async fn cleanup_orphans(&self) -> Result<usize, LifecycleError> {
        let containers = self.backend.list_containers(ContainerFilter::managed()).await?;
        let mut removed = 0;
        for summary in containers {
            if summary.state == ContainerState::Running || self.registry.read().containers.contains_key(&summary.id) {
                continue;
            }
            match self.backend.remove_container(&summary.id, true).await {
                Ok(()) => {
                    removed += 1;
                    info!(container_id = %summary.id, state = ?summary.state, "Removed orphaned sub-agent container");
                }
                Err(e) => warn!(container_id = %summary.id, "Failed to remove orphaned container: {}", e),
            }
        }
        Ok(removed)
    }
}

/// Split `name:tag`, defaulting the tag to `latest`. A colon that belongs to
/// a registry port is not a tag separator.
fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_runtime::{BackendCall, InMemoryBackend};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    const IMAGES: [&str; 3] = ["autocoder-coder:latest", "autocoder-reviewer:latest", "autocoder-tester:latest"];

    fn fast_settings() -> LifecycleSettings {
        LifecycleSettings {
            readiness_timeout: Duration::from_millis(300),
            readiness_poll_interval: Duration::from_millis(10),
            readiness_error_backoff: Duration::from_millis(5),
            graceful_stop_timeout: Duration::from_millis(100),
            graceful_poll_interval: Duration::from_millis(10),
            force_stop_grace: Duration::from_secs(1),
            ..LifecycleSettings::default()
        }
    }

    fn manager_with(backend: Arc<InMemoryBackend>) -> ContainerLifecycleManager {
        ContainerLifecycleManager::new(backend, EventBus::new(64), fast_settings())
    }

    fn assert_indexes_consistent(manager: &ContainerLifecycleManager) {
        let registry = manager.registry.read();
        for (task_id, ids) in &registry.by_task {
            for id in ids {
                let container = registry.containers.get(id).expect("indexed container is managed");
                assert_eq!(container.task_id(), *task_id);
            }
        }
        for (id, container) in &registry.containers {
            assert!(registry.by_task[&container.task_id()].contains(id));
        }
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("autocoder-coder:1.2"), ("autocoder-coder".into(), "1.2".into()));
        assert_eq!(split_reference("autocoder-coder"), ("autocoder-coder".into(), "latest".into()));
        assert_eq!(
            split_reference("registry:5000/autocoder-coder"),
            ("registry:5000/autocoder-coder".into(), "latest".into())
        );
    }

    #[tokio::test]
    async fn test_spawn_registers_container() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let manager = manager_with(backend.clone());
        let task_id = TaskId::new();

        let id = manager
            .spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Coder).requirements(vec!["x".into()]))
            .await
            .unwrap();

        let container = manager.get_managed_container(&id).unwrap();
        assert_eq!(container.role(), AgentRole::Coder);
        assert_eq!(container.agent_config.capabilities.len(), 5);
        assert!(container.status.ready());
        assert_eq!(container.agent_config.env["AUTOCODER_TASK_ID"], task_id.to_string());
        assert_eq!(manager.get_task_containers(task_id).len(), 1);
        assert_indexes_consistent(&manager);
    }

    #[tokio::test]
    async fn test_ports_are_allocated_in_pairs() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let manager = manager_with(backend);
        let task_id = TaskId::new();

        let first = manager.spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Coder)).await.unwrap();
        let second = manager.spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Reviewer)).await.unwrap();

        let first = manager.get_managed_container(&first).unwrap().agent_config.ports;
        let second = manager.get_managed_container(&second).unwrap().agent_config.ports;
        assert_eq!(first, PortAssignment { communication: 8000, health: 8001 });
        assert_eq!(second, PortAssignment { communication: 8002, health: 8003 });
    }

    #[tokio::test]
    async fn test_builds_missing_image_once() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager_with(backend.clone());
        let task_id = TaskId::new();

        manager.spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Tester)).await.unwrap();
        manager.spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Tester)).await.unwrap();

        let builds: Vec<_> = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Build(_)))
            .collect();
        assert_eq!(builds, vec![BackendCall::Build("autocoder-tester:latest".to_string())]);
    }

    #[tokio::test]
    async fn test_main_role_is_rejected() {
        let manager = manager_with(Arc::new(InMemoryBackend::new().with_images(IMAGES)));
        let result = manager.spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Main)).await;
        assert!(matches!(result, Err(LifecycleError::InvalidRole(AgentRole::Main))));
    }

    #[tokio::test]
    async fn test_readiness_timeout_removes_container() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        backend.hold_unready_role(AgentRole::Reviewer);
        let manager = manager_with(backend.clone());

        let result = manager
            .spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Reviewer).timeout(Duration::from_millis(50)))
            .await;

        assert!(matches!(result, Err(LifecycleError::ReadinessTimeout { .. })));
        assert!(backend.container_ids().is_empty());
        assert!(manager.list_managed_containers().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_fails_fast_on_exit() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        backend.crash_on_start_role(AgentRole::Coder);
        let manager = manager_with(backend.clone());

        let started = std::time::Instant::now();
        let result = manager.spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Coder)).await;

        assert!(matches!(
            result,
            Err(LifecycleError::ReadinessFailed { state: ContainerState::Exited, .. })
        ));
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(backend.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_batch_spawn_rolls_back() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        backend.fail_create_for_role(AgentRole::Reviewer);
        let manager = manager_with(backend.clone());
        let task_id = TaskId::new();

        let result = manager
            .spawn_sub_agents(vec![
                SpawnRequest::new(task_id, AgentRole::Coder),
                SpawnRequest::new(task_id, AgentRole::Tester),
                SpawnRequest::new(task_id, AgentRole::Reviewer),
            ])
            .await;

        assert!(result.is_err());
        assert!(manager.get_task_containers(task_id).is_empty());
        assert!(backend.containers_with_label(LABEL_TASK_ID, &task_id.to_string()).is_empty());
        assert_indexes_consistent(&manager);
    }

    #[tokio::test]
    async fn test_graceful_termination() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let manager = manager_with(backend.clone());
        let mut events = manager.event_bus.subscribe();
        let task_id = TaskId::new();
        let id = manager.spawn_sub_agent(SpawnRequest::new(task_id, AgentRole::Coder)).await.unwrap();

        manager.terminate_sub_agent(&id, true).await.unwrap();

        assert!(manager.get_managed_container(&id).is_none());
        assert!(manager.get_task_containers(task_id).is_empty());
        assert!(!backend.calls().iter().any(|c| matches!(c, BackendCall::Stop { .. })));

        let _spawned = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            crate::infrastructure::event_bus::DomainEvent::Container(ContainerLifecycleEvent::Terminated {
                graceful, ..
            }) => assert!(graceful),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_graceful_falls_back_to_forced_stop() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        backend.ignore_sigterm(true);
        let manager = manager_with(backend.clone());
        let id = manager
            .spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Coder))
            .await
            .unwrap();

        manager.terminate_sub_agent(&id, true).await.unwrap();

        let calls = backend.calls();
        assert!(calls.iter().any(|c| matches!(c, BackendCall::Exec { .. })));
        assert!(calls.iter().any(|c| matches!(c, BackendCall::Stop { grace, .. } if *grace == Duration::from_secs(1))));
        assert!(backend.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unknown_container() {
        let manager = manager_with(Arc::new(InMemoryBackend::new()));
        let result = manager.terminate_sub_agent(&ContainerId::new("ghost"), true).await;
        assert!(matches!(result, Err(LifecycleError::NotFound(_))));
    }

    #[derive(Default)]
    struct RecordingPolicy {
        losses: Mutex<Vec<(ContainerId, LossCause)>>,
    }

    #[async_trait]
    impl RecoveryPolicy for RecordingPolicy {
        async fn on_container_lost(&self, container: &ManagedContainer, cause: &LossCause) {
            self.losses
                .lock()
                .await
                .push((container.container_id.clone(), cause.clone()));
        }
    }

    #[tokio::test]
    async fn test_unexpected_death_drops_container_and_calls_policy() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let policy = Arc::new(RecordingPolicy::default());
        let manager = manager_with(backend.clone()).with_recovery_policy(policy.clone());
        let id = manager
            .spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Coder))
            .await
            .unwrap();

        manager
            .handle_backend_event(BackendEvent {
                kind: BackendEventKind::Die,
                container_id: id.clone(),
                data: HashMap::from([("exitCode".to_string(), "137".to_string())]),
            })
            .await;

        assert!(manager.get_managed_container(&id).is_none());
        let losses = policy.losses.lock().await;
        assert_eq!(
            losses.as_slice(),
            &[(id, LossCause::Died { reason: "exited with code 137".to_string() })]
        );
    }

    #[tokio::test]
    async fn test_unhealthy_event_keeps_container() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let policy = Arc::new(RecordingPolicy::default());
        let manager = manager_with(backend.clone()).with_recovery_policy(policy.clone());
        let id = manager
            .spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Tester))
            .await
            .unwrap();

        manager
            .handle_backend_event(BackendEvent {
                kind: BackendEventKind::HealthStatus,
                container_id: id.clone(),
                data: HashMap::from([("health_status".to_string(), "unhealthy".to_string())]),
            })
            .await;

        let container = manager.get_managed_container(&id).unwrap();
        assert_eq!(container.status.health, HealthState::Unhealthy);
        assert_eq!(policy.losses.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_in_sub_agent_uses_workspace() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let manager = manager_with(backend.clone());
        let id = manager
            .spawn_sub_agent(SpawnRequest::new(TaskId::new(), AgentRole::Coder))
            .await
            .unwrap();

        let output = manager
            .execute_in_sub_agent(&id, vec!["git".into(), "status".into()])
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.contains("git status"));

        let missing = manager
            .execute_in_sub_agent(&ContainerId::new("ghost"), vec!["ls".into()])
            .await;
        assert!(matches!(missing, Err(LifecycleError::NotFound(_))));
    }
}
