// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # In-Memory Execution Backend
//!
//! Simulates containers inside the orchestrator process. Selected with
//! `backend.kind: memory` for local runs without a Docker daemon, and used by
//! the test suites, which steer it through the fault-injection methods:
//!
//! | Method | Effect |
//! |--------|--------|
//! | [`fail_create_for_role`](InMemoryBackend::fail_create_for_role) | `create_container` errors for that role |
//! | [`hold_unready_role`](InMemoryBackend::hold_unready_role) | containers of that role never report healthy |
//! | [`crash_on_start_role`](InMemoryBackend::crash_on_start_role) | containers of that role exit right after start |
//! | [`ignore_sigterm`](InMemoryBackend::ignore_sigterm) | `kill -TERM 1` has no effect |
//! | [`simulate_exit`](InMemoryBackend::simulate_exit) | container exits and a `die` event fires |
//! | [`simulate_unhealthy`](InMemoryBackend::simulate_unhealthy) | health flips and a `health_status` event fires |
//!
//! Stopping a container emits `die`; removing it emits `destroy`, matching
//! what a real daemon reports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::agent::AgentRole;
use crate::domain::container::{ContainerId, ContainerState, ContainerStatus, HealthState};
use crate::domain::runtime::{
    BackendError, BackendEvent, BackendEventKind, BuildImageRequest, ContainerFilter, ContainerSummary,
    CreateContainerRequest, ExecOutput, ExecRequest, ExecutionBackend, ImageSummary, LABEL_ROLE,
};

/// Every backend call, in the order it was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create { name: String, image: String },
    Start(ContainerId),
    Stop { id: ContainerId, grace: Duration },
    Remove { id: ContainerId, force: bool },
    Exec { id: ContainerId, command: Vec<String> },
    Build(String),
}

#[derive(Debug, Clone)]
struct SimContainer {
    role: Option<AgentRole>,
    labels: HashMap<String, String>,
    state: ContainerState,
    health: HealthState,
}

#[derive(Default)]
struct SimState {
    containers: HashMap<ContainerId, SimContainer>,
    images: HashSet<String>,
    next_id: u64,
    calls: Vec<BackendCall>,
    failing_roles: HashSet<AgentRole>,
    unready_roles: HashSet<AgentRole>,
    crashing_roles: HashSet<AgentRole>,
    ignore_sigterm: bool,
    fail_builds: bool,
}

pub struct InMemoryBackend {
    state: Mutex<SimState>,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(SimState::default()),
            events,
        }
    }

    /// Images already present, so spawns skip the build step.
    pub fn with_images<I, S>(self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().images.extend(images.into_iter().map(Into::into));
        self
    }

    pub fn fail_create_for_role(&self, role: AgentRole) {
        self.state.lock().failing_roles.insert(role);
    }

    pub fn hold_unready_role(&self, role: AgentRole) {
        self.state.lock().unready_roles.insert(role);
    }

    pub fn crash_on_start_role(&self, role: AgentRole) {
        self.state.lock().crashing_roles.insert(role);
    }

    pub fn ignore_sigterm(&self, ignore: bool) {
        self.state.lock().ignore_sigterm = ignore;
    }

    pub fn fail_builds(&self, fail: bool) {
        self.state.lock().fail_builds = fail;
    }

    /// Insert a container that was not created through this backend, e.g. a
    /// leftover from a previous orchestrator run.
    pub fn seed_container(&self, labels: HashMap<String, String>, state: ContainerState) -> ContainerId {
        let mut sim = self.state.lock();
        let id = next_container_id(&mut sim);
        let role = labels.get(LABEL_ROLE).and_then(|r| r.parse().ok());
        sim.containers.insert(
            id.clone(),
            SimContainer {
                role,
                labels,
                state,
                health: HealthState::None,
            },
        );
        id
    }

    pub fn simulate_exit(&self, id: &ContainerId, exit_code: i64) {
        let found = {
            let mut sim = self.state.lock();
            match sim.containers.get_mut(id) {
                Some(container) => {
                    container.state = ContainerState::Exited;
                    container.health = HealthState::None;
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(
                BackendEventKind::Die,
                id,
                HashMap::from([("exitCode".to_string(), exit_code.to_string())]),
            );
        }
    }

    pub fn simulate_unhealthy(&self, id: &ContainerId) {
        let found = {
            let mut sim = self.state.lock();
            match sim.containers.get_mut(id) {
                Some(container) => {
                    container.health = HealthState::Unhealthy;
                    true
                }
                None => false,
            }
        };
        if found {
            self.emit(
                BackendEventKind::HealthStatus,
                id,
                HashMap::from([("health_status".to_string(), "unhealthy".to_string())]),
            );
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.state.lock().containers.keys().cloned().collect()
    }

    /// Containers still known to the backend that carry `key=value`.
    pub fn containers_with_label(&self, key: &str, value: &str) -> Vec<ContainerId> {
        self.state
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn emit(&self, kind: BackendEventKind, id: &ContainerId, data: HashMap<String, String>) {
        let _ = self.events.send(BackendEvent {
            kind,
            container_id: id.clone(),
            data,
        });
    }
}

fn next_container_id(sim: &mut SimState) -> ContainerId {
    sim.next_id += 1;
    ContainerId::new(format!("sim-{:06}", sim.next_id))
}

#[async_trait]
impl ExecutionBackend for InMemoryBackend {
    async fn ping(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn create_container(&self, request: CreateContainerRequest) -> Result<ContainerId, BackendError> {
        let mut sim = self.state.lock();
        sim.calls.push(BackendCall::Create {
            name: request.name.clone(),
            image: request.image.clone(),
        });

        let role: Option<AgentRole> = request.labels.get(LABEL_ROLE).and_then(|r| r.parse().ok());
        if let Some(role) = role {
            if sim.failing_roles.contains(&role) {
                return Err(BackendError::Operation(format!("Injected create failure for role {}", role)));
            }
        }
        if !sim.images.contains(&request.image) {
            return Err(BackendError::Operation(format!("No such image: {}", request.image)));
        }

        let id = next_container_id(&mut sim);
        sim.containers.insert(
            id.clone(),
            SimContainer {
                role,
                labels: request.labels,
                state: ContainerState::Created,
                health: HealthState::None,
            },
        );
        debug!(container_id = %id, "Simulated container created");
        Ok(id)
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), BackendError> {
        let mut sim = self.state.lock();
        sim.calls.push(BackendCall::Start(id.clone()));
        let unready = sim.unready_roles.clone();
        let crashing = sim.crashing_roles.clone();

        let container = sim
            .containers
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;

        let role = container.role;
        if role.map(|r| crashing.contains(&r)).unwrap_or(false) {
            container.state = ContainerState::Exited;
            container.health = HealthState::None;
        } else {
            container.state = ContainerState::Running;
            container.health = if role.map(|r| unready.contains(&r)).unwrap_or(false) {
                HealthState::Starting
            } else {
                HealthState::Healthy
            };
        }
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<(), BackendError> {
        let was_running = {
            let mut sim = self.state.lock();
            sim.calls.push(BackendCall::Stop { id: id.clone(), grace });
            let container = sim
                .containers
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            let was_running = container.state == ContainerState::Running;
            container.state = ContainerState::Exited;
            container.health = HealthState::None;
            was_running
        };
        if was_running {
            self.emit(BackendEventKind::Die, id, HashMap::new());
        }
        Ok(())
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), BackendError> {
        {
            let mut sim = self.state.lock();
            sim.calls.push(BackendCall::Remove { id: id.clone(), force });
            let state = sim
                .containers
                .get(id)
                .map(|c| c.state)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            if state == ContainerState::Running && !force {
                return Err(BackendError::Operation(format!(
                    "Cannot remove running container {} without force",
                    id
                )));
            }
            sim.containers.remove(id);
        }
        self.emit(BackendEventKind::Destroy, id, HashMap::new());
        Ok(())
    }

    async fn container_status(&self, id: &ContainerId) -> Result<ContainerStatus, BackendError> {
        let sim = self.state.lock();
        let container = sim
            .containers
            .get(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        Ok(ContainerStatus::new(container.state, container.health))
    }

    async fn execute_in_container(&self, id: &ContainerId, request: ExecRequest) -> Result<ExecOutput, BackendError> {
        let exited = {
            let mut sim = self.state.lock();
            sim.calls.push(BackendCall::Exec {
                id: id.clone(),
                command: request.command.clone(),
            });
            let ignore_sigterm = sim.ignore_sigterm;
            let container = sim
                .containers
                .get_mut(id)
                .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
            if container.state != ContainerState::Running {
                return Err(BackendError::Operation(format!("Container {} is not running", id)));
            }

            let is_sigterm = request.command.first().map(String::as_str) == Some("kill")
                && request.command.iter().any(|arg| arg == "-TERM");
            if is_sigterm && !ignore_sigterm {
                container.state = ContainerState::Exited;
                container.health = HealthState::None;
                true
            } else {
                false
            }
        };

        if exited {
            self.emit(BackendEventKind::Die, id, HashMap::from([("exitCode".to_string(), "0".to_string())]));
        }

        Ok(ExecOutput {
            stdout: format!("{}\n", request.command.join(" ")),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn list_containers(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, BackendError> {
        let sim = self.state.lock();
        Ok(sim
            .containers
            .iter()
            .filter(|(_, c)| filter.all || c.state == ContainerState::Running)
            .filter(|(_, c)| filter.labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                state: c.state,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, BackendError> {
        let sim = self.state.lock();
        Ok(sim
            .images
            .iter()
            .map(|reference| ImageSummary {
                id: format!("sha256:{}", reference),
                tags: vec![reference.clone()],
            })
            .collect())
    }

    async fn build_image(&self, request: BuildImageRequest) -> Result<(), BackendError> {
        let mut sim = self.state.lock();
        let reference = request.reference();
        sim.calls.push(BackendCall::Build(reference.clone()));
        if sim.fail_builds {
            return Err(BackendError::ImageBuild(format!("Injected build failure for {}", reference)));
        }
        sim.images.insert(reference);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
