// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Coordinator
//!
//! Owns every [`Task`] and the dispatch queue. Turns a task request into a
//! team of sub-agents and drives the task through its state machine as
//! reports arrive over the bus.
//!
//! ## Assignment
//!
//! ```text
//! pending ─▶ derive roles ─▶ spawn (coder, tester?, reviewer) ─▶ assigned ─▶ send assignments ─▶ in_progress
//!                                    │
//!                                    └─ any spawn fails: terminate task containers, task ─▶ failed
//! ```
//!
//! ## Reactions
//!
//! [`TaskCoordinator::spawn_event_listener`] subscribes to the [`EventBus`]:
//!
//! | Event | Effect |
//! |-------|--------|
//! | `status_update` from an agent | [`TaskCoordinator::update_task_status`] |
//! | `result_report` from an agent | [`TaskCoordinator::complete_task`] |
//! | `error_report` from an agent | timeline entry; fails the task when fatal |
//! | container deadline exceeded | task ─▶ failed |
//! | container died | timeline entry only |
//!
//! Every terminal transition releases the task's containers before the
//! call returns.

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autocoder_core::application::lifecycle::{ContainerLifecycleManager, LifecycleError, SpawnRequest};
use autocoder_core::domain::agent::AgentId;
use autocoder_core::domain::container::ContainerId;
use autocoder_core::domain::events::{AgentBusEvent, ContainerLifecycleEvent, TaskLifecycleEvent};
use autocoder_core::domain::message::{
    ErrorReport, Message, MessageType, ResultReport, StatusUpdate, TaskAssignment,
};
use autocoder_core::domain::node_config::CoordinatorConfig;
use autocoder_core::domain::task::{
    InvalidTransition, NewTask, Task, TaskEventKind, TaskId, TaskPriority, TaskResult, TaskStatus,
};
use autocoder_core::infrastructure::event_bus::{DomainEvent, EventBus, EventBusError};

use crate::application::message_bus::{AgentMessageBus, Delivery, ORCHESTRATOR_ID};
use crate::domain::queue::TaskQueue;
use crate::domain::roles::derive_roles;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Task {task_id} is already {status}")]
    Terminal { task_id: TaskId, status: TaskStatus },

    #[error("Task {task_id} is {status} or already being assigned")]
    NotPending { task_id: TaskId, status: TaskStatus },

    #[error("Task {0} passed its deadline before assignment")]
    DeadlinePassed(TaskId),

    #[error("Failed to spawn sub-agents for task {task_id}: {source}")]
    Spawn {
        task_id: TaskId,
        #[source]
        source: LifecycleError,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub dispatch_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

impl CoordinatorSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            dispatch_interval: config.dispatch_interval(),
        }
    }
}

/// Optional criteria for [`TaskCoordinator::list_tasks`]; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s) && self.priority.map_or(true, |p| task.priority == p)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub total: usize,
    pub queued: usize,
    pub by_status: HashMap<TaskStatus, usize>,
    pub by_priority: HashMap<TaskPriority, usize>,
    pub average_completion_ms: Option<f64>,
    pub average_failure_ms: Option<f64>,
    /// Completed over all terminal tasks.
    pub success_rate: Option<f64>,
}

/// One transition applied under the task lock, published after it is released.
struct Applied {
    task_id: TaskId,
    from: TaskStatus,
    to: TaskStatus,
    at: DateTime<Utc>,
}

pub struct TaskCoordinator {
    tasks: RwLock<HashMap<TaskId, Task>>,
    queue: Mutex<TaskQueue>,
    /// Tasks whose assignment is between claim and `in_progress`.
    assigning: Mutex<HashSet<TaskId>>,
    lifecycle: Arc<ContainerLifecycleManager>,
    bus: Arc<AgentMessageBus>,
    event_bus: EventBus,
    settings: CoordinatorSettings,
    dispatching: AtomicBool,
    shutdown: CancellationToken,
}

impl TaskCoordinator {
    pub fn new(
        lifecycle: Arc<ContainerLifecycleManager>,
        bus: Arc<AgentMessageBus>,
        event_bus: EventBus,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(TaskQueue::new()),
            assigning: Mutex::new(HashSet::new()),
            lifecycle,
            bus,
            event_bus,
            settings,
            dispatching: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn create_task(&self, request: NewTask) -> TaskId {
        let task = Task::new(request);
        let task_id = task.id;
        let priority = task.priority;
        let created_at = task.created_at;

        info!(task_id = %task_id, priority = %priority, title = %task.title, "Task created");
        self.tasks.write().insert(task_id, task);
        self.queue.lock().push(task_id, priority);

        counter!("autocoder_tasks_created_total", "priority" => priority.as_str()).increment(1);
        self.event_bus
            .publish_task_event(TaskLifecycleEvent::Created { task_id, created_at });
        task_id
    }

    /// Dispatch the highest-priority pending task, if any.
    ///
    /// At most one assignment runs at a time; a call made while another is in
    /// flight returns `None` immediately.
    pub async fn process_queue(&self) -> Option<TaskId> {
        if self.dispatching.swap(true, Ordering::SeqCst) {
            debug!("Assignment already in flight, skipping dispatch");
            return None;
        }
        let _reset = scopeguard::guard((), |_| self.dispatching.store(false, Ordering::SeqCst));

        let task_id = loop {
            let next = self.queue.lock().pop()?;
            match self.tasks.read().get(&next.task_id).map(|t| t.status) {
                Some(TaskStatus::Pending) => break next.task_id,
                Some(status) => debug!(task_id = %next.task_id, status = %status, "Skipping non-pending queued task"),
                None => debug!(task_id = %next.task_id, "Skipping unknown queued task"),
            }
        };

        if let Err(e) = self.assign_task(task_id).await {
            error!(task_id = %task_id, "Task assignment failed: {}", e);
        }
        Some(task_id)
    }

    /// Spawn the task's sub-agents and deliver their assignments. Only one
    /// caller can assign a given task; the others get `NotPending`.
    pub async fn assign_task(&self, task_id: TaskId) -> Result<(), CoordinatorError> {
        let task = self.claim(task_id)?;
        let _release = scopeguard::guard((), |_| {
            self.assigning.lock().remove(&task_id);
        });
        self.queue.lock().remove(task_id);

        let now = Utc::now();
        if task.is_past_deadline(now) {
            self.fail_task(task_id, TaskEventKind::DeadlineExceeded, "Deadline passed before assignment".to_string(), None)
                .await;
            return Err(CoordinatorError::DeadlinePassed(task_id));
        }
        let timeout = task.deadline.and_then(|deadline| (deadline - now).to_std().ok());

        let roles = derive_roles(&task);
        info!(task_id = %task_id, roles = ?roles, "Assigning task");

        let requests = roles
            .iter()
            .map(|role| {
                let request = SpawnRequest::new(task_id, *role)
                    .requirements(task.requirements.clone())
                    .priority(task.priority);
                match timeout {
                    Some(timeout) => request.timeout(timeout),
                    None => request,
                }
            })
            .collect();

        let container_ids = match self.lifecycle.spawn_sub_agents(requests).await {
            Ok(ids) => ids,
            Err(e) => {
                // Sweep anything still tagged for this task
                self.lifecycle.terminate_task_containers(task_id).await;
                self.fail_task(task_id, TaskEventKind::Failed, format!("Assignment failed: {}", e), None)
                    .await;
                return Err(CoordinatorError::Spawn { task_id, source: e });
            }
        };

        let assigned = {
            let mut tasks = self.tasks.write();
            match tasks.get_mut(&task_id) {
                None => Err(CoordinatorError::NotFound(task_id)),
                Some(task) if task.status.is_terminal() => Err(CoordinatorError::Terminal {
                    task_id,
                    status: task.status,
                }),
                Some(task) => task
                    .transition(TaskStatus::Assigned)
                    .map_err(CoordinatorError::from)
                    .map(|from| {
                        task.assigned_container_ids = container_ids.clone();
                        task.record(
                            TaskEventKind::Assigned,
                            format!("Assigned to {} sub-agents", container_ids.len()),
                            None,
                            Some(serde_json::json!({
                                "roles": roles,
                                "containerIds": container_ids,
                            })),
                        );
                        Applied {
                            task_id,
                            from,
                            to: TaskStatus::Assigned,
                            at: task.updated_at,
                        }
                    }),
            }
        };
        let assigned = match assigned {
            Ok(applied) => applied,
            Err(e) => {
                // Cancelled while the containers were starting
                warn!(task_id = %task_id, "Task finished during assignment, releasing containers");
                self.lifecycle.terminate_task_containers(task_id).await;
                return Err(e);
            }
        };
        self.publish(assigned);

        self.send_assignments(&task);

        let started = {
            let mut tasks = self.tasks.write();
            tasks.get_mut(&task_id).and_then(|task| {
                let from = task.transition(TaskStatus::InProgress).ok()?;
                task.record(TaskEventKind::Started, "Task assignment delivered to sub-agents", None, None);
                Some(Applied {
                    task_id,
                    from,
                    to: TaskStatus::InProgress,
                    at: task.updated_at,
                })
            })
        };
        if let Some(applied) = started {
            self.publish(applied);
        }
        Ok(())
    }

    fn claim(&self, task_id: TaskId) -> Result<Task, CoordinatorError> {
        let tasks = self.tasks.read();
        let task = tasks.get(&task_id).ok_or(CoordinatorError::NotFound(task_id))?;
        if task.status != TaskStatus::Pending || !self.assigning.lock().insert(task_id) {
            return Err(CoordinatorError::NotPending {
                task_id,
                status: task.status,
            });
        }
        Ok(task.clone())
    }

    fn send_assignments(&self, task: &Task) {
        for container in self.lifecycle.get_task_containers(task.id) {
            let agent_id = container.agent_config.agent_id.clone();
            let assignment = TaskAssignment {
                task_id: task.id,
                title: task.title.clone(),
                description: task.description.clone(),
                requirements: task.requirements.clone(),
                acceptance_criteria: task.acceptance_criteria.clone(),
                priority: task.priority,
                context: task.context.clone(),
                role: container.role(),
                deadline: task.deadline,
            };
            self.bus.expect_agent(&agent_id);
            match Message::with_payload(MessageType::TaskAssignment, ORCHESTRATOR_ID, agent_id.as_str(), &assignment) {
                Ok(message) => {
                    let delivery = self.bus.send_to_agent(&agent_id, message);
                    debug!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        queued = delivery == Delivery::Queued,
                        "Task assignment sent"
                    );
                }
                Err(e) => warn!(task_id = %task.id, agent_id = %agent_id, "Failed to encode task assignment: {}", e),
            }
        }
    }

    /// Apply a status reported for a task. Terminal statuses release the
    /// task's containers before returning.
    pub async fn update_task_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        message: Option<String>,
        agent_id: Option<AgentId>,
        data: Option<serde_json::Value>,
    ) -> Result<(), CoordinatorError> {
        let kind = match status {
            TaskStatus::Completed => TaskEventKind::Completed,
            TaskStatus::Failed => TaskEventKind::Failed,
            TaskStatus::Cancelled => TaskEventKind::Cancelled,
            _ => TaskEventKind::StatusChanged,
        };
        let message = message.unwrap_or_else(|| format!("Status changed to {}", status));
        self.apply(task_id, status, kind, message, agent_id, data, None).await
    }

    /// Record the final result. A successful result completes the task, an
    /// unsuccessful one fails it.
    pub async fn complete_task(
        &self,
        task_id: TaskId,
        result: TaskResult,
        agent_id: Option<AgentId>,
    ) -> Result<(), CoordinatorError> {
        let (status, kind) = if result.success {
            (TaskStatus::Completed, TaskEventKind::Completed)
        } else {
            (TaskStatus::Failed, TaskEventKind::Failed)
        };
        let message = result
            .summary
            .clone()
            .unwrap_or_else(|| format!("Task {}", status));
        self.apply(task_id, status, kind, message, agent_id, None, Some(result))
            .await
    }

    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) -> Result<(), CoordinatorError> {
        self.apply(
            task_id,
            TaskStatus::Cancelled,
            TaskEventKind::Cancelled,
            format!("Task cancelled: {}", reason),
            None,
            None,
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        kind: TaskEventKind,
        message: String,
        agent_id: Option<AgentId>,
        data: Option<serde_json::Value>,
        result: Option<TaskResult>,
    ) -> Result<(), CoordinatorError> {
        let applied = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(&task_id).ok_or(CoordinatorError::NotFound(task_id))?;
            if task.status.is_terminal() {
                return Err(CoordinatorError::Terminal {
                    task_id,
                    status: task.status,
                });
            }
            let from = task.transition(status)?;
            if result.is_some() {
                task.result = result;
            }
            task.record(kind, message, agent_id, data);
            Applied {
                task_id,
                from,
                to: status,
                at: task.updated_at,
            }
        };

        self.publish(applied);
        if status.is_terminal() {
            self.finish(task_id, status).await;
        }
        Ok(())
    }

    /// Force a task to failed, ignoring tasks that are already terminal.
    async fn fail_task(&self, task_id: TaskId, kind: TaskEventKind, message: String, agent_id: Option<AgentId>) {
        let applied = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            let Ok(from) = task.transition(TaskStatus::Failed) else {
                return;
            };
            task.assigned_container_ids.clear();
            task.record(kind, message, agent_id, None);
            Applied {
                task_id,
                from,
                to: TaskStatus::Failed,
                at: task.updated_at,
            }
        };
        self.publish(applied);
        self.finish(task_id, TaskStatus::Failed).await;
    }

    async fn finish(&self, task_id: TaskId, status: TaskStatus) {
        self.queue.lock().remove(task_id);
        let agents: Vec<AgentId> = self
            .lifecycle
            .get_task_containers(task_id)
            .into_iter()
            .map(|container| container.agent_config.agent_id)
            .collect();
        let released = self.lifecycle.terminate_task_containers(task_id).await;
        let discarded = self.bus.forget_agents(&agents);
        counter!("autocoder_tasks_finished_total", "status" => status.as_str()).increment(1);
        info!(task_id = %task_id, status = %status, released, discarded, "Task finished");
    }

    fn publish(&self, applied: Applied) {
        debug!(task_id = %applied.task_id, from = %applied.from, to = %applied.to, "Task status changed");
        self.event_bus.publish_task_event(TaskLifecycleEvent::StatusChanged {
            task_id: applied.task_id,
            from: applied.from,
            to: applied.to,
            changed_at: applied.at,
        });
    }

    fn record(&self, task_id: TaskId, kind: TaskEventKind, message: String, agent_id: Option<AgentId>, data: Option<serde_json::Value>) {
        if let Some(task) = self.tasks.write().get_mut(&task_id) {
            task.record(kind, message, agent_id, data);
        }
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks.read().get(&task_id).cloned()
    }

    /// Matching tasks, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        tasks
    }

    pub fn queued_task_ids(&self) -> Vec<TaskId> {
        self.queue.lock().iter().map(|q| q.task_id).collect()
    }

    pub fn get_task_metrics(&self) -> TaskMetrics {
        let tasks = self.tasks.read();
        let mut metrics = TaskMetrics {
            total: tasks.len(),
            queued: self.queue.lock().len(),
            ..Default::default()
        };

        let mut completed_ms = Vec::new();
        let mut failed_ms = Vec::new();
        let mut terminal = 0usize;
        for task in tasks.values() {
            *metrics.by_status.entry(task.status).or_default() += 1;
            *metrics.by_priority.entry(task.priority).or_default() += 1;
            match task.status {
                TaskStatus::Completed => completed_ms.push(task.duration_ms() as f64),
                TaskStatus::Failed => failed_ms.push(task.duration_ms() as f64),
                _ => {}
            }
            if task.status.is_terminal() {
                terminal += 1;
            }
        }

        let average = |values: &[f64]| (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
        metrics.average_completion_ms = average(&completed_ms);
        metrics.average_failure_ms = average(&failed_ms);
        metrics.success_rate = (terminal > 0).then(|| completed_ms.len() as f64 / terminal as f64);
        metrics
    }

    /// React to a routable message an agent sent to the orchestrator.
    pub async fn handle_agent_message(&self, agent_id: AgentId, message: Message) -> Result<(), CoordinatorError> {
        match message.kind {
            MessageType::StatusUpdate => {
                let Ok(update) = message.payload::<StatusUpdate>() else {
                    warn!(agent_id = %agent_id, message_id = %message.id, "Ignoring malformed status update");
                    return Ok(());
                };
                let data = update
                    .progress
                    .map(|progress| serde_json::json!({ "progress": progress }));
                self.update_task_status(update.task_id, update.status, update.message, Some(agent_id), data)
                    .await
            }
            MessageType::ResultReport => {
                let Ok(report) = message.payload::<ResultReport>() else {
                    warn!(agent_id = %agent_id, message_id = %message.id, "Ignoring malformed result report");
                    return Ok(());
                };
                let result = TaskResult {
                    success: report.success,
                    summary: report.summary,
                    output: report.output,
                };
                self.complete_task(report.task_id, result, Some(agent_id)).await
            }
            MessageType::ErrorReport => {
                let Ok(report) = message.payload::<ErrorReport>() else {
                    warn!(agent_id = %agent_id, message_id = %message.id, "Ignoring malformed error report");
                    return Ok(());
                };
                let Some(task_id) = report.task_id.or_else(|| message.task_id()) else {
                    warn!(agent_id = %agent_id, "Agent error without task: {}", report.error);
                    return Ok(());
                };
                warn!(task_id = %task_id, agent_id = %agent_id, fatal = report.fatal, "Agent reported error: {}", report.error);
                if report.fatal {
                    self.update_task_status(
                        task_id,
                        TaskStatus::Failed,
                        Some(format!("Agent error: {}", report.error)),
                        Some(agent_id),
                        None,
                    )
                    .await
                } else {
                    self.record(task_id, TaskEventKind::AgentError, report.error, Some(agent_id), None);
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    async fn handle_event(&self, event: DomainEvent) {
        match event {
            DomainEvent::Agent(AgentBusEvent::MessageReceived { agent_id, message }) => {
                if message.is_addressed() && message.to != ORCHESTRATOR_ID {
                    return;
                }
                if let Err(e) = self.handle_agent_message(agent_id.clone(), message).await {
                    warn!(agent_id = %agent_id, "Agent report rejected: {}", e);
                }
            }
            DomainEvent::Container(ContainerLifecycleEvent::DeadlineExceeded {
                task_id, container_ids, ..
            }) => {
                warn!(task_id = %task_id, containers = container_ids.len(), "Task deadline exceeded");
                self.fail_task(
                    task_id,
                    TaskEventKind::DeadlineExceeded,
                    format!("Deadline exceeded; {} containers terminated", container_ids.len()),
                    None,
                )
                .await;
            }
            DomainEvent::Container(ContainerLifecycleEvent::Died {
                container_id,
                agent_id,
                task_id,
                reason,
                ..
            }) => {
                self.record_container_lost(task_id, &container_id, agent_id, &reason);
            }
            _ => {}
        }
    }

    fn record_container_lost(&self, task_id: TaskId, container_id: &ContainerId, agent_id: AgentId, reason: &str) {
        self.record(
            task_id,
            TaskEventKind::ContainerLost,
            format!("Container {} lost: {}", container_id, reason),
            Some(agent_id),
            Some(serde_json::json!({ "containerId": container_id })),
        );
    }

    /// Subscribe to agent reports and container events.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut receiver = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = coordinator.shutdown.cancelled() => return,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(event) => coordinator.handle_event(event).await,
                    Err(EventBusError::Lagged(n)) => warn!("Coordinator missed {} events", n),
                    Err(EventBusError::Closed) => return,
                    Err(EventBusError::Empty) => {}
                }
            }
        })
    }

    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.settings.dispatch_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => {
                        debug!("Task dispatcher stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        coordinator.process_queue().await;
                    }
                }
            }
        })
    }

    /// Stop the dispatcher and event listener. Tasks and containers are left
    /// as they are.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::message_bus::{AuthPolicy, BusSettings};
    use autocoder_core::application::lifecycle::LifecycleSettings;
    use async_trait::async_trait;
    use autocoder_core::domain::agent::AgentRole;
    use autocoder_core::domain::container::ContainerStatus;
    use autocoder_core::domain::runtime::{
        BackendError, BackendEvent, BuildImageRequest, ContainerFilter, ContainerSummary, CreateContainerRequest,
        ExecOutput, ExecRequest, ExecutionBackend, ImageSummary,
    };
    use autocoder_core::infrastructure::memory_runtime::InMemoryBackend;
    use tokio::sync::broadcast;
    use autocoder_core::infrastructure::signature::LengthHeuristicVerifier;
    use serde_json::json;

    const IMAGES: [&str; 3] = ["autocoder-coder:latest", "autocoder-reviewer:latest", "autocoder-tester:latest"];

    fn setup() -> (Arc<InMemoryBackend>, Arc<TaskCoordinator>, Arc<AgentMessageBus>) {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let (coordinator, bus) = coordinator_over(backend.clone());
        (backend, coordinator, bus)
    }

    fn coordinator_over(backend: Arc<dyn ExecutionBackend>) -> (Arc<TaskCoordinator>, Arc<AgentMessageBus>) {
        let event_bus = EventBus::new(256);
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            backend,
            event_bus.clone(),
            LifecycleSettings {
                readiness_timeout: Duration::from_millis(300),
                readiness_poll_interval: Duration::from_millis(10),
                graceful_stop_timeout: Duration::from_millis(100),
                graceful_poll_interval: Duration::from_millis(10),
                ..LifecycleSettings::default()
            },
        ));
        let bus = Arc::new(AgentMessageBus::new(
            BusSettings::default(),
            AuthPolicy::new(Arc::new(LengthHeuristicVerifier::new(32))),
            event_bus.clone(),
        ));
        let coordinator = Arc::new(TaskCoordinator::new(
            lifecycle,
            bus.clone(),
            event_bus,
            CoordinatorSettings::default(),
        ));
        (coordinator, bus)
    }

    /// Delays container creation so overlapping assignments interleave.
    struct SlowCreate(Arc<InMemoryBackend>);

    #[async_trait]
    impl ExecutionBackend for SlowCreate {
        async fn ping(&self) -> Result<bool, BackendError> {
            self.0.ping().await
        }
        async fn create_container(&self, request: CreateContainerRequest) -> Result<ContainerId, BackendError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.create_container(request).await
        }
        async fn start_container(&self, id: &ContainerId) -> Result<(), BackendError> {
            self.0.start_container(id).await
        }
        async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<(), BackendError> {
            self.0.stop_container(id, grace).await
        }
        async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), BackendError> {
            self.0.remove_container(id, force).await
        }
        async fn container_status(&self, id: &ContainerId) -> Result<ContainerStatus, BackendError> {
            self.0.container_status(id).await
        }
        async fn execute_in_container(&self, id: &ContainerId, request: ExecRequest) -> Result<ExecOutput, BackendError> {
            self.0.execute_in_container(id, request).await
        }
        async fn list_containers(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, BackendError> {
            self.0.list_containers(filter).await
        }
        async fn list_images(&self) -> Result<Vec<ImageSummary>, BackendError> {
            self.0.list_images().await
        }
        async fn build_image(&self, request: BuildImageRequest) -> Result<(), BackendError> {
            self.0.build_image(request).await
        }
        fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent> {
            self.0.subscribe_events()
        }
    }

    fn request(requirements: &[&str]) -> NewTask {
        NewTask {
            title: "Login".to_string(),
            description: "Add a login endpoint".to_string(),
            requirements: requirements.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_task_defaults() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["implement login endpoint"]));
        let task = coordinator.get_task(id).unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.acceptance_criteria.len(), 4);
        assert_eq!(task.timeline[0].kind, TaskEventKind::Created);
        assert_eq!(coordinator.queued_task_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_assignment_sends_one_message_per_agent() {
        let (_backend, coordinator, bus) = setup();
        let id = coordinator.create_task(request(&["implement login endpoint"]));

        coordinator.assign_task(id).await.unwrap();

        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_container_ids.len(), 2);
        assert!(coordinator.queued_task_ids().is_empty());

        // Agents have not connected yet, so every assignment waits in their queue
        for container in coordinator.lifecycle.get_task_containers(id) {
            assert_eq!(bus.offline_queue_len(&container.agent_config.agent_id), 1);
        }
        let kinds: Vec<TaskEventKind> = task.timeline.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TaskEventKind::Created, TaskEventKind::Assigned, TaskEventKind::Started]
        );
    }

    #[tokio::test]
    async fn test_assign_requires_pending() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["x"]));
        coordinator.cancel_task(id, "not needed").await.unwrap();

        assert!(matches!(
            coordinator.assign_task(id).await,
            Err(CoordinatorError::NotPending { .. })
        ));
        assert!(coordinator.queued_task_ids().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_fails_task_without_orphans() {
        let (backend, coordinator, _bus) = setup();
        backend.fail_create_for_role(AgentRole::Reviewer);
        let id = coordinator.create_task(request(&["implement login endpoint"]));

        let result = coordinator.assign_task(id).await;

        assert!(matches!(result, Err(CoordinatorError::Spawn { .. })));
        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.assigned_container_ids.is_empty());
        assert!(task.timeline.last().unwrap().message.starts_with("Assignment failed"));
        assert!(coordinator.lifecycle.get_task_containers(id).is_empty());
        assert!(backend
            .containers_with_label(autocoder_core::domain::runtime::LABEL_TASK_ID, &id.to_string())
            .is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_before_spawning() {
        let (backend, coordinator, _bus) = setup();
        let mut req = request(&["x"]);
        req.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        let id = coordinator.create_task(req);

        assert!(matches!(
            coordinator.assign_task(id).await,
            Err(CoordinatorError::DeadlinePassed(_))
        ));
        assert_eq!(coordinator.get_task(id).unwrap().status, TaskStatus::Failed);
        assert!(backend.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_process_queue_skips_cancelled_tasks() {
        let (_backend, coordinator, _bus) = setup();
        let cancelled = coordinator.create_task(NewTask {
            priority: TaskPriority::Critical,
            ..request(&["x"])
        });
        let wanted = coordinator.create_task(request(&["y"]));
        coordinator.cancel_task(cancelled, "dropped").await.unwrap();

        assert_eq!(coordinator.process_queue().await, Some(wanted));
        assert_eq!(coordinator.process_queue().await, None);
    }

    #[tokio::test]
    async fn test_complete_task_releases_containers() {
        let (backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["implement login endpoint"]));
        coordinator.assign_task(id).await.unwrap();

        coordinator
            .complete_task(
                id,
                TaskResult {
                    success: true,
                    summary: Some("done".to_string()),
                    output: json!({"files": 2}),
                },
                None,
            )
            .await
            .unwrap();

        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.unwrap().summary.as_deref(), Some("done"));
        assert!(coordinator.lifecycle.get_task_containers(id).is_empty());
        assert!(backend.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_finished_task_discards_undelivered_assignments() {
        let (_backend, coordinator, bus) = setup();
        let id = coordinator.create_task(request(&["implement login endpoint"]));
        coordinator.assign_task(id).await.unwrap();
        let agents: Vec<AgentId> = coordinator
            .lifecycle
            .get_task_containers(id)
            .into_iter()
            .map(|c| c.agent_config.agent_id)
            .collect();
        assert!(agents.iter().all(|a| bus.offline_queue_len(a) == 1));

        coordinator.cancel_task(id, "no longer needed").await.unwrap();

        for agent_id in &agents {
            assert_eq!(bus.offline_queue_len(agent_id), 0);
            let late = Message::new(MessageType::StatusUpdate, ORCHESTRATOR_ID, agent_id.as_str(), json!({}));
            assert_eq!(bus.send_to_agent(agent_id, late), Delivery::Undeliverable);
        }
    }

    #[tokio::test]
    async fn test_concurrent_assignment_spawns_one_team() {
        let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
        let (coordinator, _bus) = coordinator_over(Arc::new(SlowCreate(backend.clone())));
        let id = coordinator.create_task(request(&["implement login endpoint"]));

        let (first, second) = tokio::join!(coordinator.assign_task(id), coordinator.assign_task(id));

        assert!(first.is_ok());
        assert!(matches!(second, Err(CoordinatorError::NotPending { .. })));
        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        let mut managed: Vec<ContainerId> = coordinator
            .lifecycle
            .get_task_containers(id)
            .into_iter()
            .map(|c| c.container_id)
            .collect();
        let mut recorded = task.assigned_container_ids.clone();
        managed.sort();
        recorded.sort();
        assert_eq!(managed, recorded);
        assert_eq!(backend.container_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_status_update_cannot_move_running_task_backward() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["x"]));
        coordinator.assign_task(id).await.unwrap();

        let result = coordinator
            .update_task_status(id, TaskStatus::Assigned, None, None, None)
            .await;

        assert!(matches!(result, Err(CoordinatorError::InvalidTransition(_))));
        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.timeline.last().unwrap().kind, TaskEventKind::Started);
    }

    #[tokio::test]
    async fn test_unsuccessful_result_fails_task() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["x"]));
        coordinator.assign_task(id).await.unwrap();

        coordinator
            .complete_task(
                id,
                TaskResult {
                    success: false,
                    summary: None,
                    output: json!(null),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(coordinator.get_task(id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_status_update_message_moves_task_to_review() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["x"]));
        coordinator.assign_task(id).await.unwrap();

        let update = Message::new(
            MessageType::StatusUpdate,
            "coder-1",
            ORCHESTRATOR_ID,
            json!({"taskId": id.to_string(), "status": "review", "progress": 0.8}),
        );
        coordinator
            .handle_agent_message(AgentId::new("coder-1"), update)
            .await
            .unwrap();

        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Review);
        let last = task.timeline.last().unwrap();
        assert_eq!(last.kind, TaskEventKind::StatusChanged);
        assert_eq!(last.agent_id, Some(AgentId::new("coder-1")));
        assert_eq!(last.data, Some(json!({"progress": 0.8})));
    }

    #[tokio::test]
    async fn test_non_fatal_error_report_only_records() {
        let (_backend, coordinator, _bus) = setup();
        let id = coordinator.create_task(request(&["x"]));
        coordinator.assign_task(id).await.unwrap();

        let report = Message::new(
            MessageType::ErrorReport,
            "tester-1",
            "",
            json!({"taskId": id.to_string(), "error": "flaky test"}),
        );
        coordinator
            .handle_agent_message(AgentId::new("tester-1"), report)
            .await
            .unwrap();

        let task = coordinator.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.timeline.last().unwrap().kind, TaskEventKind::AgentError);

        let fatal = Message::new(
            MessageType::ErrorReport,
            "tester-1",
            "",
            json!({"taskId": id.to_string(), "error": "disk full", "fatal": true}),
        );
        coordinator
            .handle_agent_message(AgentId::new("tester-1"), fatal)
            .await
            .unwrap();
        assert_eq!(coordinator.get_task(id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_metrics() {
        let (_backend, coordinator, _bus) = setup();
        let done = coordinator.create_task(NewTask {
            priority: TaskPriority::High,
            ..request(&["a"])
        });
        let dropped = coordinator.create_task(request(&["b"]));
        let _waiting = coordinator.create_task(request(&["c"]));

        coordinator.assign_task(done).await.unwrap();
        coordinator
            .complete_task(
                done,
                TaskResult {
                    success: true,
                    summary: None,
                    output: json!(null),
                },
                None,
            )
            .await
            .unwrap();
        coordinator.cancel_task(dropped, "dup").await.unwrap();

        let metrics = coordinator.get_task_metrics();
        assert_eq!(metrics.total, 3);
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.by_status[&TaskStatus::Completed], 1);
        assert_eq!(metrics.by_status[&TaskStatus::Cancelled], 1);
        assert_eq!(metrics.by_status[&TaskStatus::Pending], 1);
        assert_eq!(metrics.by_priority[&TaskPriority::Medium], 2);
        assert_eq!(metrics.success_rate, Some(0.5));
        assert!(metrics.average_completion_ms.is_some());
        assert!(metrics.average_failure_ms.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_is_single_flight() {
        let (backend, coordinator, _bus) = setup();
        backend.hold_unready_role(AgentRole::Coder);
        let slow = coordinator.create_task(request(&["x"]));
        let other = coordinator.create_task(request(&["y"]));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.process_queue().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.process_queue().await, None);

        assert_eq!(first.await.unwrap(), Some(slow));
        assert_eq!(coordinator.queued_task_ids(), vec![other]);
        assert!(coordinator.lifecycle.get_task_containers(slow).is_empty());
    }
}
