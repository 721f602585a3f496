// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use autocoder_core::application::lifecycle::{ContainerLifecycleManager, LifecycleSettings};
use autocoder_core::domain::agent::{AgentId, AgentRole};
use autocoder_core::domain::message::{Message, MessageType};
use autocoder_core::domain::task::{NewTask, TaskEventKind, TaskPriority, TaskResult, TaskStatus};
use autocoder_core::infrastructure::event_bus::EventBus;
use autocoder_core::infrastructure::memory_runtime::InMemoryBackend;
use autocoder_core::infrastructure::signature::LengthHeuristicVerifier;
use autocoder_swarm::application::coordinator::{CoordinatorError, CoordinatorSettings, TaskCoordinator, TaskFilter};
use autocoder_swarm::application::message_bus::{AgentMessageBus, AuthPolicy, BusSettings, OutboundFrame, ORCHESTRATOR_ID};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const IMAGES: [&str; 3] = ["autocoder-coder:latest", "autocoder-reviewer:latest", "autocoder-tester:latest"];
const SIGNATURE: &str = "c2lnbmF0dXJlLXNpZ25hdHVyZS1zaWduYXR1cmUtc2ln";

struct Harness {
    backend: Arc<InMemoryBackend>,
    lifecycle: Arc<ContainerLifecycleManager>,
    bus: Arc<AgentMessageBus>,
    coordinator: Arc<TaskCoordinator>,
}

fn harness() -> Harness {
    let backend = Arc::new(InMemoryBackend::new().with_images(IMAGES));
    let event_bus = EventBus::new(256);
    let lifecycle = Arc::new(ContainerLifecycleManager::new(
        backend.clone(),
        event_bus.clone(),
        LifecycleSettings {
            readiness_timeout: Duration::from_millis(500),
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
        lifecycle.clone(),
        bus.clone(),
        event_bus,
        CoordinatorSettings::default(),
    ));
    Harness {
        backend,
        lifecycle,
        bus,
        coordinator,
    }
}

fn login_task(priority: TaskPriority, requirements: &[&str]) -> NewTask {
    NewTask {
        title: "T1".to_string(),
        description: "Add a login endpoint".to_string(),
        requirements: requirements.iter().map(|r| r.to_string()).collect(),
        priority,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_scenario_coder_and_reviewer() {
    let h = harness();
    let t1 = h
        .coordinator
        .create_task(login_task(TaskPriority::High, &["implement login endpoint"]));

    assert_eq!(h.coordinator.process_queue().await, Some(t1));

    assert_eq!(h.coordinator.list_tasks(&TaskFilter::status(TaskStatus::InProgress)).len(), 1);
    let containers = h.lifecycle.get_task_containers(t1);
    assert_eq!(containers.len(), 2);
    let roles: Vec<AgentRole> = containers.iter().map(|c| c.role()).collect();
    assert_eq!(roles, vec![AgentRole::Coder, AgentRole::Reviewer]);
}

#[tokio::test]
async fn test_scenario_tester_added_for_coverage() {
    let h = harness();
    let t1 = h.coordinator.create_task(login_task(
        TaskPriority::High,
        &["implement login endpoint", "with full test coverage"],
    ));

    h.coordinator.process_queue().await;

    let roles: Vec<AgentRole> = h.lifecycle.get_task_containers(t1).iter().map(|c| c.role()).collect();
    assert_eq!(roles, vec![AgentRole::Coder, AgentRole::Tester, AgentRole::Reviewer]);
    assert_eq!(h.backend.container_ids().len(), 3);
}

#[tokio::test]
async fn test_scenario_deadline_forces_termination_and_fails_task() {
    let h = harness();
    let _listener = h.coordinator.spawn_event_listener();
    let mut request = login_task(TaskPriority::High, &["implement login endpoint"]);
    request.deadline = Some(Utc::now() + chrono::Duration::milliseconds(100));
    let t1 = h.coordinator.create_task(request);

    h.coordinator.assign_task(t1).await.unwrap();
    assert_eq!(h.lifecycle.get_task_containers(t1).len(), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let report = h.lifecycle.run_health_check().await;

    assert_eq!(report.expired.len(), 2);
    assert!(h.lifecycle.list_managed_containers().is_empty());
    assert!(h.backend.container_ids().is_empty());

    timeout(Duration::from_secs(2), async {
        while h.coordinator.get_task(t1).map(|t| t.status) != Some(TaskStatus::Failed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let task = h.coordinator.get_task(t1).unwrap();
    assert_eq!(task.timeline.last().unwrap().kind, TaskEventKind::DeadlineExceeded);
    h.coordinator.shutdown();
}

#[tokio::test]
async fn test_dispatch_follows_priority_order() {
    let h = harness();
    let ids: Vec<_> = [
        TaskPriority::Low,
        TaskPriority::Critical,
        TaskPriority::Medium,
        TaskPriority::High,
    ]
    .into_iter()
    .map(|p| (p, h.coordinator.create_task(login_task(p, &["x"]))))
    .collect();

    let mut dispatched = Vec::new();
    while let Some(id) = h.coordinator.process_queue().await {
        dispatched.push(ids.iter().find(|(_, t)| *t == id).unwrap().0);
    }

    assert_eq!(
        dispatched,
        vec![
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Medium,
            TaskPriority::Low
        ]
    );
}

#[tokio::test]
async fn test_terminal_tasks_cannot_be_cancelled() {
    let h = harness();
    let done = h.coordinator.create_task(login_task(TaskPriority::Medium, &["x"]));
    h.coordinator.assign_task(done).await.unwrap();
    h.coordinator
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

    let cancelled = h.coordinator.create_task(login_task(TaskPriority::Medium, &["y"]));
    h.coordinator.cancel_task(cancelled, "first").await.unwrap();

    for id in [done, cancelled] {
        let before = h.coordinator.get_task(id).unwrap();
        let result = h.coordinator.cancel_task(id, "again").await;
        assert!(matches!(result, Err(CoordinatorError::Terminal { .. })));

        let after = h.coordinator.get_task(id).unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.timeline.len(), before.timeline.len());
        assert_eq!(after.updated_at, before.updated_at);
    }
}

#[tokio::test]
async fn test_agent_report_over_bus_completes_task() {
    let h = harness();
    let _listener = h.coordinator.spawn_event_listener();
    let t1 = h.coordinator.create_task(login_task(TaskPriority::High, &["implement login endpoint"]));
    h.coordinator.assign_task(t1).await.unwrap();

    // The coder connects after assignment and picks up its queued assignment
    let coder = h
        .lifecycle
        .get_task_containers(t1)
        .into_iter()
        .find(|c| c.role() == AgentRole::Coder)
        .unwrap();
    let agent_id: AgentId = coder.agent_config.agent_id.clone();

    let (connection, mut outbound) = h.bus.open_connection();
    let auth = Message::new(
        MessageType::AuthResponse,
        agent_id.as_str(),
        ORCHESTRATOR_ID,
        json!({
            "agentId": agent_id,
            "role": "coder",
            "signature": SIGNATURE,
            "taskId": t1.to_string(),
            "containerId": coder.container_id,
        }),
    );
    h.bus.handle_message(connection, auth).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(OutboundFrame::Message(message)) = outbound.try_recv() {
        kinds.push(message.kind);
    }
    assert_eq!(
        kinds,
        vec![MessageType::AuthRequest, MessageType::AuthSuccess, MessageType::TaskAssignment]
    );

    let report = Message::new(
        MessageType::ResultReport,
        agent_id.as_str(),
        ORCHESTRATOR_ID,
        json!({"taskId": t1.to_string(), "success": true, "summary": "login endpoint added"}),
    );
    h.bus.handle_message(connection, report).await.unwrap();

    timeout(Duration::from_secs(2), async {
        while h.coordinator.get_task(t1).map(|t| t.status) != Some(TaskStatus::Completed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.lifecycle.get_task_containers(t1).is_empty());
    h.coordinator.shutdown();
}
