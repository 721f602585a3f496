// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Orchestrator process assembly
//!
//! Wires the backend, lifecycle manager, message bus and coordinator
//! together, starts their background loops and serves the agent bus until a
//! shutdown signal arrives.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autocoder_core::{
    application::lifecycle::{ContainerLifecycleManager, LifecycleSettings},
    domain::{
        agent::AgentRole,
        node_config::{BackendKind, NodeConfigManifest},
        runtime::ExecutionBackend,
        task::NewTask,
    },
    infrastructure::{event_bus::EventBus, memory_runtime::InMemoryBackend, runtime::DockerBackend},
};
use autocoder_swarm::{
    application::{
        coordinator::{CoordinatorSettings, TaskCoordinator},
        message_bus::{AgentMessageBus, AuthPolicy, BusSettings},
    },
    infrastructure::websocket::{self, AGENT_SOCKET_PATH},
};

pub async fn run_orchestrator(config: NodeConfigManifest, task_files: Vec<PathBuf>) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    info!(node = %config.metadata.name, backend = ?config.spec.backend.kind, "autocoder orchestrator starting");

    if let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    let spec = &config.spec;
    let cancel = CancellationToken::new();
    let event_bus = EventBus::with_default_capacity();

    let (backend, backend_events) = init_backend(&config, cancel.clone()).await?;

    let bind_addr: SocketAddr = spec
        .bus
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid bus bind address {}", spec.bus.bind_addr()))?;
    let bus_url = spec
        .bus
        .advertised_url
        .clone()
        .unwrap_or_else(|| format!("ws://host.docker.internal:{}{}", spec.bus.port, AGENT_SOCKET_PATH));

    let lifecycle = Arc::new(ContainerLifecycleManager::new(
        backend,
        event_bus.clone(),
        LifecycleSettings::from_config(&spec.lifecycle, &spec.backend, Some(bus_url)),
    ));
    match lifecycle.cleanup_orphans().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Removed orphaned sub-agent containers from a previous run"),
        Err(e) => warn!("Orphan cleanup failed: {}", e),
    }

    let auth = AuthPolicy::from_config(&spec.bus).context("Failed to configure agent authentication")?;
    let bus = Arc::new(AgentMessageBus::new(BusSettings::from_config(&spec.bus), auth, event_bus.clone()));
    let coordinator = Arc::new(TaskCoordinator::new(
        lifecycle.clone(),
        bus.clone(),
        event_bus.clone(),
        CoordinatorSettings::from_config(&spec.coordinator),
    ));

    let mut loops: Vec<JoinHandle<()>> = vec![
        lifecycle.spawn_health_monitor(cancel.clone()),
        lifecycle.spawn_event_listener(cancel.clone()),
        bus.spawn_liveness_monitor(),
        coordinator.spawn_event_listener(),
        coordinator.spawn_dispatcher(),
    ];
    loops.extend(backend_events);

    for path in &task_files {
        let request = load_task_request(path)?;
        let task_id = coordinator.create_task(request);
        info!(task_id = %task_id, file = %path.display(), "Enqueued task");
    }

    let listener = websocket::bind(bind_addr).await?;
    let server = tokio::spawn(websocket::serve(listener, bus.clone()));

    shutdown_signal().await;
    info!("Orchestrator shutting down");

    coordinator.shutdown();
    bus.shutdown();
    cancel.cancel();
    let terminated = lifecycle.terminate_all().await;
    info!(terminated, "Released sub-agent containers");

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Agent bus server error: {:#}", e),
        Err(e) => error!("Agent bus server task failed: {}", e),
    }
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("Background loop ended abnormally: {}", e);
        }
    }

    let metrics = coordinator.get_task_metrics();
    info!(
        total = metrics.total,
        queued = metrics.queued,
        success_rate = ?metrics.success_rate,
        "Orchestrator stopped"
    );
    Ok(())
}

async fn init_backend(
    config: &NodeConfigManifest,
    cancel: CancellationToken,
) -> Result<(Arc<dyn ExecutionBackend>, Option<JoinHandle<()>>)> {
    let backend = &config.spec.backend;
    match backend.kind {
        BackendKind::Docker => {
            let docker = DockerBackend::new(backend.docker_socket_path.clone())
                .context("Failed to initialize Docker backend")?;
            docker.healthcheck().await.context("Docker healthcheck failed")?;
            docker
                .ensure_network(&backend.network)
                .await
                .with_context(|| format!("Failed to prepare network {}", backend.network))?;
            let events = docker.start_event_stream(cancel);
            let docker: Arc<dyn ExecutionBackend> = Arc::new(docker);
            Ok((docker, Some(events)))
        }
        BackendKind::Memory => {
            warn!("Using the in-memory backend; sub-agent containers are simulated");
            let images = AgentRole::SUB_AGENT_ROLES
                .iter()
                .filter_map(|role| backend.images.for_role(*role))
                .map(|image| image.image.clone());
            let memory: Arc<dyn ExecutionBackend> = Arc::new(InMemoryBackend::new().with_images(images));
            Ok((memory, None))
        }
    }
}

/// Read a task request from a YAML or JSON file.
pub fn load_task_request(path: &Path) -> Result<NewTask> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read task file {:?}", path))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse task file {:?}", path))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
