// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::container::{ContainerId, ContainerState, ContainerStatus, HealthState};
use crate::domain::runtime::{
    BackendError, BackendEvent, BackendEventKind, BuildImageRequest, ContainerFilter, ContainerSummary,
    CreateContainerRequest, ExecOutput, ExecRequest, ExecutionBackend, ImageSummary, LABEL_MANAGED,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::models::{HealthConfig, HealthStatusEnum, HostConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const EVENT_STREAM_RETRY: Duration = Duration::from_secs(5);

pub struct DockerBackend {
    docker: Docker,
    events: broadcast::Sender<BackendEvent>,
}

impl DockerBackend {
    pub fn new(socket_path: Option<String>) -> Result<Self, BackendError> {
        // Connect to Docker daemon (custom socket or auto-detect)
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group\n\n\
                     Try:\n\
                     - Start Docker: systemctl start docker (Linux) or Docker Desktop (Windows/Mac)\n\
                     - Check permissions: ls -la /var/run/docker.sock",
                    e
                ))
            })?
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { docker, events })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), BackendError> {
        self.docker.ping().await.map_err(|e| {
            BackendError::Unavailable(format!(
                "Cannot connect to Docker daemon: {}\n\n\
                 Docker healthcheck failed. Ensure Docker is running:\n\
                 - On Linux: sudo systemctl start docker\n\
                 - On macOS/Windows: Start Docker Desktop\n\n\
                 Verify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    /// Create the sub-agent bridge network if it does not exist yet.
    pub async fn ensure_network(&self, name: &str) -> Result<(), BackendError> {
        if self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            debug!(network = name, "Sub-agent network already exists");
            return Ok(());
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            labels: HashMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| BackendError::Operation(format!("Failed to create network {}: {}", name, e)))?;
        info!(network = name, "Created sub-agent network");
        Ok(())
    }

    /// Forward container die/destroy/health events from the daemon to
    /// subscribers until `cancel` fires. The daemon stream is re-opened if it
    /// ends or errors.
    pub fn start_event_stream(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let sender = self.events.clone();

        tokio::spawn(async move {
            loop {
                let filters = HashMap::from([
                    ("type".to_string(), vec!["container".to_string()]),
                    (
                        "event".to_string(),
                        vec!["die".to_string(), "destroy".to_string(), "health_status".to_string()],
                    ),
                    ("label".to_string(), vec![format!("{}=true", LABEL_MANAGED)]),
                ]);
                let mut stream = docker.events(Some(EventsOptions::<String> {
                    filters,
                    ..Default::default()
                }));

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => match next {
                            Some(Ok(message)) => {
                                if let Some(event) = translate_event(message) {
                                    let _ = sender.send(event);
                                }
                            }
                            Some(Err(e)) => {
                                warn!("Docker event stream error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(EVENT_STREAM_RETRY) => {
                        debug!("Re-opening Docker event stream");
                    }
                }
            }
        })
    }
}

fn translate_event(message: bollard::models::EventMessage) -> Option<BackendEvent> {
    let action = message.action?;
    let actor = message.actor?;
    let container_id = ContainerId::new(actor.id?);
    let mut data = actor.attributes.unwrap_or_default();

    let kind = if action == "die" {
        BackendEventKind::Die
    } else if action == "destroy" {
        BackendEventKind::Destroy
    } else if let Some(status) = action.strip_prefix("health_status") {
        // Action reads "health_status: unhealthy"
        let status = status.trim_start_matches(':').trim();
        data.insert("health_status".to_string(), status.to_string());
        BackendEventKind::HealthStatus
    } else {
        return None;
    };

    Some(BackendEvent { kind, container_id, data })
}

fn to_nanos(duration: Duration) -> i64 {
    duration.as_nanos().min(i64::MAX as u128) as i64
}

fn health_from_docker(status: Option<HealthStatusEnum>) -> HealthState {
    match status {
        Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
        Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
        Some(HealthStatusEnum::STARTING) => HealthState::Starting,
        _ => HealthState::None,
    }
}

/// Pack a build context directory into an in-memory tar archive.
fn pack_build_context(context: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", context)?;
    builder.into_inner()
}

fn map_not_found(id: &ContainerId, e: bollard::errors::Error) -> BackendError {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
            BackendError::NotFound(id.to_string())
        }
        other => BackendError::Operation(other.to_string()),
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn ping(&self) -> Result<bool, BackendError> {
        Ok(self.docker.ping().await.is_ok())
    }

    async fn create_container(&self, request: CreateContainerRequest) -> Result<ContainerId, BackendError> {
        let env: Vec<String> = request.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = request
            .exposed_ports
            .iter()
            .map(|port| (format!("{}/tcp", port), HashMap::new()))
            .collect();

        let mut security_opt = Vec::new();
        if request.security.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        let host_config = HostConfig {
            network_mode: request.network.clone(),
            readonly_rootfs: Some(request.security.read_only_root_fs),
            cap_drop: Some(request.security.cap_drop.clone()),
            cap_add: Some(request.security.cap_add.clone()),
            security_opt: Some(security_opt),
            ..Default::default()
        };

        let healthcheck = request.health_check.as_ref().map(|hc| HealthConfig {
            test: Some(hc.command.clone()),
            interval: Some(to_nanos(hc.interval)),
            timeout: Some(to_nanos(hc.timeout)),
            retries: Some(hc.retries as i64),
            start_period: Some(to_nanos(hc.start_period)),
            ..Default::default()
        });

        let config = Config {
            image: Some(request.image.clone()),
            env: Some(env),
            labels: Some(request.labels.clone()),
            exposed_ports: Some(exposed_ports),
            working_dir: Some(request.working_dir.clone()),
            host_config: Some(host_config),
            healthcheck,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| BackendError::Operation(format!("Failed to create container {}: {}", request.name, e)))?;

        for warning in response.warnings {
            warn!(container = %request.name, "Docker warning: {}", warning);
        }

        info!(container_id = %response.id, image = %request.image, "Created sub-agent container");
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), BackendError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<(), BackendError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker
            .stop_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_not_found(id, e))
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_not_found(id, e))?;
        debug!(container_id = %id, "Removed container");
        Ok(())
    }

    async fn container_status(&self, id: &ContainerId) -> Result<ContainerStatus, BackendError> {
        let inspect = self
            .docker
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_not_found(id, e))?;

        let Some(state) = inspect.state else {
            return Ok(ContainerStatus::new(ContainerState::Unknown, HealthState::None));
        };

        let container_state = state
            .status
            .map(|s| ContainerState::from_runtime_str(&s.to_string()))
            .unwrap_or(ContainerState::Unknown);
        let health = health_from_docker(state.health.and_then(|h| h.status));

        Ok(ContainerStatus {
            state: container_state,
            health,
            error: state.error.filter(|e| !e.is_empty()),
        })
    }

    async fn execute_in_container(&self, id: &ContainerId, request: ExecRequest) -> Result<ExecOutput, BackendError> {
        let exec_config = CreateExecOptions {
            attach_stdout: Some(request.attach_stdout),
            attach_stderr: Some(request.attach_stderr),
            working_dir: Some(request.working_dir.clone()),
            cmd: Some(request.command.clone()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id.as_str(), exec_config)
            .await
            .map_err(|e| map_not_found(id, e))?;

        let start_opts = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let res = self
            .docker
            .start_exec(&exec.id, Some(start_opts))
            .await
            .map_err(|e| BackendError::Operation(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = res {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
                    Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %id, "Exec output stream error: {}", e);
                        break;
                    }
                }
            }
        }

        let exec_inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| BackendError::Operation(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: exec_inspect.exit_code,
        })
    }

    async fn list_containers(&self, filter: ContainerFilter) -> Result<Vec<ContainerSummary>, BackendError> {
        let labels: Vec<String> = filter.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut filters = HashMap::new();
        if !labels.is_empty() {
            filters.insert("label".to_string(), labels);
        }

        let options = ListContainersOptions::<String> {
            all: filter.all,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| BackendError::Operation(format!("Failed to list containers: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: ContainerId::new(c.id?),
                    state: c
                        .state
                        .as_deref()
                        .map(ContainerState::from_runtime_str)
                        .unwrap_or(ContainerState::Unknown),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, BackendError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| BackendError::Operation(format!("Failed to list images: {}", e)))?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image.repo_tags,
            })
            .collect())
    }

    async fn build_image(&self, request: BuildImageRequest) -> Result<(), BackendError> {
        let reference = request.reference();
        info!(image = %reference, dockerfile = %request.dockerfile, "Building sub-agent image");

        let context = request.build_context.clone();
        let archive = tokio::task::spawn_blocking(move || pack_build_context(&context))
            .await
            .map_err(|e| BackendError::ImageBuild(format!("Build context packing aborted: {}", e)))?
            .map_err(|e| {
                BackendError::ImageBuild(format!(
                    "Failed to pack build context {}: {}",
                    request.build_context.display(),
                    e
                ))
            })?;

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.clone(),
            t: reference.clone(),
            rm: true,
            buildargs: request.build_args.clone(),
            labels: request.labels.clone(),
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(Bytes::from(archive)));
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(BackendError::ImageBuild(format!("{}: {}", reference, error)));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!(image = %reference, "{}", line);
                        }
                    }
                }
                Err(e) => {
                    return Err(BackendError::ImageBuild(format!("{}: {}", reference, e)));
                }
            }
        }

        info!(image = %reference, "Built sub-agent image");
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventActor, EventMessage};

    fn event(action: &str) -> EventMessage {
        EventMessage {
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: Some(HashMap::from([("exitCode".to_string(), "137".to_string())])),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_translate_die_event() {
        let translated = translate_event(event("die")).unwrap();
        assert_eq!(translated.kind, BackendEventKind::Die);
        assert_eq!(translated.container_id, ContainerId::new("abc123"));
        assert_eq!(translated.data.get("exitCode").map(String::as_str), Some("137"));
    }

    #[test]
    fn test_translate_health_event() {
        let translated = translate_event(event("health_status: unhealthy")).unwrap();
        assert_eq!(translated.kind, BackendEventKind::HealthStatus);
        assert_eq!(translated.data.get("health_status").map(String::as_str), Some("unhealthy"));
    }

    #[test]
    fn test_ignores_other_actions() {
        assert!(translate_event(event("start")).is_none());
    }

    #[test]
    fn test_pack_build_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("coder.Dockerfile"), "FROM scratch\n").unwrap();
        let archive = pack_build_context(dir.path()).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("coder.Dockerfile")));
    }
}
