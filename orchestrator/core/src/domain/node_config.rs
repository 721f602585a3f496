// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for an autocoder orchestrator node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Execution backend selection and per-role sub-agent images
// - Container lifecycle timings (readiness, health ticks, stop grace)
// - Task dispatch cadence
// - Agent bus endpoint, liveness and authentication settings
// - Logging and metrics

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::agent::AgentRole;

pub const API_VERSION: &str = "autocoder.dev/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "autocoder.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable node name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Docker,
    /// In-process simulated containers (local development)
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleImage {
    /// Image reference (`name:tag`)
    pub image: String,

    /// Dockerfile used to build the image when it is not present locally,
    /// relative to `build_context`
    pub dockerfile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleImages {
    pub coder: RoleImage,
    pub reviewer: RoleImage,
    pub tester: RoleImage,
}

impl RoleImages {
    pub fn for_role(&self, role: AgentRole) -> Option<&RoleImage> {
        match role {
            AgentRole::Coder => Some(&self.coder),
            AgentRole::Reviewer => Some(&self.reviewer),
            AgentRole::Tester => Some(&self.tester),
            AgentRole::Main => None,
        }
    }
}

impl Default for RoleImages {
    fn default() -> Self {
        let image = |role: &str| RoleImage {
            image: format!("autocoder-{}:latest", role),
            dockerfile: format!("docker/sub-agents/{}.Dockerfile", role),
        };
        Self {
            coder: image("coder"),
            reviewer: image("reviewer"),
            tester: image("tester"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Path to Docker socket
    /// Default: auto-detect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,

    /// Dedicated bridge network shared by all sub-agents
    #[serde(default = "default_network")]
    pub network: String,

    /// Directory sent as the build context when a role image must be built
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,

    #[serde(default)]
    pub images: RoleImages,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            docker_socket_path: None,
            network: default_network(),
            build_context: default_build_context(),
            images: RoleImages::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// First port handed out; two ports (communication, health) per sub-agent
    #[serde(default = "default_port_base")]
    pub port_base: u16,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Upper bound on waiting for a spawned container to become healthy
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval_ms: u64,

    /// Poll delay after a failed status query
    #[serde(default = "default_readiness_error_backoff")]
    pub readiness_error_backoff_ms: u64,

    #[serde(default = "default_graceful_stop_timeout")]
    pub graceful_stop_timeout_secs: u64,

    #[serde(default = "default_force_stop_grace")]
    pub force_stop_grace_secs: u64,

    /// Sub-agent deadline when a task has none
    #[serde(default = "default_task_timeout")]
    pub default_task_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            port_base: default_port_base(),
            health_check_interval_secs: default_health_check_interval(),
            readiness_timeout_secs: default_readiness_timeout(),
            readiness_poll_interval_ms: default_readiness_poll_interval(),
            readiness_error_backoff_ms: default_readiness_error_backoff(),
            graceful_stop_timeout_secs: default_graceful_stop_timeout(),
            force_stop_grace_secs: default_force_stop_grace(),
            default_task_timeout_secs: default_task_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: default_dispatch_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bus_port")]
    pub port: u16,

    /// URL handed to sub-agents so they can reach the bus
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_url: Option<String>,

    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Agents silent for longer than this are evicted
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// Per-agent cap on messages held for offline delivery
    #[serde(default = "default_offline_queue_capacity")]
    pub offline_queue_capacity: usize,

    /// Base64 ed25519 public key agents sign their id with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default = "default_min_trust_score")]
    pub min_trust_score: f64,

    /// Accepted signature length when no public key is configured
    #[serde(default = "default_min_signature_length")]
    pub min_signature_length: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_bus_port(),
            advertised_url: None,
            liveness_interval_secs: default_liveness_interval(),
            ping_timeout_secs: default_ping_timeout(),
            offline_queue_capacity: default_offline_queue_capacity(),
            public_key: None,
            min_trust_score: default_min_trust_score(),
            min_signature_length: default_min_signature_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_network() -> String {
    "autocoder-subagents".to_string()
}

fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_port_base() -> u16 {
    8000
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_readiness_poll_interval() -> u64 {
    2000
}

fn default_readiness_error_backoff() -> u64 {
    1000
}

fn default_graceful_stop_timeout() -> u64 {
    30
}

fn default_force_stop_grace() -> u64 {
    10
}

fn default_task_timeout() -> u64 {
    3600
}

fn default_dispatch_interval() -> u64 {
    5
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bus_port() -> u16 {
    8080
}

fn default_liveness_interval() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    60
}

fn default_offline_queue_capacity() -> usize {
    1000
}

fn default_min_trust_score() -> f64 {
    0.5
}

fn default_min_signature_length() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl LifecycleConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn readiness_error_backoff(&self) -> Duration {
        Duration::from_millis(self.readiness_error_backoff_ms)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    pub fn force_stop_grace(&self) -> Duration {
        Duration::from_secs(self.force_stop_grace_secs)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

impl BusConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Decoded public key bytes, if one is configured.
    pub fn public_key_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match &self.public_key {
            Some(key) => {
                let bytes = STANDARD
                    .decode(key.trim())
                    .map_err(|e| anyhow::anyhow!("bus.public_key is not valid base64: {}", e))?;
                if bytes.len() != 32 {
                    anyhow::bail!("bus.public_key must decode to 32 bytes, got {}", bytes.len());
                }
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}

impl CoordinatorConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "autocoder-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AUTOCODER_CONFIG_PATH environment variable
    /// 2. ./autocoder-config.yaml (working directory)
    /// 3. ~/.autocoder/config.yaml (user home)
    /// 4. /etc/autocoder/config.yaml (system, Unix) or C:\ProgramData\Autocoder\config.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AUTOCODER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./autocoder-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".autocoder").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/autocoder/config.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Autocoder\\config.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    /// This allows container deployments to override config via env vars
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AUTOCODER_BUS_PORT") {
            match val.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Environment override: AUTOCODER_BUS_PORT={}", port);
                    self.spec.bus.port = port;
                }
                Err(_) => {
                    tracing::warn!("Invalid value for AUTOCODER_BUS_PORT: '{}'. Ignoring.", val);
                }
            }
        }

        if let Ok(val) = std::env::var("AUTOCODER_BUS_PUBLIC_KEY") {
            tracing::info!("Environment override: AUTOCODER_BUS_PUBLIC_KEY set");
            self.spec.bus.public_key = Some(val);
        }

        if let Ok(val) = std::env::var("AUTOCODER_BACKEND") {
            match val.to_lowercase().as_str() {
                "docker" => self.spec.backend.kind = BackendKind::Docker,
                "memory" => self.spec.backend.kind = BackendKind::Memory,
                _ => {
                    tracing::warn!(
                        "Invalid value for AUTOCODER_BACKEND: '{}'. Expected docker/memory. Ignoring.",
                        val
                    );
                    return;
                }
            }
            tracing::info!("Environment override: AUTOCODER_BACKEND={}", val);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let lifecycle = &self.spec.lifecycle;
        if lifecycle.health_check_interval_secs == 0 {
            anyhow::bail!("lifecycle.health_check_interval_secs must be greater than zero");
        }
        if lifecycle.readiness_timeout_secs == 0 || lifecycle.readiness_poll_interval_ms == 0 {
            anyhow::bail!("lifecycle readiness timeout and poll interval must be greater than zero");
        }
        if lifecycle.port_base == 0 {
            anyhow::bail!("lifecycle.port_base must be greater than zero");
        }

        if self.spec.coordinator.dispatch_interval_secs == 0 {
            anyhow::bail!("coordinator.dispatch_interval_secs must be greater than zero");
        }

        let bus = &self.spec.bus;
        if bus.liveness_interval_secs == 0 {
            anyhow::bail!("bus.liveness_interval_secs must be greater than zero");
        }
        if bus.ping_timeout_secs <= bus.liveness_interval_secs {
            anyhow::bail!(
                "bus.ping_timeout_secs ({}) must exceed bus.liveness_interval_secs ({})",
                bus.ping_timeout_secs,
                bus.liveness_interval_secs
            );
        }
        if bus.offline_queue_capacity == 0 {
            anyhow::bail!("bus.offline_queue_capacity must be greater than zero");
        }
        if !(0.0..=1.0).contains(&bus.min_trust_score) {
            anyhow::bail!("bus.min_trust_score must be within [0, 1]");
        }
        bus.public_key_bytes()?;

        for role in AgentRole::SUB_AGENT_ROLES {
            if let Some(image) = self.spec.backend.images.for_role(role) {
                if image.image.is_empty() || image.dockerfile.is_empty() {
                    anyhow::bail!("backend.images.{} must name an image and a dockerfile", role);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = NodeConfigManifest::default();
        assert_eq!(manifest.api_version, API_VERSION);
        assert_eq!(manifest.kind, KIND);
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.backend.kind, BackendKind::Docker);
        assert_eq!(manifest.spec.lifecycle.port_base, 8000);
        assert_eq!(manifest.spec.bus.ping_timeout_secs, 60);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: autocoder.dev/v1
kind: NodeConfig
metadata:
  name: test-node
spec:
  backend:
    kind: memory
  bus:
    port: 9100
"#;
        let manifest = NodeConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.spec.backend.kind, BackendKind::Memory);
        assert_eq!(manifest.spec.bus.port, 9100);
        assert_eq!(manifest.spec.bus.liveness_interval_secs, 30);
        assert_eq!(manifest.spec.lifecycle.graceful_stop_timeout_secs, 30);
        assert_eq!(manifest.spec.coordinator.dispatch_interval_secs, 5);
        assert_eq!(
            manifest.spec.backend.images.for_role(AgentRole::Tester).unwrap().image,
            "autocoder-tester:latest"
        );
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut manifest = NodeConfigManifest::default();
        manifest.metadata.name = "roundtrip".to_string();
        manifest.to_yaml_file(&path).unwrap();

        let loaded = NodeConfigManifest::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.metadata.name, "roundtrip");
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(NodeConfigManifest::load_or_default(Some(missing)).is_err());
    }

    #[test]
    fn test_validation() {
        let mut manifest = NodeConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "WrongKind".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.bus.ping_timeout_secs = manifest.spec.bus.liveness_interval_secs;
        assert!(manifest.validate().is_err());
        manifest.spec.bus.ping_timeout_secs = 60;

        manifest.spec.bus.offline_queue_capacity = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.bus.offline_queue_capacity = 10;

        manifest.spec.bus.public_key = Some("not base64 !!".to_string());
        assert!(manifest.validate().is_err());

        manifest.spec.bus.public_key = Some(STANDARD.encode([7u8; 32]));
        assert!(manifest.validate().is_ok());
    }
}
