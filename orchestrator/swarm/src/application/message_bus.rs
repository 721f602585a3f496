// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Message Bus
//!
//! Authenticated, ordered messaging between the orchestrator and its
//! sub-agents. The bus is transport-agnostic: a transport (see
//! [`crate::infrastructure::websocket`]) calls [`AgentMessageBus::open_connection`]
//! for every socket, feeds inbound text frames to
//! [`AgentMessageBus::handle_frame`], writes every [`OutboundFrame`] it
//! receives back to the socket, and reports the socket closing with
//! [`AgentMessageBus::connection_closed`].
//!
//! ## Authentication
//!
//! Evaluated in order, rejecting on the first failure:
//!
//! 1. signature present and base64
//! 2. trust score at or above the minimum (when a [`TrustOracle`] is set)
//! 3. exact match against a provisioned signature (when a [`CredentialStore`]
//!    holds one for the agent); a match accepts
//! 4. signature verified over the agent id by the configured
//!    [`SignatureVerifier`]
//!
//! A failed handshake leaves the connection open but unauthenticated. A
//! connection stays bound to the first agent id it authenticated as.
//!
//! ## Offline delivery
//!
//! Messages for an agent that is not connected are held in a per-agent FIFO
//! bounded by `offline_queue_capacity`; when full the oldest message is
//! dropped. The queue is flushed in order right after `auth_success`.
//! Only agents that have authenticated before, or were announced with
//! [`AgentMessageBus::expect_agent`], get a queue; anything else is
//! undeliverable. [`AgentMessageBus::forget_agents`] discards the queues of
//! agents whose containers are gone.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use autocoder_core::domain::agent::{AgentId, AgentRole};
use autocoder_core::domain::container::ContainerId;
use autocoder_core::domain::events::AgentBusEvent;
use autocoder_core::domain::message::{AuthChallenge, AuthResponse, AuthSuccess, ErrorPayload, Message, MessageType};
use autocoder_core::domain::node_config::BusConfig;
use autocoder_core::domain::security::{CredentialStore, SignatureVerifier, TrustOracle};
use autocoder_core::domain::task::TaskId;
use autocoder_core::infrastructure::event_bus::EventBus;
use autocoder_core::infrastructure::signature::{is_base64_charset, Ed25519SignatureVerifier, LengthHeuristicVerifier};

/// Sender id the orchestrator uses on the bus.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

const CHALLENGE_LENGTH: usize = 16;
const CHALLENGE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection already authenticated as {0}")]
    IdentityMismatch(AgentId),

    #[error("Invalid bus configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a transport must write to its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(Message),
    /// Close the socket; no further frames follow.
    Close { reason: String },
}

/// Whether [`AgentMessageBus::send_to_agent`] reached a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued,
    /// The recipient never authenticated and was not announced with
    /// [`AgentMessageBus::expect_agent`]; the message was discarded.
    Undeliverable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAgent {
    pub id: AgentId,
    pub role: AgentRole,
    pub authenticated: bool,
    pub last_ping: DateTime<Utc>,
    pub container_id: Option<ContainerId>,
    pub task_id: Option<TaskId>,
    pub connected_at: DateTime<Utc>,
    pub connection: ConnectionId,
}

#[derive(Debug, Clone)]
pub struct BusSettings {
    pub liveness_interval: Duration,
    pub ping_timeout: Duration,
    pub offline_queue_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from_config(&BusConfig::default())
    }
}

impl BusSettings {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            liveness_interval: config.liveness_interval(),
            ping_timeout: config.ping_timeout(),
            offline_queue_capacity: config.offline_queue_capacity,
        }
    }
}

/// Layered handshake check. See the module docs for the order.
pub struct AuthPolicy {
    trust_oracle: Option<Arc<dyn TrustOracle>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    verifier: Arc<dyn SignatureVerifier>,
    min_trust_score: f64,
}

impl AuthPolicy {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            trust_oracle: None,
            credential_store: None,
            verifier,
            min_trust_score: 0.5,
        }
    }

    /// Ed25519 verification when a public key is configured, otherwise the
    /// minimum-length fallback.
    pub fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        let verifier: Arc<dyn SignatureVerifier> = match &config.public_key {
            Some(key) => Arc::new(Ed25519SignatureVerifier::from_base64(key).map_err(|e| BusError::Config(e.to_string()))?),
            None => {
                warn!(
                    "No bus public key configured; accepting any base64 signature of at least {} characters",
                    config.min_signature_length
                );
                Arc::new(LengthHeuristicVerifier::new(config.min_signature_length))
            }
        };
        Ok(Self::new(verifier).with_min_trust_score(config.min_trust_score))
    }

    pub fn with_trust_oracle(mut self, oracle: Arc<dyn TrustOracle>) -> Self {
        self.trust_oracle = Some(oracle);
        self
    }

    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    pub fn with_min_trust_score(mut self, score: f64) -> Self {
        self.min_trust_score = score;
        self
    }

    pub async fn evaluate(&self, auth: &AuthResponse) -> Result<(), BusError> {
        let reject = |reason: String| Err(BusError::AuthenticationFailed(reason));

        if auth.signature.is_empty() || !is_base64_charset(&auth.signature) {
            return reject("signature missing or not base64".to_string());
        }

        if let Some(oracle) = &self.trust_oracle {
            match oracle.trust_score(&auth.agent_id).await {
                Ok(score) if score >= self.min_trust_score => {}
                Ok(score) => {
                    return reject(format!(
                        "trust score {:.2} below minimum {:.2}",
                        score, self.min_trust_score
                    ))
                }
                Err(e) => return reject(format!("trust oracle unavailable: {}", e)),
            }
        }

        if let Some(store) = &self.credential_store {
            match store.expected_signature(&auth.agent_id).await {
                Ok(Some(expected)) => {
                    return if bool::from(expected.as_bytes().ct_eq(auth.signature.as_bytes())) {
                        Ok(())
                    } else {
                        reject("signature does not match provisioned credential".to_string())
                    };
                }
                Ok(None) => {}
                Err(e) => return reject(format!("credential store unavailable: {}", e)),
            }
        }

        self.verifier
            .verify(auth.agent_id.as_str().as_bytes(), &auth.signature)
            .map_err(|e| BusError::AuthenticationFailed(e.to_string()))
    }
}

fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CHALLENGE_ALPHABET[*b as usize % CHALLENGE_ALPHABET.len()] as char)
        .collect()
}

struct Connection {
    sender: mpsc::UnboundedSender<OutboundFrame>,
    agent_id: Option<AgentId>,
}

#[derive(Default)]
struct BusState {
    connections: HashMap<ConnectionId, Connection>,
    agents: HashMap<AgentId, ConnectedAgent>,
    offline: HashMap<AgentId, VecDeque<Message>>,
    /// Ids that may receive offline-queued messages.
    known: HashSet<AgentId>,
}

pub struct AgentMessageBus {
    state: Mutex<BusState>,
    settings: BusSettings,
    auth: AuthPolicy,
    event_bus: EventBus,
    next_connection: AtomicU64,
    shutdown: CancellationToken,
}

impl AgentMessageBus {
    pub fn new(settings: BusSettings, auth: AuthPolicy, event_bus: EventBus) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            settings,
            auth,
            event_bus,
            next_connection: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled once [`shutdown`](Self::shutdown) runs; transports stop
    /// accepting connections when it fires.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a new transport connection and queue its `auth_request`.
    pub fn open_connection(&self) -> (ConnectionId, mpsc::UnboundedReceiver<OutboundFrame>) {
        let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();

        if self.shutdown.is_cancelled() {
            let _ = sender.send(OutboundFrame::Close {
                reason: "bus shutting down".to_string(),
            });
            return (id, receiver);
        }

        let challenge = Message::with_payload(
            MessageType::AuthRequest,
            ORCHESTRATOR_ID,
            "",
            &AuthChallenge {
                challenge: generate_challenge(),
            },
        );
        match challenge {
            Ok(message) => {
                let _ = sender.send(OutboundFrame::Message(message));
            }
            Err(e) => warn!(connection = %id, "Failed to build auth challenge: {}", e),
        }

        self.state.lock().connections.insert(
            id,
            Connection {
                sender,
                agent_id: None,
            },
        );
        debug!(connection = %id, "Connection opened");
        (id, receiver)
    }

    /// Parse and handle one inbound text frame.
    pub async fn handle_frame(&self, connection: ConnectionId, text: &str) -> Result<(), BusError> {
        match serde_json::from_str::<Message>(text) {
            Ok(message) => self.handle_message(connection, message).await,
            Err(e) => {
                self.reply_error(connection, format!("Malformed message: {}", e));
                Err(BusError::Malformed(e))
            }
        }
    }

    pub async fn handle_message(&self, connection: ConnectionId, message: Message) -> Result<(), BusError> {
        if message.kind == MessageType::AuthResponse {
            return self.authenticate(connection, message).await;
        }

        let agent_id = {
            let state = self.state.lock();
            let conn = state
                .connections
                .get(&connection)
                .ok_or(BusError::UnknownConnection(connection))?;
            conn.agent_id.clone()
        };
        let Some(agent_id) = agent_id else {
            self.reply_error(connection, "Not authenticated".to_string());
            return Err(BusError::NotAuthenticated);
        };

        match message.kind {
            MessageType::Ping => {
                self.touch(&agent_id);
                let pong = Message::new(MessageType::Pong, ORCHESTRATOR_ID, agent_id.as_str(), serde_json::Value::Null);
                self.send_on_connection(connection, OutboundFrame::Message(pong));
            }
            MessageType::Pong => self.touch(&agent_id),
            kind if kind.is_routable() => self.route_inbound(agent_id, message),
            kind => {
                debug!(agent_id = %agent_id, kind = ?kind, "Ignoring server-side message kind from agent");
            }
        }
        Ok(())
    }

    async fn authenticate(&self, connection: ConnectionId, message: Message) -> Result<(), BusError> {
        let auth: AuthResponse = match message.payload() {
            Ok(auth) => auth,
            Err(e) => {
                return Err(self.reject(connection, None, format!("invalid auth_response payload: {}", e)));
            }
        };

        if let Err(e) = self.auth.evaluate(&auth).await {
            let reason = match e {
                BusError::AuthenticationFailed(reason) => reason,
                other => other.to_string(),
            };
            return Err(self.reject(connection, Some(auth.agent_id), reason));
        }

        let now = Utc::now();
        let registered = {
            let mut state = self.state.lock();
            let bound = match state.connections.get(&connection) {
                Some(conn) => conn.agent_id.clone(),
                None => return Err(BusError::UnknownConnection(connection)),
            };
            match bound {
                Some(bound) if bound != auth.agent_id => Err(bound),
                _ => Ok(Self::register(&mut state, connection, &auth, now)),
            }
        };
        let (replaced, connected) = match registered {
            Ok(registered) => registered,
            Err(bound) => {
                self.reject(
                    connection,
                    Some(auth.agent_id),
                    format!("connection is already authenticated as {}", bound),
                );
                return Err(BusError::IdentityMismatch(bound));
            }
        };

        gauge!("autocoder_agents_connected").set(connected as f64);
        if let Some(previous) = replaced {
            info!(agent_id = %auth.agent_id, old_connection = %previous, "Replaced stale agent connection");
        }
        info!(
            agent_id = %auth.agent_id,
            role = %auth.role,
            connection = %connection,
            "Agent authenticated"
        );

        self.event_bus.publish_agent_event(AgentBusEvent::Authenticated {
            agent_id: auth.agent_id,
            role: auth.role,
            task_id: auth.task_id,
            container_id: auth.container_id,
            authenticated_at: now,
        });
        Ok(())
    }

    /// Bind `connection` to the agent, reply `auth_success` and flush its
    /// offline queue. Returns the superseded connection, if any, and the
    /// number of connected agents.
    fn register(
        state: &mut BusState,
        connection: ConnectionId,
        auth: &AuthResponse,
        now: DateTime<Utc>,
    ) -> (Option<ConnectionId>, usize) {
        // A re-authenticating agent supersedes its previous connection
        let mut replaced = None;
        if let Some(previous) = state.agents.get(&auth.agent_id).map(|a| a.connection) {
            if previous != connection {
                if let Some(old) = state.connections.remove(&previous) {
                    let _ = old.sender.send(OutboundFrame::Close {
                        reason: "superseded by a new connection".to_string(),
                    });
                }
                replaced = Some(previous);
            }
        }

        state.agents.insert(
            auth.agent_id.clone(),
            ConnectedAgent {
                id: auth.agent_id.clone(),
                role: auth.role,
                authenticated: true,
                last_ping: now,
                container_id: auth.container_id.clone(),
                task_id: auth.task_id,
                connected_at: now,
                connection,
            },
        );
        let queued = state.offline.remove(&auth.agent_id).unwrap_or_default();

        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.agent_id = Some(auth.agent_id.clone());
            if let Ok(success) = Message::with_payload(
                MessageType::AuthSuccess,
                ORCHESTRATOR_ID,
                auth.agent_id.as_str(),
                &AuthSuccess {
                    agent_id: auth.agent_id.clone(),
                },
            ) {
                let _ = conn.sender.send(OutboundFrame::Message(success));
            }
            let flushed = queued.len();
            for message in queued {
                let _ = conn.sender.send(OutboundFrame::Message(message));
            }
            if flushed > 0 {
                info!(agent_id = %auth.agent_id, count = flushed, "Delivered queued messages");
            }
        }
        state.known.insert(auth.agent_id.clone());
        (replaced, state.agents.len())
    }

    fn reject(&self, connection: ConnectionId, agent_id: Option<AgentId>, reason: String) -> BusError {
        counter!("autocoder_bus_auth_failures_total").increment(1);
        warn!(
            connection = %connection,
            agent_id = ?agent_id.as_ref().map(|a| a.as_str()),
            "Agent authentication failed: {}",
            reason
        );
        self.reply_error(connection, format!("Authentication failed: {}", reason));
        self.event_bus.publish_agent_event(AgentBusEvent::AuthenticationFailed {
            agent_id,
            reason: reason.clone(),
            failed_at: Utc::now(),
        });
        BusError::AuthenticationFailed(reason)
    }

    fn reply_error(&self, connection: ConnectionId, error: String) {
        if let Ok(message) = Message::with_payload(MessageType::Error, ORCHESTRATOR_ID, "", &ErrorPayload { error }) {
            self.send_on_connection(connection, OutboundFrame::Message(message));
        }
    }

    fn send_on_connection(&self, connection: ConnectionId, frame: OutboundFrame) -> bool {
        let state = self.state.lock();
        state
            .connections
            .get(&connection)
            .map(|conn| conn.sender.send(frame).is_ok())
            .unwrap_or(false)
    }

    fn touch(&self, agent_id: &AgentId) {
        if let Some(agent) = self.state.lock().agents.get_mut(agent_id) {
            agent.last_ping = Utc::now();
        }
    }

    fn route_inbound(&self, from: AgentId, message: Message) {
        self.event_bus.publish_agent_event(AgentBusEvent::MessageReceived {
            agent_id: from.clone(),
            message: message.clone(),
        });

        if message.to == ORCHESTRATOR_ID {
            return;
        }
        if message.is_addressed() {
            let to = AgentId::new(message.to.clone());
            match self.send_to_agent(&to, message) {
                Delivery::Delivered => {}
                Delivery::Queued => debug!(from = %from, to = %to, "Recipient offline, message queued"),
                Delivery::Undeliverable => warn!(from = %from, to = %to, "Dropped message for unknown recipient"),
            }
        } else {
            let delivered = self.broadcast_to_role(AgentRole::Main, &message);
            debug!(from = %from, delivered, "Forwarded unaddressed message to main agents");
        }
    }

    /// Allow messages for `agent_id` to be queued before it first connects.
    pub fn expect_agent(&self, agent_id: &AgentId) {
        self.state.lock().known.insert(agent_id.clone());
    }

    /// Drop the offline queues of agents that will never connect again and
    /// stop queueing for them. Returns how many messages were discarded.
    pub fn forget_agents(&self, agent_ids: &[AgentId]) -> usize {
        let mut state = self.state.lock();
        let mut discarded = 0;
        for agent_id in agent_ids {
            state.known.remove(agent_id);
            if let Some(queue) = state.offline.remove(agent_id) {
                discarded += queue.len();
            }
        }
        if discarded > 0 {
            debug!(agents = agent_ids.len(), discarded, "Discarded offline messages");
        }
        discarded
    }

    /// Deliver immediately when the agent is connected, otherwise queue it
    /// if the agent is known to the bus.
    pub fn send_to_agent(&self, agent_id: &AgentId, message: Message) -> Delivery {
        let mut state = self.state.lock();

        let connection = state
            .agents
            .get(agent_id)
            .filter(|agent| agent.authenticated)
            .map(|agent| agent.connection);
        if let Some(conn) = connection.and_then(|c| state.connections.get(&c)) {
            if conn.sender.send(OutboundFrame::Message(message.clone())).is_ok() {
                return Delivery::Delivered;
            }
        }

        if !state.known.contains(agent_id) {
            debug!(agent_id = %agent_id, message_id = %message.id, "No such agent, message discarded");
            return Delivery::Undeliverable;
        }

        let capacity = self.settings.offline_queue_capacity;
        let queue = state.offline.entry(agent_id.clone()).or_default();
        queue.push_back(message);
        counter!("autocoder_bus_messages_queued_total").increment(1);
        if queue.len() > capacity {
            if let Some(dropped) = queue.pop_front() {
                counter!("autocoder_bus_messages_dropped_total").increment(1);
                warn!(
                    agent_id = %agent_id,
                    message_id = %dropped.id,
                    capacity,
                    "Offline queue full, dropped oldest message"
                );
            }
        }
        Delivery::Queued
    }

    fn broadcast_where(&self, message: &Message, filter: impl Fn(&ConnectedAgent) -> bool) -> usize {
        let state = self.state.lock();
        state
            .agents
            .values()
            .filter(|agent| agent.authenticated && filter(agent))
            .filter_map(|agent| state.connections.get(&agent.connection))
            .filter(|conn| conn.sender.send(OutboundFrame::Message(message.clone())).is_ok())
            .count()
    }

    /// Send to every connected agent with `role`. Returns how many received it.
    pub fn broadcast_to_role(&self, role: AgentRole, message: &Message) -> usize {
        self.broadcast_where(message, |agent| agent.role == role)
    }

    /// Send to every connected agent bound to `task_id`. Returns how many received it.
    pub fn broadcast_to_task(&self, task_id: TaskId, message: &Message) -> usize {
        self.broadcast_where(message, |agent| agent.task_id == Some(task_id))
    }

    /// The transport's socket closed.
    pub fn connection_closed(&self, connection: ConnectionId, reason: &str) {
        let (agent_id, connected) = {
            let mut state = self.state.lock();
            let Some(conn) = state.connections.remove(&connection) else {
                return;
            };
            let agent_id = conn.agent_id.filter(|id| {
                state
                    .agents
                    .get(id)
                    .map(|agent| agent.connection == connection)
                    .unwrap_or(false)
            });
            if let Some(id) = &agent_id {
                state.agents.remove(id);
            }
            (agent_id, state.agents.len())
        };

        if let Some(agent_id) = agent_id {
            gauge!("autocoder_agents_connected").set(connected as f64);
            info!(agent_id = %agent_id, connection = %connection, "Agent disconnected: {}", reason);
            self.event_bus.publish_agent_event(AgentBusEvent::Disconnected {
                agent_id,
                reason: reason.to_string(),
                disconnected_at: Utc::now(),
            });
        } else {
            debug!(connection = %connection, "Unauthenticated connection closed");
        }
    }

    /// Forcibly close an agent's connection and deregister it.
    pub fn disconnect_agent(&self, agent_id: &AgentId, reason: &str) -> bool {
        let connected = {
            let mut state = self.state.lock();
            let Some(agent) = state.agents.remove(agent_id) else {
                return false;
            };
            if let Some(conn) = state.connections.remove(&agent.connection) {
                let _ = conn.sender.send(OutboundFrame::Close {
                    reason: reason.to_string(),
                });
            }
            state.agents.len()
        };

        gauge!("autocoder_agents_connected").set(connected as f64);
        info!(agent_id = %agent_id, "Agent disconnected by orchestrator: {}", reason);
        self.event_bus.publish_agent_event(AgentBusEvent::Disconnected {
            agent_id: agent_id.clone(),
            reason: reason.to_string(),
            disconnected_at: Utc::now(),
        });
        true
    }

    /// Evict agents silent for longer than the ping timeout and ping the
    /// rest. Returns the evicted agent ids.
    pub fn run_liveness_check(&self) -> Vec<AgentId> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.settings.ping_timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let (stale, live): (Vec<_>, Vec<_>) = {
            let state = self.state.lock();
            state
                .agents
                .values()
                .map(|agent| (agent.id.clone(), now - agent.last_ping > timeout))
                .partition(|(_, is_stale)| *is_stale)
        };

        for (agent_id, _) in &stale {
            warn!(agent_id = %agent_id, "Agent missed liveness window, evicting");
            self.disconnect_agent(agent_id, "ping timeout");
        }
        for (agent_id, _) in &live {
            let ping = Message::new(MessageType::Ping, ORCHESTRATOR_ID, agent_id.as_str(), serde_json::Value::Null);
            let connection = self.state.lock().agents.get(agent_id).map(|a| a.connection);
            if let Some(connection) = connection {
                self.send_on_connection(connection, OutboundFrame::Message(ping));
            }
        }

        stale.into_iter().map(|(id, _)| id).collect()
    }

    pub fn spawn_liveness_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(bus.settings.liveness_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = bus.shutdown.cancelled() => {
                        debug!("Liveness monitor stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        let evicted = bus.run_liveness_check();
                        if !evicted.is_empty() {
                            debug!(evicted = evicted.len(), "Liveness tick evicted agents");
                        }
                    }
                }
            }
        })
    }

    /// Stop liveness probing, disconnect every agent and close every
    /// remaining connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let agents: Vec<AgentId> = self.state.lock().agents.keys().cloned().collect();
        for agent_id in &agents {
            self.disconnect_agent(agent_id, "orchestrator shutting down");
        }
        let connections: Vec<Connection> = self.state.lock().connections.drain().map(|(_, c)| c).collect();
        for conn in connections {
            let _ = conn.sender.send(OutboundFrame::Close {
                reason: "orchestrator shutting down".to_string(),
            });
        }
        gauge!("autocoder_agents_connected").set(0.0);
        info!(disconnected = agents.len(), "Agent message bus shut down");
    }

    pub fn connected_agents(&self) -> Vec<ConnectedAgent> {
        self.state.lock().agents.values().cloned().collect()
    }

    pub fn get_agent(&self, agent_id: &AgentId) -> Option<ConnectedAgent> {
        self.state.lock().agents.get(agent_id).cloned()
    }

    pub fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.state.lock().agents.contains_key(agent_id)
    }

    pub fn offline_queue_len(&self, agent_id: &AgentId) -> usize {
        self.state.lock().offline.get(agent_id).map(VecDeque::len).unwrap_or(0)
    }

    #[cfg(test)]
    fn backdate_ping(&self, agent_id: &AgentId, by: Duration) {
        if let Some(agent) = self.state.lock().agents.get_mut(agent_id) {
            agent.last_ping = agent.last_ping - chrono::Duration::from_std(by).unwrap();
        }
    }
}
