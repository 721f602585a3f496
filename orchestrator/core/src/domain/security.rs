// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Authentication Collaborators
//!
//! Domain seams consulted by the bus during the challenge/response handshake.
//! They keep the bus free of any particular trust service, secret store, or
//! signature scheme. The ed25519 verifier lives in
//! [`crate::infrastructure::signature`].

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::agent::AgentId;

/// Reputation source for connecting agents. Scores are in `[0.0, 1.0]`.
#[async_trait]
pub trait TrustOracle: Send + Sync {
    async fn trust_score(&self, agent_id: &AgentId) -> Result<f64>;
}

/// Store of pre-provisioned agent signatures.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The signature an agent is expected to present, if one is provisioned.
    async fn expected_signature(&self, agent_id: &AgentId) -> Result<Option<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
    #[error("Malformed signature: {0}")]
    Malformed(String),
    #[error("Signature verification failed: {0}")]
    Mismatch(String),
}

/// Verifies a base64 signature over a message.
///
/// Implementations must compare in constant time.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), SignatureError>;
}
