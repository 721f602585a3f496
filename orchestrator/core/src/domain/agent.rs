// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Identity & Roles
//!
//! Every worker connected to the bus carries an [`AgentId`] and exactly one
//! [`AgentRole`]. The parent process (and any operator console attached to it)
//! connects as [`AgentRole::Main`]; sandboxed sub-agents are `coder`, `reviewer`
//! or `tester`.
//!
//! ## Capability Table
//!
//! | Role | Capabilities |
//! |------|--------------|
//! | coder | code-generation, file-editing, git-operations, package-management, debugging |
//! | reviewer | code-analysis, security-audit, performance-analysis, documentation-review, test-assessment |
//! | tester | test-generation, test-execution, coverage-analysis, integration-testing, e2e-testing |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier a worker presents during the bus handshake.
///
/// Sub-agents receive a generated id of the form `<role>-<uuid>` when their
/// container is spawned; externally launched agents may use any string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id for a sub-agent of the given role.
    pub fn generate(role: AgentRole) -> Self {
        Self(format!("{}-{}", role.as_str(), Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Main,
    Coder,
    Reviewer,
    Tester,
}

#[derive(Debug, Error)]
#[error("Unknown agent role: '{0}'")]
pub struct UnknownRoleError(pub String);

impl AgentRole {
    /// Roles that run inside a managed container.
    pub const SUB_AGENT_ROLES: [AgentRole; 3] = [AgentRole::Coder, AgentRole::Reviewer, AgentRole::Tester];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Main => "main",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Tester => "tester",
        }
    }

    pub fn is_sub_agent(&self) -> bool {
        !matches!(self, AgentRole::Main)
    }

    /// Fixed capability list advertised to a sub-agent of this role.
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Main => &[],
            AgentRole::Coder => &[
                "code-generation",
                "file-editing",
                "git-operations",
                "package-management",
                "debugging",
            ],
            AgentRole::Reviewer => &[
                "code-analysis",
                "security-audit",
                "performance-analysis",
                "documentation-review",
                "test-assessment",
            ],
            AgentRole::Tester => &[
                "test-generation",
                "test-execution",
                "coverage-analysis",
                "integration-testing",
                "e2e-testing",
            ],
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = UnknownRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" => Ok(AgentRole::Main),
            "coder" => Ok(AgentRole::Coder),
            "reviewer" => Ok(AgentRole::Reviewer),
            "tester" => Ok(AgentRole::Tester),
            other => Err(UnknownRoleError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_sub_agent_role_has_five_capabilities() {
        for role in AgentRole::SUB_AGENT_ROLES {
            assert_eq!(role.capabilities().len(), 5, "role {}", role);
        }
        assert!(AgentRole::Main.capabilities().is_empty());
    }

    #[test]
    fn test_role_parsing_is_case_insensitive() {
        assert_eq!("Coder".parse::<AgentRole>().unwrap(), AgentRole::Coder);
        assert_eq!("TESTER".parse::<AgentRole>().unwrap(), AgentRole::Tester);
        assert!("janitor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_generated_id_carries_role_prefix() {
        let id = AgentId::generate(AgentRole::Reviewer);
        assert!(id.as_str().starts_with("reviewer-"));
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&AgentRole::Tester).unwrap();
        assert_eq!(json, "\"tester\"");
    }
}
