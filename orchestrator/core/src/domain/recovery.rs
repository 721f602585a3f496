// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Container Recovery Policy
//!
//! Extension point invoked when a managed container dies unexpectedly or is
//! reported unhealthy. The lifecycle manager has already marked a dead
//! container `error` and dropped it from its registry before the policy runs;
//! the policy decides what, if anything, happens next.
//!
//! The shipped [`NoRestartPolicy`] never restarts anything.

use async_trait::async_trait;
use tracing::warn;

use crate::domain::container::ManagedContainer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossCause {
    /// The container exited while it was expected to be running.
    Died { reason: String },
    /// The runtime health check reported the container unhealthy.
    Unhealthy,
}

#[async_trait]
pub trait RecoveryPolicy: Send + Sync {
    async fn on_container_lost(&self, container: &ManagedContainer, cause: &LossCause);
}

/// Marks the loss in the log and leaves the task to its remaining workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRestartPolicy;

#[async_trait]
impl RecoveryPolicy for NoRestartPolicy {
    async fn on_container_lost(&self, container: &ManagedContainer, cause: &LossCause) {
        warn!(
            container_id = %container.container_id,
            task_id = %container.task_id(),
            role = %container.role(),
            cause = ?cause,
            "Sub-agent container lost; automatic restart is disabled"
        );
    }
}
