// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod message_bus;

pub use coordinator::{CoordinatorError, CoordinatorSettings, TaskCoordinator, TaskFilter, TaskMetrics};
pub use message_bus::{
    AgentMessageBus, AuthPolicy, BusError, BusSettings, ConnectedAgent, ConnectionId, Delivery, OutboundFrame,
    ORCHESTRATOR_ID,
};
