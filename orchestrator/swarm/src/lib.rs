// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `autocoder-swarm` - Task Coordination & Agent Messaging
//!
//! Drives a task from request to completion across a team of sandboxed
//! sub-agents, and carries the authenticated messages between them and the
//! orchestrator.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | dispatch queue, role derivation |
//! | [`application`] | Application | `TaskCoordinator`, `AgentMessageBus` |
//! | [`infrastructure`] | Infrastructure | WebSocket transport for the bus |
//!
//! Container management lives in `autocoder_core`; this crate only calls
//! into it.

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::coordinator::{CoordinatorError, TaskCoordinator, TaskFilter, TaskMetrics};
pub use application::message_bus::{AgentMessageBus, AuthPolicy, BusError, BusSettings, Delivery};
