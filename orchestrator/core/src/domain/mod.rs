// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: tasks, sub-agent containers, bus messages, and the ports
//! (execution backend, trust, credentials, recovery) the application layer
//! is written against.

pub mod agent;
pub mod task;
pub mod container;
pub mod runtime;
pub mod message;
pub mod security;
pub mod events;
pub mod recovery;
pub mod node_config;
