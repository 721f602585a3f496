// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod runtime;
pub mod memory_runtime;
pub mod event_bus;
pub mod signature;

pub use event_bus::{DomainEvent, EventBus, EventBusError};
pub use memory_runtime::InMemoryBackend;
pub use runtime::DockerBackend;
pub use signature::{Ed25519SignatureVerifier, LengthHeuristicVerifier};
