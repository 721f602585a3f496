// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod lifecycle;

pub use lifecycle::{ContainerLifecycleManager, HealthCheckReport, LifecycleError, LifecycleSettings, SpawnRequest};
