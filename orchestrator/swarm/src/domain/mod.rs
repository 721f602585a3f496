// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Domain Layer
//!
//! Pure scheduling rules. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`queue`] | `TaskQueue`, `QueuedTask` |
//! | [`roles`] | `derive_roles`, `requires_tester` |

pub mod queue;
pub mod roles;

pub use queue::{QueuedTask, TaskQueue};
pub use roles::{derive_roles, requires_tester};
