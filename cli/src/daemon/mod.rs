// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Foreground orchestrator process

pub mod server;

pub use server::run_orchestrator;
