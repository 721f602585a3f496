// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Autocoder orchestrator core
//!
//! Task and sub-agent domain model, the container lifecycle manager, and the
//! execution backends it drives.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain types, container lifecycle, runtime adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
