// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenantgate Server - HTTP surface and background runtime.
//!
//! Exposes the core under `/api/v1`:
//!
//! - runtime endpoints (`/runtime/{slug}`, schema, execute, VM dispatch)
//! - workspace management (versions, members, domains, access settings)
//! - exports, log archives and export subscriptions
//! - billing (consume, quota, budget, catalog, estimate)
//! - dead-letter administration under `/ops/dead-tasks`
//!
//! Every success body is `{success: true, data, meta?}` and every error body
//! is `{success: false, error: {code, message, details?}}`.
//!
//! [`runtime::GatewayRuntime`] embeds the HTTP server together with the job
//! worker, the maintenance worker and the idle-isolate sweeper.

pub mod api;
pub mod auth;
pub mod runtime;
pub mod state;

pub use state::{AppState, Collaborators};
