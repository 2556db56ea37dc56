// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenantgate Core - Application Runtime Gateway
//!
//! Request-path machinery for workspace-scoped, user-authored applications and
//! the asynchronous pipeline behind it. A runtime request is resolved to a
//! workspace and its published version, admitted by the access controller,
//! metered by the billing engine and then dispatched to either the workflow
//! execution engine or the workspace's embedded VM isolate.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    HTTP surface (tenantgate-server)                   │
//! └──────────────────────────────────────────────────────────────────────┘
//!                │ runtime                         │ management / ops
//!                ▼                                 ▼
//! ┌─────────────────────────────┐      ┌─────────────────────────────────┐
//! │     Runtime dispatcher      │      │   Export service / job worker   │
//! │  host → workspace → version │      │  queues, backoff, DLQ, replay   │
//! └─────────────────────────────┘      └─────────────────────────────────┘
//!   │        │        │       │                        │
//!   ▼        ▼        ▼       ▼                        ▼
//! ┌──────┐┌───────┐┌───────┐┌─────────────┐   ┌───────────────────────┐
//! │Access││CAPTCHA││Billing││ UI schema   │   │   Local object store  │
//! └──────┘└───────┘└───────┘└─────────────┘   └───────────────────────┘
//!   │                 │           │
//!   │                 │     ┌─────┴──────────────┐
//!   │                 │     ▼                    ▼
//!   │                 │  ┌──────────────┐  ┌────────────┐
//!   │                 │  │ Exec handoff │  │  VM pool   │
//!   │                 │  └──────────────┘  └────────────┘
//!   ▼                 ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  Entity store (SQLite) + audit sink                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: persistent state behind the [`store::Store`] trait
//! - [`ui_schema`]: schema normalisation and input mapping
//! - [`access`]: access modes, sessions, rate windows, bans
//! - [`captcha`]: pluggable CAPTCHA verification
//! - [`billing`]: dimension catalog, quota consumption, budgets
//! - [`dispatcher`]: runtime entry, schema and execute operations
//! - [`vm`]: per-workspace isolate pool
//! - [`execution`]: handoff to the workflow execution engine
//! - [`jobs`]: export and archive jobs, worker, DLQ, replay
//! - [`audit`]: append-only audit log
//! - [`metrics`]: runtime and job instruments

pub mod access;
pub mod audit;
pub mod billing;
pub mod captcha;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod jobs;
pub mod metrics;
pub mod store;
pub mod time;
pub mod ui_schema;
pub mod vm;

pub use config::{Config, ConfigError};
pub use context::{Principal, RequestContext};
pub use error::{Error, ErrorClass, Result};
pub use store::{SqliteStore, Store};
