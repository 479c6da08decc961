// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backplane Engine - DAG Workflow Executor
//!
//! This crate runs the workflow attached to a published workspace version. It has no
//! storage dependency: callers hand it a [`WorkflowDefinition`], an [`ExecutionContext`]
//! and an [`EventSink`], and receive an [`ExecutionResult`].
//!
//! # Execution Model
//!
//! ```text
//!   definition ──► Dag::build ──► levels (Kahn) ──► per level: ready nodes run
//!                     │                               concurrently (Semaphore)
//!                     └─ cycle → InvalidDefinition          │
//!                                                           ▼
//!                                              EventSink ──► recorder / WebSocket hub
//! ```
//!
//! | Event | When |
//! |-------|------|
//! | `execution_started` | Before the first node |
//! | `execution_node_started` | A node leaves `pending` |
//! | `execution_node_completed` | A node succeeded |
//! | `execution_node_failed` | A node failed after its retries |
//! | `execution_node_skipped` | A node was not activated by any predecessor |
//! | `execution_completed` / `execution_failed` / `execution_cancelled` | Terminal |
//!
//! Node failures retry with exponential backoff seeded at `retryPolicy.backoffMs`.
//! `errorHandling = "stop"` halts on the first unrecoverable failure; `"continue"`
//! records the failure and keeps running independent branches.

#![deny(missing_docs)]

pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod hub;
pub mod nodes;
pub mod retry;

pub use context::{ExecutionContext, TokenUsage};
pub use dag::Dag;
pub use definition::{
    EdgeDefinition, ErrorHandling, NodeDefinition, RetryPolicy, WorkflowDefinition,
    WorkflowSettings,
};
pub use engine::{Engine, EngineConfig, ExecutionResult, ExecutionStatus, NodeRun, NodeStatus};
pub use error::{EngineError, Result};
pub use events::{EventSink, ExecutionEvent, ExecutionEventType, FanoutSink, NoopSink};
pub use executor::{ExecutorRegistry, NodeExecutor, NodeInput, NodeOutput};
pub use hub::ExecutionHub;
