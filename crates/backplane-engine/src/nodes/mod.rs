// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in node executors.
//!
//! | Type | Behaviour |
//! |------|-----------|
//! | `start`, `end`, `input`, `output`, `merge` | Pass inputs through |
//! | `variable` | Sets workflow variables from `variables` |
//! | `template` | Renders `template` into `output`/`text` |
//! | `condition` | Evaluates a predicate and selects the `true`/`false` handle |
//! | `delay` | Waits `duration` ms, cancellation-aware |
//! | `http` | Calls an upstream HTTP endpoint |
//! | `llm` | Chat completion through an [`llm::LlmProvider`] |

pub mod basic;
pub mod condition;
pub mod delay;
pub mod http;
pub mod interpolate;
pub mod llm;
pub mod template;

use std::sync::Arc;

use crate::executor::ExecutorRegistry;

/// Registers every built-in node that needs no external provider.
pub fn register_builtins(registry: &mut ExecutorRegistry) {
    for node_type in basic::PASSTHROUGH_TYPES {
        registry.register(Arc::new(basic::PassthroughExecutor::new(node_type)));
    }
    registry.register(Arc::new(basic::VariableExecutor));
    registry.register(Arc::new(template::TemplateExecutor));
    registry.register(Arc::new(condition::ConditionExecutor));
    registry.register(Arc::new(delay::DelayExecutor));
    registry.register(Arc::new(http::HttpExecutor::new()));
}
