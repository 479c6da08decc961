// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime events: catalog, PII sanitizer and the sequenced recorder.

pub mod catalog;
pub mod recorder;
pub mod sanitize;

pub use catalog::{EventCategory, EventTypeInfo, Severity, types};
pub use recorder::{EventDispatcher, EventRecorder, RuntimeEvent};
pub use sanitize::PiiSanitizer;
