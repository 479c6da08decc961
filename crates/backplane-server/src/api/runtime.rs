// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime handlers: entry, schema and execute.
//!
//! Each endpoint exists twice, addressed by slug (`/runtime/{slug}/...`) and
//! by host (`/runtime/...` on a bound domain or platform subdomain).

use axum::extract::{Path, State};
use backplane_core::CoreError;
use backplane_core::model::Caller;
use backplane_core::runtime::{
    EntryResponse, ExecuteRequest, ExecuteResponse, RuntimeAddress, RuntimeEntry, RuntimeSchema,
};
use bytes::Bytes;

use super::edge::Edge;
use super::response::{ApiError, ApiResponse, ApiResult};
use crate::app::AppState;

/// Resolves the bearer header against the resolved workspace.
pub(crate) async fn caller_for(
    state: &AppState,
    entry: &RuntimeEntry,
    edge: &Edge,
) -> Result<Caller, CoreError> {
    if edge.authorization.is_none() {
        return Ok(Caller::anonymous());
    }
    state
        .ctx
        .auth
        .resolve_bearer(entry.workspace.id, edge.authorization.as_deref())
        .await
}

fn host_address(edge: &Edge) -> Result<RuntimeAddress, ApiError> {
    edge.host
        .clone()
        .map(RuntimeAddress::Host)
        .ok_or_else(|| ApiError::new(CoreError::InvalidDomain, &edge.meta))
}

fn parse_execute(body: &Bytes) -> Result<ExecuteRequest, CoreError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ExecuteRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| CoreError::InvalidRequest(format!("body: {e}")))
}

// ============================================================================
// Shared flows
// ============================================================================

async fn entry(state: &AppState, address: RuntimeAddress, edge: Edge) -> ApiResult<EntryResponse> {
    let result = async {
        let resolved = state.ctx.runtime.resolve(&address).await?;
        let caller = caller_for(state, &resolved, &edge).await?;
        state.ctx.runtime.entry_for(&resolved, &caller, &edge.meta).await
    }
    .await;
    match result {
        Ok(entry) => {
            let session_id = entry.session_id;
            Ok(ApiResponse::ok(entry, &edge.meta).with_session(session_id))
        }
        Err(e) => Err(ApiError::new(e, &edge.meta)),
    }
}

async fn schema(state: &AppState, address: RuntimeAddress, edge: Edge) -> ApiResult<RuntimeSchema> {
    let result = async {
        let resolved = state.ctx.runtime.resolve(&address).await?;
        let caller = caller_for(state, &resolved, &edge).await?;
        state.ctx.runtime.schema_for(&resolved, &caller, &edge.meta).await
    }
    .await;
    match result {
        Ok(schema) => {
            let session_id = schema.session_id;
            Ok(ApiResponse::ok(schema, &edge.meta).with_session(session_id))
        }
        Err(e) => Err(ApiError::new(e, &edge.meta)),
    }
}

async fn execute(
    state: &AppState,
    address: RuntimeAddress,
    edge: Edge,
    body: Bytes,
) -> ApiResult<ExecuteResponse> {
    let result = async {
        let request = parse_execute(&body)?;
        let resolved = state.ctx.runtime.resolve(&address).await?;
        let caller = caller_for(state, &resolved, &edge).await?;
        state
            .ctx
            .runtime
            .execute_for(&resolved, &caller, &edge.meta, request)
            .await
    }
    .await;
    match result {
        Ok(accepted) => {
            let session_id = accepted.session_id;
            Ok(ApiResponse::ok(accepted, &edge.meta).with_session(session_id))
        }
        Err(e) => Err(ApiError::new(e, &edge.meta)),
    }
}

// ============================================================================
// Slug-addressed
// ============================================================================

/// `GET /runtime/{slug}/entry`
pub async fn slug_entry(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    edge: Edge,
) -> ApiResult<EntryResponse> {
    entry(&state, RuntimeAddress::Slug(slug), edge).await
}

/// `GET /runtime/{slug}/schema`
pub async fn slug_schema(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    edge: Edge,
) -> ApiResult<RuntimeSchema> {
    schema(&state, RuntimeAddress::Slug(slug), edge).await
}

/// `POST /runtime/{slug}/execute`
pub async fn slug_execute(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    edge: Edge,
    body: Bytes,
) -> ApiResult<ExecuteResponse> {
    execute(&state, RuntimeAddress::Slug(slug), edge, body).await
}

// ============================================================================
// Host-addressed
// ============================================================================

/// `GET /runtime/entry` on a bound host.
pub async fn host_entry(State(state): State<AppState>, edge: Edge) -> ApiResult<EntryResponse> {
    let address = host_address(&edge)?;
    entry(&state, address, edge).await
}

/// `GET /runtime/schema` on a bound host.
pub async fn host_schema(State(state): State<AppState>, edge: Edge) -> ApiResult<RuntimeSchema> {
    let address = host_address(&edge)?;
    schema(&state, address, edge).await
}

/// `POST /runtime/execute` on a bound host.
pub async fn host_execute(
    State(state): State<AppState>,
    edge: Edge,
    body: Bytes,
) -> ApiResult<ExecuteResponse> {
    let address = host_address(&edge)?;
    execute(&state, address, edge, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_execute_body() {
        let empty = parse_execute(&Bytes::from_static(b"  \n")).unwrap();
        assert!(empty.inputs.is_empty());

        let parsed = parse_execute(&Bytes::from_static(
            br#"{"inputs":{"x":1},"trigger_type":"app_runtime","captcha_token":"t"}"#,
        ))
        .unwrap();
        assert_eq!(parsed.inputs["x"], 1);
        assert_eq!(parsed.trigger_type.as_deref(), Some("app_runtime"));
        assert_eq!(parsed.captcha_token.as_deref(), Some("t"));

        assert!(matches!(
            parse_execute(&Bytes::from_static(b"{not json")),
            Err(CoreError::InvalidRequest(_))
        ));
    }
}
