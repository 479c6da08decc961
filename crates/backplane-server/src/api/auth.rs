// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App-user auth handlers for `public_auth` workspaces.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use backplane_core::CoreError;
use backplane_core::auth::{LoginRequest, LoginResult, RegisterAppUser};
use backplane_core::persistence::AppUserRecord;
use backplane_core::runtime::RuntimeAddress;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use super::edge::Edge;
use super::response::{ApiError, ApiResponse, ApiResult};
use crate::app::AppState;

fn parse<T: DeserializeOwned>(body: &Bytes) -> Result<T, CoreError> {
    serde_json::from_slice(body).map_err(|e| CoreError::InvalidRequest(format!("body: {e}")))
}

async fn workspace_id(state: &AppState, slug: String) -> Result<Uuid, CoreError> {
    let entry = state
        .ctx
        .runtime
        .resolve(&RuntimeAddress::Slug(slug))
        .await?;
    Ok(entry.workspace.id)
}

/// `POST /runtime/{slug}/auth/register`
pub async fn register(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    edge: Edge,
    body: Bytes,
) -> ApiResult<AppUserRecord> {
    let result = async {
        let form: RegisterAppUser = parse(&body)?;
        let ws = workspace_id(&state, slug).await?;
        state.ctx.auth.register(ws, form).await
    }
    .await;
    result
        .map(|user| ApiResponse::ok(user, &edge.meta).with_status(StatusCode::CREATED))
        .map_err(|e| ApiError::new(e, &edge.meta))
}

/// `POST /runtime/{slug}/auth/login`
pub async fn login(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    edge: Edge,
    body: Bytes,
) -> ApiResult<LoginResult> {
    let result = async {
        let form: LoginRequest = parse(&body)?;
        let ws = workspace_id(&state, slug).await?;
        state.ctx.auth.login(ws, form, &edge.meta).await
    }
    .await;
    result
        .map(|login| ApiResponse::ok(login, &edge.meta))
        .map_err(|e| ApiError::new(e, &edge.meta))
}

/// `POST /runtime/{slug}/auth/logout` with the session's bearer token.
pub async fn logout(
    State(state): State<AppState>,
    Path(_slug): Path<String>,
    edge: Edge,
) -> ApiResult<Value> {
    let token = edge
        .authorization
        .as_deref()
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        return Err(ApiError::new(CoreError::Unauthorized, &edge.meta));
    };
    state
        .ctx
        .auth
        .logout(token)
        .await
        .map(|()| ApiResponse::ok(json!({ "logged_out": true }), &edge.meta))
        .map_err(|e| ApiError::new(e, &edge.meta))
}
