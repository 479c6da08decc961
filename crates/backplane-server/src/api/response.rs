// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Uniform response envelope.
//!
//! Every runtime response, success or failure, has the shape
//! `{code, message, request_id, trace_id, data}`. Failures additionally carry
//! `retry_after_seconds` (mirrored in the `Retry-After` header) when the
//! error is retryable.

use axum::Json;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use backplane_core::CoreError;
use backplane_core::model::RequestMeta;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error};
use uuid::Uuid;

/// Header carrying the session id back to the client.
pub const SESSION_HEADER: &str = "x-app-session-id";

/// Header echoing the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Code of every successful response.
pub const OK_CODE: &str = "OK";

const OK_MESSAGE: &str = "success";

/// Wire envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: &'static str,
    pub message: &'static str,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    pub data: Option<T>,
}

/// Result type of runtime handlers.
pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

// ============================================================================
// Success
// ============================================================================

/// Successful response wrapped in the envelope.
#[derive(Debug)]
pub struct ApiResponse<T: Serialize> {
    status: StatusCode,
    data: T,
    request_id: Option<String>,
    trace_id: Option<String>,
    session_id: Option<Uuid>,
}

impl<T: Serialize> ApiResponse<T> {
    /// 200 with `data`, correlated to the request.
    pub fn ok(data: T, meta: &RequestMeta) -> Self {
        Self {
            status: StatusCode::OK,
            data,
            request_id: meta.request_id.clone(),
            trace_id: meta.trace_id.clone(),
            session_id: None,
        }
    }

    /// Overrides the status.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Sets `X-App-Session-Id` on the response.
    pub fn with_session(mut self, session_id: Option<Uuid>) -> Self {
        self.session_id = session_id;
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let request_id = self.request_id.clone();
        let body = Envelope {
            code: OK_CODE,
            message: OK_MESSAGE,
            request_id: self.request_id,
            trace_id: self.trace_id,
            retry_after_seconds: None,
            data: Some(self.data),
        };
        let mut response = (self.status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(session_id) = self.session_id {
            insert_header(headers, SESSION_HEADER, &session_id.to_string());
        }
        if let Some(request_id) = request_id {
            insert_header(headers, REQUEST_ID_HEADER, &request_id);
        }
        response
    }
}

// ============================================================================
// Failure
// ============================================================================

/// A [`CoreError`] bound to the request it failed.
#[derive(Debug)]
pub struct ApiError {
    error: CoreError,
    request_id: Option<String>,
    trace_id: Option<String>,
}

impl ApiError {
    /// Wraps `error` with the request's correlation ids.
    pub fn new(error: CoreError, meta: &RequestMeta) -> Self {
        Self {
            error,
            request_id: meta.request_id.clone(),
            trace_id: meta.trace_id.clone(),
        }
    }

    /// The underlying error.
    pub fn error(&self) -> &CoreError {
        &self.error
    }
}

/// Structured details for errors the client can act on.
fn error_data(error: &CoreError) -> Option<Value> {
    match error {
        CoreError::InvalidInputs(fields) => Some(json!({ "fields": fields })),
        CoreError::QuotaExceeded { exceeded, reset_at } => Some(json!({
            "exceeded": exceeded,
            "reset_at": reset_at,
        })),
        CoreError::RateLimited { scope, .. } => Some(json!({ "scope": scope })),
        CoreError::Validation { field, .. } => Some(json!({ "field": field })),
        CoreError::BlockedByRisk(signals) => Some(json!({ "risk_signals": signals })),
        _ => None,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = self.error.error_code();
        if status.is_server_error() {
            error!(
                code,
                request_id = ?self.request_id,
                error = %self.error,
                "Runtime request failed"
            );
        } else {
            debug!(code, request_id = ?self.request_id, error = %self.error, "Runtime request refused");
        }

        let retry_after = self.error.retry_after().map(|d| d.as_secs().max(1));
        let request_id = self.request_id.clone();
        let body = Envelope {
            code,
            message: self.error.public_message(),
            request_id: self.request_id,
            trace_id: self.trace_id,
            retry_after_seconds: retry_after,
            data: error_data(&self.error),
        };
        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if let Some(request_id) = request_id {
            insert_header(headers, REQUEST_ID_HEADER, &request_id);
        }
        response
    }
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
