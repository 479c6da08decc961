// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request metadata extracted at the HTTP edge.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use backplane_core::model::{RequestMeta, resolve_client_ip};
use uuid::Uuid;

use super::response::{REQUEST_ID_HEADER, SESSION_HEADER};

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const CAPTCHA_HEADER: &str = "x-captcha-token";
const TRACE_ID_HEADER: &str = "x-trace-id";
const TRACEPARENT: &str = "traceparent";

/// Everything the runtime needs from the raw request besides the body.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Client identity and correlation ids.
    pub meta: RequestMeta,
    /// Raw `Authorization` header.
    pub authorization: Option<String>,
    /// Raw `Host`, for domain-addressed requests.
    pub host: Option<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Trace id from `X-Trace-Id`, else the trace-id field of a W3C
/// `traceparent`.
fn trace_id(headers: &HeaderMap) -> Option<String> {
    if let Some(id) = header_str(headers, TRACE_ID_HEADER) {
        return Some(id.to_string());
    }
    let parent = header_str(headers, TRACEPARENT)?;
    let mut parts = parent.split('-');
    let (_version, id) = (parts.next()?, parts.next()?);
    (id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())).then(|| id.to_string())
}

impl Edge {
    /// Builds the edge view of a request. `peer` is the socket address when
    /// the server runs with connect info.
    pub fn from_parts(parts: &Parts, peer: Option<SocketAddr>) -> Self {
        let headers = &parts.headers;
        let peer_ip = peer.map(|addr| addr.ip().to_string());
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace_id = trace_id(headers).unwrap_or_else(|| request_id.clone());

        let meta = RequestMeta {
            ip: resolve_client_ip(
                header_str(headers, CF_CONNECTING_IP),
                header_str(headers, X_FORWARDED_FOR),
                peer_ip.as_deref(),
            ),
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
            // A malformed session id is treated as absent.
            session_id: header_str(headers, SESSION_HEADER).and_then(|v| Uuid::parse_str(v).ok()),
            captcha_token: header_str(headers, CAPTCHA_HEADER).map(str::to_string),
            trace_id: Some(trace_id),
            request_id: Some(request_id),
            method: Some(parts.method.to_string()),
            path: Some(parts.uri.path().to_string()),
        };

        let host = header_str(headers, header::HOST.as_str())
            .or_else(|| parts.uri.host())
            .map(str::to_string);

        Self {
            meta,
            authorization: header_str(headers, header::AUTHORIZATION.as_str()).map(str::to_string),
            host,
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Edge {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_parts(parts, peer))
    }
}
