// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App-user authentication for published workspaces.
//!
//! - Passwords are stored as bcrypt hashes.
//! - Login issues an opaque 32-byte hex token. Only `sha256(token)` is kept,
//!   on an `auth` session row.
//! - Bearer resolution accepts those opaque tokens and, when a secret is
//!   configured, HS256 JWTs whose `sub` is the user id.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::{random_hex, sha256_hex};
use crate::error::{CoreError, Result};
use crate::events::{EventRecorder, RuntimeEvent, types};
use crate::model::{Caller, RequestMeta, session_type};
use crate::persistence::{AppUserRecord, Persistence, SessionRecord};

/// Lifetime of an auth session.
pub const AUTH_SESSION_TTL: Duration = Duration::days(7);
/// Opaque token entropy in bytes.
pub const TOKEN_BYTES: usize = 32;
/// Shortest accepted password.
pub const MIN_PASSWORD_LEN: usize = 8;

/// App-user states.
pub mod user_status {
    /// May log in.
    pub const ACTIVE: &str = "active";
    /// Refused at login.
    pub const BLOCKED: &str = "blocked";
}

/// Registration form.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAppUser {
    /// Email, normalized before storage.
    pub email: String,
    /// Clear password.
    pub password: String,
    /// Optional display name.
    pub display_name: Option<String>,
}

/// Login form.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    /// Email as typed.
    pub email: String,
    /// Clear password.
    pub password: String,
}

/// Successful login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    /// Opaque bearer token, returned once.
    pub token: String,
    /// The auth session.
    pub session_id: Uuid,
    /// Session expiry.
    pub expires_at: DateTime<Utc>,
    /// The user.
    pub user: AppUserRecord,
}

/// HS256 claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// User id.
    pub sub: String,
    /// Workspace the token is scoped to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws: Option<Uuid>,
    /// Expiry, unix seconds.
    pub exp: i64,
    /// Issued at, unix seconds.
    pub iat: i64,
}

/// Trims and lowercases; rejects anything without a local part and a dotted domain.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid || email.chars().any(char::is_whitespace) {
        return Err(CoreError::validation("email", "invalid email address"));
    }
    Ok(email)
}

/// Registers app users, manages their sessions and resolves bearer tokens.
pub struct AuthService {
    persistence: Arc<dyn Persistence>,
    events: Arc<EventRecorder>,
    jwt_secret: Option<String>,
    bcrypt_cost: u32,
}

impl AuthService {
    /// Creates the service. JWT bearer auth is disabled without a secret.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        events: Arc<EventRecorder>,
        jwt_secret: Option<String>,
    ) -> Self {
        Self {
            persistence,
            events,
            jwt_secret: jwt_secret.filter(|s| !s.is_empty()),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Overrides the bcrypt cost.
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Creates an app user in a live workspace.
    pub async fn register(&self, workspace_id: Uuid, form: RegisterAppUser) -> Result<AppUserRecord> {
        self.persistence
            .get_workspace(workspace_id)
            .await?
            .filter(|w| w.deleted_at.is_none())
            .ok_or(CoreError::WorkspaceNotFound)?;
        let email = normalize_email(&form.email)?;
        if form.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CoreError::validation(
                "password",
                format!("must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }
        if self
            .persistence
            .get_app_user_by_email(workspace_id, &email)
            .await?
            .is_some()
        {
            return Err(CoreError::Conflict("email already registered".into()));
        }

        let password_hash = hash_password(form.password, self.bcrypt_cost).await?;
        let user = AppUserRecord {
            id: Uuid::new_v4(),
            workspace_id,
            email,
            password_hash,
            display_name: form
                .display_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            role: "member".into(),
            status: user_status::ACTIVE.into(),
            last_login_at: None,
            created_at: Utc::now(),
        };
        self.persistence.create_app_user(&user).await?;
        let _ = self
            .events
            .record(
                RuntimeEvent::new(types::APP_USER_REGISTERED)
                    .workspace(workspace_id)
                    .user(Some(user.id))
                    .meta("email", user.email.clone()),
            )
            .await;
        info!(workspace_id = %workspace_id, user_id = %user.id, "App user registered");
        Ok(user)
    }

    /// Verifies the password and opens an auth session.
    ///
    /// Unknown emails and wrong passwords fail the same way and record a
    /// `security_auth_failed` event.
    pub async fn login(
        &self,
        workspace_id: Uuid,
        form: LoginRequest,
        meta: &RequestMeta,
    ) -> Result<LoginResult> {
        let email = normalize_email(&form.email).unwrap_or_default();
        let user = self
            .persistence
            .get_app_user_by_email(workspace_id, &email)
            .await?;
        let verified = match &user {
            Some(u) => verify_password(form.password, u.password_hash.clone()).await?,
            None => false,
        };
        let Some(mut user) = user.filter(|_| verified) else {
            let _ = self
                .events
                .record_security_event(
                    types::SECURITY_AUTH_FAILED,
                    Some(workspace_id),
                    meta,
                    "invalid credentials",
                )
                .await;
            return Err(CoreError::Unauthorized);
        };
        if user.status != user_status::ACTIVE {
            return Err(CoreError::Forbidden("app user is blocked".into()));
        }

        let now = Utc::now();
        let token = random_hex(TOKEN_BYTES);
        let session = SessionRecord {
            id: Uuid::new_v4(),
            workspace_id,
            session_type: session_type::AUTH.into(),
            user_id: Some(user.id),
            ip_hash: meta.ip_hash(),
            user_agent_hash: meta.user_agent_hash(),
            token_hash: Some(sha256_hex(&token)),
            expired_at: now + AUTH_SESSION_TTL,
            blocked_at: None,
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.create_session(&session).await?;
        user.last_login_at = Some(now);
        self.persistence.update_app_user(&user).await?;
        let _ = self
            .events
            .record(
                RuntimeEvent::new(types::APP_USER_LOGIN)
                    .workspace(workspace_id)
                    .user(Some(user.id))
                    .session(Some(session.id))
                    .request(meta),
            )
            .await;
        Ok(LoginResult {
            token,
            session_id: session.id,
            expires_at: session.expired_at,
            user,
        })
    }

    /// Ends the session behind an opaque token. Unknown tokens are rejected.
    pub async fn logout(&self, token: &str) -> Result<()> {
        let mut session = self.live_session(token).await?;
        let now = Utc::now();
        session.expired_at = now;
        session.updated_at = now;
        self.persistence.update_session(&session).await?;
        let _ = self
            .events
            .record(
                RuntimeEvent::new(types::APP_USER_LOGOUT)
                    .workspace(session.workspace_id)
                    .user(session.user_id)
                    .session(Some(session.id)),
            )
            .await;
        Ok(())
    }

    /// Resolves an `Authorization` header value. A missing or blank header is
    /// an anonymous caller; anything present must resolve or the call fails
    /// with `InvalidToken`.
    pub async fn resolve_bearer(&self, workspace_id: Uuid, header: Option<&str>) -> Result<Caller> {
        let Some(raw) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(Caller::anonymous());
        };
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CoreError::InvalidToken)?;

        if token.matches('.').count() == 2 {
            let claims = self.decode_jwt(token)?;
            if claims.ws.is_some_and(|ws| ws != workspace_id) {
                return Err(CoreError::InvalidToken);
            }
            let user_id = Uuid::parse_str(&claims.sub).map_err(|_| CoreError::InvalidToken)?;
            return Ok(Caller::user(user_id));
        }

        let session = self.live_session(token).await?;
        if session.workspace_id != workspace_id {
            return Err(CoreError::InvalidToken);
        }
        session
            .user_id
            .map(Caller::user)
            .ok_or(CoreError::InvalidToken)
    }

    /// Signs an HS256 token for `user_id`.
    pub fn issue_jwt(&self, user_id: Uuid, workspace_id: Option<Uuid>, ttl: Duration) -> Result<String> {
        let secret = self
            .jwt_secret
            .as_deref()
            .ok_or_else(|| CoreError::Internal("JWT secret not configured".into()))?;
        let now = Utc::now();
        let claims = JwtClaims {
            sub: user_id.to_string(),
            ws: workspace_id,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| CoreError::Crypto(format!("sign jwt: {e}")))
    }

    fn decode_jwt(&self, token: &str) -> Result<JwtClaims> {
        let secret = self.jwt_secret.as_deref().ok_or(CoreError::InvalidToken)?;
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<JwtClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| {
            debug!(error = %e, "JWT rejected");
            CoreError::InvalidToken
        })
    }

    async fn live_session(&self, token: &str) -> Result<SessionRecord> {
        let session = self
            .persistence
            .get_session_by_token_hash(&sha256_hex(token))
            .await?
            .ok_or(CoreError::InvalidToken)?;
        if session.session_type != session_type::AUTH
            || session.blocked_at.is_some()
            || session.expired_at <= Utc::now()
        {
            return Err(CoreError::InvalidToken);
        }
        Ok(session)
    }
}

async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| CoreError::Internal(format!("hash task: {e}")))?
        .map_err(|e| CoreError::Crypto(format!("hash password: {e}")))
}

async fn verify_password(password: String, hash: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| CoreError::Internal(format!("verify task: {e}")))?
        .or(Ok(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{EventQuery, MemoryPersistence, WorkspaceRecord};
    use crate::runtime::test_support::{published_workspace, request_from};

    async fn setup(jwt: Option<&str>) -> (AuthService, Arc<MemoryPersistence>, WorkspaceRecord) {
        let store = Arc::new(MemoryPersistence::new());
        let ws = published_workspace("shop");
        store.create_workspace(&ws).await.unwrap();
        let persistence: Arc<dyn Persistence> = store.clone();
        let events = Arc::new(EventRecorder::new(Arc::clone(&persistence), false));
        let service = AuthService::new(persistence, events, jwt.map(str::to_string))
            .with_bcrypt_cost(4);
        (service, store, ws)
    }

    fn form(email: &str) -> RegisterAppUser {
        RegisterAppUser {
            email: email.into(),
            password: "correct horse".into(),
            display_name: Some(" Ada ".into()),
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ada@Example.COM ").unwrap(), "ada@example.com");
        for bad in ["", "ada", "@example.com", "ada@example", "ada@.com", "a b@example.com"] {
            assert!(normalize_email(bad).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_register_hashes_and_rejects_duplicates() {
        let (service, _store, ws) = setup(None).await;
        let user = service.register(ws.id, form("Ada@Example.com")).await.unwrap();
        assert_eq!(user.email, "ada@example.com");
        assert_eq!(user.display_name.as_deref(), Some("Ada"));
        assert!(user.password_hash.starts_with("$2"));
        assert!(bcrypt::verify("correct horse", &user.password_hash).unwrap());

        let dup = service.register(ws.id, form("ada@example.com ")).await;
        assert!(matches!(dup, Err(CoreError::Conflict(_))));

        let short = service
            .register(
                ws.id,
                RegisterAppUser {
                    password: "short".into(),
                    ..form("b@example.com")
                },
            )
            .await;
        assert!(matches!(short, Err(CoreError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_login_resolve_logout() {
        let (service, store, ws) = setup(None).await;
        let user = service.register(ws.id, form("ada@example.com")).await.unwrap();
        let meta = request_from("1.2.3.4");
        let login = service
            .login(
                ws.id,
                LoginRequest {
                    email: "ADA@example.com".into(),
                    password: "correct horse".into(),
                },
                &meta,
            )
            .await
            .unwrap();
        assert_eq!(login.token.len(), 64);

        let session = store.get_session(login.session_id).await.unwrap().unwrap();
        assert_eq!(session.session_type, "auth");
        assert_eq!(session.token_hash, Some(sha256_hex(&login.token)));
        assert_ne!(session.token_hash.as_deref(), Some(login.token.as_str()));

        let header = format!("Bearer {}", login.token);
        let caller = service.resolve_bearer(ws.id, Some(&header)).await.unwrap();
        assert_eq!(caller, Caller::user(user.id));
        assert_eq!(
            service.resolve_bearer(Uuid::new_v4(), Some(&header)).await,
            Err(CoreError::InvalidToken)
        );

        service.logout(&login.token).await.unwrap();
        assert_eq!(
            service.resolve_bearer(ws.id, Some(&header)).await,
            Err(CoreError::InvalidToken)
        );
        assert_eq!(
            service.resolve_bearer(ws.id, None).await.unwrap(),
            Caller::anonymous()
        );
    }

    #[tokio::test]
    async fn test_bad_password_records_security_event() {
        let (service, store, ws) = setup(None).await;
        service.register(ws.id, form("ada@example.com")).await.unwrap();
        let err = service
            .login(
                ws.id,
                LoginRequest {
                    email: "ada@example.com".into(),
                    password: "wrong password".into(),
                },
                &request_from("5.6.7.8"),
            )
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::Unauthorized);
        let events = store
            .list_events(&EventQuery {
                event_types: vec![types::SECURITY_AUTH_FAILED.into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_jwt_bearer() {
        let (service, _store, ws) = setup(Some("jwt-secret")).await;
        let user_id = Uuid::new_v4();
        let token = service
            .issue_jwt(user_id, Some(ws.id), Duration::minutes(5))
            .unwrap();
        let header = format!("Bearer {token}");
        assert_eq!(
            service.resolve_bearer(ws.id, Some(&header)).await.unwrap(),
            Caller::user(user_id)
        );
        assert_eq!(
            service.resolve_bearer(Uuid::new_v4(), Some(&header)).await,
            Err(CoreError::InvalidToken)
        );

        let (other, _, _) = setup(Some("different")).await;
        assert_eq!(
            other.resolve_bearer(ws.id, Some(&header)).await,
            Err(CoreError::InvalidToken)
        );
        let (disabled, _, _) = setup(None).await;
        assert!(disabled.issue_jwt(user_id, None, Duration::minutes(5)).is_err());
        assert_eq!(
            disabled.resolve_bearer(ws.id, Some("Basic abc")).await,
            Err(CoreError::InvalidToken)
        );
    }
}
