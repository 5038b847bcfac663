use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::context::RequestId;

// ── Role ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        matches!(
            (self, required),
            (Role::Admin, _)
                | (Role::Operator, Role::Viewer | Role::Operator)
                | (Role::Viewer, Role::Viewer)
        )
    }
}

// ── AuthContext ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Loggable label for the caller; never the raw token.
    pub principal: String,
    /// Stable per-caller key for rate and concurrency accounting.
    pub key: String,
    pub role: Role,
}

fn principal_label(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("key:{prefix}***")
}

// ── AuthConfig ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Arc<HashMap<String, Role>>,
}

// ── Parsing ─────────────────────────────────────────────────────────

pub fn parse_auth_from_env() -> AuthConfig {
    let raw = std::env::var("QUASAR_AUTH_TOKENS").ok();
    let config = parse_auth_tokens(raw.as_deref());
    if !config.enabled {
        tracing::warn!("auth disabled: QUASAR_AUTH_TOKENS not set");
    }
    config
}

/// Parses `token:role,token:role`. `None` disables auth.
pub fn parse_auth_tokens(raw: Option<&str>) -> AuthConfig {
    let Some(raw) = raw else {
        return AuthConfig {
            enabled: false,
            tokens: Arc::new(HashMap::new()),
        };
    };

    let mut tokens = HashMap::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((token, role_raw)) = trimmed.split_once(':') else {
            tracing::warn!("invalid QUASAR_AUTH_TOKENS entry, expected token:role");
            continue;
        };
        let role = match role_raw.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "operator" => Role::Operator,
            "viewer" => Role::Viewer,
            other => {
                tracing::warn!(role=%other, "unknown role in QUASAR_AUTH_TOKENS, skipping");
                continue;
            }
        };
        tokens.insert(token.to_string(), role);
    }

    AuthConfig {
        enabled: true,
        tokens: Arc::new(tokens),
    }
}

// ── Middleware ───────────────────────────────────────────────────────
// Generic over any state type S that implements AsRef<AuthConfig>.
// Usage: `middleware::from_fn_with_state(app_state, auth_middleware::<MyAppState>)`

pub async fn auth_middleware<S>(
    State(state): State<S>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<AuthConfig> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();
    let request_id = req.extensions().get::<RequestId>().map(|r| r.0.clone());

    if !auth.enabled {
        req.extensions_mut().insert(AuthContext {
            principal: "guest".into(),
            key: "guest".into(),
            role: Role::Admin,
        });
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_token(&req) else {
        return Ok(unauthorized("missing bearer token", request_id.as_deref()));
    };

    let Some(role) = auth.tokens.get(&token).copied() else {
        return Ok(unauthorized("invalid token", request_id.as_deref()));
    };

    req.extensions_mut().insert(AuthContext {
        principal: principal_label(&token),
        key: token,
        role,
    });

    Ok(next.run(req).await)
}

pub fn extract_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

// ── Role check ──────────────────────────────────────────────────────
// Returns None when the caller has sufficient permissions, or
// Some(403 response) when forbidden.

pub fn require_role(ctx: &AuthContext, required: Role, request_id: Option<&str>) -> Option<Response> {
    if ctx.role.allows(required) {
        None
    } else {
        Some(forbidden("insufficient permissions", request_id))
    }
}

// ── Error helpers ───────────────────────────────────────────────────

fn envelope(status: StatusCode, msg: &str, request_id: Option<&str>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {"code": status.as_u16(), "message": msg},
            "request_id": request_id.unwrap_or_default(),
        })),
    )
        .into_response()
}

pub fn unauthorized(msg: &str, request_id: Option<&str>) -> Response {
    envelope(StatusCode::UNAUTHORIZED, msg, request_id)
}

pub fn forbidden(msg: &str, request_id: Option<&str>) -> Response {
    envelope(StatusCode::FORBIDDEN, msg, request_id)
}
