use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use quasar_common::{Diagnosis, RequestId};
use quasar_engine::LifecycleError;
use quasar_router::limiter::retry_after_secs;
use quasar_router::{LimitRejection, RouteError};
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    UpstreamError(String),
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("too many concurrent streams (limit {limit})")]
    ConcurrencyLimitExceeded { limit: u32 },
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("{0}")]
    PathValidation(String),
    #[error("{message}")]
    ContainerStartFailure {
        message: String,
        diagnosis: Option<Diagnosis>,
    },
    #[error("{message}")]
    ReadinessTimeout {
        message: String,
        diagnosis: Option<Diagnosis>,
    },
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::RateLimited { .. } | GatewayError::ConcurrencyLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::PathValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::ContainerStartFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind, carried next to the numeric code.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::UpstreamError(_) => "upstream_error",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::ConcurrencyLimitExceeded { .. } => "concurrency_limit_exceeded",
            GatewayError::BodyTooLarge { .. } => "body_too_large",
            GatewayError::PathValidation(_) => "path_validation_error",
            GatewayError::ContainerStartFailure { .. } => "container_start_failure",
            GatewayError::ReadinessTimeout { .. } => "readiness_timeout",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Internal(_) => "internal",
        }
    }

    fn diagnosis(&self) -> Option<&Diagnosis> {
        match self {
            GatewayError::ContainerStartFailure { diagnosis, .. }
            | GatewayError::ReadinessTimeout { diagnosis, .. } => diagnosis.as_ref(),
            _ => None,
        }
    }

    /// The standard `{"error": {...}, "request_id": ...}` body.
    pub fn envelope(&self, request_id: &str) -> Value {
        let mut error = json!({
            "code": self.status().as_u16(),
            "message": self.to_string(),
            "type": self.kind(),
        });
        if let Some(d) = self.diagnosis() {
            error["diagnosis"] = json!(d);
        }
        json!({ "error": error, "request_id": request_id })
    }

    pub fn with(self, request_id: &RequestId) -> ApiError {
        ApiError {
            error: self,
            request_id: request_id.0.clone(),
        }
    }
}

impl From<LimitRejection> for GatewayError {
    fn from(r: LimitRejection) -> Self {
        match r {
            LimitRejection::RateLimited { retry_after } => GatewayError::RateLimited {
                retry_after_secs: retry_after_secs(retry_after),
            },
            LimitRejection::ConcurrencyLimitExceeded { limit } => {
                GatewayError::ConcurrencyLimitExceeded { limit }
            }
        }
    }
}

impl From<RouteError> for GatewayError {
    fn from(e: RouteError) -> Self {
        GatewayError::UpstreamUnavailable(e.to_string())
    }
}

impl From<LifecycleError> for GatewayError {
    fn from(e: LifecycleError) -> Self {
        let text = e.to_string();
        match e {
            LifecycleError::NotFound(_) => GatewayError::NotFound(text),
            LifecycleError::Validation(_) => GatewayError::PathValidation(text),
            LifecycleError::Busy { .. } | LifecycleError::NotStopped { .. } | LifecycleError::Cancelled { .. } => {
                GatewayError::Conflict(text)
            }
            LifecycleError::ContainerStart { diagnosis, .. } => GatewayError::ContainerStartFailure {
                message: text,
                diagnosis,
            },
            LifecycleError::ReadinessTimeout { diagnosis, .. } => GatewayError::ReadinessTimeout {
                message: text,
                diagnosis,
            },
            LifecycleError::Internal(err) => GatewayError::Internal(format!("{err:#}")),
        }
    }
}

/// A [`GatewayError`] bound to the request it failed.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if status.is_server_error() {
            tracing::warn!(request_id=%self.request_id, kind = self.error.kind(), error=%self.error, "request failed");
        } else {
            tracing::debug!(request_id=%self.request_id, kind = self.error.kind(), error=%self.error, "request rejected");
        }
        let mut resp = (status, Json(self.error.envelope(&self.request_id))).into_response();
        if let GatewayError::RateLimited { retry_after_secs } = self.error {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasar_common::{DiagnosisKind, PoolKind};
    use std::time::Duration;

    #[test]
    fn envelope_shape() {
        let e = GatewayError::BadRequest("`model` is required".into());
        let v = e.envelope("req_1");
        assert_eq!(v["error"]["code"], 400);
        assert_eq!(v["error"]["message"], "`model` is required");
        assert_eq!(v["request_id"], "req_1");
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let e: GatewayError = LimitRejection::RateLimited {
            retry_after: Duration::from_millis(1200),
        }
        .into();
        let resp = e.with(&RequestId("req_2".into())).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn lifecycle_errors_map_to_statuses() {
        let busy: GatewayError = LifecycleError::Busy {
            id: "m".into(),
            state: quasar_common::LifecycleState::Loading,
        }
        .into();
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let start: GatewayError = LifecycleError::ContainerStart {
            id: "m".into(),
            message: "boom".into(),
            diagnosis: Some(Diagnosis {
                kind: DiagnosisKind::OutOfMemory,
                title: "GPU out of memory".into(),
                message: "oom".into(),
                suggested_fixes: vec![],
            }),
        }
        .into();
        let v = start.envelope("req_3");
        assert_eq!(v["error"]["type"], "container_start_failure");
        assert_eq!(v["error"]["diagnosis"]["kind"], "out_of_memory");

        let route: GatewayError = RouteError::NoViableEndpoint {
            pool: PoolKind::Embed,
            members: 0,
        }
        .into();
        assert_eq!(route.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
