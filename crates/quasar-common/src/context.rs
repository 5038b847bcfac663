use serde::{Deserialize, Serialize};

/// Per-request data threaded explicitly through limiter, router and proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestContext {
    pub request_id: String,
    /// Authenticated principal, `guest` when auth is disabled.
    pub principal: String,
    /// Key used for rate and concurrency accounting (API token or client IP).
    pub client_key: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, principal: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            principal: principal.into(),
            client_key: client_key.into(),
        }
    }
}

/// Correlation id stored in request extensions by the gateway's request-id layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }
}
