//! OpenAI-compatible inference forwarding.
//!
//! One request: read the body under the size limit, admit it through the
//! limiter, pick an endpoint, and forward. A failed attempt (transport error
//! or 5xx) is retried once on a different endpoint. Successful responses are
//! relayed either buffered or as a re-framed SSE stream, and every upstream
//! outcome ends in a breaker update and a usage record.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use bytes::Bytes;
use futures_util::StreamExt;
use quasar_common::auth::AuthContext;
use quasar_common::usage::estimate_tokens;
use quasar_common::{
    now_ms, Endpoint, LifecycleState, PoolKind, RequestContext, RequestId, RequestOutcome, Usage, UsageRecord,
    UsageSource,
};
use quasar_registry::UsageSink;
use quasar_router::{Selection, StreamPermit};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ProxyConfig;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::request_id::REQUEST_ID_HEADER;
use crate::sse::{self, SseFramer, DONE_MARKER};
use crate::state::AppState;

pub const USAGE_SOURCE_HEADER: &str = "x-quasar-usage-source";

#[derive(Debug, Clone, Copy)]
struct Operation {
    pool: PoolKind,
    path: &'static str,
    streamable: bool,
}

const CHAT: Operation = Operation {
    pool: PoolKind::Generate,
    path: "/v1/chat/completions",
    streamable: true,
};

const COMPLETIONS: Operation = Operation {
    pool: PoolKind::Generate,
    path: "/v1/completions",
    streamable: true,
};

const EMBEDDINGS: Operation = Operation {
    pool: PoolKind::Embed,
    path: "/v1/embeddings",
    streamable: false,
};

pub async fn chat_completions(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    body: Body,
) -> Response {
    handle(st, rid, auth, CHAT, body).await
}

pub async fn completions(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    body: Body,
) -> Response {
    handle(st, rid, auth, COMPLETIONS, body).await
}

pub async fn embeddings(
    State(st): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Extension(auth): Extension<AuthContext>,
    body: Body,
) -> Response {
    handle(st, rid, auth, EMBEDDINGS, body).await
}

async fn handle(st: AppState, rid: RequestId, auth: AuthContext, op: Operation, body: Body) -> Response {
    let ctx = RequestContext::new(rid.0.clone(), auth.principal, auth.key);
    match forward(&st, &ctx, op, body).await {
        Ok(resp) => resp,
        Err(e) => e.with(&rid).into_response(),
    }
}

fn classify_reqwest_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        return "timeout";
    }
    if error.is_connect() {
        return "connect";
    }
    "other"
}

fn copy_response_headers(src: &HeaderMap, dst: &mut Response) {
    for (k, v) in src.iter() {
        if matches!(
            k.as_str(),
            "transfer-encoding"
                | "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailer"
                | "upgrade"
                | "content-length"
        ) {
            continue;
        }
        dst.headers_mut().insert(k.clone(), v.clone());
    }
}

/// Where a request should go once its `model` is matched against the registry.
#[derive(Debug, Default)]
struct Target {
    /// Endpoint id of the running managed engine serving this model.
    prefer: Option<String>,
    /// Name to put in the forwarded body when it differs from the client's.
    rewrite: Option<String>,
}

async fn resolve_target(st: &AppState, model: &str, pool: PoolKind) -> Target {
    let config = match st.registry.get(model).await {
        Ok(Some(c)) => Some(c),
        Ok(None) => match st.registry.list().await {
            Ok(all) => all.into_iter().find(|c| c.served_name == model),
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "model registry unavailable");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "model registry unavailable");
            None
        }
    };
    let Some(config) = config.filter(|c| c.pool == pool) else {
        return Target::default();
    };

    let running = st.orchestrator.state(&config.id).state == LifecycleState::Running;
    Target {
        prefer: running.then(|| Endpoint::managed_id(&config.id)),
        rewrite: (config.served_name != model).then(|| config.served_name.clone()),
    }
}

fn text_len(v: &Value) -> usize {
    match v {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(text_len).sum(),
        Value::Object(obj) => obj.get("text").map(text_len).unwrap_or(0),
        _ => 0,
    }
}

/// Characters of prompt text: chat `messages[].content`, `prompt` or embedding `input`.
fn input_chars(payload: &Value) -> usize {
    let messages = payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|m| m.iter().filter_map(|msg| msg.get("content")).map(text_len).sum())
        .unwrap_or(0);
    let prompt = payload.get("prompt").map(text_len).unwrap_or(0);
    let input = payload.get("input").map(text_len).unwrap_or(0);
    messages + prompt + input
}

fn choices(v: &Value) -> impl Iterator<Item = &Value> {
    v.get("choices").and_then(Value::as_array).into_iter().flatten()
}

/// Characters of generated text in a complete (non-streaming) response.
fn output_chars(body: &Value) -> usize {
    choices(body)
        .map(|c| {
            c.get("message").and_then(|m| m.get("content")).map(text_len).unwrap_or(0)
                + c.get("text").map(text_len).unwrap_or(0)
        })
        .sum()
}

/// Characters of generated text in one streamed chunk.
fn delta_chars(chunk: &Value) -> usize {
    choices(chunk)
        .map(|c| {
            c.get("delta").and_then(|d| d.get("content")).map(text_len).unwrap_or(0)
                + c.get("text").map(text_len).unwrap_or(0)
        })
        .sum()
}

async fn forward(st: &AppState, ctx: &RequestContext, op: Operation, body: Body) -> Result<Response, GatewayError> {
    let limit = st.proxy.max_body_bytes;
    let raw = axum::body::to_bytes(body, limit).await.map_err(|_| {
        st.metrics.body_too_large_total.fetch_add(1, Ordering::Relaxed);
        GatewayError::BodyTooLarge { limit }
    })?;

    let mut payload: Value =
        serde_json::from_slice(&raw).map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {e}")))?;
    if !payload.is_object() {
        return Err(GatewayError::BadRequest("request body must be a JSON object".into()));
    }
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("`model` is required".into()))?
        .to_string();
    let stream = op.streamable && payload.get("stream").and_then(Value::as_bool).unwrap_or(false);

    st.limiter.check_rate(&ctx.client_key)?;
    let permit = if stream {
        st.limiter.acquire_stream(&ctx.client_key)?
    } else {
        None
    };

    let target = resolve_target(st, &model, op.pool).await;
    let outbound = match &target.rewrite {
        Some(served) => {
            payload["model"] = Value::String(served.clone());
            Bytes::from(
                serde_json::to_vec(&payload).map_err(|e| GatewayError::Internal(format!("re-encode body: {e}")))?,
            )
        }
        None => raw,
    };

    let ledger = Ledger {
        request_id: ctx.request_id.clone(),
        principal: ctx.principal.clone(),
        model,
        pool: op.pool,
        stream,
        started: Instant::now(),
        sink: st.usage.clone(),
        metrics: st.metrics.clone(),
    };
    let prompt_chars = input_chars(&payload);

    let (selection, resp, dispatched) = match dispatch(st, ctx, op, &outbound, stream, target.prefer.as_deref()).await {
        Ok(v) => v,
        Err(e) => {
            ledger.record(None, e.status().as_u16(), RequestOutcome::Failed, None, None, 0);
            return Err(e);
        }
    };

    if stream && resp.status().is_success() {
        let relay = StreamRelay {
            router: st.router.clone(),
            proxy: st.proxy.clone(),
            ledger,
            selection,
            permit,
            dispatched,
            prompt_chars,
        };
        return Ok(relay.start(resp));
    }
    relay_buffered(st, ledger, selection, resp, prompt_chars).await
}

/// Sends the request, retrying once on a different endpoint after a transport
/// error or 5xx. 4xx answers are the client's problem and are returned as is.
async fn dispatch(
    st: &AppState,
    ctx: &RequestContext,
    op: Operation,
    body: &Bytes,
    stream: bool,
    prefer: Option<&str>,
) -> Result<(Selection, reqwest::Response, Instant), GatewayError> {
    let mut excluded: HashSet<String> = HashSet::new();
    let mut last_failure: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let selection = match st.router.select(op.pool, prefer, &excluded) {
            Ok(s) => s,
            Err(e) => {
                return Err(match last_failure {
                    Some(msg) => GatewayError::UpstreamError(msg),
                    None => e.into(),
                })
            }
        };
        let endpoint = Arc::clone(&selection.endpoint);

        let mut req = st
            .http
            .post(endpoint.url(op.path))
            .header(header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, ctx.request_id.as_str())
            .body(body.clone());
        if let Some(token) = endpoint.auth_token.as_deref() {
            req = req.bearer_auth(token);
        }
        if stream {
            req = req.header(header::ACCEPT, "text/event-stream");
        }

        tracing::debug!(endpoint = %endpoint.id, attempt, trial = selection.is_trial(), "forwarding request");
        let dispatched = Instant::now();
        let failure = match req.send().await {
            Ok(resp) if !resp.status().is_server_error() => {
                if attempt > 1 {
                    st.metrics.retry_success_total.fetch_add(1, Ordering::Relaxed);
                }
                return Ok((selection, resp, dispatched));
            }
            Ok(resp) => {
                st.metrics.record_upstream_error("status_5xx");
                format!("upstream {} returned {}", endpoint.id, resp.status())
            }
            Err(e) => {
                let kind = classify_reqwest_error(&e);
                st.metrics.record_upstream_error(kind);
                format!("upstream {} {kind} error: {e}", endpoint.id)
            }
        };

        st.router.record_outcome(selection, false);
        tracing::warn!(endpoint = %endpoint.id, attempt, error = %failure, "upstream attempt failed");
        if attempt >= st.proxy.max_attempts {
            return Err(GatewayError::UpstreamError(failure));
        }
        excluded.insert(endpoint.id.clone());
        last_failure = Some(failure);
        st.metrics.retry_total.fetch_add(1, Ordering::Relaxed);
        if !st.proxy.retry_backoff.is_zero() {
            tokio::time::sleep(st.proxy.retry_backoff).await;
        }
    }
}

async fn relay_buffered(
    st: &AppState,
    ledger: Ledger,
    selection: Selection,
    resp: reqwest::Response,
    prompt_chars: usize,
) -> Result<Response, GatewayError> {
    let status = resp.status();
    let headers = resp.headers().clone();
    let endpoint_id = selection.endpoint_id().to_string();

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            st.metrics.record_upstream_error(classify_reqwest_error(&e));
            st.router.record_outcome(selection, false);
            let err = GatewayError::UpstreamError(format!("reading response from {endpoint_id}: {e}"));
            ledger.record(Some(endpoint_id), err.status().as_u16(), RequestOutcome::Failed, None, None, 0);
            return Err(err);
        }
    };
    st.router.record_outcome(selection, true);

    let usage = if status.is_success() {
        buffered_usage(&body, prompt_chars, ledger.pool, &st.proxy)
    } else {
        None
    };
    let outcome = if status.is_success() {
        RequestOutcome::Completed
    } else {
        RequestOutcome::Failed
    };
    ledger.record(Some(endpoint_id), status.as_u16(), outcome, usage, None, 0);

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    copy_response_headers(&headers, &mut out);
    let source = usage.map(|(_, s)| s.as_str()).unwrap_or("none");
    out.headers_mut()
        .insert(USAGE_SOURCE_HEADER, HeaderValue::from_static(source));
    Ok(out)
}

/// Reported usage when the upstream sent it, otherwise the chars-per-token estimate.
fn buffered_usage(body: &[u8], prompt_chars: usize, pool: PoolKind, cfg: &ProxyConfig) -> Option<(Usage, UsageSource)> {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    if let Some(u) = parsed.as_ref().and_then(Usage::from_json) {
        return Some((u, UsageSource::Reported));
    }
    if !cfg.token_estimation {
        return None;
    }
    let prompt = estimate_tokens(prompt_chars, cfg.chars_per_token);
    let completion = match pool {
        PoolKind::Embed => 0,
        PoolKind::Generate => estimate_tokens(parsed.as_ref().map(output_chars).unwrap_or(0), cfg.chars_per_token),
    };
    Some((Usage::new(prompt, completion), UsageSource::Estimated))
}

/// Fields every usage record of one request shares.
struct Ledger {
    request_id: String,
    principal: String,
    model: String,
    pool: PoolKind,
    stream: bool,
    started: Instant,
    sink: Arc<dyn UsageSink>,
    metrics: Arc<Metrics>,
}

impl Ledger {
    fn record(
        &self,
        endpoint_id: Option<String>,
        status: u16,
        outcome: RequestOutcome,
        usage: Option<(Usage, UsageSource)>,
        ttft: Option<Duration>,
        chunks: u64,
    ) {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        let ttft_ms = ttft.map(|d| d.as_millis() as u64);
        self.metrics.record_timing(ttft_ms, latency_ms);
        self.metrics.record_usage_source(usage.map(|(_, s)| s));
        if self.stream {
            self.metrics.record_stream(outcome);
        }
        self.sink.record(UsageRecord {
            request_id: self.request_id.clone(),
            principal: self.principal.clone(),
            model: self.model.clone(),
            pool: self.pool,
            endpoint_id,
            stream: self.stream,
            status,
            outcome,
            usage: usage.map(|(u, _)| u),
            usage_source: usage.map(|(_, s)| s),
            ttft_ms,
            latency_ms,
            chunks,
            completed_at_ms: now_ms(),
        });
    }
}

/// Running totals over the events of one relayed stream.
#[derive(Debug, Default)]
struct StreamTally {
    ttft: Option<Duration>,
    /// Events that carried generated text.
    chunks: u64,
    reported: Option<Usage>,
    done: bool,
}

impl StreamTally {
    fn observe(&mut self, event: &[u8], dispatched: Instant) {
        for data in sse::data_lines(event) {
            if data == DONE_MARKER {
                self.done = true;
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(u) = Usage::from_json(&chunk) {
                self.reported = Some(u);
            }
            if delta_chars(&chunk) > 0 {
                self.chunks += 1;
                self.ttft.get_or_insert_with(|| dispatched.elapsed());
            }
        }
    }
}

enum StreamEnd {
    Completed,
    Failed(String),
    Cancelled,
}

struct StreamRelay {
    router: Arc<quasar_router::Router>,
    proxy: Arc<ProxyConfig>,
    ledger: Ledger,
    selection: Selection,
    permit: Option<StreamPermit>,
    dispatched: Instant,
    prompt_chars: usize,
}

impl StreamRelay {
    /// Spawns the relay task and returns the client-facing streaming response.
    /// The task owns the breaker selection and the stream permit, so both are
    /// released when the stream ends, however it ends.
    fn start(self, resp: reqwest::Response) -> Response {
        let status = resp.status();
        let headers = resp.headers().clone();
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

        tokio::spawn(self.run(resp, tx));

        let mut out = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *out.status_mut() = status;
        copy_response_headers(&headers, &mut out);
        out.headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        out.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        out
    }

    async fn run(self, resp: reqwest::Response, tx: mpsc::Sender<Result<Bytes, Infallible>>) {
        let StreamRelay {
            router,
            proxy,
            ledger,
            selection,
            permit,
            dispatched,
            prompt_chars,
        } = self;
        let status = resp.status().as_u16();
        let endpoint_id = selection.endpoint_id().to_string();
        let mut upstream = resp.bytes_stream();
        let mut framer = SseFramer::default();
        let mut tally = StreamTally::default();

        let end = 'relay: loop {
            tokio::select! {
                _ = tx.closed() => break 'relay StreamEnd::Cancelled,
                item = upstream.next() => match item {
                    Some(Ok(chunk)) => {
                        for event in framer.push(&chunk) {
                            tally.observe(&event, dispatched);
                            if tx.send(Ok(event)).await.is_err() {
                                break 'relay StreamEnd::Cancelled;
                            }
                        }
                    }
                    Some(Err(e)) => break 'relay StreamEnd::Failed(format!("upstream stream error: {e}")),
                    None => {
                        if let Some(rest) = framer.finish() {
                            tally.observe(&rest, dispatched);
                            if tx.send(Ok(rest)).await.is_err() {
                                break 'relay StreamEnd::Cancelled;
                            }
                        }
                        if tally.done {
                            break 'relay StreamEnd::Completed;
                        }
                        break 'relay StreamEnd::Failed("upstream closed the stream before [DONE]".to_string());
                    }
                }
            }
        };
        drop(upstream);

        let outcome = match end {
            StreamEnd::Completed => {
                router.record_outcome(selection, true);
                RequestOutcome::Completed
            }
            StreamEnd::Failed(message) => {
                router.record_outcome(selection, false);
                ledger.metrics.record_upstream_error("other");
                tracing::warn!(request_id = %ledger.request_id, endpoint = %endpoint_id, error = %message, "stream failed");
                let err = GatewayError::UpstreamError(message);
                let _ = tx.send(Ok(sse::error_event(&err.envelope(&ledger.request_id)))).await;
                RequestOutcome::Failed
            }
            StreamEnd::Cancelled => {
                // Nobody observed the outcome; the breaker learns nothing.
                drop(selection);
                tracing::debug!(request_id = %ledger.request_id, "client cancelled stream");
                RequestOutcome::Cancelled
            }
        };
        drop(tx);
        drop(permit);

        let usage = match tally.reported {
            Some(u) => Some((u, UsageSource::Reported)),
            None if proxy.token_estimation => Some((
                Usage::new(estimate_tokens(prompt_chars, proxy.chars_per_token), tally.chunks),
                UsageSource::Estimated,
            )),
            None => None,
        };
        ledger.record(Some(endpoint_id), status, outcome, usage, tally.ttft, tally.chunks);
    }
}
