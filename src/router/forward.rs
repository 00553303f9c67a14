//! Request forwarding to registered modules.
//!
//! `resolve -> pick instance -> acquire pool slot -> send -> relay`. Pool
//! exhaustion and connect failures get one retry on a different instance
//! after `retry_backoff`. The slots belong to the module, not the instance,
//! so retrying after exhaustion is a second wait of up to `acquire_timeout`
//! on the same semaphore. Small request bodies are buffered so that retry
//! can resend them; larger ones stream straight through and are never
//! replayed.
//!
//! Buffered requests must see response headers within `response_timeout`.
//! Streamed uploads have no such deadline. Once headers arrive, the body is
//! relayed for as long as the module keeps sending; a pause longer than
//! `body_idle_timeout` ends it with an error.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{Method, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::AppState;
use super::auth::Caller;
use super::upstream;
use crate::registry::{Instance, ModuleEntry, prefix};
use crate::{Error, Result};

/// Fallback handler: everything that is not a router endpoint is proxied
pub async fn forward(State(state): State<Arc<AppState>>, caller: Caller, request: Request) -> Response {
    match proxy(&state, &caller, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

enum Payload {
    Buffered(Bytes),
    Streaming(Option<Body>),
}

impl Payload {
    async fn read(body: Body, limit: usize) -> Result<Self> {
        let small = body
            .size_hint()
            .exact()
            .is_some_and(|len| usize::try_from(len).is_ok_and(|len| len <= limit));
        if small {
            let bytes = axum::body::to_bytes(body, limit)
                .await
                .map_err(|e| Error::BadRequest(format!("failed to read request body: {e}")))?;
            Ok(Self::Buffered(bytes))
        } else {
            Ok(Self::Streaming(Some(body)))
        }
    }

    /// Body for the next attempt; `None` once a stream was handed out
    fn take(&mut self) -> Option<reqwest::Body> {
        match self {
            Self::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            Self::Streaming(body) => body
                .take()
                .map(|b| reqwest::Body::wrap_stream(b.into_data_stream())),
        }
    }
}

/// Why an attempt failed and whether another instance may be tried
enum Failure {
    Retryable(Error),
    Fatal(Error),
}

async fn proxy(state: &AppState, caller: &Caller, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path();
    if prefix::has_dot_segments(path) {
        return Err(Error::BadRequest(format!("path '{path}' contains dot segments")));
    }

    let (entry, rest) = state.registry.route(path).inspect_err(|e| match e {
        Error::ServiceUnavailable(module) => {
            warn!(module = %module, path = %path, "Refusing request for unhealthy module");
        }
        _ => debug!(path = %path, error = %e, "No route"),
    })?;
    let target = match parts.uri.query() {
        Some(q) => format!("{rest}?{q}"),
        None => rest.to_string(),
    };
    let headers = upstream::request_headers(
        &parts.headers,
        &state.identity_header,
        caller.0.as_deref(),
    );
    let settings = state.upstreams.config();
    let mut payload = Payload::read(body, settings.replay_buffer_limit).await?;

    let mut tried: Option<String> = None;
    let mut last_error = None;
    for attempt in 0..2 {
        let Some(instance) = entry.pick(tried.as_deref()) else {
            break;
        };
        if attempt > 0 {
            tokio::time::sleep(settings.retry_backoff).await;
        }
        match send(state, &entry, instance, &parts.method, &target, &headers, &mut payload).await {
            Ok(response) => return Ok(response),
            Err(Failure::Fatal(e)) => {
                warn!(module = %entry.id, instance = %instance.address, error = %e, "Upstream request failed");
                return Err(e);
            }
            Err(Failure::Retryable(e)) => {
                warn!(
                    module = %entry.id,
                    instance = %instance.address,
                    attempt,
                    error = %e,
                    "Upstream attempt failed"
                );
                tried = Some(instance.address.clone());
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::ServiceUnavailable(format!("{}: no usable instance", entry.id))
    }))
}

async fn send(
    state: &AppState,
    entry: &ModuleEntry,
    instance: &Instance,
    method: &Method,
    target: &str,
    headers: &axum::http::HeaderMap,
    payload: &mut Payload,
) -> std::result::Result<Response, Failure> {
    let settings = state.upstreams.config();
    let pool = state.upstreams.pool(entry).map_err(Failure::Fatal)?;
    let Some(permit) = pool.acquire(settings.acquire_timeout).await else {
        return Err(Failure::Retryable(Error::UpstreamUnavailable(format!(
            "{}: connection pool exhausted",
            entry.id
        ))));
    };
    let buffered = matches!(payload, Payload::Buffered(_));
    // A stream handed to an earlier attempt cannot be sent again.
    let Some(body) = payload.take() else {
        return Err(Failure::Fatal(Error::UpstreamUnavailable(format!(
            "{}: request body already consumed",
            entry.id
        ))));
    };

    let url = upstream_url(&instance.address, target).map_err(Failure::Fatal)?;
    let request = pool
        .client
        .request(method.clone(), url.to_string())
        .headers(headers.clone())
        .body(body)
        .send();
    let result = if buffered {
        tokio::time::timeout(settings.response_timeout, request)
            .await
            .map_err(|_| {
                Failure::Fatal(Error::UpstreamUnavailable(format!(
                    "{}: no response from {} within {:?}",
                    entry.id, instance.address, settings.response_timeout
                )))
            })?
    } else {
        request.await
    };

    match result {
        Ok(response) => {
            debug!(
                module = %entry.id,
                instance = %instance.address,
                status = response.status().as_u16(),
                "Upstream responded"
            );
            Ok(relay(response, permit, settings.body_idle_timeout))
        }
        Err(e) if e.is_connect() => Err(Failure::Retryable(Error::UpstreamUnavailable(format!(
            "{}: connect to {} failed: {e}",
            entry.id, instance.address
        )))),
        Err(e) => Err(Failure::Fatal(Error::UpstreamUnavailable(format!(
            "{}: {e}",
            entry.id
        )))),
    }
}

fn upstream_url(address: &str, target: &str) -> Result<Uri> {
    format!("https://{address}{target}")
        .parse()
        .map_err(|e| Error::BadRequest(format!("cannot build upstream URL: {e}")))
}

/// Stream the upstream response back, holding the pool slot until the body
/// is fully relayed, stalls for longer than `idle`, or is dropped.
fn relay(response: reqwest::Response, permit: OwnedSemaphorePermit, idle: Duration) -> Response {
    let status = response.status();
    let headers = upstream::response_headers(response.headers());
    let body = Box::pin(response.bytes_stream());
    let chunks = futures::stream::unfold(Some((body, permit)), move |state| async move {
        let (mut body, permit) = state?;
        match tokio::time::timeout(idle, body.next()).await {
            Ok(Some(chunk)) => Some((chunk.map_err(io::Error::other), Some((body, permit)))),
            Ok(None) => None,
            Err(_) => {
                warn!(
                    idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX),
                    "Upstream body stalled, closing relay"
                );
                Some((
                    Err(io::Error::new(io::ErrorKind::TimedOut, "upstream body stalled")),
                    None,
                ))
            }
        }
    });

    let mut out = Response::new(Body::from_stream(chunks));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
