//! Public side of the tunnel: HTTP proxy handlers and the WebSocket gate.
//!
//! Two routes cover the whole surface:
//!
//! 1. `ANY /{conn_id}/{*rest}` — a public request, forwarded to the session
//!    holding `conn_id`.
//! 2. `GET /{conn_id}` — either a bare public request for the origin root,
//!    or (with `Upgrade: websocket` and a valid bearer token) tunnel
//!    establishment.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, Request, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::auth::TokenValidator;
use crate::protocol::{self, Frame, CLOSE_CONN_ID_IN_USE};
use crate::registry::TunnelRegistry;
use crate::session::{CloseCause, DispatchError, Outbound, Session};

/// Outbound frames buffered per session before senders are backpressured.
const OUTBOUND_BUFFER: usize = 256;

/// How long to let the writer task flush a close frame before aborting it.
const WRITER_FLUSH: Duration = Duration::from_secs(2);

/// State shared across all public handlers.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<TunnelRegistry>,
    pub validator: Arc<TokenValidator>,
    /// Deadline for a tunneled request's response.
    pub request_timeout: Duration,
    /// Public request bodies above this are rejected with 413.
    pub max_body_bytes: usize,
}

/// Build the router for the whole public surface.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/{conn_id}", any(conn_root))
        .route("/{conn_id}/{*rest}", any(proxy_request))
        .with_state(state)
}

/// `/{conn_id}` — tunnel establishment when the request is a WebSocket
/// upgrade, otherwise a public request for the origin root.
async fn conn_root(
    State(state): State<RelayState>,
    Path(conn_id): Path<String>,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state).await.ok();
    let request = Request::from_parts(parts, body);
    match ws {
        Some(upgrade) => tunnel_upgrade(state, &conn_id, upgrade, request.headers(), request.uri()),
        None => proxy(state, &conn_id, request).await,
    }
}

/// `ANY /{conn_id}/{*rest}` — a public request.
async fn proxy_request(
    State(state): State<RelayState>,
    Path((conn_id, _rest)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy(state, &conn_id, request).await
}

// ─── Public HTTP handler ─────────────────────────────────────────────────────

async fn proxy(state: RelayState, conn_id: &str, request: Request) -> Response {
    let Ok(conn_id) = Uuid::parse_str(conn_id) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    let Some(session) = state.registry.lookup(conn_id) else {
        return (StatusCode::BAD_GATEWAY, "tunnel not connected").into_response();
    };

    let method = request.method().to_string();
    let path = tunnel_path(request.uri());
    let headers = forwarded_headers(request.headers());
    let body = match to_bytes(request.into_body(), state.max_body_bytes).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };

    match session
        .dispatch(method, path, headers, body, state.request_timeout)
        .await
    {
        Ok(response) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut builder = Response::builder().status(status);
            for (name, value) in &response.headers {
                if !protocol::forwardable(name) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    builder = builder.header(name, value);
                }
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(err) => dispatch_error_response(err).into_response(),
    }
}

fn dispatch_error_response(err: DispatchError) -> (StatusCode, &'static str) {
    match err {
        DispatchError::UpstreamTimeout => (StatusCode::GATEWAY_TIMEOUT, "upstream timeout"),
        DispatchError::TunnelClosed => (StatusCode::BAD_GATEWAY, "tunnel closed"),
    }
}

/// The part of the public URL after `/{conn_id}`, including the leading `/`
/// and the query string, exactly as received (no percent-decoding).
fn tunnel_path(uri: &Uri) -> String {
    let full = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str());
    let tail = &full[1..];
    match tail.find(['/', '?']) {
        Some(i) if tail.as_bytes()[i] == b'/' => tail[i..].to_string(),
        Some(i) => format!("/{}", &tail[i..]),
        None => "/".to_string(),
    }
}

/// Copy headers in order, dropping the ones that must not cross the tunnel.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| protocol::forwardable(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

// ─── Tunnel establishment ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct UpgradeQuery {
    token: Option<String>,
}

/// Validate the connection id and bearer token, then accept the upgrade.
/// Auth failures are reported as plain HTTP before any upgrade happens.
fn tunnel_upgrade(
    state: RelayState,
    conn_id: &str,
    upgrade: WebSocketUpgrade,
    headers: &HeaderMap,
    uri: &Uri,
) -> Response {
    let Ok(conn_id) = Uuid::parse_str(conn_id) else {
        return (StatusCode::BAD_REQUEST, "malformed connection id").into_response();
    };
    let Some(token) = bearer_token(headers, uri) else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    if !state.validator.validate(&token) {
        warn!(conn_id = %conn_id, "rejected tunnel with invalid token");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    upgrade.on_upgrade(move |socket| {
        run_tunnel(state, conn_id, socket).instrument(info_span!("tunnel", conn_id = %conn_id))
    })
}

/// The bearer token, from the `Authorization` header when present, else the
/// `token` query parameter.
fn bearer_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(ToString::to_string);
    from_header.or_else(|| {
        Query::<UpgradeQuery>::try_from_uri(uri)
            .ok()
            .and_then(|query| query.0.token)
    })
}

/// Own the tunnel socket for its lifetime: register the session, pump
/// inbound frames to their waiters, and drain on any exit.
async fn run_tunnel(state: RelayState, conn_id: Uuid, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let session = Session::new(conn_id, outbound_tx, state.registry.clone());

    if state.registry.try_register(session.clone()).is_err() {
        warn!(conn_id = %conn_id, "rejected tunnel: connection id in use");
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_CONN_ID_IN_USE,
                reason: "connection id in use".into(),
            })))
            .await;
        return;
    }
    info!(conn_id = %conn_id, "tunnel registered");

    // Single writer: everything the session sends funnels through here.
    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => match protocol::decode(text.as_str()) {
                Ok(Frame::Response(response)) => session.deliver(response),
                Ok(Frame::Request(_)) => {
                    warn!(conn_id = %conn_id, "client sent a request frame");
                    session.drain(CloseCause::ProtocolError);
                    break;
                }
                Err(err) => {
                    warn!(conn_id = %conn_id, "{err}");
                    session.drain(CloseCause::ProtocolError);
                    break;
                }
            },
            Ok(Message::Binary(_)) => {
                warn!(conn_id = %conn_id, "client sent a binary frame");
                session.drain(CloseCause::ProtocolError);
                break;
            }
            Ok(Message::Close(_)) => {
                session.drain(CloseCause::PeerClosed);
                break;
            }
            // Ping/Pong keepalive; axum answers pings itself.
            Ok(_) => {}
            Err(err) => {
                session.drain(CloseCause::Io(err.to_string()));
                break;
            }
        }
    }
    session.drain(CloseCause::PeerClosed);
    info!(conn_id = %conn_id, "tunnel closed");

    // Give the writer a moment to flush the close frame, then stop it.
    if tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(text: &str) -> Uri {
        text.parse().unwrap()
    }

    #[test]
    fn tunnel_path_splits_after_connection_id() {
        assert_eq!(tunnel_path(&uri("/abc/hello?x=1")), "/hello?x=1");
        assert_eq!(tunnel_path(&uri("/abc/a/b/c")), "/a/b/c");
        assert_eq!(tunnel_path(&uri("/abc/")), "/");
        assert_eq!(tunnel_path(&uri("/abc")), "/");
        assert_eq!(tunnel_path(&uri("/abc?x=1")), "/?x=1");
    }

    #[test]
    fn tunnel_path_keeps_percent_encoding() {
        assert_eq!(
            tunnel_path(&uri("/abc/a%20b?q=%2Ffoo")),
            "/a%20b?q=%2Ffoo"
        );
    }

    #[test]
    fn bearer_token_prefers_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer from-header".parse().unwrap());
        let uri = uri("/abc?token=from-query");
        assert_eq!(bearer_token(&headers, &uri).as_deref(), Some("from-header"));
        assert_eq!(
            bearer_token(&HeaderMap::new(), &uri).as_deref(),
            Some("from-query")
        );
        assert!(bearer_token(&HeaderMap::new(), &"/abc".parse().unwrap()).is_none());
    }

    #[test]
    fn dispatch_errors_map_to_gateway_statuses() {
        assert_eq!(
            dispatch_error_response(DispatchError::UpstreamTimeout).0,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            dispatch_error_response(DispatchError::TunnelClosed).0,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn forwarded_headers_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("host", "example.com".parse().unwrap());
        headers.append("x-tag", "one".parse().unwrap());
        headers.append("x-tag", "two".parse().unwrap());
        let forwarded = forwarded_headers(&headers);
        assert_eq!(
            forwarded,
            vec![
                ("accept".to_string(), "*/*".to_string()),
                ("x-tag".to_string(), "one".to_string()),
                ("x-tag".to_string(), "two".to_string()),
            ]
        );
    }
}
