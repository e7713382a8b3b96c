//! Client-side relay, run on the tunneled host.
//!
//! Maintains an outbound WebSocket to the server, decodes request frames,
//! replays each against the local origin, and returns response frames. Every
//! request is handled by its own task; the socket's write side is shared
//! behind a mutex so concurrent workers never interleave frames.
//!
//! The connection loop reconnects with exponential backoff. Rejections that
//! retrying cannot fix (bad credentials, connection id already in use) are
//! fatal and bubble out of [`run`].

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{self, forwardable, Frame, RequestFrame, ResponseFrame, CLOSE_CONN_ID_IN_USE};

/// Write half of the tunnel socket, shared by all request workers.
type WsSink = Arc<
    Mutex<futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>,
>;

/// Settings for the client-side relay.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Base URL of the local origin, e.g. `http://127.0.0.1:9090`.
    pub local_url: String,
    /// Tunnel URL including the connection id, e.g. `wss://host/<conn-id>`.
    pub server_url: String,
    /// Bearer token presented on the upgrade.
    pub token: String,
    /// Initial reconnect backoff (default 5 s).
    pub reconnect_delay: Duration,
    /// Backoff ceiling (default 60 s).
    pub reconnect_max_delay: Duration,
    /// Timeout for requests against the local origin (default 30 s).
    pub origin_timeout: Duration,
    /// WebSocket ping interval keeping NAT mappings warm (default 30 s).
    pub keepalive: Duration,
}

impl ClientOptions {
    pub fn new(
        local_url: impl Into<String>,
        server_url: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            local_url: local_url.into(),
            server_url: server_url.into(),
            token: token.into(),
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            origin_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Errors from the client-side relay.
#[derive(Debug)]
pub enum ClientError {
    /// Unusable options (URL, token characters).
    Config(String),
    /// The server refused the upgrade with this HTTP status.
    Rejected(u16),
    /// Another client already holds the connection id.
    ConnIdInUse,
    /// Socket-level failure.
    Transport(String),
    /// The server sent something the codec rejects.
    Protocol(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(detail) => write!(f, "invalid configuration: {detail}"),
            Self::Rejected(status) => write!(f, "server rejected the tunnel (HTTP {status})"),
            Self::ConnIdInUse => write!(f, "connection id already in use"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::Protocol(detail) => write!(f, "protocol error: {detail}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Main loop: connect, relay until disconnect, reconnect with backoff.
/// Returns only on errors that retrying cannot fix.
pub async fn run(opts: ClientOptions) -> Result<(), ClientError> {
    let http = reqwest::Client::builder()
        .timeout(opts.origin_timeout)
        .build()
        .map_err(|e| ClientError::Config(e.to_string()))?;

    let mut delay = opts.reconnect_delay;
    loop {
        info!("connecting to {}", opts.server_url);
        match run_once(&opts, &http).await {
            Ok(()) => {
                info!("tunnel closed, reconnecting...");
                delay = opts.reconnect_delay;
            }
            Err(err @ (ClientError::Config(_) | ClientError::Rejected(_) | ClientError::ConnIdInUse)) => {
                return Err(err);
            }
            Err(err) => {
                warn!("tunnel error: {err}, reconnecting in {}s", delay.as_secs());
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(opts.reconnect_max_delay);
    }
}

/// A single connection attempt: open the tunnel and relay requests until it
/// drops. `Ok(())` means a clean close, worth reconnecting after.
pub async fn run_once(opts: &ClientOptions, http: &reqwest::Client) -> Result<(), ClientError> {
    let mut request = opts
        .server_url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Config(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", opts.token))
        .map_err(|e| ClientError::Config(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (socket, _response) = connect_async(request).await.map_err(|err| match err {
        tungstenite::Error::Http(response) => ClientError::Rejected(response.status().as_u16()),
        other => ClientError::Transport(other.to_string()),
    })?;
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));
    info!("tunnel established");

    let keepalive = {
        let sink = sink.clone();
        let interval = opts.keepalive;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut sink = sink.lock().await;
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        })
    };

    let result = loop {
        let Some(item) = stream.next().await else {
            break Ok(());
        };
        match item {
            Ok(Message::Text(text)) => match protocol::decode(text.as_str()) {
                Ok(Frame::Request(frame)) => {
                    let http = http.clone();
                    let sink = sink.clone();
                    let local_url = opts.local_url.clone();
                    tokio::spawn(async move {
                        handle_request(&http, &local_url, frame, &sink).await;
                    });
                }
                Ok(Frame::Response(_)) => {
                    break Err(ClientError::Protocol(
                        "server sent a response frame".into(),
                    ));
                }
                Err(err) => break Err(ClientError::Protocol(err.to_string())),
            },
            Ok(Message::Close(frame)) => {
                if frame
                    .as_ref()
                    .is_some_and(|f| u16::from(f.code) == CLOSE_CONN_ID_IN_USE)
                {
                    break Err(ClientError::ConnIdInUse);
                }
                break Ok(());
            }
            Ok(_) => {}
            Err(err) => break Err(ClientError::Transport(err.to_string())),
        }
    };
    keepalive.abort();
    result
}

/// Replay one tunneled request against the origin and send the response
/// frame back. Origin failures become a 502 with a short diagnostic body.
async fn handle_request(http: &reqwest::Client, local_url: &str, frame: RequestFrame, sink: &WsSink) {
    let request_id = frame.request_id;
    let response = match forward_to_origin(http, local_url, frame).await {
        Ok(response) => response,
        Err(detail) => {
            warn!(request_id = %request_id, "origin request failed: {detail}");
            origin_error_response(request_id, &detail)
        }
    };
    let text = protocol::encode(&Frame::Response(response));
    let mut sink = sink.lock().await;
    if sink.send(Message::Text(text.into())).await.is_err() {
        warn!(request_id = %request_id, "tunnel closed before the response could be sent");
    }
}

async fn forward_to_origin(
    http: &reqwest::Client,
    local_url: &str,
    frame: RequestFrame,
) -> Result<ResponseFrame, String> {
    let url = origin_url(local_url, &frame.path);
    let method = reqwest::Method::from_bytes(frame.method.as_bytes())
        .map_err(|_| format!("invalid method {:?}", frame.method))?;

    let response = http
        .request(method, url)
        .headers(origin_headers(&frame.headers))
        .body(frame.body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| forwardable(name.as_str()))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.bytes().await.map_err(|e| e.to_string())?;

    Ok(ResponseFrame {
        request_id: frame.request_id,
        status,
        headers,
        body: body.to_vec(),
    })
}

fn origin_error_response(request_id: Uuid, detail: &str) -> ResponseFrame {
    ResponseFrame {
        request_id,
        status: 502,
        headers: vec![(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body: format!("origin unreachable: {detail}").into_bytes(),
    }
}

/// `local_url` + tunneled path. The path already carries the leading `/`
/// and query string.
fn origin_url(local_url: &str, path: &str) -> String {
    format!("{}{}", local_url.trim_end_matches('/'), path)
}

/// Header map for the origin request, skipping names that must not cross
/// the tunnel. Invalid names or values are dropped rather than failing the
/// whole request.
fn origin_headers(headers: &[(String, String)]) -> reqwest::header::HeaderMap {
    let mut map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if !forwardable(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_url_joins_base_and_path() {
        assert_eq!(
            origin_url("http://127.0.0.1:9090", "/hello?x=1"),
            "http://127.0.0.1:9090/hello?x=1"
        );
        assert_eq!(
            origin_url("http://127.0.0.1:9090/", "/hello"),
            "http://127.0.0.1:9090/hello"
        );
        assert_eq!(origin_url("http://localhost", "/"), "http://localhost/");
    }

    #[test]
    fn origin_headers_keep_duplicates_and_drop_hop_by_hop() {
        let headers = vec![
            ("accept".to_string(), "*/*".to_string()),
            ("x-tag".to_string(), "one".to_string()),
            ("x-tag".to_string(), "two".to_string()),
            ("connection".to_string(), "keep-alive".to_string()),
            ("host".to_string(), "public.example".to_string()),
        ];
        let map = origin_headers(&headers);
        assert_eq!(map.len(), 3);
        let tags: Vec<_> = map.get_all("x-tag").iter().collect();
        assert_eq!(tags.len(), 2);
        assert!(map.get("connection").is_none());
        assert!(map.get("host").is_none());
    }

    #[test]
    fn origin_error_response_is_a_502() {
        let id = Uuid::new_v4();
        let response = origin_error_response(id, "connection refused");
        assert_eq!(response.request_id, id);
        assert_eq!(response.status, 502);
        assert!(String::from_utf8(response.body).unwrap().contains("connection refused"));
    }
}
