//! Wire protocol for HTTP-over-WebSocket frames.
//!
//! Frames travel as WebSocket **text** messages, each a JSON object tagged by
//! a `kind` field:
//!
//! ```json
//! {"kind":"request","request_id":"<uuid>","method":"GET","path":"/foo?x=1",
//!  "headers":[["Accept","*/*"]],"body":""}
//! {"kind":"response","request_id":"<uuid>","status":200,
//!  "headers":[["Content-Type","text/plain"]],"body":"aGVsbG8="}
//! ```
//!
//! Bodies are base64 so arbitrary bytes survive the text framing. Headers are
//! a list of `[name, value]` pairs rather than a map, preserving both order
//! and duplicates. Text + base64 is trivially inspectable and survives any
//! intermediary that re-frames messages; the overhead is noise next to the
//! round-trip latency a tunnel adds anyway.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application close code sent when a second tunnel claims a live connection id.
pub const CLOSE_CONN_ID_IN_USE: u16 = 4409;

/// A tunneled HTTP request, server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub request_id: Uuid,
    /// HTTP method token (`GET`, `POST`, ...).
    pub method: String,
    /// Path after the connection id, including the leading `/` and any query
    /// string, exactly as received on the public side.
    pub path: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

/// A tunneled HTTP response, client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub request_id: Uuid,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
}

/// Either direction of the wire protocol, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

/// Encode a frame as the text payload of a WebSocket message.
pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("frame serializes")
}

/// Decode a text payload into a [`Frame`].
///
/// Fails on invalid JSON, an unknown `kind`, a missing field, a base64 error
/// in `body`, or a `status` outside 100–599.
pub fn decode(text: &str) -> Result<Frame, MalformedMessage> {
    let frame: Frame = serde_json::from_str(text).map_err(|e| MalformedMessage(e.to_string()))?;
    if let Frame::Response(resp) = &frame {
        if !(100..=599).contains(&resp.status) {
            return Err(MalformedMessage(format!(
                "status {} out of range",
                resp.status
            )));
        }
    }
    Ok(frame)
}

/// A frame that could not be decoded. Fatal for the session that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage(pub String);

impl std::fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed message: {}", self.0)
    }
}

impl std::error::Error for MalformedMessage {}

/// Hop-by-hop header names (RFC 9110 §7.6.1). These apply to a single
/// transport hop and must never cross the tunnel.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header may be copied across the tunnel, on either leg.
///
/// Excludes the hop-by-hop set plus `Host` (each hop has its own) and
/// `Content-Length` (each hop's HTTP stack recomputes it from the buffered
/// body).
pub fn forwardable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !HOP_BY_HOP.contains(&lower.as_str()) && lower != "host" && lower != "content-length"
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_id() -> Uuid {
        Uuid::parse_str("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa").unwrap()
    }

    #[test]
    fn request_encoding_is_stable() {
        let frame = Frame::Request(RequestFrame {
            request_id: fixed_id(),
            method: "GET".into(),
            path: "/foo?x=1".into(),
            headers: vec![("Accept".into(), "*/*".into())],
            body: Vec::new(),
        });
        assert_eq!(
            encode(&frame),
            r#"{"kind":"request","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa","method":"GET","path":"/foo?x=1","headers":[["Accept","*/*"]],"body":""}"#
        );
    }

    #[test]
    fn response_encoding_is_stable() {
        let frame = Frame::Response(ResponseFrame {
            request_id: fixed_id(),
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: b"hello".to_vec(),
        });
        assert_eq!(
            encode(&frame),
            r#"{"kind":"response","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa","status":200,"headers":[["Content-Type","text/plain"]],"body":"aGVsbG8="}"#
        );
    }

    #[test]
    fn round_trip_preserves_duplicate_headers_and_bytes() {
        let frame = Frame::Request(RequestFrame {
            request_id: Uuid::new_v4(),
            method: "POST".into(),
            path: "/submit?a=1&a=2".into(),
            headers: vec![
                ("X-Tag".into(), "one".into()),
                ("Accept".into(), "text/html".into()),
                ("X-Tag".into(), "two".into()),
            ],
            body: vec![0, 159, 146, 150, 255],
        });
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn round_trip_empty_body() {
        let frame = Frame::Response(ResponseFrame {
            request_id: Uuid::new_v4(),
            status: 204,
            headers: Vec::new(),
            body: Vec::new(),
        });
        assert_eq!(decode(&encode(&frame)).unwrap(), frame);
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(decode("not json").is_err());
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert!(decode(r#"{"kind":"cancel","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa"}"#).is_err());
    }

    #[test]
    fn decode_rejects_missing_field() {
        assert!(decode(
            r#"{"kind":"request","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa","path":"/","headers":[],"body":""}"#
        )
        .is_err());
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(decode(
            r#"{"kind":"response","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa","status":200,"headers":[],"body":"!!!"}"#
        )
        .is_err());
    }

    #[test]
    fn decode_rejects_out_of_range_status() {
        for status in [99, 600] {
            let text = format!(
                r#"{{"kind":"response","request_id":"aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa","status":{status},"headers":[],"body":""}}"#
            );
            assert!(decode(&text).is_err(), "status {status} should be rejected");
        }
    }

    #[test]
    fn hop_by_hop_headers_are_not_forwardable() {
        for name in ["Connection", "keep-alive", "TE", "Transfer-Encoding", "Upgrade", "Host", "Content-Length"] {
            assert!(!forwardable(name), "{name} must be stripped");
        }
        for name in ["Accept", "Content-Type", "Authorization", "X-Request-Id"] {
            assert!(forwardable(name), "{name} must pass through");
        }
    }
}
