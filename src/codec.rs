use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{header::HeaderName, HeaderValue, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// An inbound request flattened for the evaluator boundary.
///
/// Headers carry one pair per name with the first value seen; multi-valued
/// headers are not modeled at this boundary. Bodies are read fully into
/// memory — the evaluator contract is not streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// The evaluator's response artifact. Header names may repeat; the outbound
/// writer sets them in order, last write winning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// One line of JSON handed to the evaluator on stdin for a web request.
/// `output` names the file the child must write its response artifact to.
#[derive(Debug, Serialize)]
pub struct EvaluatorInput<'a> {
    pub req: &'a SerializedRequest,
    pub entrypoint: String,
    pub env: &'a HashMap<String, String>,
    pub output: String,
}

/// The command-mode variant used by cron invocations.
#[derive(Debug, Serialize)]
pub struct CommandInput<'a> {
    pub entrypoint: String,
    pub env: &'a HashMap<String, String>,
    pub args: &'a [String],
}

/// Flatten everything but the body: URL reconstructed as
/// `<scheme>://<host><path>?<query>` (scheme decided by whether this
/// instance terminates TLS), method, and headers in encounter order with
/// first values. Used directly for access-log records of handlers that
/// never read the body.
pub fn serialize_parts(req: &Request<Body>, host: &str, tls: bool) -> SerializedRequest {
    let scheme = if tls { "https" } else { "http" };
    let path = req.uri().path();
    let url = match req.uri().query() {
        Some(query) => format!("{scheme}://{host}{path}?{query}"),
        None => format!("{scheme}://{host}{path}"),
    };

    let mut headers = Vec::new();
    let mut seen = HashSet::new();
    for (name, value) in req.headers().iter() {
        if seen.insert(name.clone()) {
            headers.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
    }

    SerializedRequest {
        url,
        method: req.method().as_str().to_string(),
        headers,
        body: Vec::new(),
    }
}

/// Flatten an inbound request for the evaluator, reading the body fully
/// into memory.
pub async fn serialize_request(
    req: Request<Body>,
    host: &str,
    tls: bool,
) -> Result<SerializedRequest> {
    let mut serialized = serialize_parts(&req, host, tls);

    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .context("Failed to read request body")?;
    serialized.body = body.to_vec();

    Ok(serialized)
}

/// Materialize the outbound response: status, headers in artifact order
/// (last write wins on repeats), then the body bytes verbatim.
pub fn write_response(serialized: SerializedResponse) -> Response<Body> {
    let status =
        StatusCode::from_u16(serialized.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(Body::from(serialized.body));
    *response.status_mut() = status;

    for (name, value) in &serialized.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => {
                tracing::warn!(header = %name, "Dropping invalid response header");
            }
        }
    }

    response
}

/// Bodies and captured logs are raw bytes; the JSON encoding carries them as
/// standard base64 so the records stay line-oriented.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::{ACCEPT, HOST};

    #[tokio::test]
    async fn url_reconstruction_with_query() {
        let req = Request::builder()
            .method("GET")
            .uri("/hello?a=1&b=2")
            .body(Body::empty())
            .unwrap();

        let serialized = serialize_request(req, "blog.example.test", false)
            .await
            .unwrap();
        assert_eq!(serialized.url, "http://blog.example.test/hello?a=1&b=2");
        assert_eq!(serialized.method, "GET");
    }

    #[tokio::test]
    async fn url_scheme_follows_tls() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let serialized = serialize_request(req, "docs.example.test", true)
            .await
            .unwrap();
        assert_eq!(serialized.url, "https://docs.example.test/");
    }

    #[tokio::test]
    async fn headers_keep_first_value_only() {
        let req = Request::builder()
            .uri("/")
            .header(ACCEPT, "text/html")
            .header(ACCEPT, "application/json")
            .header(HOST, "a.example.test")
            .body(Body::empty())
            .unwrap();

        let serialized = serialize_request(req, "a.example.test", false)
            .await
            .unwrap();
        let accepts: Vec<_> = serialized
            .headers
            .iter()
            .filter(|(name, _)| name == "accept")
            .collect();
        assert_eq!(accepts.len(), 1);
        assert_eq!(accepts[0].1, "text/html");
    }

    #[tokio::test]
    async fn body_bytes_round_trip_through_json() {
        let req = Request::builder()
            .method("POST")
            .uri("/submit")
            .body(Body::from(&b"<a href=\"/x?p=1&q=2\">&amp;</a>"[..]))
            .unwrap();

        let serialized = serialize_request(req, "x.example.test", false)
            .await
            .unwrap();
        let json = serde_json::to_string(&serialized).unwrap();
        let decoded: SerializedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.body, b"<a href=\"/x?p=1&q=2\">&amp;</a>");
    }

    #[test]
    fn json_encoding_does_not_escape_html_metacharacters() {
        let serialized = SerializedRequest {
            url: "http://a.example.test/p?x=1&y=2".into(),
            method: "GET".into(),
            headers: vec![],
            body: Vec::new(),
        };
        let json = serde_json::to_string(&serialized).unwrap();
        assert!(json.contains("x=1&y=2"));
        assert!(!json.contains("\\u0026"));
    }

    #[test]
    fn response_writer_sets_headers_in_order() {
        let response = write_response(SerializedResponse {
            status: 201,
            headers: vec![
                ("x-one".into(), "first".into()),
                ("content-type".into(), "text/plain".into()),
                ("x-one".into(), "second".into()),
            ],
            body: b"ok".to_vec(),
        });

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-one").unwrap(), "second");
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn response_writer_rejects_bogus_status() {
        let response = write_response(SerializedResponse {
            status: 99,
            headers: vec![],
            body: Vec::new(),
        });
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn response_artifact_decodes_with_defaults() {
        let decoded: SerializedResponse = serde_json::from_str(r#"{"status": 204}"#).unwrap();
        assert_eq!(decoded.status, 204);
        assert!(decoded.headers.is_empty());
        assert!(decoded.body.is_empty());
    }
}
