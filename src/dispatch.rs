use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header::HOST, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, error, info};

use crate::app::{alias, App, Entrypoint, LoadError, Reserved};
use crate::auth::{self, Gate};
use crate::builtins;
use crate::codec::{self, SerializedRequest, SerializedResponse};
use crate::logs::AccessRecord;
use crate::AppState;

/// Everything the per-tenant access log needs alongside the outbound
/// response. `record_response` is absent when the evaluator failed.
struct Handled {
    response: Response,
    request: SerializedRequest,
    record_response: Option<SerializedResponse>,
    logs: Vec<u8>,
}

/// The per-request pipeline: host → app, handler selection, privacy
/// decision, auth wrap, logging wrap. The chain is assembled just-in-time
/// because the privacy decision depends on the request path.
pub async fn handle(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let timestamp = Utc::now();

    let host_header = request_host(&req);
    let host = host_header.split(':').next().unwrap_or("").to_string();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // The apex itself has no app; park it on the www subdomain.
    if host == state.config.domain {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let location = format!("https://www.{}{}", state.config.domain, path_and_query);
        let response =
            (StatusCode::TEMPORARY_REDIRECT, [("location", location)]).into_response();
        return traced(response, &method, &host, &path, started);
    }

    let name = alias(&host).to_string();
    let app = match App::load(&state.config.root_dir, &name).await {
        Ok(app) => app,
        Err(e @ LoadError::MissingEntrypoint(_)) => {
            error!(app = %name, error = %e, "App has no entrypoint");
            let response =
                (StatusCode::INTERNAL_SERVER_ERROR, "no entrypoint\n").into_response();
            return traced(response, &method, &host, &path, started);
        }
        Err(e) => {
            debug!(app = %name, error = %e, "App lookup failed");
            let response = (StatusCode::NOT_FOUND, "app not found\n").into_response();
            return traced(response, &method, &host, &path, started);
        }
    };

    if app.config.is_private(&path) {
        if let Gate::Respond(response) = auth::gate(&state, &host, req.uri(), req.headers()).await {
            return traced(response, &method, &host, &path, started);
        }
    }

    let handled = run_handler(&state, &app, &host_header, req).await;

    state
        .access_log
        .append(
            &app.name,
            &AccessRecord {
                timestamp,
                entrypoint: app.entrypoint.display(),
                request: handled.request,
                response: handled.record_response,
                duration: started.elapsed().as_nanos() as u64,
                logs: handled.logs,
            },
        )
        .await;

    traced(handled.response, &method, &host, &path, started)
}

/// The logging wrap: one structured line per request.
fn traced(
    response: Response,
    method: &axum::http::Method,
    host: &str,
    path: &str,
    started: Instant,
) -> Response {
    info!(
        method = %method,
        host = %host,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Select and run the handler for the app's entrypoint.
async fn run_handler(
    state: &AppState,
    app: &App,
    host_header: &str,
    req: Request<Body>,
) -> Handled {
    let tls = state.config.tls_enabled();

    match &app.entrypoint {
        Entrypoint::Reserved(Reserved::Webdav) => {
            wrapped_collaborator("webdav", "*", req, host_header, tls).await
        }
        Entrypoint::Reserved(Reserved::Cli) => {
            let request = codec::serialize_parts(&req, host_header, tls);
            record_local(builtins::collaborator("cli").await, request).await
        }
        Entrypoint::Reserved(Reserved::Docs) => {
            let request = codec::serialize_parts(&req, host_header, tls);
            record_local(builtins::collaborator("docs").await, request).await
        }
        Entrypoint::Reserved(Reserved::Editor) => {
            let request = codec::serialize_parts(&req, host_header, tls);
            record_local(builtins::collaborator("editor").await, request).await
        }
        Entrypoint::Reserved(Reserved::Static) => {
            let request = codec::serialize_parts(&req, host_header, tls);
            if let Some(response) = builtins::cors_preflight(&req, "GET") {
                return record_local(response, request).await;
            }
            let mut response = builtins::serve_static(&app.dir, req).await;
            builtins::add_cors_headers(&mut response, "GET");
            record_local(response, request).await
        }
        Entrypoint::File(path) if path.file_name().is_some_and(|n| n == "index.html") => {
            let request = codec::serialize_parts(&req, host_header, tls);
            let dir = path.parent().unwrap_or(&state.config.root_dir).to_path_buf();
            record_local(builtins::serve_static(&dir, req).await, request).await
        }
        Entrypoint::File(path) => evaluate(state, path, host_header, req).await,
    }
}

async fn wrapped_collaborator(
    name: &'static str,
    methods: &'static str,
    req: Request<Body>,
    host_header: &str,
    tls: bool,
) -> Handled {
    let request = codec::serialize_parts(&req, host_header, tls);
    if let Some(response) = builtins::cors_preflight(&req, methods) {
        return record_local(response, request).await;
    }
    let mut response = builtins::collaborator(name).await;
    builtins::add_cors_headers(&mut response, methods);
    record_local(response, request).await
}

/// Dispatch into the evaluator and translate the outcome: a decoded
/// artifact becomes the response; any failure becomes a 500 whose body is
/// the child's combined output.
async fn evaluate(
    state: &AppState,
    entrypoint: &Path,
    host_header: &str,
    req: Request<Body>,
) -> Handled {
    let tls = state.config.tls_enabled();
    let light = codec::serialize_parts(&req, host_header, tls);

    let request = match codec::serialize_request(req, host_header, tls).await {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return Handled {
                response: (StatusCode::INTERNAL_SERVER_ERROR, "failed to read request body\n")
                    .into_response(),
                request: light,
                record_response: None,
                logs: Vec::new(),
            };
        }
    };

    match state.evaluator.fetch(entrypoint, &request).await {
        Ok((serialized, logs)) => Handled {
            response: codec::write_response(serialized.clone()),
            request,
            record_response: Some(serialized),
            logs,
        },
        Err(e) => {
            error!(entrypoint = %entrypoint.display(), error = %e, "Evaluator invocation failed");
            let mut body = e.output().to_vec();
            if body.is_empty() {
                body = format!("{e}\n").into_bytes();
            }
            Handled {
                response: (StatusCode::INTERNAL_SERVER_ERROR, body.clone()).into_response(),
                request,
                record_response: None,
                logs: body,
            }
        }
    }
}

/// Buffer a locally produced response so it can ride in the access record,
/// then re-emit it unchanged. The boundary is non-streaming by design.
async fn record_local(response: Response, request: SerializedRequest) -> Handled {
    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to buffer response body");
            bytes::Bytes::new()
        }
    };

    let record_response = SerializedResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: bytes.to_vec(),
    };

    Handled {
        response: Response::from_parts(parts, Body::from(bytes)),
        request,
        record_response: Some(record_response),
        logs: Vec::new(),
    }
}

fn request_host(req: &Request<Body>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| req.uri().host().map(ToString::to_string))
        .unwrap_or_default()
}
