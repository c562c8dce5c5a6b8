use std::path::Path;

use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Serve files from `dir`. Backs `reserved:static` apps and the
/// `index.html` convention fallback.
pub async fn serve_static(dir: &Path, req: Request<Body>) -> Response {
    let router: Router = Router::new().fallback_service(ServeDir::new(dir));
    router.oneshot(req).await.into_response()
}

/// Wildcard CORS short-circuit: any OPTIONS request is answered 200 with
/// permissive allow headers before the wrapped handler runs.
pub fn cors_preflight(req: &Request<Body>, methods: &'static str) -> Option<Response> {
    (req.method() == Method::OPTIONS)
        .then(|| (StatusCode::OK, cors_headers(methods)).into_response())
}

/// Attach the permissive CORS headers to a wrapped handler's response.
pub fn add_cors_headers(response: &mut Response, methods: &'static str) {
    for (name, value) in cors_headers(methods) {
        response
            .headers_mut()
            .insert(name, HeaderValue::from_static(value));
    }
}

fn cors_headers(methods: &'static str) -> [(&'static str, &'static str); 3] {
    [
        ("access-control-allow-origin", "*"),
        ("access-control-allow-methods", methods),
        ("access-control-allow-headers", "*"),
    ]
}

/// Seam for the reserved handlers that ship as collaborator crates (webdav,
/// cli, docs, editor). The dispatcher selects and wraps them here; a build
/// without the collaborator wired in answers 501.
pub async fn collaborator(name: &'static str) -> Response {
    tracing::warn!(handler = name, "Reserved handler not wired into this build");
    (
        StatusCode::NOT_IMPLEMENTED,
        format!("{name} handler is not available\n"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn serves_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>docs</h1>").unwrap();

        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = serve_static(dir.path(), req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>docs</h1>");
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder().uri("/ghost").body(Body::empty()).unwrap();
        let response = serve_static(dir.path(), req).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn options_short_circuits_with_wildcards() {
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/any")
            .body(Body::empty())
            .unwrap();

        let response = cors_preflight(&req, "*").unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert_eq!(
            response.headers().get("access-control-allow-methods").unwrap(),
            "*"
        );
    }

    #[test]
    fn non_options_requests_pass_through_preflight() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert!(cors_preflight(&req, "GET").is_none());
    }

    #[test]
    fn cors_headers_attach_to_response() {
        let mut response = StatusCode::OK.into_response();
        add_cors_headers(&mut response, "GET");
        assert_eq!(
            response.headers().get("access-control-allow-methods").unwrap(),
            "GET"
        );
    }
}
