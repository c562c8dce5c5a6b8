pub mod oauth;
pub mod sessions;
pub mod tokens;

use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use chrono::Utc;
use tracing::{debug, error};

use crate::AppState;

const REALM: &str = "smallweb";

/// Outcome of the auth gate for a private route: either the request may
/// proceed to the selected handler, or the gate already produced the
/// response (challenge, redirect, or one of the `/_auth/*` endpoints).
pub enum Gate {
    Forward,
    Respond(Response),
}

/// The credential shape presented by the request. The auth flow is a single
/// dispatch over this shape, first match wins: Basic, then Bearer, then the
/// cookie-session machinery.
enum Credential {
    Basic(String),
    Bearer(String),
    None,
}

fn classify(headers: &HeaderMap) -> Credential {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Some(encoded) = authorization.strip_prefix("Basic ") {
        return Credential::Basic(encoded.to_string());
    }
    if let Some(token) = authorization.strip_prefix("Bearer ") {
        return Credential::Bearer(token.to_string());
    }
    Credential::None
}

/// Run the auth state machine for a private route.
pub async fn gate(state: &AppState, host: &str, uri: &Uri, headers: &HeaderMap) -> Gate {
    let path = uri.path();
    let required_email = state.config.email.as_str();

    match classify(headers) {
        Credential::Basic(encoded) => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());

            match decoded {
                Some(payload) => {
                    let credential = basic_credential(&payload);
                    match tokens::verify(&state.db, credential).await {
                        Ok(token) => {
                            debug!(token = %token.public_id, "Basic token credential accepted");
                            Gate::Forward
                        }
                        Err(_) => Gate::Respond(basic_challenge()),
                    }
                }
                None => Gate::Respond(basic_challenge()),
            }
        }

        Credential::Bearer(credential) => match tokens::verify(&state.db, &credential).await {
            Ok(token) => {
                debug!(token = %token.public_id, "Bearer token credential accepted");
                Gate::Forward
            }
            Err(_) => Gate::Respond(bearer_challenge()),
        },

        Credential::None => {
            // Without a required account there is no session flow to offer;
            // only token credentials can open private routes.
            if required_email.is_empty() {
                return Gate::Respond(basic_challenge());
            }

            match path {
                "/_auth/login" => {
                    Gate::Respond(oauth::login(&state.config.oauth, host, uri))
                }
                "/_auth/callback" => Gate::Respond(
                    oauth::callback(
                        &state.db,
                        &state.http,
                        &state.config.oauth,
                        host,
                        uri,
                        headers,
                    )
                    .await,
                ),
                "/_auth/logout" => Gate::Respond(oauth::logout(&state.db, uri, headers).await),
                _ => session_gate(state, host, path, headers, required_email).await,
            }
        }
    }
}

/// The cookie branch: a present, unexpired session bound to this host and
/// the required account passes (re-armed to a full TTL when inside the
/// sliding window); everything else lands back at the login flow.
async fn session_gate(
    state: &AppState,
    host: &str,
    path: &str,
    headers: &HeaderMap,
    required_email: &str,
) -> Gate {
    let session_id = match cookie_value(headers, sessions::SESSION_COOKIE) {
        Some(id) => id,
        None => return Gate::Respond(redirect_to_login(path)),
    };

    let session = match sessions::get(&state.db, session_id, host).await {
        Ok(Some(session)) => session,
        Ok(None) => return Gate::Respond(expire_and_redirect(path)),
        Err(e) => {
            error!(error = %e, "Session lookup failed");
            return Gate::Respond(expire_and_redirect(path));
        }
    };

    if session.email != required_email {
        if let Err(e) = sessions::delete(&state.db, session_id).await {
            error!(error = %e, "Failed to delete mismatched session");
        }
        return Gate::Respond(expire_and_redirect(path));
    }

    let now = Utc::now();
    if session.needs_refresh(now) {
        if let Err(e) = sessions::extend(&state.db, session_id, now + sessions::session_ttl()).await
        {
            error!(error = %e, "Failed to extend session");
        }
    }

    Gate::Forward
}

fn basic_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", format!("Basic realm=\"{REALM}\""))],
    )
        .into_response()
}

fn bearer_challenge() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("www-authenticate", format!("Bearer realm=\"{REALM}\""))],
    )
        .into_response()
}

/// The request path rides in the `redirect` query value and may contain
/// characters that are legal in a path but significant in a query (`&`,
/// `=`, `+`), so it is percent-encoded rather than spliced in raw.
fn login_location(path: &str) -> String {
    let redirect: String = url::form_urlencoded::byte_serialize(path.as_bytes()).collect();
    format!("/_auth/login?redirect={redirect}")
}

fn redirect_to_login(path: &str) -> Response {
    (StatusCode::SEE_OTHER, [("location", login_location(path))]).into_response()
}

fn expire_and_redirect(path: &str) -> Response {
    (
        StatusCode::SEE_OTHER,
        [
            ("location", login_location(path)),
            ("set-cookie", sessions::clear_cookie()),
        ],
    )
        .into_response()
}

/// The decoded Basic payload is the token credential itself; a conventional
/// `user:token` payload is accepted when the part after the first `:`
/// parses as a credential.
fn basic_credential(payload: &str) -> &str {
    if let Some((_, rest)) = payload.split_once(':') {
        if tokens::parse(rest).is_some() {
            return rest;
        }
    }
    payload
}

/// Pull a single cookie's raw value out of the Cookie header.
pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    let prefix = format!("{name}=");
    raw.split(';')
        .map(str::trim)
        .find_map(|pair| pair.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn classify_recognizes_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic cHViLnNlYw=="));
        assert!(matches!(classify(&headers), Credential::Basic(_)));

        headers.insert("authorization", HeaderValue::from_static("Bearer pub.sec"));
        assert!(matches!(classify(&headers), Credential::Bearer(_)));

        assert!(matches!(classify(&HeaderMap::new()), Credential::None));
    }

    #[test]
    fn basic_credential_prefers_whole_payload() {
        assert_eq!(basic_credential("pub.secret"), "pub.secret");
        assert_eq!(basic_credential("user:pub.secret"), "pub.secret");
        assert_eq!(basic_credential("junk"), "junk");
    }

    #[test]
    fn challenges_carry_www_authenticate() {
        let basic = basic_challenge();
        assert_eq!(basic.status(), StatusCode::UNAUTHORIZED);
        assert!(basic
            .headers()
            .get("www-authenticate")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Basic"));

        let bearer = bearer_challenge();
        assert!(bearer
            .headers()
            .get("www-authenticate")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Bearer"));
    }

    #[test]
    fn login_redirect_carries_original_path() {
        let response = redirect_to_login("/page");
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "/_auth/login?redirect=%2Fpage"
        );
    }

    #[test]
    fn login_redirect_encodes_query_metacharacters() {
        let response = redirect_to_login("/foo&bar=x");
        let location = response
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(location, "/_auth/login?redirect=%2Ffoo%26bar%3Dx");

        // The login handler's query parsing recovers the full path.
        let uri: axum::http::Uri = location.parse().unwrap();
        let redirect = url::form_urlencoded::parse(uri.query().unwrap().as_bytes())
            .find(|(k, _)| k == "redirect")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(redirect, "/foo&bar=x");
    }

    #[test]
    fn cookie_value_finds_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("other=1; smallweb-session=abc123; last=2"),
        );
        assert_eq!(
            cookie_value(&headers, sessions::SESSION_COOKIE),
            Some("abc123")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
