use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{AppendHeaders, IntoResponse, Response};
use cookie::Cookie;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::error;
use url::Url;

use crate::auth::sessions;
use crate::config::OauthEndpoints;
use crate::db::Database;

pub const OAUTH_COOKIE: &str = "smallweb-oauth-store";

const OAUTH_COOKIE_TTL_SECS: i64 = 300;

/// State parked in the browser between `/login` and `/callback`: the random
/// state parameter and where to land after the dance. Carried as URL-encoded
/// JSON in a short-lived cookie.
#[derive(Debug, Serialize, Deserialize)]
struct OauthStore {
    state: String,
    redirect: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Userinfo {
    email: String,
}

/// GET /_auth/login — park state + redirect in the oauth-store cookie and
/// send the browser to the provider's authorize endpoint.
pub fn login(oauth: &OauthEndpoints, host: &str, uri: &Uri) -> Response {
    let state_bytes: [u8; 16] = rand::rng().random();
    let state = hex::encode(state_bytes);
    let redirect = query_param(uri, "redirect").unwrap_or_else(|| "/".to_string());

    let store = OauthStore {
        state: state.clone(),
        redirect,
    };
    let store_json = match serde_json::to_string(&store) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to encode oauth store");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let authorize_url = match Url::parse(&oauth.auth_url) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("client_id", &format!("https://{host}/"))
                .append_pair("redirect_uri", &format!("https://{host}/_auth/callback"))
                .append_pair("response_type", "code")
                .append_pair("state", &state)
                .append_pair("scope", "email");
            url.to_string()
        }
        Err(e) => {
            error!(error = %e, url = %oauth.auth_url, "Invalid provider authorize URL");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::SEE_OTHER,
        AppendHeaders([
            ("location", authorize_url),
            ("set-cookie", build_store_cookie(&store_json)),
        ]),
    )
        .into_response()
}

/// GET /_auth/callback — verify the state against the parked cookie,
/// exchange the code, fetch the account email, and issue a session. Any
/// provider-side failure is logged with its context and answered with a
/// generic 401.
pub async fn callback(
    db: &Database,
    http: &reqwest::Client,
    oauth: &OauthEndpoints,
    host: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> Response {
    let store = match read_store(headers) {
        Some(store) => store,
        None => {
            error!(host = %host, "OAuth callback without a parked oauth store");
            return unauthorized();
        }
    };

    let presented_state = query_param(uri, "state").unwrap_or_default();
    if store
        .state
        .as_bytes()
        .ct_eq(presented_state.as_bytes())
        .unwrap_u8()
        != 1
    {
        error!(host = %host, "OAuth callback state mismatch");
        return unauthorized();
    }

    let code = match query_param(uri, "code") {
        Some(code) => code,
        None => {
            error!(host = %host, "OAuth callback without a code parameter");
            return unauthorized();
        }
    };

    let token: TokenResponse = match http
        .post(&oauth.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("client_id", &format!("https://{host}/")),
            ("redirect_uri", &format!("https://{host}/_auth/callback")),
        ])
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(response) => match response.json().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, endpoint = %oauth.token_url, "Undecodable token response");
                return unauthorized();
            }
        },
        Err(e) => {
            error!(error = %e, endpoint = %oauth.token_url, "OAuth code exchange failed");
            return unauthorized();
        }
    };

    let userinfo: Userinfo = match http
        .get(&oauth.userinfo_url)
        .bearer_auth(&token.access_token)
        .send()
        .await
        .and_then(|r| r.error_for_status())
    {
        Ok(response) => match response.json().await {
            Ok(userinfo) => userinfo,
            Err(e) => {
                error!(error = %e, endpoint = %oauth.userinfo_url, "Undecodable userinfo response");
                return unauthorized();
            }
        },
        Err(e) => {
            error!(error = %e, endpoint = %oauth.userinfo_url, "Userinfo request failed");
            return unauthorized();
        }
    };

    let session_id = match sessions::create(db, &userinfo.email, host).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "Failed to create session");
            return unauthorized();
        }
    };

    (
        StatusCode::SEE_OTHER,
        AppendHeaders([
            ("location", store.redirect),
            ("set-cookie", sessions::build_cookie(&session_id)),
            ("set-cookie", clear_store_cookie()),
        ]),
    )
        .into_response()
}

/// GET /_auth/logout — drop the session row, expire the cookie, and send
/// the browser to the `redirect` query parameter or the host root.
pub async fn logout(db: &Database, uri: &Uri, headers: &HeaderMap) -> Response {
    if let Some(id) = super::cookie_value(headers, sessions::SESSION_COOKIE) {
        if let Err(e) = sessions::delete(db, id).await {
            error!(error = %e, "Failed to delete session on logout");
        }
    }

    let redirect = query_param(uri, "redirect").unwrap_or_else(|| "/".to_string());

    (
        StatusCode::SEE_OTHER,
        AppendHeaders([
            ("location", redirect),
            ("set-cookie", sessions::clear_cookie()),
        ]),
    )
        .into_response()
}

fn unauthorized() -> Response {
    StatusCode::UNAUTHORIZED.into_response()
}

fn build_store_cookie(store_json: &str) -> String {
    let encoded = Cookie::new(OAUTH_COOKIE, store_json);
    format!(
        "{}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={OAUTH_COOKIE_TTL_SECS}",
        encoded.encoded()
    )
}

fn clear_store_cookie() -> String {
    format!("{OAUTH_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0")
}

fn read_store(headers: &HeaderMap) -> Option<OauthStore> {
    let raw = headers.get("cookie")?.to_str().ok()?;
    let pair = raw
        .split(';')
        .map(str::trim)
        .find(|c| c.starts_with(&format!("{OAUTH_COOKIE}=")))?;
    let cookie = Cookie::parse_encoded(pair).ok()?;
    serde_json::from_str(cookie.value()).ok()
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
