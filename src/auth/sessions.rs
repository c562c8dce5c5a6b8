use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::db::Database;

pub const SESSION_COOKIE: &str = "smallweb-session";

const SESSION_TTL_DAYS: i64 = 14;
const REFRESH_WINDOW_DAYS: i64 = 7;

/// A server-issued login session. The id is opaque, collision-resistant
/// random, and stored hashed at rest; the presented host must match the
/// stored domain for the session to be visible at all.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub email: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Within the sliding window: the next authenticated hit re-arms the
    /// session to a full TTL.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now < Duration::days(REFRESH_WINDOW_DAYS)
    }
}

pub fn session_ttl() -> Duration {
    Duration::days(SESSION_TTL_DAYS)
}

/// Generate a random session id.
pub fn generate_session_id() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

fn hash_id(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Create a session for `email` bound to the originating host. Returns the
/// plaintext id — the only time it exists outside the cookie.
pub async fn create(db: &Database, email: &str, domain: &str) -> Result<String> {
    let id = generate_session_id();
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO sessions (id_hash, email, domain, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(hash_id(&id))
    .bind(email)
    .bind(domain)
    .bind(now)
    .bind(now + session_ttl())
    .execute(&db.pool)
    .await
    .context("Failed to create session")?;

    Ok(id)
}

/// Fetch a session by presented id and host. Returns `None` on unknown id,
/// domain mismatch (cross-host cookie replay), or expiry — an expired row
/// is deleted on discovery.
pub async fn get(db: &Database, id: &str, domain: &str) -> Result<Option<Session>> {
    let row = sqlx::query_as::<_, Session>(
        "SELECT email, domain, created_at, expires_at FROM sessions WHERE id_hash = ?",
    )
    .bind(hash_id(id))
    .fetch_optional(&db.pool)
    .await
    .context("Failed to query session")?;

    let session = match row {
        Some(s) => s,
        None => return Ok(None),
    };

    if session.domain != domain {
        return Ok(None);
    }

    if Utc::now() >= session.expires_at {
        delete(db, id).await?;
        return Ok(None);
    }

    Ok(Some(session))
}

/// Re-arm a session's expiry in place. A single UPDATE keeps the sliding
/// extension atomic with respect to concurrent hits.
pub async fn extend(db: &Database, id: &str, new_expiry: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE sessions SET expires_at = ? WHERE id_hash = ?")
        .bind(new_expiry)
        .bind(hash_id(id))
        .execute(&db.pool)
        .await
        .context("Failed to extend session")?;
    Ok(())
}

/// Delete a session (logout or expiry discovery).
pub async fn delete(db: &Database, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE id_hash = ?")
        .bind(hash_id(id))
        .execute(&db.pool)
        .await
        .context("Failed to delete session")?;
    Ok(())
}

/// Sweep expired rows. Runs hourly in the background; expiry is also
/// enforced at read time.
pub async fn cleanup_expired(db: &Database) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
        .bind(Utc::now())
        .execute(&db.pool)
        .await
        .context("Failed to clean up sessions")?;
    Ok(result.rows_affected())
}

/// Set-Cookie value for a fresh session.
pub fn build_cookie(id: &str) -> String {
    format!(
        "{SESSION_COOKIE}={id}; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age={}",
        SESSION_TTL_DAYS * 24 * 3600
    )
}

/// Set-Cookie value clearing the session cookie.
pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Secure; SameSite=Lax; Max-Age=0")
}
