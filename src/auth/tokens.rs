use anyhow::{bail, Context, Result};
use rand::RngExt;
use uuid::Uuid;

use crate::db::Database;

/// A stored API token. The secret itself is never stored — only a bcrypt
/// hash, compared with bcrypt's constant-time check.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Token {
    pub public_id: String,
    pub hash: String,
    pub description: Option<String>,
}

/// Split a presented credential of shape `<publicId>.<secret>` on the first
/// `.`; both sides must be non-empty.
pub fn parse(credential: &str) -> Option<(&str, &str)> {
    let (public_id, secret) = credential.split_once('.')?;
    (!public_id.is_empty() && !secret.is_empty()).then_some((public_id, secret))
}

pub async fn get(db: &Database, public_id: &str) -> Result<Option<Token>> {
    sqlx::query_as::<_, Token>(
        "SELECT public_id, hash, description FROM tokens WHERE public_id = ?",
    )
    .bind(public_id)
    .fetch_optional(&db.pool)
    .await
    .context("Failed to query token")
}

/// Verify a presented credential. Every failure mode collapses into an
/// error — callers answer 401 without leaking which step failed.
pub async fn verify(db: &Database, credential: &str) -> Result<Token> {
    let (public_id, secret) = parse(credential).context("Malformed token credential")?;

    let token = get(db, public_id)
        .await?
        .context("Unknown token public id")?;

    if !bcrypt::verify(secret, &token.hash).context("Failed to verify token hash")? {
        bail!("Token secret mismatch");
    }

    Ok(token)
}

/// Provision a new token. Returns the plaintext `<publicId>.<secret>`
/// credential — the only time the secret exists outside the caller's hands.
pub async fn create(db: &Database, description: Option<&str>) -> Result<String> {
    let public_id = Uuid::new_v4().to_string();
    let secret_bytes: [u8; 16] = rand::rng().random();
    let secret = hex::encode(secret_bytes);
    let hash = bcrypt::hash(&secret, bcrypt::DEFAULT_COST).context("Failed to hash secret")?;

    sqlx::query("INSERT INTO tokens (public_id, hash, description) VALUES (?, ?, ?)")
        .bind(&public_id)
        .bind(&hash)
        .bind(description)
        .execute(&db.pool)
        .await
        .context("Failed to create token")?;

    Ok(format!("{public_id}.{secret}"))
}
