use crate::error::{AppError, AppResult};
use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use axum::http::HeaderMap;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const MIN_PASSWORD_LEN: usize = 6;

/// Argon2id with default cost; a non-empty pepper is mixed in as the secret.
fn hasher(pepper: &str) -> Result<Argon2<'_>, password_hash::Error> {
    if pepper.is_empty() {
        return Ok(Argon2::default());
    }
    Ok(Argon2::new_with_secret(
        pepper.as_bytes(),
        Algorithm::Argon2id,
        Version::V0x13,
        Params::default(),
    )?)
}

/// PHC string (`$argon2id$v=19$...`) with a fresh random salt.
pub fn hash_password(password: &str, pepper: &str) -> Result<String, password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(hasher(pepper)?
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

/// `Ok(false)` on a wrong password; `Err` only for an unreadable stored hash.
pub fn verify_password(
    password: &str,
    pepper: &str,
    stored: &str,
) -> Result<bool, password_hash::Error> {
    let parsed = PasswordHash::new(stored)?;
    match hasher(pepper)?.verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Sessions are stored under this digest, never the raw bearer token.
pub fn session_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn new_session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn validate_username(username: &str) -> AppResult<()> {
    let len = username.chars().count();
    if !(3..=30).contains(&len) {
        return Err(AppError::Validation(
            "username must be 3-30 characters".into(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(
            "username may only contain letters, digits and underscores".into(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Bearer token from the Authorization header, if one was sent.
pub fn extract_bearer(headers: &HeaderMap) -> AppResult<Option<String>> {
    let Some(raw) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    else {
        return Ok(None);
    };
    let Some(token) = raw.strip_prefix("Bearer ") else {
        return Err(AppError::Validation("invalid auth header".into()));
    };
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::Validation("invalid token".into()));
    }
    Ok(Some(token.to_string()))
}
