use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;
use warp::{Filter, Rejection};

use crate::config::Settings;
use crate::db;
use crate::error::ApiError;
use crate::models::{Role, Session};

pub const SESSION_COOKIE: &str = "session";

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Picks the session token from an `Authorization: Bearer` header, falling back to the cookie.
pub fn token_from(authorization: Option<&str>, cookie: Option<&str>) -> Option<String> {
    let bearer = authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());

    bearer
        .or_else(|| cookie.map(str::trim).filter(|t| !t.is_empty()))
        .map(String::from)
}

pub fn session_cookie(token: &str, ttl_hours: i64) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        ttl_hours * 3600
    )
}

pub fn expired_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

/// Raw token of the caller, if any. Used by logout, which must not fail.
pub fn optional_token() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::cookie::optional::<String>(SESSION_COOKIE))
        .map(|auth: Option<String>, cookie: Option<String>| {
            token_from(auth.as_deref(), cookie.as_deref())
        })
}

/// Route guard: resolves the caller's session and checks its role.
pub fn with_role(
    pool: SqlitePool,
    role: Role,
) -> impl Filter<Extract = (Session,), Error = Rejection> + Clone {
    optional_token()
        .and(warp::any().map(move || pool.clone()))
        .and_then(move |token: Option<String>, pool: SqlitePool| async move {
            authorize(&pool, token, role)
                .await
                .map_err(warp::reject::custom)
        })
}

async fn authorize(pool: &SqlitePool, token: Option<String>, role: Role) -> Result<Session, ApiError> {
    let token = token.ok_or(ApiError::Unauthorized)?;
    let session = db::read_session(pool, &token)
        .await?
        .ok_or(ApiError::Unauthorized)?;

    if session.role != role {
        warn!(username = %session.username, required = %role, "role mismatch");
        return Err(ApiError::Forbidden);
    }
    Ok(session)
}

/// Creates the configured admin account when no admin exists yet.
pub async fn seed_admin(pool: &SqlitePool, settings: &Settings) -> anyhow::Result<()> {
    if db::count_users_with_role(pool, Role::Admin).await? > 0 {
        return Ok(());
    }

    let hash = hash_password(&settings.admin_password)
        .map_err(|e| anyhow::anyhow!("hashing admin password: {}", e))?;
    db::write_user(pool, &settings.admin_username, &hash, Role::Admin).await?;
    info!(username = %settings.admin_username, "seeded admin account");

    Ok(())
}
