use std::env;
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use dotenv::dotenv;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3333";
const DEFAULT_SESSION_TTL_HOURS: i64 = 12;
const MAX_SESSION_TTL_HOURS: i64 = 24 * 365;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Server settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub admin_username: String,
    pub admin_password: String,
    pub session_ttl_hours: i64,
    pub max_upload_bytes: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL env var must be set!")?;

        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("BIND_ADDR must be a socket address, e.g. 0.0.0.0:3333")?;

        let session_ttl_hours = match env::var("SESSION_TTL_HOURS") {
            Ok(v) => parse_session_ttl_hours(&v)?,
            Err(_) => DEFAULT_SESSION_TTL_HOURS,
        };

        let max_upload_bytes = match env::var("MAX_UPLOAD_BYTES") {
            Ok(v) => v.parse().context("MAX_UPLOAD_BYTES must be an integer")?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };

        Ok(Settings {
            database_url,
            bind_addr,
            admin_username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            admin_password: env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "1234".to_string()),
            session_ttl_hours,
            max_upload_bytes,
        })
    }

    /// Settings for tests and embedded use; only the database differs from the defaults.
    pub fn with_database(database_url: &str) -> Self {
        Settings {
            database_url: database_url.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3333)),
            admin_username: "admin".to_string(),
            admin_password: "1234".to_string(),
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// Session lifetime in hours, between 1 and one year.
fn parse_session_ttl_hours(value: &str) -> Result<i64> {
    let hours: i64 = value
        .trim()
        .parse()
        .context("SESSION_TTL_HOURS must be an integer")?;
    if !(1..=MAX_SESSION_TTL_HOURS).contains(&hours) {
        bail!(
            "SESSION_TTL_HOURS must be between 1 and {}, got {}",
            MAX_SESSION_TTL_HOURS,
            hours
        );
    }
    Ok(hours)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ttl_hours_range() {
        assert_eq!(parse_session_ttl_hours("12").unwrap(), 12);
        assert_eq!(parse_session_ttl_hours(" 1 ").unwrap(), 1);
        assert_eq!(parse_session_ttl_hours("8760").unwrap(), MAX_SESSION_TTL_HOURS);

        assert!(parse_session_ttl_hours("0").is_err());
        assert!(parse_session_ttl_hours("-5").is_err());
        assert!(parse_session_ttl_hours("8761").is_err());
        assert!(parse_session_ttl_hours("9223372036854775807").is_err());
        assert!(parse_session_ttl_hours("twelve").is_err());
    }
}
