use crate::error::{DigitError, Result};
use std::env;
use std::path::PathBuf;

pub const DEFAULT_DATABASE_URL: &str = "file:data/digits.db";
pub const DEFAULT_MODEL_PATH: &str = "model/model.onnx";
pub const DEFAULT_CORS_ORIGINS: &str = r#"["http://localhost:5173"]"#;
pub const DEFAULT_API_PREFIX: &str = "/api";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Service settings, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database: DatabaseTarget,
    pub model_path: PathBuf,
    pub cors_origins: CorsOrigins,
    pub api_prefix: String,
    pub invert_strokes: bool,
    pub metrics_enabled: bool,
    pub log_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests don't touch process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let auth_token = lookup("DATABASE_AUTH_TOKEN");

        Ok(Self {
            database: DatabaseTarget::parse(&database_url, auth_token)?,
            model_path: PathBuf::from(
                lookup("MODEL_PATH").unwrap_or_else(|| DEFAULT_MODEL_PATH.to_string()),
            ),
            cors_origins: CorsOrigins::parse(
                &lookup("CORS_ORIGINS").unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string()),
            )?,
            api_prefix: normalize_prefix(
                &lookup("API_PREFIX").unwrap_or_else(|| DEFAULT_API_PREFIX.to_string()),
            ),
            invert_strokes: parse_bool("INVERT_STROKES", lookup("INVERT_STROKES"), true)?,
            metrics_enabled: parse_bool("METRICS_ENABLED", lookup("METRICS_ENABLED"), true)?,
            log_dir: PathBuf::from(lookup("LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())),
        })
    }
}

/// Where drawings are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseTarget {
    /// SQLite file opened with the embedded libSQL engine.
    Local { path: PathBuf },
    /// Turso / sqld server.
    Remote { url: String, auth_token: String },
}

impl DatabaseTarget {
    /// Accepts `file:`/`sqlite://` URLs or bare paths for local databases and
    /// `libsql://`, `http(s)://`, `ws(s)://` URLs for remote ones.
    pub fn parse(url: &str, auth_token: Option<String>) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DigitError::Config("DATABASE_URL is empty".to_string()));
        }

        const REMOTE_SCHEMES: [&str; 5] = ["libsql://", "http://", "https://", "ws://", "wss://"];
        if REMOTE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
            let auth_token = auth_token.ok_or_else(|| {
                DigitError::Config(
                    "DATABASE_AUTH_TOKEN must be set for a remote DATABASE_URL".to_string(),
                )
            })?;
            return Ok(DatabaseTarget::Remote {
                url: url.to_string(),
                auth_token,
            });
        }

        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("file://"))
            .or_else(|| url.strip_prefix("file:"))
            .unwrap_or(url);

        if path.is_empty() || path.contains("://") {
            return Err(DigitError::Config(format!("Unsupported DATABASE_URL '{url}'")));
        }

        Ok(DatabaseTarget::Local {
            path: PathBuf::from(path),
        })
    }
}

/// Origins allowed to call the API from a browser.
#[derive(Debug, Clone, PartialEq)]
pub enum CorsOrigins {
    Any,
    List(Vec<String>),
}

impl CorsOrigins {
    /// Accepts a JSON array (`["http://a", "http://b"]`), a comma-separated
    /// list, or `*`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let origins: Vec<String> = if raw.starts_with('[') {
            serde_json::from_str(raw)
                .map_err(|e| DigitError::Config(format!("CORS_ORIGINS is not a JSON string array: {e}")))?
        } else {
            raw.split(',').map(|s| s.trim().to_string()).collect()
        };

        let origins: Vec<String> = origins.into_iter().filter(|s| !s.is_empty()).collect();
        if origins.iter().any(|o| o == "*") {
            return Ok(CorsOrigins::Any);
        }
        Ok(CorsOrigins::List(origins))
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_bool(key: &str, value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(DigitError::Config(format!("{key} must be a boolean, got '{other}'"))),
        },
    }
}
