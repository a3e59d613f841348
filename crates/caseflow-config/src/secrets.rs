//! Store secret resolution.
//!
//! # Contract
//! - Config YAML stores only the env var NAME holding the database URL
//!   (`store.database_url_env`, default `CASEFLOW_DATABASE_URL`).
//! - Callers resolve once at startup and pass [`ResolvedStore`] into
//!   constructors; nothing else reads the environment for it.
//! - `Debug` redacts the URL and errors mention only the variable NAME.
//!
//! # Backend enforcement
//! - `postgres`: the named variable is required.
//! - `memory`: nothing is required; a URL, if present, is ignored.

use anyhow::{bail, Result};
use serde_json::Value;

pub const DEFAULT_DATABASE_URL_ENV: &str = "CASEFLOW_DATABASE_URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store; state is lost on restart.
    Memory,
    Postgres,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::Postgres => "postgres",
        }
    }
}

#[derive(Clone)]
pub struct ResolvedStore {
    pub backend: StoreBackend,
    /// The env var the URL was (or would be) read from.
    pub database_url_env: String,
    pub database_url: Option<String>,
}

impl std::fmt::Debug for ResolvedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedStore")
            .field("backend", &self.backend)
            .field("database_url_env", &self.database_url_env)
            .field("database_url", &self.database_url.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

fn read_str_at(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the store backend and its connection URL.
///
/// `store.backend` defaults to `postgres` when the URL variable is set and to
/// `memory` otherwise.
pub fn resolve_store_secrets(config_json: &Value) -> Result<ResolvedStore> {
    let database_url_env = read_str_at(config_json, "/store/database_url_env")
        .unwrap_or_else(|| DEFAULT_DATABASE_URL_ENV.to_string());
    let database_url = resolve_env(&database_url_env);

    let backend = match read_str_at(config_json, "/store/backend")
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("memory") => StoreBackend::Memory,
        Some("postgres") => StoreBackend::Postgres,
        None if database_url.is_some() => StoreBackend::Postgres,
        None => StoreBackend::Memory,
        Some(other) => bail!(
            "STORE_UNKNOWN_BACKEND: unrecognised backend '{}'; expected one of: memory | postgres",
            other
        ),
    };

    if backend == StoreBackend::Postgres && database_url.is_none() {
        bail!(
            "SECRETS_MISSING backend=postgres: required env var '{}' (database url) is not set or empty",
            database_url_env
        );
    }

    Ok(ResolvedStore {
        backend,
        database_url_env,
        database_url,
    })
}
