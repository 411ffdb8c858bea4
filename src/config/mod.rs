//! Runtime configuration: environment variables with an optional TOML
//! overlay, covering the knobs named in spec §6 — storage backend
//! selector, Redis address, CORS allow-list, API key, rate limit
//! window/max, listen port — plus the container-job driver defaults
//! (namespace, service account, image-pull secrets, resource requests,
//! active-deadline, ttl-after-finished, backoff).
//!
//! Grounded on the teacher's `tooling::config::env` helpers
//! (`get_env_or`/`get_env_parse_or`) generalized from a single-value
//! lookup into a full `Config::load()` that also accepts a TOML file for
//! the settings that don't belong in the process environment.

mod env;

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
pub use env::{get_env, get_env_or, get_env_parse_or};

/// Which `RunStore` backend to construct at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

impl StorageBackend {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "memory" => Ok(StorageBackend::Memory),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(CoreError::Validation(format!(
                "unknown storage backend: {other} (expected memory|sqlite)"
            ))),
        }
    }
}

/// Token-bucket rate limit applied per identity (API key or client IP),
/// exempting health/ready/metrics/CORS-preflight (spec §4.6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_ms: 60_000, max_requests: 120 }
    }
}

/// Container-job driver defaults, applied when a node's run mode is
/// `k8s` and the `NodeSpec` itself doesn't override them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sDriverConfig {
    pub namespace: String,
    pub service_account: Option<String>,
    pub image_pull_secrets: Vec<String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub active_deadline_secs: i64,
    pub ttl_seconds_after_finished: i32,
    pub backoff_limit: u32,
}

impl Default for K8sDriverConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            service_account: None,
            image_pull_secrets: Vec::new(),
            cpu_request: "100m".to_string(),
            memory_request: "128Mi".to_string(),
            cpu_limit: "1".to_string(),
            memory_limit: "512Mi".to_string(),
            active_deadline_secs: 900,
            ttl_seconds_after_finished: 300,
            backoff_limit: 0,
        }
    }
}

/// Top-level process configuration, assembled once at startup and passed
/// explicitly to the components that need it (spec §9: no ambient
/// globals).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub storage_backend: StorageBackend,
    pub sqlite_database_url: String,
    pub redis_url: Option<String>,
    pub cors_allowed_origins: Vec<String>,
    pub api_key: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub max_parallel_nodes: usize,
    pub sse_heartbeat_interval: Duration,
    pub sse_default_replay: u32,
    pub sse_max_replay: u32,
    pub k8s: K8sDriverConfig,
}

impl Config {
    /// Load configuration from the process environment. Every field has a
    /// sane local-dev default so the server can start with nothing set.
    pub fn load() -> Result<Self> {
        let host = get_env_or("HOST", "127.0.0.1")?;
        let port: u16 = get_env_parse_or("PORT", 8080u16)?;

        let storage_backend = StorageBackend::parse(&get_env_or("STORAGE_BACKEND", "memory")?)?;

        let cors_allowed_origins = get_env("CORS_ALLOWED_ORIGINS")?
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let rate_limit = RateLimitConfig {
            window_ms: get_env_parse_or("RATE_LIMIT_WINDOW_MS", 60_000u64)?,
            max_requests: get_env_parse_or("RATE_LIMIT_MAX", 120u32)?,
        };

        let k8s = K8sDriverConfig {
            namespace: get_env_or("K8S_NAMESPACE", "default")?,
            service_account: get_env("K8S_SERVICE_ACCOUNT")?,
            image_pull_secrets: get_env("K8S_IMAGE_PULL_SECRETS")?
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            cpu_request: get_env_or("K8S_CPU_REQUEST", "100m")?,
            memory_request: get_env_or("K8S_MEMORY_REQUEST", "128Mi")?,
            cpu_limit: get_env_or("K8S_CPU_LIMIT", "1")?,
            memory_limit: get_env_or("K8S_MEMORY_LIMIT", "512Mi")?,
            active_deadline_secs: get_env_parse_or("K8S_ACTIVE_DEADLINE_SECS", 900i64)?,
            ttl_seconds_after_finished: get_env_parse_or("K8S_TTL_SECONDS_AFTER_FINISHED", 300i32)?,
            backoff_limit: get_env_parse_or("K8S_BACKOFF_LIMIT", 0u32)?,
        };

        Ok(Self {
            listen_addr: format!("{host}:{port}"),
            storage_backend,
            sqlite_database_url: get_env_or("SQLITE_DATABASE_URL", "sqlite://mentatlab.db")?,
            redis_url: get_env("REDIS_URL")?,
            cors_allowed_origins,
            api_key: get_env("API_KEY")?,
            rate_limit,
            max_parallel_nodes: get_env_parse_or(
                "MAX_PARALLEL_NODES",
                std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            )?,
            sse_heartbeat_interval: Duration::from_secs(get_env_parse_or("SSE_HEARTBEAT_SECS", 15u64)?),
            sse_default_replay: get_env_parse_or("SSE_DEFAULT_REPLAY", 10u32)?,
            sse_max_replay: get_env_parse_or("SSE_MAX_REPLAY", 100u32)?,
            k8s,
        })
    }

    /// `true` if `origin` is allowed by the CORS allow-list. An empty
    /// list means "allow any", matching the WebSocket Hub's origin-check
    /// convention in spec §4.5.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_allowed_origins.is_empty() {
            return true;
        }
        let allowed: HashSet<&str> = self.cors_allowed_origins.iter().map(String::as_str).collect();
        allowed.contains(origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_backend_parses_known_values() {
        assert_eq!(StorageBackend::parse("memory").unwrap(), StorageBackend::Memory);
        assert_eq!(StorageBackend::parse("sqlite").unwrap(), StorageBackend::Sqlite);
        assert!(StorageBackend::parse("postgres").is_err());
    }

    #[test]
    fn empty_cors_allow_list_allows_any_origin() {
        let config = Config {
            listen_addr: "127.0.0.1:8080".into(),
            storage_backend: StorageBackend::Memory,
            sqlite_database_url: "sqlite::memory:".into(),
            redis_url: None,
            cors_allowed_origins: Vec::new(),
            api_key: None,
            rate_limit: RateLimitConfig::default(),
            max_parallel_nodes: 4,
            sse_heartbeat_interval: Duration::from_secs(15),
            sse_default_replay: 10,
            sse_max_replay: 100,
            k8s: K8sDriverConfig::default(),
        };
        assert!(config.is_origin_allowed("https://anything.example"));
    }

    #[test]
    fn non_empty_cors_allow_list_is_exact_match() {
        let mut config = Config {
            listen_addr: "127.0.0.1:8080".into(),
            storage_backend: StorageBackend::Memory,
            sqlite_database_url: "sqlite::memory:".into(),
            redis_url: None,
            cors_allowed_origins: vec!["https://app.example".into()],
            api_key: None,
            rate_limit: RateLimitConfig::default(),
            max_parallel_nodes: 4,
            sse_heartbeat_interval: Duration::from_secs(15),
            sse_default_replay: 10,
            sse_max_replay: 100,
            k8s: K8sDriverConfig::default(),
        };
        assert!(config.is_origin_allowed("https://app.example"));
        assert!(!config.is_origin_allowed("https://evil.example"));
        config.cors_allowed_origins.clear();
        assert!(config.is_origin_allowed("https://evil.example"));
    }
}
