//! Controller configuration from `KANARY_*` environment variables
//!
//! Every value has a default. A value that fails to parse falls back to the
//! default with a warning rather than aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_HEALTH_PORT: &str = "KANARY_HEALTH_PORT";
pub const ENV_CONCURRENCY: &str = "KANARY_CONCURRENCY";
pub const ENV_ANALYTICS_ENDPOINT: &str = "KANARY_ANALYTICS_ENDPOINT";
pub const ENV_ANALYTICS_TIMEOUT_SECONDS: &str = "KANARY_ANALYTICS_TIMEOUT_SECONDS";
pub const ENV_METRICS_FILE: &str = "KANARY_METRICS_FILE";
pub const ENV_CLEANUP_DELETE_CANDIDATES: &str = "KANARY_CLEANUP_DELETE_CANDIDATES";
pub const ENV_READINESS_POLL_SECONDS: &str = "KANARY_READINESS_POLL_SECONDS";
pub const ENV_READINESS_TIMEOUT_SECONDS: &str = "KANARY_READINESS_TIMEOUT_SECONDS";
pub const ENV_RECONCILE_TIMEOUT_SECONDS: &str = "KANARY_RECONCILE_TIMEOUT_SECONDS";

const DEFAULT_HEALTH_PORT: u16 = 8080;
const DEFAULT_CONCURRENCY: u16 = 4;
const DEFAULT_ANALYTICS_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_READINESS_POLL_SECONDS: u64 = 3;
const DEFAULT_READINESS_TIMEOUT_SECONDS: u64 = 15;
const DEFAULT_RECONCILE_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Port for /healthz, /readyz and /metrics
    pub health_port: u16,
    /// Number of experiments reconciled concurrently
    pub concurrency: u16,
    /// Assessment service URL; `None` holds the current split each iteration
    pub analytics_endpoint: Option<String>,
    pub analytics_timeout: Duration,
    /// JSON file with metric definitions synced into experiment status
    pub metrics_file: Option<PathBuf>,
    /// Delete candidate Deployments when a cleanup experiment is finalized
    pub cleanup_delete_candidates: bool,
    pub readiness_poll_interval: Duration,
    pub readiness_timeout: Duration,
    /// Deadline for one reconciliation step; an overrunning step is abandoned and requeued
    pub reconcile_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            concurrency: DEFAULT_CONCURRENCY,
            analytics_endpoint: None,
            analytics_timeout: Duration::from_secs(DEFAULT_ANALYTICS_TIMEOUT_SECONDS),
            metrics_file: None,
            cleanup_delete_candidates: false,
            readiness_poll_interval: Duration::from_secs(DEFAULT_READINESS_POLL_SECONDS),
            readiness_timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECONDS),
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECONDS),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom key lookup (used by tests)
    pub fn from_env_with<F>(get_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let non_empty = |key: &str| get_env(key).filter(|v| !v.trim().is_empty());

        Self {
            health_port: parse_or(&get_env, ENV_HEALTH_PORT, defaults.health_port),
            concurrency: parse_or(&get_env, ENV_CONCURRENCY, defaults.concurrency),
            analytics_endpoint: non_empty(ENV_ANALYTICS_ENDPOINT),
            analytics_timeout: Duration::from_secs(parse_or(
                &get_env,
                ENV_ANALYTICS_TIMEOUT_SECONDS,
                DEFAULT_ANALYTICS_TIMEOUT_SECONDS,
            )),
            metrics_file: non_empty(ENV_METRICS_FILE).map(PathBuf::from),
            cleanup_delete_candidates: get_env(ENV_CLEANUP_DELETE_CANDIDATES)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.cleanup_delete_candidates),
            readiness_poll_interval: Duration::from_secs(parse_or(
                &get_env,
                ENV_READINESS_POLL_SECONDS,
                DEFAULT_READINESS_POLL_SECONDS,
            )),
            readiness_timeout: Duration::from_secs(parse_or(
                &get_env,
                ENV_READINESS_TIMEOUT_SECONDS,
                DEFAULT_READINESS_TIMEOUT_SECONDS,
            )),
            reconcile_timeout: Duration::from_secs(parse_or(
                &get_env,
                ENV_RECONCILE_TIMEOUT_SECONDS,
                DEFAULT_RECONCILE_TIMEOUT_SECONDS,
            )),
        }
    }
}

fn parse_or<F, T>(get_env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match get_env(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key = key, value = %raw, default = %default, "Invalid config value, using default");
                default
            }
        },
    }
}
