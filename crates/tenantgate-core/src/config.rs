// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tenantgate, loaded from `TENANTGATE_*` environment variables.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL or file path.
    pub database_url: String,
    /// HTTP listen address.
    pub http_addr: SocketAddr,
    /// Primary public base URL.
    pub base_url: String,
    /// Per-region base URLs (`region -> url`).
    pub region_base_urls: BTreeMap<String, String>,
    /// HS256 secret for bearer and app-session tokens.
    pub jwt_secret: Option<String>,
    /// Execution engine base URL.
    pub execution_url: Option<String>,
    /// CAPTCHA site-verify backend.
    pub captcha: Option<CaptchaSettings>,
    /// Dispatcher settings.
    pub runtime: RuntimeSettings,
    /// Access controller settings.
    pub access: AccessSettings,
    /// Billing settings.
    pub billing: BillingSettings,
    /// Job pipeline settings.
    pub jobs: JobSettings,
    /// VM pool settings.
    pub vm: VmSettings,
    /// Per-operation deadlines.
    pub timeouts: Timeouts,
}

/// Where `allowed_origins` is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginCheck {
    /// Entry, schema, execute and VM dispatch.
    All,
    /// Only execute and VM dispatch.
    ExecuteOnly,
}

impl FromStr for OriginCheck {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "execute_only" | "execute" => Ok(Self::ExecuteOnly),
            other => Err(format!("unknown origin check scope '{other}'")),
        }
    }
}

/// JavaScript engine that boots isolates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEngineKind {
    /// Embedded boa interpreter.
    Script,
    /// No engine; VM dispatch answers 503.
    Disabled,
}

impl FromStr for VmEngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script" | "boa" | "js" => Ok(Self::Script),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown VM engine '{other}'")),
        }
    }
}

/// CAPTCHA backend credentials.
#[derive(Debug, Clone)]
pub struct CaptchaSettings {
    /// Site-verify endpoint.
    pub verify_url: String,
    /// Server-side secret.
    pub secret: String,
}

/// Runtime dispatcher settings.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// `max-age` / `s-maxage` of cacheable schema responses.
    pub schema_cache_ttl: Duration,
    /// `stale-while-revalidate` of cacheable schema responses.
    pub schema_stale_ttl: Duration,
    /// Lifetime of idempotency records.
    pub idempotency_ttl: Duration,
    /// Scope of the origin gate.
    pub origin_check: OriginCheck,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            schema_cache_ttl: Duration::from_secs(60),
            schema_stale_ttl: Duration::from_secs(120),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            origin_check: OriginCheck::All,
        }
    }
}

/// Access controller settings.
#[derive(Debug, Clone)]
pub struct AccessSettings {
    /// Inactivity TTL of anonymous sessions.
    pub anonymous_session_ttl: Duration,
    /// Inactivity TTL of authenticated sessions.
    pub authenticated_session_ttl: Duration,
    /// Rate window used when a workspace sets none.
    pub default_window: Duration,
    /// Soft threshold used when a workspace sets none.
    pub default_soft_limit: u32,
    /// Hard threshold used when a workspace sets none.
    pub default_hard_limit: u32,
    /// Sliding window for consecutive strikes.
    pub strike_window: Duration,
    /// Consecutive strikes that block a session.
    pub session_ban_strikes: u32,
    /// Consecutive strikes that ban an IP.
    pub ip_ban_strikes: u32,
    /// Length of automatic blocks.
    pub ban_cooldown: Duration,
    /// Age after which access events are deleted.
    pub event_retention: Duration,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            anonymous_session_ttl: Duration::from_secs(24 * 3600),
            authenticated_session_ttl: Duration::from_secs(30 * 24 * 3600),
            default_window: Duration::from_secs(60),
            default_soft_limit: 30,
            default_hard_limit: 60,
            strike_window: Duration::from_secs(300),
            session_ban_strikes: 3,
            ip_ban_strikes: 6,
            ban_cooldown: Duration::from_secs(3600),
            event_retention: Duration::from_secs(90 * 24 * 3600),
        }
    }
}

/// Billing settings.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    /// Currency of prices and budgets.
    pub currency: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSettings {
    /// Delay after the first failed attempt.
    pub base: Duration,
    /// Upper bound of any delay.
    pub max: Duration,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

/// Job pipeline settings.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Root directory of the object store.
    pub object_store_dir: PathBuf,
    /// Export kill switch.
    pub exports_enabled: bool,
    /// How long completed artifacts stay downloadable.
    pub export_retention: Duration,
    /// Idle poll interval of workers.
    pub poll_interval: Duration,
    /// Lease length of a claimed task.
    pub visibility_timeout: Duration,
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    /// Retry backoff.
    pub backoff: BackoffSettings,
    /// Interval of the export reaper, subscription scheduler and retention sweep.
    pub maintenance_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            object_store_dir: PathBuf::from(".data/objects"),
            exports_enabled: true,
            export_retention: Duration::from_secs(7 * 24 * 3600),
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
            max_attempts: 5,
            backoff: BackoffSettings::default(),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// VM pool settings.
#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Engine that runs application code.
    pub engine: VmEngineKind,
    /// Maximum number of warm isolates.
    pub max_isolates: usize,
    /// Idle time after which an isolate is evicted.
    pub idle_ttl: Duration,
    /// Per-isolate memory quota.
    pub memory_limit_bytes: u64,
    /// Per-isolate cumulative CPU quota.
    pub cpu_limit: Duration,
    /// Hosts isolates may fetch from.
    pub fetch_allowlist: Vec<String>,
    /// Directory of the per-workspace application databases.
    pub db_dir: PathBuf,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            engine: VmEngineKind::Script,
            max_isolates: 64,
            idle_ttl: Duration::from_secs(300),
            memory_limit_bytes: 128 * 1024 * 1024,
            cpu_limit: Duration::from_secs(10),
            fetch_allowlist: Vec::new(),
            db_dir: PathBuf::from(".data/workspace-db"),
        }
    }
}

/// Per-operation deadlines injected at the boundary.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Runtime entry.
    pub entry: Duration,
    /// Runtime schema.
    pub schema: Duration,
    /// Runtime execute.
    pub execute: Duration,
    /// VM request handling.
    pub vm: Duration,
    /// Job claim.
    pub job_claim: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            entry: Duration::from_secs(2),
            schema: Duration::from_secs(5),
            execute: Duration::from_secs(30),
            vm: Duration::from_secs(20),
            job_claim: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Configuration with every optional setting at its default.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            base_url: "http://localhost:8080".to_string(),
            region_base_urls: BTreeMap::new(),
            jwt_secret: None,
            execution_url: None,
            captcha: None,
            runtime: RuntimeSettings::default(),
            access: AccessSettings::default(),
            billing: BillingSettings::default(),
            jobs: JobSettings::default(),
            vm: VmSettings::default(),
            timeouts: Timeouts::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env_opt("TENANTGATE_DATABASE_URL")
            .ok_or(ConfigError::Missing("TENANTGATE_DATABASE_URL"))?;

        let http_addr = env_parse("TENANTGATE_HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;
        let base_url =
            env_opt("TENANTGATE_BASE_URL").unwrap_or_else(|| "http://localhost:8080".to_string());

        let mut region_base_urls = BTreeMap::new();
        if let Some(raw) = env_opt("TENANTGATE_REGION_BASE_URLS") {
            for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (region, url) = pair.split_once('=').ok_or_else(|| {
                    ConfigError::Invalid("TENANTGATE_REGION_BASE_URLS", pair.to_string())
                })?;
                region_base_urls.insert(region.trim().to_string(), url.trim().to_string());
            }
        }

        let captcha = match (
            env_opt("TENANTGATE_CAPTCHA_VERIFY_URL"),
            env_opt("TENANTGATE_CAPTCHA_SECRET"),
        ) {
            (Some(verify_url), Some(secret)) => Some(CaptchaSettings { verify_url, secret }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("TENANTGATE_CAPTCHA_SECRET")),
            (None, Some(_)) => return Err(ConfigError::Missing("TENANTGATE_CAPTCHA_VERIFY_URL")),
        };

        let runtime_defaults = RuntimeSettings::default();
        let runtime = RuntimeSettings {
            schema_cache_ttl: env_secs(
                "TENANTGATE_SCHEMA_CACHE_TTL_SECS",
                runtime_defaults.schema_cache_ttl,
            )?,
            schema_stale_ttl: env_secs(
                "TENANTGATE_SCHEMA_STALE_TTL_SECS",
                runtime_defaults.schema_stale_ttl,
            )?,
            idempotency_ttl: env_secs(
                "TENANTGATE_IDEMPOTENCY_TTL_SECS",
                runtime_defaults.idempotency_ttl,
            )?,
            origin_check: env_parse("TENANTGATE_ORIGIN_CHECK", runtime_defaults.origin_check)?,
        };

        let a = AccessSettings::default();
        let access = AccessSettings {
            anonymous_session_ttl: env_secs(
                "TENANTGATE_ANON_SESSION_TTL_SECS",
                a.anonymous_session_ttl,
            )?,
            authenticated_session_ttl: env_secs(
                "TENANTGATE_AUTH_SESSION_TTL_SECS",
                a.authenticated_session_ttl,
            )?,
            default_window: env_secs("TENANTGATE_RATE_WINDOW_SECS", a.default_window)?,
            default_soft_limit: env_parse("TENANTGATE_RATE_SOFT_LIMIT", a.default_soft_limit)?,
            default_hard_limit: env_parse("TENANTGATE_RATE_HARD_LIMIT", a.default_hard_limit)?,
            strike_window: env_secs("TENANTGATE_STRIKE_WINDOW_SECS", a.strike_window)?,
            session_ban_strikes: env_parse(
                "TENANTGATE_SESSION_BAN_STRIKES",
                a.session_ban_strikes,
            )?,
            ip_ban_strikes: env_parse("TENANTGATE_IP_BAN_STRIKES", a.ip_ban_strikes)?,
            ban_cooldown: env_secs("TENANTGATE_BAN_COOLDOWN_SECS", a.ban_cooldown)?,
            event_retention: Duration::from_secs(
                env_parse::<u64>("TENANTGATE_ACCESS_EVENT_RETENTION_DAYS", 90)? * 24 * 3600,
            ),
        };
        if access.default_hard_limit < access.default_soft_limit {
            return Err(ConfigError::Invalid(
                "TENANTGATE_RATE_HARD_LIMIT",
                "must not be below TENANTGATE_RATE_SOFT_LIMIT".to_string(),
            ));
        }

        let billing = BillingSettings {
            currency: env_opt("TENANTGATE_BILLING_CURRENCY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| BillingSettings::default().currency),
        };

        let j = JobSettings::default();
        let jitter: f64 = env_parse("TENANTGATE_JOB_BACKOFF_JITTER", j.backoff.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::Invalid(
                "TENANTGATE_JOB_BACKOFF_JITTER",
                jitter.to_string(),
            ));
        }
        let jobs = JobSettings {
            object_store_dir: env_opt("TENANTGATE_OBJECT_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(j.object_store_dir),
            exports_enabled: env_bool("TENANTGATE_EXPORTS_ENABLED", j.exports_enabled)?,
            export_retention: env_secs("TENANTGATE_EXPORT_RETENTION_SECS", j.export_retention)?,
            poll_interval: env_millis("TENANTGATE_JOB_POLL_INTERVAL_MS", j.poll_interval)?,
            visibility_timeout: env_secs(
                "TENANTGATE_JOB_VISIBILITY_TIMEOUT_SECS",
                j.visibility_timeout,
            )?,
            max_attempts: env_parse("TENANTGATE_JOB_MAX_ATTEMPTS", j.max_attempts)?,
            backoff: BackoffSettings {
                base: env_millis("TENANTGATE_JOB_BACKOFF_BASE_MS", j.backoff.base)?,
                max: env_millis("TENANTGATE_JOB_BACKOFF_MAX_MS", j.backoff.max)?,
                jitter,
            },
            maintenance_interval: env_secs(
                "TENANTGATE_MAINTENANCE_INTERVAL_SECS",
                j.maintenance_interval,
            )?,
        };

        let v = VmSettings::default();
        let vm = VmSettings {
            engine: env_parse("TENANTGATE_VM_ENGINE", v.engine)?,
            max_isolates: env_parse("TENANTGATE_VM_MAX_ISOLATES", v.max_isolates)?,
            idle_ttl: env_secs("TENANTGATE_VM_IDLE_TTL_SECS", v.idle_ttl)?,
            memory_limit_bytes: env_parse::<u64>(
                "TENANTGATE_VM_MEMORY_LIMIT_MB",
                v.memory_limit_bytes / (1024 * 1024),
            )? * 1024
                * 1024,
            cpu_limit: env_millis("TENANTGATE_VM_CPU_LIMIT_MS", v.cpu_limit)?,
            fetch_allowlist: env_opt("TENANTGATE_VM_FETCH_ALLOWLIST")
                .map(|raw| {
                    raw.split(',')
                        .map(|h| h.trim().to_ascii_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            db_dir: env_opt("TENANTGATE_VM_DB_DIR")
                .map(PathBuf::from)
                .unwrap_or(v.db_dir),
        };

        let t = Timeouts::default();
        let timeouts = Timeouts {
            entry: env_millis("TENANTGATE_TIMEOUT_ENTRY_MS", t.entry)?,
            schema: env_millis("TENANTGATE_TIMEOUT_SCHEMA_MS", t.schema)?,
            execute: env_millis("TENANTGATE_TIMEOUT_EXECUTE_MS", t.execute)?,
            vm: env_millis("TENANTGATE_TIMEOUT_VM_MS", t.vm)?,
            job_claim: env_millis("TENANTGATE_TIMEOUT_JOB_CLAIM_MS", t.job_claim)?,
        };

        Ok(Self {
            database_url,
            http_addr,
            base_url,
            region_base_urls,
            jwt_secret: env_opt("TENANTGATE_JWT_SECRET"),
            execution_url: env_opt("TENANTGATE_EXECUTION_URL"),
            captcha,
            runtime,
            access,
            billing,
            jobs,
            vm,
            timeouts,
        })
    }

    /// Hosts served by slug routing. Any other host is a custom domain.
    pub fn base_hosts(&self) -> HashSet<String> {
        crate::dispatcher::base_hosts(&self.base_url, self.region_base_urls.values())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    /// A variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_opt(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid(key, raw)),
        },
        None => Ok(default),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("TENANTGATE_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TENANTGATE_DATABASE_URL")));
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TENANTGATE_DATABASE_URL", "sqlite::memory:");
        guard.remove("TENANTGATE_SCHEMA_CACHE_TTL_SECS");
        guard.remove("TENANTGATE_CAPTCHA_VERIFY_URL");
        guard.remove("TENANTGATE_CAPTCHA_SECRET");
        guard.remove("TENANTGATE_ORIGIN_CHECK");
        guard.remove("TENANTGATE_VM_ENGINE");

        let config = Config::from_env().unwrap();
        assert_eq!(config.runtime.schema_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.runtime.schema_stale_ttl, Duration::from_secs(120));
        assert_eq!(config.runtime.origin_check, OriginCheck::All);
        assert_eq!(config.timeouts.execute, Duration::from_secs(30));
        assert!(config.captcha.is_none());
        assert_eq!(config.vm.engine, VmEngineKind::Script);
    }

    #[test]
    fn test_overrides_and_regions() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TENANTGATE_DATABASE_URL", "sqlite::memory:");
        guard.set("TENANTGATE_BASE_URL", "https://Apps.Example.com");
        guard.set(
            "TENANTGATE_REGION_BASE_URLS",
            "eu=https://eu.apps.example.com, us=https://us.apps.example.com:8443",
        );
        guard.set("TENANTGATE_RATE_SOFT_LIMIT", "5");
        guard.set("TENANTGATE_RATE_HARD_LIMIT", "10");
        guard.set("TENANTGATE_ORIGIN_CHECK", "execute_only");
        guard.set("TENANTGATE_VM_ENGINE", "disabled");

        let config = Config::from_env().unwrap();
        assert_eq!(config.vm.engine, VmEngineKind::Disabled);
        assert_eq!(config.access.default_soft_limit, 5);
        assert_eq!(config.access.default_hard_limit, 10);
        assert_eq!(config.runtime.origin_check, OriginCheck::ExecuteOnly);

        let hosts = config.base_hosts();
        assert!(hosts.contains("apps.example.com"));
        assert!(hosts.contains("eu.apps.example.com"));
        assert!(hosts.contains("us.apps.example.com"));
        assert!(hosts.contains("localhost"));
        assert!(hosts.contains("::1"));
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TENANTGATE_DATABASE_URL", "sqlite::memory:");
        guard.set("TENANTGATE_RATE_SOFT_LIMIT", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TENANTGATE_RATE_SOFT_LIMIT", _)));
    }

    #[test]
    fn test_captcha_requires_both_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TENANTGATE_DATABASE_URL", "sqlite::memory:");
        guard.remove("TENANTGATE_RATE_SOFT_LIMIT");
        guard.remove("TENANTGATE_RATE_HARD_LIMIT");
        guard.set("TENANTGATE_CAPTCHA_VERIFY_URL", "https://captcha.example.com/verify");
        guard.remove("TENANTGATE_CAPTCHA_SECRET");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TENANTGATE_CAPTCHA_SECRET")));
    }
}
