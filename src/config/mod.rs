use crate::{models::AgentClass, HephaestusError, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fmt, str::FromStr, time::Duration};


/// Environment prefix for every recognized configuration variable.
const ENV_PREFIX: &str = "HEPHAESTUS_";

/// The full set of recognized variables. Any other `HEPHAESTUS_*`
/// variable in the environment is rejected at startup.
const RECOGNIZED_KEYS: &[&str] = &[
    "HEPHAESTUS_MAX_CONCURRENT",
    "HEPHAESTUS_CALLS_PER_MINUTE",
    "HEPHAESTUS_CLASS_LIMITS",
    "HEPHAESTUS_BREAKER_FAILURE_THRESHOLD",
    "HEPHAESTUS_BREAKER_TIMEOUT_TO_PROBE_MS",
    "HEPHAESTUS_RETRY_MAX_ATTEMPTS",
    "HEPHAESTUS_RETRY_BASE_DELAY_MS",
    "HEPHAESTUS_RETRY_MAX_DELAY_MS",
    "HEPHAESTUS_RETRY_JITTER",
    "HEPHAESTUS_CACHE_MAX_ENTRIES",
    "HEPHAESTUS_CACHE_DEFAULT_TTL_SECS",
    "HEPHAESTUS_QUEUE_PATH",
    "HEPHAESTUS_QUEUE_MAX_RETRIES",
    "HEPHAESTUS_ADAPTIVE_SAMPLE_INTERVAL_SECS",
    "HEPHAESTUS_OBJECTIVE_DEADLINE_SECS",
    "HEPHAESTUS_SHUTDOWN_GRACE_SECS",
    "HEPHAESTUS_API_KEYS",
    "HEPHAESTUS_KEY_COOLDOWN_BASE_MS",
    "HEPHAESTUS_KEY_COOLDOWN_MAX_MS",
    "HEPHAESTUS_API_HOST",
    "HEPHAESTUS_API_PORT",
    "HEPHAESTUS_TURBO",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub limiter: LimiterSettings,
    pub class_limits: HashMap<AgentClass, usize>,
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
    pub adaptive: AdaptiveSettings,
    pub api: ApiSettings,
    /// Execution budget granted to each objective at dequeue.
    pub objective_deadline: Duration,
    /// Bound on graceful shutdown before remaining work is abandoned.
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Hard cap on concurrent in-flight external calls.
    pub max_concurrent: usize,
    /// Token-bucket rate for external calls.
    pub calls_per_minute: u32,
    pub keys: Vec<KeySettings>,
    /// Initial cooldown after a retryable key failure.
    pub key_cooldown_base: Duration,
    /// Ceiling for the exponentially growing cooldown.
    pub key_cooldown_max: Duration,
}

/// One provider credential. The secret is excluded from Debug output
/// and must never reach logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeySettings {
    pub id: String,
    pub provider: String,
    pub secret: String,
}

impl fmt::Debug for KeySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySettings")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("secret", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub timeout_to_probe: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor in [0, 1].
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Snapshot file path; the dead-letter log lives at `path + ".dead"`.
    pub path: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    pub sample_interval: Duration,
    /// Manual override pinning the Aggressive strategy until cleared.
    pub turbo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let mut class_limits = HashMap::new();
        for class in AgentClass::ALL {
            class_limits.insert(class, 4);
        }
        Self {
            limiter: LimiterSettings {
                max_concurrent: 16,
                calls_per_minute: 120,
                keys: Vec::new(),
                key_cooldown_base: crate::constants::KEY_COOLDOWN_BASE,
                key_cooldown_max: crate::constants::KEY_COOLDOWN_MAX,
            },
            class_limits,
            breaker: BreakerSettings {
                failure_threshold: 5,
                timeout_to_probe: Duration::from_secs(30),
            },
            retry: RetrySettings {
                max_attempts: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(30),
                jitter: 0.2,
            },
            cache: CacheSettings {
                max_entries: 2048,
                default_ttl: Duration::from_secs(3600),
            },
            queue: QueueSettings {
                path: "hephaestus-queue.snapshot".to_string(),
                max_retries: 3,
            },
            adaptive: AdaptiveSettings {
                sample_interval: Duration::from_secs(15),
                turbo: false,
            },
            api: ApiSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            objective_deadline: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `.env` files are honored when present. Every `HEPHAESTUS_*`
    /// variable must be recognized; unknown keys abort startup.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect();
        Self::from_vars(&vars)
    }

    /// Build a config from an explicit variable map. Separated from
    /// `load` so tests never touch the process environment.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        for key in vars.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(HephaestusError::Configuration(format!(
                    "Unknown configuration key: {key}"
                )));
            }
        }

        let mut config = Config::default();

        if let Some(v) = vars.get("HEPHAESTUS_MAX_CONCURRENT") {
            config.limiter.max_concurrent = parse(v, "HEPHAESTUS_MAX_CONCURRENT")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_CALLS_PER_MINUTE") {
            config.limiter.calls_per_minute = parse(v, "HEPHAESTUS_CALLS_PER_MINUTE")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_CLASS_LIMITS") {
            config.class_limits = parse_class_limits(v)?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_BREAKER_FAILURE_THRESHOLD") {
            config.breaker.failure_threshold = parse(v, "HEPHAESTUS_BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_BREAKER_TIMEOUT_TO_PROBE_MS") {
            config.breaker.timeout_to_probe =
                Duration::from_millis(parse(v, "HEPHAESTUS_BREAKER_TIMEOUT_TO_PROBE_MS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_RETRY_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse(v, "HEPHAESTUS_RETRY_MAX_ATTEMPTS")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay =
                Duration::from_millis(parse(v, "HEPHAESTUS_RETRY_BASE_DELAY_MS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_RETRY_MAX_DELAY_MS") {
            config.retry.max_delay =
                Duration::from_millis(parse(v, "HEPHAESTUS_RETRY_MAX_DELAY_MS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_RETRY_JITTER") {
            config.retry.jitter = parse(v, "HEPHAESTUS_RETRY_JITTER")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = parse(v, "HEPHAESTUS_CACHE_MAX_ENTRIES")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_CACHE_DEFAULT_TTL_SECS") {
            config.cache.default_ttl =
                Duration::from_secs(parse(v, "HEPHAESTUS_CACHE_DEFAULT_TTL_SECS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_QUEUE_PATH") {
            config.queue.path = v.clone();
        }
        if let Some(v) = vars.get("HEPHAESTUS_QUEUE_MAX_RETRIES") {
            config.queue.max_retries = parse(v, "HEPHAESTUS_QUEUE_MAX_RETRIES")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_ADAPTIVE_SAMPLE_INTERVAL_SECS") {
            config.adaptive.sample_interval =
                Duration::from_secs(parse(v, "HEPHAESTUS_ADAPTIVE_SAMPLE_INTERVAL_SECS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_OBJECTIVE_DEADLINE_SECS") {
            config.objective_deadline =
                Duration::from_secs(parse(v, "HEPHAESTUS_OBJECTIVE_DEADLINE_SECS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace =
                Duration::from_secs(parse(v, "HEPHAESTUS_SHUTDOWN_GRACE_SECS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_API_KEYS") {
            config.limiter.keys = parse_keys(v)?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_KEY_COOLDOWN_BASE_MS") {
            config.limiter.key_cooldown_base =
                Duration::from_millis(parse(v, "HEPHAESTUS_KEY_COOLDOWN_BASE_MS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_KEY_COOLDOWN_MAX_MS") {
            config.limiter.key_cooldown_max =
                Duration::from_millis(parse(v, "HEPHAESTUS_KEY_COOLDOWN_MAX_MS")?);
        }
        if let Some(v) = vars.get("HEPHAESTUS_API_HOST") {
            config.api.host = v.clone();
        }
        if let Some(v) = vars.get("HEPHAESTUS_API_PORT") {
            config.api.port = parse(v, "HEPHAESTUS_API_PORT")?;
        }
        if let Some(v) = vars.get("HEPHAESTUS_TURBO") {
            config.adaptive.turbo = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on");
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.max_concurrent == 0 {
            return Err(HephaestusError::Configuration(
                "HEPHAESTUS_MAX_CONCURRENT must be at least 1".to_string(),
            ));
        }
        if self.limiter.calls_per_minute == 0 {
            return Err(HephaestusError::Configuration(
                "HEPHAESTUS_CALLS_PER_MINUTE must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(HephaestusError::Configuration(format!(
                "HEPHAESTUS_RETRY_JITTER must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(HephaestusError::Configuration(
                "HEPHAESTUS_RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        for (class, limit) in &self.class_limits {
            if *limit == 0 {
                return Err(HephaestusError::Configuration(format!(
                    "Class limit for {class} must be at least 1"
                )));
            }
        }
        for key in &self.limiter.keys {
            if key.id.is_empty() || key.provider.is_empty() {
                return Err(HephaestusError::Configuration(
                    "API key entries require both an id and a provider".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(value: &str, key: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        HephaestusError::Configuration(format!("Invalid value for {key}: {value:?}"))
    })
}

/// Parse `architect=4,reviewer=2` style per-class limits. Classes not
/// mentioned keep their default limit.
fn parse_class_limits(value: &str) -> Result<HashMap<AgentClass, usize>> {
    let mut limits = Config::default().class_limits;
    for pair in value.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, limit) = pair.split_once('=').ok_or_else(|| {
            HephaestusError::Configuration(format!(
                "HEPHAESTUS_CLASS_LIMITS entries must look like class=N, got {pair:?}"
            ))
        })?;
        let class: AgentClass = name
            .trim()
            .parse()
            .map_err(HephaestusError::Configuration)?;
        limits.insert(class, parse(limit, "HEPHAESTUS_CLASS_LIMITS")?);
    }
    Ok(limits)
}

/// Parse `id:provider:secret,...` key entries. Secrets never appear in
/// error messages.
fn parse_keys(value: &str) -> Result<Vec<KeySettings>> {
    let mut keys = Vec::new();
    for entry in value.split(',').filter(|e| !e.trim().is_empty()) {
        let mut parts = entry.trim().splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(provider), Some(secret)) if !secret.is_empty() => {
                keys.push(KeySettings {
                    id: id.to_string(),
                    provider: provider.to_string(),
                    secret: secret.to_string(),
                });
            }
            _ => {
                return Err(HephaestusError::Configuration(
                    "HEPHAESTUS_API_KEYS entries must look like id:provider:secret".to_string(),
                ))
            }
        }
    }
    Ok(keys)
}
