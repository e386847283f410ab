// ABOUTME: Fleet configuration loaded from environment variables
// ABOUTME: Validates numbers, intervals and provider selection before anything is wired

pub mod constants;

use std::collections::HashMap;
use std::env;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use constants::*;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("Unknown sandbox provider: {0}")]
    UnknownProvider(String),
    #[error("Missing required variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,     // Container runtime on the local daemon
    Local,      // Plain local process
    MicroVm,    // Cloud micro-VM booted from a snapshot
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Docker => "docker",
            ProviderKind::Local => "local",
            ProviderKind::MicroVm => "microvm",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ProviderKind::Docker),
            "local" => Ok(ProviderKind::Local),
            "microvm" | "micro-vm" => Ok(ProviderKind::MicroVm),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MicroVmConfig {
    pub api_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub database_url: String,
    pub default_provider: ProviderKind,
    pub sandbox_image: String,
    pub microvm: Option<MicroVmConfig>,
    pub local_sandbox_command: Option<Vec<String>>,
    pub sandbox_token: Option<String>,
    pub poll_interval: Duration,
    pub warm_ttl: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub delivery_max_attempts: u32,
    pub delivery_base_delay: Duration,
    pub delivery_max_delay: Duration,
    pub dedup_prefix_chars: usize,
    pub max_natural_questions: usize,
    pub log_level: String,
}

impl FleetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build a config from an explicit variable map. `from_env` is a thin wrapper.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let default_provider = get(FLEET_DEFAULT_PROVIDER)
            .unwrap_or("docker")
            .parse::<ProviderKind>()?;

        let microvm = match (get(FLEET_MICROVM_API_URL), get(FLEET_MICROVM_API_KEY)) {
            (Some(url), Some(key)) => Some(MicroVmConfig {
                api_url: url.trim_end_matches('/').to_string(),
                api_key: key.to_string(),
            }),
            _ => None,
        };

        if default_provider == ProviderKind::MicroVm && microvm.is_none() {
            return Err(if get(FLEET_MICROVM_API_URL).is_none() {
                ConfigError::Missing(FLEET_MICROVM_API_URL)
            } else {
                ConfigError::Missing(FLEET_MICROVM_API_KEY)
            });
        }

        let local_sandbox_command = get(FLEET_LOCAL_SANDBOX_COMMAND).map(|cmd| {
            cmd.split_whitespace()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        });

        if default_provider == ProviderKind::Local && local_sandbox_command.is_none() {
            return Err(ConfigError::Missing(FLEET_LOCAL_SANDBOX_COMMAND));
        }

        let delivery_max_attempts = positive(vars, FLEET_DELIVERY_MAX_ATTEMPTS, 5)? as u32;
        let delivery_base_delay_ms = positive(vars, FLEET_DELIVERY_BASE_DELAY_MS, 1000)?;
        let delivery_max_delay_ms = positive(vars, FLEET_DELIVERY_MAX_DELAY_MS, 30_000)?;

        let config = FleetConfig {
            database_url: get(FLEET_DATABASE_URL)
                .unwrap_or("sqlite://fleet.db")
                .to_string(),
            default_provider,
            sandbox_image: get(FLEET_SANDBOX_IMAGE)
                .unwrap_or("ghcr.io/fleet/sandbox:latest")
                .to_string(),
            microvm,
            local_sandbox_command,
            sandbox_token: get(FLEET_SANDBOX_TOKEN).map(|s| s.to_string()),
            poll_interval: Duration::from_secs(positive(vars, FLEET_POLL_INTERVAL_SECS, 5)?),
            warm_ttl: Duration::from_secs(positive(vars, FLEET_WARM_TTL_SECS, 600)?),
            idle_timeout: Duration::from_secs(positive(vars, FLEET_IDLE_TIMEOUT_SECS, 1800)?),
            sweep_interval: Duration::from_secs(positive(vars, FLEET_SWEEP_INTERVAL_SECS, 60)?),
            delivery_max_attempts,
            delivery_base_delay: Duration::from_millis(delivery_base_delay_ms),
            // A cap below the base delay would make every retry immediate
            delivery_max_delay: Duration::from_millis(
                delivery_max_delay_ms.max(delivery_base_delay_ms),
            ),
            dedup_prefix_chars: positive(vars, FLEET_DEDUP_PREFIX_CHARS, 40)? as usize,
            max_natural_questions: number(vars, FLEET_MAX_NATURAL_QUESTIONS, 3)? as usize,
            log_level: get(FLEET_LOG_LEVEL).unwrap_or("info").to_string(),
        };

        tracing::debug!(
            provider = config.default_provider.as_str(),
            database_url = %config.database_url,
            "Loaded fleet configuration"
        );

        Ok(config)
    }
}

fn number(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|source| ConfigError::InvalidNumber { name, source }),
        None => Ok(default),
    }
}

fn positive(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    let value = number(vars, name, default)?;
    if value == 0 {
        return Err(ConfigError::MustBePositive(name));
    }
    Ok(value)
}
