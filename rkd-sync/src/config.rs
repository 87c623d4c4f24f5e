//! Engine settings resolution
//!
//! Provides tiered resolution with ENV → TOML → compiled default priority.
//! When a value is set in more than one tier and the tiers disagree, the
//! higher tier wins and a warning is logged.

use rkd_common::config::TomlConfig;
use rkd_common::{Error, Result, Variant};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::heartbeat::HeartbeatContext;
use crate::providers::DeviceClass;

pub const SERVER_URL_ENV: &str = "RKD_SERVER_URL";
pub const DEBOUNCE_MS_ENV: &str = "RKD_DEBOUNCE_MS";
pub const HEARTBEAT_SECS_ENV: &str = "RKD_HEARTBEAT_SECS";

/// Fully resolved engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub server_url: String,
    pub request_timeout: Duration,
    pub debounce: Duration,
    pub min_identifier_len: usize,
    pub heartbeat_interval: Duration,
    pub recent_identities_limit: usize,
    pub default_variant: Variant,
    pub page: String,
    pub device_class: DeviceClass,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let defaults = TomlConfig::default();
        Self {
            server_url: defaults.server.base_url,
            request_timeout: Duration::from_secs(defaults.server.request_timeout_secs),
            debounce: Duration::from_millis(defaults.engine.debounce_ms),
            min_identifier_len: defaults.engine.min_identifier_len,
            heartbeat_interval: Duration::from_secs(defaults.engine.heartbeat_interval_secs),
            recent_identities_limit: defaults.engine.recent_identities_limit,
            default_variant: Variant::default(),
            page: defaults.engine.page,
            device_class: DeviceClass::default(),
        }
    }
}

impl EngineSettings {
    /// Resolve settings from the environment and a loaded TOML config
    pub fn resolve(toml_config: &TomlConfig) -> Result<Self> {
        let defaults = TomlConfig::default();

        let server_url = resolve_tiered(
            "server URL",
            SERVER_URL_ENV,
            toml_config.server.base_url.clone(),
            defaults.server.base_url,
        );
        let debounce_ms = resolve_tiered(
            "debounce interval",
            DEBOUNCE_MS_ENV,
            toml_config.engine.debounce_ms,
            defaults.engine.debounce_ms,
        );
        let heartbeat_secs = resolve_tiered(
            "heartbeat interval",
            HEARTBEAT_SECS_ENV,
            toml_config.engine.heartbeat_interval_secs,
            defaults.engine.heartbeat_interval_secs,
        );

        if heartbeat_secs == 0 {
            return Err(Error::Config("heartbeat interval must be at least 1 second".to_string()));
        }
        if toml_config.engine.min_identifier_len == 0 {
            return Err(Error::Config("min_identifier_len must be at least 1".to_string()));
        }

        let default_variant = toml_config.engine.default_variant.parse::<Variant>()?;
        let device_class = toml_config.engine.device_class.parse::<DeviceClass>()?;

        Ok(Self {
            server_url,
            request_timeout: Duration::from_secs(toml_config.server.request_timeout_secs),
            debounce: Duration::from_millis(debounce_ms),
            min_identifier_len: toml_config.engine.min_identifier_len,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            recent_identities_limit: toml_config.engine.recent_identities_limit.max(1),
            default_variant,
            page: toml_config.engine.page.clone(),
            device_class,
        })
    }

    /// Heartbeat fields for `variant`
    pub fn heartbeat_context(&self, variant: Variant) -> HeartbeatContext {
        HeartbeatContext {
            page: self.page.clone(),
            variant_or_locale: variant.as_str().to_string(),
            device_class: self.device_class,
        }
    }
}

/// Pick ENV over TOML over default, warning when set tiers disagree
fn resolve_tiered<T>(name: &str, env_var: &str, toml_value: T, default: T) -> T
where
    T: FromStr + PartialEq + Display,
{
    let env_value = match std::env::var(env_var) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", env_var, raw);
                None
            }
        },
        _ => None,
    };
    let toml_set = toml_value != default;

    match env_value {
        Some(env_value) => {
            if toml_set && env_value != toml_value {
                warn!(
                    "{} set in environment ({}) and TOML ({}). Using environment (highest priority).",
                    name, env_value, toml_value
                );
            }
            info!("{} loaded from environment variable {}", name, env_var);
            env_value
        }
        None if toml_set => {
            info!("{} loaded from TOML config", name);
            toml_value
        }
        None => default,
    }
}
