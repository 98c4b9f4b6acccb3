use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::coordination::CoordinatorSettings;
use crate::state::{CycleMode, ModeProfile};

/// Main configuration structure for Packline
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacklineConfig {
    /// Local state machine settings
    pub engine: EngineConfig,
    /// Fleet coordination settings
    pub coordinator: CoordinatorConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
    /// Per-mode state availability masks, keyed by mode name
    #[serde(default)]
    pub modes: HashMap<String, ModeMaskConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Cycle behavior for EXECUTE: "single" or "continuous"
    pub cycle: String,
    /// Stand-in delay for unbound acting states, in milliseconds
    pub acting_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Names of the subordinate nodes to keep in lockstep
    pub node_names: Vec<String>,
    /// Upper bound on one fan-out round
    pub fan_out_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Enable tracing output
    pub tracing_enabled: bool,
    /// Log level
    pub log_level: String,
    /// Enable metrics collection
    pub metrics_enabled: bool,
}

/// One operating mode's availability mask. States absent from `states`
/// stay available.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModeMaskConfig {
    /// Wire value of the mode; values above 3 are user defined
    pub value: i8,
    /// State name to availability
    #[serde(default)]
    pub states: HashMap<String, bool>,
}

impl Default for PacklineConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig {
                cycle: "single".to_string(),
                acting_delay_ms: 200,
            },
            coordinator: CoordinatorConfig {
                node_names: Vec::new(),
                fan_out_timeout_seconds: 30,
            },
            observability: ObservabilityConfig {
                tracing_enabled: true,
                log_level: "info".to_string(),
                metrics_enabled: true,
            },
            modes: HashMap::new(),
        }
    }
}

impl PacklineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (packline.toml, .packline-rc)
    /// 3. Environment variables (prefixed with PACKLINE_)
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&PacklineConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        if Path::new("packline.toml").exists() {
            builder = builder.add_source(File::with_name("packline"));
        }

        if Path::new(".packline-rc").exists() {
            builder = builder.add_source(File::with_name(".packline-rc"));
        }

        builder = builder.add_source(
            Environment::with_prefix("PACKLINE")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn cycle_mode(&self) -> CycleMode {
        if self.engine.cycle.eq_ignore_ascii_case("continuous") {
            CycleMode::Continuous
        } else {
            CycleMode::Single
        }
    }

    pub fn acting_delay(&self) -> Duration {
        Duration::from_millis(self.engine.acting_delay_ms)
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings::with_nodes(self.coordinator.node_names.clone())
            .fan_out_timeout(Duration::from_secs(self.coordinator.fan_out_timeout_seconds))
    }

    /// Availability profiles per mode wire value, built from the configured
    /// masks. Unknown state names inside a mask are logged and skipped.
    pub fn mode_profiles(&self) -> HashMap<i8, ModeProfile> {
        self.modes
            .values()
            .map(|mask| (mask.value, ModeProfile::from_masks(&mask.states)))
            .collect()
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<PacklineConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = PacklineConfig::load_env_file();
        PacklineConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static PacklineConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[test]
    fn defaults_are_sane() {
        let config = PacklineConfig::default();
        assert_eq!(config.cycle_mode(), CycleMode::Single);
        assert_eq!(config.acting_delay(), Duration::from_millis(200));
        assert!(config.coordinator_settings().nodes.is_empty());
    }

    #[test]
    fn mode_masks_parse_from_toml() {
        let raw = r#"
            [engine]
            cycle = "continuous"
            acting_delay_ms = 50

            [coordinator]
            node_names = ["press", "labeler"]
            fan_out_timeout_seconds = 5

            [observability]
            tracing_enabled = true
            log_level = "debug"
            metrics_enabled = true

            [modes.maintenance]
            value = 2
            [modes.maintenance.states]
            COMPLETING = false
        "#;
        let config: PacklineConfig = toml::from_str(raw).expect("parse config");
        assert_eq!(config.cycle_mode(), CycleMode::Continuous);
        assert_eq!(config.coordinator.node_names.len(), 2);
        let profiles = config.mode_profiles();
        let maintenance = profiles.get(&2).expect("maintenance profile");
        assert!(!maintenance.available(State::Completing));
        assert!(maintenance.available(State::Execute));
    }
}
