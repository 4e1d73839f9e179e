//! Engine and store configuration with environment overrides.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::telemetry::Signal;
use crate::time_window::StationTimezone;

/// Widest cohort the sequence models accept in one call.
pub const DEFAULT_MAX_BATCH_WIDTH: usize = 18;

pub const DEFAULT_MODEL_PRIORITY: [&str; 4] = ["SAITS", "iTransformer", "FreTS", "Lerp"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalLimits {
    /// Absolute step both neighbours must exceed for a point to count as a spike.
    pub spike_threshold: f64,
    /// Fixed normalisation ceiling; model inputs are `v / norm_max`.
    pub norm_max: f64,
}

/// What an unavailable irradiance signal means for zero-run reclassification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrradiancePolicy {
    /// Sibling corroboration alone confirms a zero as missing.
    SiblingsSufficient,
    /// No irradiance, no reclassification.
    RequireIrradiance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip)]
    pub timezone: StationTimezone,
    pub max_batch_width: usize,
    pub intensity: SignalLimits,
    pub voltage: SignalLimits,
    pub irradiance_policy: IrradiancePolicy,
    pub max_candidates: usize,
    pub model_dir: PathBuf,
    pub model_priority: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: StationTimezone::default(),
            max_batch_width: DEFAULT_MAX_BATCH_WIDTH,
            intensity: SignalLimits {
                spike_threshold: 10.0,
                norm_max: 15.0,
            },
            voltage: SignalLimits {
                spike_threshold: 1_000.0,
                norm_max: 1_500.0,
            },
            irradiance_policy: IrradiancePolicy::SiblingsSufficient,
            max_candidates: 3,
            model_dir: PathBuf::from("models"),
            model_priority: DEFAULT_MODEL_PRIORITY
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl EngineConfig {
    pub fn limits(&self, signal: Signal) -> SignalLimits {
        match signal {
            Signal::Intensity => self.intensity,
            Signal::Voltage => self.voltage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/stations"),
        }
    }
}

pub fn engine_config_from_env() -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Some(tz) = env_trimmed("PVGF_TIMEZONE").and_then(|raw| raw.parse().ok()) {
        config.timezone = tz;
    }

    if let Some(width) = env_trimmed("PVGF_MAX_BATCH_WIDTH")
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|width| *width > 0)
    {
        config.max_batch_width = width;
    }

    if let Some(policy) = env_trimmed("PVGF_IRRADIANCE_POLICY").and_then(|raw| parse_policy(&raw)) {
        config.irradiance_policy = policy;
    }

    if let Some(dir) = env_trimmed("PVGF_MODEL_DIR") {
        config.model_dir = PathBuf::from(dir);
    }

    if let Some(models) = env_trimmed("PVGF_MODELS") {
        let parsed: Vec<String> = models
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        if !parsed.is_empty() {
            config.model_priority = parsed;
        }
    }

    config
}

pub fn store_config_from_env() -> StoreConfig {
    let mut config = StoreConfig::default();
    if let Some(root) = env_trimmed("PVGF_DATA_ROOT") {
        config.data_root = PathBuf::from(root);
    }
    config
}

pub(crate) fn env_trimmed(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_policy(raw: &str) -> Option<IrradiancePolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "siblings" | "siblings_sufficient" => Some(IrradiancePolicy::SiblingsSufficient),
        "require" | "require_irradiance" => Some(IrradiancePolicy::RequireIrradiance),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_env::with_env_vars;
    use super::*;

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(
            &[
                ("PVGF_TIMEZONE", None),
                ("PVGF_MAX_BATCH_WIDTH", None),
                ("PVGF_IRRADIANCE_POLICY", None),
                ("PVGF_MODEL_DIR", None),
                ("PVGF_MODELS", None),
            ],
            engine_config_from_env,
        );

        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.max_batch_width, 18);
        assert_eq!(cfg.limits(Signal::Voltage).norm_max, 1_500.0);
    }

    #[test]
    fn parses_overrides_from_env() {
        let cfg = with_env_vars(
            &[
                ("PVGF_TIMEZONE", Some("+05:30")),
                ("PVGF_MAX_BATCH_WIDTH", Some("12")),
                ("PVGF_IRRADIANCE_POLICY", Some("require")),
                ("PVGF_MODEL_DIR", Some("/opt/models")),
                ("PVGF_MODELS", Some("Lerp, SAITS")),
            ],
            engine_config_from_env,
        );

        assert_eq!(cfg.timezone.to_string(), "+05:30");
        assert_eq!(cfg.max_batch_width, 12);
        assert_eq!(cfg.irradiance_policy, IrradiancePolicy::RequireIrradiance);
        assert_eq!(cfg.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.model_priority, vec!["Lerp", "SAITS"]);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let cfg = with_env_vars(
            &[
                ("PVGF_TIMEZONE", Some("Nowhere/Land")),
                ("PVGF_MAX_BATCH_WIDTH", Some("0")),
                ("PVGF_IRRADIANCE_POLICY", Some("sometimes")),
                ("PVGF_MODEL_DIR", None),
                ("PVGF_MODELS", Some(" , ")),
            ],
            engine_config_from_env,
        );

        assert_eq!(cfg, EngineConfig::default());
    }
}
