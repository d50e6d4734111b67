use std::collections::HashSet;
use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::calculator::CalcParams;
use crate::error::ConfigError;
use crate::model::{Family, PriorityTier};
use crate::registry::{CalculatorSettings, Overrides};

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_utc_offset_hours() -> i32 {
    8
}

fn default_concurrency() -> usize {
    8
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_lookback_padding() -> usize {
    5
}

fn default_families() -> Vec<String> {
    Family::ALL.iter().map(|f| f.to_string()).collect()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
    #[serde(default)]
    pub calculators: Vec<CalculatorConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Offset used to decide what "today" is for scheduled runs.
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub persist_timeout_secs: u64,
    #[serde(default = "default_lookback_padding")]
    pub lookback_padding: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fetch_timeout_secs: default_timeout_secs(),
            persist_timeout_secs: default_timeout_secs(),
            lookback_padding: default_lookback_padding(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    pub tier: String,
    /// Six-field cron expression (seconds first).
    pub cron: String,
    #[serde(default = "default_families")]
    pub families: Vec<String>,
}

impl ScheduleConfig {
    pub fn priority(&self) -> Result<PriorityTier, Report<ConfigError>> {
        self.tier.parse().map_err(|reason: String| {
            Report::new(ConfigError::Validation {
                field: format!("schedules[cron={}].tier: {reason}", self.cron),
            })
        })
    }

    pub fn parsed_families(&self) -> Result<Vec<Family>, Report<ConfigError>> {
        self.families
            .iter()
            .map(|f| {
                f.parse().map_err(|reason: String| {
                    Report::new(ConfigError::Validation {
                        field: format!("schedules[tier={}].families: {reason}", self.tier),
                    })
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct CalculatorConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: toml::Table,
}

impl CalculatorConfig {
    /// Numeric parameters; any other TOML value is rejected.
    pub fn calc_params(&self) -> Result<CalcParams, Report<ConfigError>> {
        let mut params = CalcParams::new();
        for (key, value) in &self.params {
            let number = match value {
                toml::Value::Integer(i) => *i as f64,
                toml::Value::Float(f) => *f,
                other => {
                    return Err(Report::new(ConfigError::Validation {
                        field: format!(
                            "calculators[\"{}\"].params.{key}: expected a number, got {}",
                            self.name,
                            other.type_str()
                        ),
                    }));
                }
            };
            params.insert(key.clone(), number);
        }
        Ok(params)
    }
}

impl AppConfig {
    /// Per-calculator settings keyed by name, for registry construction.
    pub fn overrides(&self) -> Result<Overrides, Report<ConfigError>> {
        self.calculators
            .iter()
            .map(|c| {
                let settings = CalculatorSettings {
                    enabled: c.enabled,
                    params: c.calc_params()?,
                };
                Ok((c.name.clone(), settings))
            })
            .collect()
    }
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_general(config)?;
    validate_engine(config)?;
    validate_schedules(config)?;
    validate_calculators(config)?;
    Ok(())
}

fn validate_general(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let general = &config.general;
    if !VALID_LOG_FORMATS.contains(&general.log_format.as_str()) {
        return Err(Report::new(ConfigError::Validation {
            field: format!("general.log_format \"{}\" is not valid", general.log_format),
        }));
    }
    if !(-12..=14).contains(&general.utc_offset_hours) {
        return Err(Report::new(ConfigError::Validation {
            field: format!(
                "general.utc_offset_hours {} is outside -12..=14",
                general.utc_offset_hours
            ),
        }));
    }
    Ok(())
}

fn validate_engine(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let engine = &config.engine;
    if engine.concurrency == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "engine.concurrency must be at least 1".into(),
        }));
    }
    if engine.fetch_timeout_secs == 0 || engine.persist_timeout_secs == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "engine timeouts must be at least 1 second".into(),
        }));
    }
    Ok(())
}

fn validate_schedules(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for schedule in &config.schedules {
        let tier = schedule.priority()?;
        schedule.parsed_families()?;

        if schedule.cron.trim().is_empty() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("schedules[tier={}].cron is empty", schedule.tier),
            }));
        }
        if schedule.families.is_empty() {
            return Err(Report::new(ConfigError::Validation {
                field: format!("schedules[tier={}].families is empty", schedule.tier),
            }));
        }
        if !seen.insert((tier, schedule.cron.trim())) {
            return Err(Report::new(ConfigError::Validation {
                field: format!(
                    "schedules: duplicate entry (tier={}, cron=\"{}\")",
                    schedule.tier, schedule.cron
                ),
            }));
        }
    }
    Ok(())
}

fn validate_calculators(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let mut seen = HashSet::new();
    for calculator in &config.calculators {
        if !seen.insert(calculator.name.as_str()) {
            return Err(Report::new(ConfigError::Validation {
                field: format!("calculators: duplicate name \"{}\"", calculator.name),
            }));
        }
        calculator.calc_params()?;
    }
    Ok(())
}
