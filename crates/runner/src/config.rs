//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use irrigation_engine::mpc::MpcConfig;
use irrigation_engine::optimizer::SolverConfig;
use irrigation_engine::sensor::Scenario;
use irrigation_engine::{ConfigError, ControlParameters, Location, Trajectory};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerKind {
    #[default]
    Rule,
    Mpc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Returns `initial_moisture` on every read.
    #[default]
    Stored,
    Simulated,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerKind,
    /// Site selector: 1 = Jeldu, 2 = Warwick.
    #[serde(default = "default_location")]
    pub location: u8,
    /// Open-Meteo hourly JSON, re-read on every fetch.
    pub forecast_path: String,
    pub initial_moisture: Option<f64>,
    /// Growth-stage preset for the receding-horizon controller (1, 2 or 3).
    #[serde(default = "default_trajectory")]
    pub trajectory: u8,
    /// Seed for the initial-state draw when `initial_moisture` is unset.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Receding-horizon steps per scheduler tick.
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default)]
    pub sensor: SensorEntry,
    #[serde(default)]
    pub parameters: ParameterOverrides,
    #[serde(default)]
    pub mpc: MpcConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub schedule: ScheduleEntry,
}

fn default_location() -> u8 {
    2
}

fn default_trajectory() -> u8 {
    2
}

fn default_seed() -> u64 {
    99
}

/// One hour of one-minute steps.
fn default_num_steps() -> usize {
    60
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorEntry {
    pub kind: SensorKind,
    pub scenario: Scenario,
    pub dry: f64,
    pub wet: f64,
    pub seed: u64,
}

impl Default for SensorEntry {
    fn default() -> Self {
        Self {
            kind: SensorKind::Stored,
            scenario: Scenario::Drying,
            dry: 10.0,
            wet: 60.0,
            seed: 7,
        }
    }
}

/// Anything left unset keeps the location's calibration.
#[derive(Debug, Default, Deserialize)]
pub struct ParameterOverrides {
    pub max_moisture: Option<f64>,
    pub min_moisture: Option<f64>,
    pub rain_threshold: Option<f64>,
    pub et_threshold: Option<f64>,
    pub flow_factor: Option<f64>,
    pub tube_constant: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleEntry {
    pub interval_sec: u64,
    pub cycle_timeout_ms: u64,
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            cycle_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    pub fn location(&self) -> Result<Location, ConfigError> {
        Location::from_selector(self.location)
    }

    pub fn trajectory(&self) -> Result<Trajectory, ConfigError> {
        Trajectory::from_selector(self.trajectory)
    }

    /// Location calibration with the `[parameters]` overrides applied.
    pub fn control_parameters(&self) -> Result<ControlParameters, ConfigError> {
        let mut p = ControlParameters::for_location(self.location()?);
        let o = &self.parameters;
        let overrides = [
            (&mut p.max_moisture, o.max_moisture),
            (&mut p.min_moisture, o.min_moisture),
            (&mut p.rain_threshold, o.rain_threshold),
            (&mut p.et_threshold, o.et_threshold),
            (&mut p.flow_factor, o.flow_factor),
            (&mut p.tube_constant, o.tube_constant),
        ];
        for (field, value) in overrides {
            if let Some(v) = value {
                *field = v;
            }
        }
        Ok(p)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.forecast_path.trim().is_empty() {
            errors.push("forecast_path is empty".to_string());
        }
        if let Some(x) = self.initial_moisture {
            if !x.is_finite() {
                errors.push(format!("initial_moisture must be finite, got {x}"));
            }
        }
        if let Err(e) = self.trajectory() {
            errors.push(e.to_string());
        }
        match self.control_parameters() {
            Ok(p) => collect(&mut errors, "parameters", p.validate()),
            Err(e) => errors.push(e.to_string()),
        }
        if self.controller == ControllerKind::Mpc {
            errors.extend(self.mpc.violations().into_iter().map(|e| format!("mpc: {e}")));
            errors.extend(self.solver.validate());
            if self.num_steps == 0 {
                errors.push("num_steps must be at least 1".to_string());
            }
        }

        self.validate_sensor(&mut errors);
        self.validate_schedule(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        match s.kind {
            SensorKind::Stored => {
                if self.controller == ControllerKind::Rule && self.initial_moisture.is_none() {
                    errors.push("sensor: a stored sensor needs initial_moisture".to_string());
                }
            }
            SensorKind::Simulated => {
                if !(s.dry.is_finite() && s.wet.is_finite()) || s.dry >= s.wet {
                    errors.push(format!(
                        "sensor: dry ({}) must be below wet ({})",
                        s.dry, s.wet
                    ));
                }
            }
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let s = &self.schedule;
        if s.interval_sec == 0 {
            errors.push("schedule: interval_sec must be positive".to_string());
        }
        if s.cycle_timeout_ms == 0 {
            errors.push("schedule: cycle_timeout_ms must be positive".to_string());
        }
        if s.interval_sec > 0 && s.cycle_timeout_ms > s.interval_sec * 1000 {
            errors.push(format!(
                "schedule: cycle_timeout_ms ({}) exceeds the tick interval ({} s)",
                s.cycle_timeout_ms, s.interval_sec
            ));
        }
    }
}

fn collect(errors: &mut Vec<String>, section: &str, result: Result<(), ConfigError>) {
    match result {
        Ok(()) => {}
        Err(ConfigError::Invalid { violations }) => {
            errors.extend(violations.into_iter().map(|v| format!("{section}: {v}")));
        }
        Err(other) => errors.push(format!("{section}: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
