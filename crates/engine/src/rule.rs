//! Open-loop rule-based controller: a forecast gate plus an affine
//! duration formula.

use serde::Serialize;
use time::PrimitiveDateTime;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::forecast::{ForecastProvider, ForecastSample};
use crate::params::{ControlParameters, MoistureState};
use crate::report::ActuationCommand;
use crate::sensor::MoistureSensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Irrigate,
    MoistureAdequate,
    RainExpected,
    LowEvapotranspiration,
    /// The forecast could not be fetched.
    ForecastUnavailable,
    /// The forecast has no sample for the current hour.
    ForecastGap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub command: ActuationCommand,
    pub reason: DecisionReason,
}

impl Decision {
    fn skip(reason: DecisionReason) -> Self {
        Self {
            command: ActuationCommand::NONE,
            reason,
        }
    }
}

/// Weather gate for one forecast hour. `Err` carries the reason to skip.
pub fn gate(params: &ControlParameters, sample: &ForecastSample) -> Result<(), DecisionReason> {
    if sample.precipitation > params.rain_threshold {
        return Err(DecisionReason::RainExpected);
    }
    if sample.evapotranspiration < params.et_threshold {
        return Err(DecisionReason::LowEvapotranspiration);
    }
    Ok(())
}

/// Irrigation needed to lift `current` back to the lower moisture bound.
/// Zero when the soil is already at or above it.
pub fn irrigation_command(params: &ControlParameters, current: f64) -> ActuationCommand {
    if current >= params.min_moisture {
        return ActuationCommand::NONE;
    }
    let duration = (params.min_moisture - current) * params.soil_depth * params.flow_factor
        + params.tube_constant;
    ActuationCommand::new(duration / params.flow_factor, duration)
}

pub struct RuleBasedController<F, S> {
    params: ControlParameters,
    forecasts: F,
    sensor: S,
}

impl<F: ForecastProvider, S: MoistureSensor> RuleBasedController<F, S> {
    pub fn new(params: ControlParameters, forecasts: F, sensor: S) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            params,
            forecasts,
            sensor,
        })
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    /// Decide the command for the cycle starting at `now`. Never fails:
    /// forecast problems resolve to no irrigation.
    pub fn decide(&self, state: MoistureState, now: PrimitiveDateTime) -> Decision {
        let location = self.params.location;

        let forecast = match self.forecasts.fetch(location) {
            Ok(f) => f,
            Err(e) => {
                warn!(%location, error = %e, "forecast unavailable, not irrigating");
                return Decision::skip(DecisionReason::ForecastUnavailable);
            }
        };
        let sample = match forecast.sample_at(now) {
            Ok(s) => s,
            Err(e) => {
                warn!(%location, error = %e, "forecast gap, not irrigating");
                return Decision::skip(DecisionReason::ForecastGap);
            }
        };

        let decision = match gate(&self.params, sample) {
            Err(reason) => Decision::skip(reason),
            Ok(()) => {
                let command = irrigation_command(&self.params, state.value());
                let reason = if command.is_none() {
                    DecisionReason::MoistureAdequate
                } else {
                    DecisionReason::Irrigate
                };
                Decision { command, reason }
            }
        };

        info!(
            %location,
            moisture = state.value(),
            precipitation = sample.precipitation,
            evapotranspiration = sample.evapotranspiration,
            volume_ml = decision.command.volume_ml,
            duration_s = decision.command.duration_s,
            reason = ?decision.reason,
            "irrigation decision"
        );
        decision
    }

    /// One full cycle: decide, tell the sensor whether water is flowing,
    /// then refresh `state` from it.
    pub fn control_cycle(&mut self, state: &mut MoistureState, now: PrimitiveDateTime) -> Decision {
        let decision = self.decide(*state, now);
        self.sensor.set_watering(!decision.command.is_none());
        state.set(self.sensor.read());
        decision
    }
}
