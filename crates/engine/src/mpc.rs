//! Receding-horizon controller.
//!
//! Each step solves a finite-horizon tracking problem from the current state
//! estimate, applies only the first control, advances the simulator with it
//! and feeds the simulated state back as the next planning state.

use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::forecast::{ForecastAlignment, ForecastProvider};
use crate::optimizer::{ControlBounds, HorizonProblem, ObjectiveWeights, Optimizer};
use crate::params::{ControlParameters, MoistureState, Trajectory};
use crate::plant::{DiscretizationScheme, Disturbance, LinearStep, PlantModel};
use crate::report::{RunAccumulator, RunReport, StepOutcome};

/// Disturbance driving the simulated plant (as opposed to the planner).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantDisturbance {
    /// The plant sees no precipitation or evapotranspiration.
    #[default]
    None,
    /// The plant sees the forecast value for the current step.
    Forecast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    pub horizon: usize,
    /// Model time units per control step.
    pub step_size: f64,
    /// Steps over which the scenario tree branches. With no uncertain
    /// parameters there is a single branch whatever the value.
    pub robust_horizon: usize,
    pub scheme: DiscretizationScheme,
    pub min_irrigation: f64,
    pub max_irrigation: f64,
    pub weights: ObjectiveWeights,
    /// Wall-clock seconds per control step, for forecast alignment.
    pub cycle_secs: u32,
    pub alignment: ForecastAlignment,
    pub plant_disturbance: PlantDisturbance,
    /// RK4 sub-steps per control step in the simulator.
    pub simulator_substeps: usize,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            horizon: 5,
            step_size: 0.02,
            robust_horizon: 1,
            scheme: DiscretizationScheme::RadauCollocation,
            min_irrigation: 0.0,
            max_irrigation: 0.2,
            weights: ObjectiveWeights::default(),
            cycle_secs: 60,
            alignment: ForecastAlignment::Timestamp,
            plant_disturbance: PlantDisturbance::None,
            simulator_substeps: 10,
        }
    }
}

impl MpcConfig {
    pub fn bounds(&self) -> ControlBounds {
        ControlBounds {
            min: self.min_irrigation,
            max: self.max_irrigation,
        }
    }

    pub fn cycle(&self) -> time::Duration {
        time::Duration::seconds(i64::from(self.cycle_secs))
    }

    /// Collect every violation; an empty list means valid.
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.horizon == 0 {
            errors.push("horizon must be at least 1".to_string());
        }
        if self.robust_horizon > self.horizon {
            errors.push(format!(
                "robust_horizon ({}) must not exceed horizon ({})",
                self.robust_horizon, self.horizon
            ));
        }
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            errors.push(format!(
                "step_size must be positive, got {}",
                self.step_size
            ));
        }
        if !(self.min_irrigation.is_finite() && self.max_irrigation.is_finite()) {
            errors.push("irrigation bounds must be finite".to_string());
        } else if self.min_irrigation > self.max_irrigation {
            errors.push(format!(
                "min_irrigation ({}) must not exceed max_irrigation ({})",
                self.min_irrigation, self.max_irrigation
            ));
        }
        let w = &self.weights;
        for (name, value) in [
            ("stage", w.stage),
            ("terminal", w.terminal),
            ("control_rate", w.control_rate),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                errors.push(format!("weights.{name} must be non-negative, got {value}"));
            }
        }
        if self.cycle_secs == 0 {
            errors.push("cycle_secs must be at least 1".to_string());
        }
        if self.simulator_substeps == 0 {
            errors.push("simulator_substeps must be at least 1".to_string());
        }

        errors
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.violations())
    }
}

/// Where the first planning state comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitialState {
    Fixed(f64),
    /// Uniform draw from `[low, high)` with an explicit seed.
    Seeded { seed: u64, low: f64, high: f64 },
}

impl Default for InitialState {
    fn default() -> Self {
        Self::Seeded {
            seed: 99,
            low: 0.1,
            high: 0.3,
        }
    }
}

impl InitialState {
    /// The starting state. Rejects non-finite values and a reversed band.
    pub fn draw(&self) -> Result<f64, ConfigError> {
        match *self {
            Self::Fixed(x) => {
                if !x.is_finite() {
                    return Err(ConfigError::Invalid {
                        violations: vec![format!("initial state must be finite, got {x}")],
                    });
                }
                Ok(x)
            }
            Self::Seeded { seed, low, high } => {
                if !(low.is_finite() && high.is_finite() && low <= high) {
                    return Err(ConfigError::Invalid {
                        violations: vec![format!(
                            "initial state band [{low}, {high}) must be finite with low <= high"
                        )],
                    });
                }
                let mut rng = fastrand::Rng::with_seed(seed);
                Ok(low + rng.f64() * (high - low))
            }
        }
    }
}

/// Plant stand-in. Integrates the continuous model with RK4.
#[derive(Debug, Clone, Copy)]
pub struct Simulator {
    model: PlantModel,
    dt: f64,
    substeps: usize,
}

impl Simulator {
    pub fn new(model: PlantModel, dt: f64, substeps: usize) -> Self {
        Self {
            model,
            dt,
            substeps,
        }
    }

    pub fn step(&self, x: f64, u: f64, d: Disturbance) -> f64 {
        self.model.integrate(x, u, d, self.dt, self.substeps)
    }
}

pub trait Estimator {
    /// Planning state for the next step given the simulator output.
    fn estimate(&mut self, simulated: f64) -> f64;
}

/// Full-state feedback: the simulated state is used as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateFeedback;

impl Estimator for StateFeedback {
    fn estimate(&mut self, simulated: f64) -> f64 {
        simulated
    }
}

pub struct RecedingHorizonController<O, F, E = StateFeedback> {
    params: ControlParameters,
    trajectory: Trajectory,
    config: MpcConfig,
    step: LinearStep,
    simulator: Simulator,
    optimizer: O,
    forecasts: F,
    estimator: E,
}

impl<O, F> RecedingHorizonController<O, F, StateFeedback>
where
    O: Optimizer,
    F: ForecastProvider,
{
    pub fn new(
        params: ControlParameters,
        trajectory: Trajectory,
        model: PlantModel,
        config: MpcConfig,
        optimizer: O,
        forecasts: F,
    ) -> Result<Self, ConfigError> {
        let mut errors = match params.validate() {
            Err(ConfigError::Invalid { violations }) => violations,
            Err(other) => return Err(other),
            Ok(()) => Vec::new(),
        };
        errors.extend(config.violations());
        ConfigError::check(errors)?;

        let step = model.discretize(config.scheme, config.step_size)?;
        let simulator = Simulator::new(model, config.step_size, config.simulator_substeps);

        Ok(Self {
            params,
            trajectory,
            config,
            step,
            simulator,
            optimizer,
            forecasts,
            estimator: StateFeedback,
        })
    }
}

impl<O, F, E> RecedingHorizonController<O, F, E>
where
    O: Optimizer,
    F: ForecastProvider,
    E: Estimator,
{
    /// Swap the state estimator.
    pub fn with_estimator<E2: Estimator>(self, estimator: E2) -> RecedingHorizonController<O, F, E2> {
        RecedingHorizonController {
            params: self.params,
            trajectory: self.trajectory,
            config: self.config,
            step: self.step,
            simulator: self.simulator,
            optimizer: self.optimizer,
            forecasts: self.forecasts,
            estimator,
        }
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn params(&self) -> &ControlParameters {
        &self.params
    }

    /// Run `num_steps` receding-horizon steps starting at wall-clock `start`.
    ///
    /// Fails only on an invalid initial state. Once running it never aborts:
    /// a step whose forecast or solve fails applies zero control and is
    /// counted in the report.
    pub fn run(
        &mut self,
        initial: InitialState,
        num_steps: usize,
        start: PrimitiveDateTime,
    ) -> Result<RunReport, ConfigError> {
        let x = initial.draw()?;
        Ok(self.run_from(x, num_steps, start))
    }

    fn run_from(
        &mut self,
        initial_state: f64,
        num_steps: usize,
        start: PrimitiveDateTime,
    ) -> RunReport {
        let target = self.trajectory.target();
        let mut acc = RunAccumulator::new(self.params.soil_depth, self.params.flow_factor);
        let mut x = initial_state;
        let mut previous_control = 0.0;
        let mut now = start;

        info!(
            location = %self.params.location,
            initial_state = x,
            target,
            num_steps,
            horizon = self.config.horizon,
            "receding-horizon run started"
        );

        for k in 0..num_steps {
            let (control, outcome, disturbance) = self.plan_step(x, previous_control, now);

            let plant_disturbance = match self.config.plant_disturbance {
                PlantDisturbance::None => Disturbance::ZERO,
                PlantDisturbance::Forecast => disturbance,
            };
            let applied = control.unwrap_or(0.0);
            let next = self.simulator.step(x, applied, plant_disturbance);
            acc.record(k, now, x, next, control, outcome);

            x = self.estimator.estimate(next);
            previous_control = applied;
            now += self.config.cycle();
        }

        let report = acc.finish();
        info!(
            location = %self.params.location,
            total_volume_ml = report.total_volume_ml,
            total_duration_s = report.total_duration_s,
            solver_failures = report.solver_failures,
            forecast_failures = report.forecast_failures,
            final_state = report.terminal_state(),
            "receding-horizon run finished"
        );
        report
    }

    /// Run from `state` and leave it at the simulator's terminal state.
    pub fn control_cycle(
        &mut self,
        state: &mut MoistureState,
        num_steps: usize,
        start: PrimitiveDateTime,
    ) -> RunReport {
        let report = self.run_from(state.value(), num_steps, start);
        if let Some(x) = report.terminal_state() {
            state.set(x);
        }
        report
    }

    /// Fetch, build and solve one horizon problem. Returns the control to
    /// apply (if any), the step outcome and the forecast disturbance for the
    /// current step.
    fn plan_step(
        &self,
        x: f64,
        previous_control: f64,
        now: PrimitiveDateTime,
    ) -> (Option<f64>, StepOutcome, Disturbance) {
        let location = self.params.location;
        let disturbances = self.forecasts.fetch(location).and_then(|f| {
            f.disturbances(
                now,
                self.config.cycle(),
                self.config.horizon,
                self.config.alignment,
            )
        });
        let disturbances = match disturbances {
            Ok(d) => d,
            Err(e) => {
                warn!(%location, %now, error = %e, "no usable forecast, applying zero control");
                return (
                    None,
                    StepOutcome::ForecastUnavailable(e.to_string()),
                    Disturbance::ZERO,
                );
            }
        };
        let current = disturbances.first().copied().unwrap_or(Disturbance::ZERO);

        let problem = HorizonProblem {
            initial_state: x,
            target: self.trajectory.target(),
            step: self.step,
            disturbances,
            previous_control,
            bounds: self.config.bounds(),
            weights: self.config.weights,
        };

        match self.optimizer.solve(&problem) {
            Ok(plan) => {
                debug!(
                    %now,
                    state = x,
                    u0 = plan.first_control(),
                    cost = plan.cost,
                    iterations = plan.iterations,
                    "horizon plan"
                );
                let outcome = match plan.first_control() {
                    Some(_) => StepOutcome::Applied,
                    None => StepOutcome::SolverFailure("plan has no controls".into()),
                };
                (plan.first_control(), outcome, current)
            }
            Err(e) => {
                warn!(%now, state = x, error = %e, "solve failed, applying zero control");
                (None, StepOutcome::SolverFailure(e.to_string()), current)
            }
        }
    }
}
