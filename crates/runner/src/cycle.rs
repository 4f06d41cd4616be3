//! One control cycle: whichever controller the config selects, plus the
//! moisture state carried between cycles.

use anyhow::Result;
use serde::Serialize;
use time::PrimitiveDateTime;

use irrigation_engine::mpc::InitialState;
use irrigation_engine::{
    ActiveSetSolver, ActuationCommand, Decision, ForecastProvider, MoistureSensor, MoistureState,
    PlantModel, RecedingHorizonController, RuleBasedController, RunReport, SimulatedProbe,
    StoredReading,
};

use crate::config::{Config, ControllerKind, SensorKind};

pub type BoxedSensor = Box<dyn MoistureSensor + Send>;

pub enum Controller<F> {
    Rule(RuleBasedController<F, BoxedSensor>),
    Mpc {
        controller: RecedingHorizonController<ActiveSetSolver, F>,
        num_steps: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "controller", rename_all = "snake_case")]
pub enum CycleDetail {
    Rule { decision: Decision },
    Mpc { report: RunReport },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub timestamp: PrimitiveDateTime,
    pub command: ActuationCommand,
    /// Moisture state carried into the next cycle.
    pub moisture: f64,
    pub detail: CycleDetail,
}

pub struct Engine<F> {
    controller: Controller<F>,
    state: MoistureState,
}

impl<F: ForecastProvider> Engine<F> {
    pub fn new(controller: Controller<F>, state: MoistureState) -> Self {
        Self { controller, state }
    }

    /// Build the controller a validated config describes.
    pub fn from_config(cfg: &Config, forecasts: F) -> Result<Self> {
        let params = cfg.control_parameters()?;

        let mut sensor: BoxedSensor = match cfg.sensor.kind {
            SensorKind::Stored => Box::new(StoredReading::new(cfg.initial_moisture.unwrap_or(0.0))),
            SensorKind::Simulated => Box::new(SimulatedProbe::new(
                cfg.sensor.scenario,
                cfg.sensor.dry,
                cfg.sensor.wet,
                cfg.sensor.seed,
            )),
        };

        let engine = match cfg.controller {
            ControllerKind::Rule => {
                let initial = cfg.initial_moisture.unwrap_or_else(|| sensor.read());
                let controller = RuleBasedController::new(params, forecasts, sensor)?;
                Self::new(Controller::Rule(controller), MoistureState(initial))
            }
            ControllerKind::Mpc => {
                let initial = match cfg.initial_moisture {
                    Some(x) => x,
                    None => InitialState::Seeded {
                        seed: cfg.seed,
                        low: 0.1,
                        high: 0.3,
                    }
                    .draw()?,
                };
                let controller = RecedingHorizonController::new(
                    params,
                    cfg.trajectory()?,
                    PlantModel::default(),
                    cfg.mpc.clone(),
                    ActiveSetSolver::new(cfg.solver)?,
                    forecasts,
                )?;
                Self::new(
                    Controller::Mpc {
                        controller,
                        num_steps: cfg.num_steps,
                    },
                    MoistureState(initial),
                )
            }
        };
        Ok(engine)
    }

    pub fn moisture(&self) -> f64 {
        self.state.value()
    }

    pub fn cycle(&mut self, now: PrimitiveDateTime) -> CycleOutcome {
        let (outcome, next) = self.evaluate(now);
        self.state = next;
        outcome
    }

    /// Like [`Engine::cycle`], but the new state is kept only if `commit`
    /// returns `true` once the controller has finished. Otherwise the
    /// carried state is left untouched and `None` is returned.
    pub fn cycle_if(
        &mut self,
        now: PrimitiveDateTime,
        commit: impl FnOnce() -> bool,
    ) -> Option<CycleOutcome> {
        let (outcome, next) = self.evaluate(now);
        if !commit() {
            return None;
        }
        self.state = next;
        Some(outcome)
    }

    /// Run the controller on a copy of the carried state.
    fn evaluate(&mut self, now: PrimitiveDateTime) -> (CycleOutcome, MoistureState) {
        let mut state = self.state;
        let (command, detail) = match &mut self.controller {
            Controller::Rule(c) => {
                let decision = c.control_cycle(&mut state, now);
                (decision.command, CycleDetail::Rule { decision })
            }
            Controller::Mpc {
                controller,
                num_steps,
            } => {
                let report = controller.control_cycle(&mut state, *num_steps, now);
                (report.command(), CycleDetail::Mpc { report })
            }
        };
        let outcome = CycleOutcome {
            timestamp: now,
            command,
            moisture: state.value(),
            detail,
        };
        (outcome, state)
    }
}
