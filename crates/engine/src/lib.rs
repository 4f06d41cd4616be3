//! Irrigation decision engine.
//!
//! Two controllers decide how much water to deliver before the next control
//! cycle: [`RuleBasedController`] (forecast gate plus an affine duration
//! formula) and [`RecedingHorizonController`] (repeated finite-horizon
//! tracking solves against the soil-moisture model).

pub mod error;
pub mod forecast;
pub mod mpc;
pub mod optimizer;
pub mod params;
pub mod plant;
pub mod report;
pub mod rule;
pub mod sensor;

pub use error::{ConfigError, EngineError, EngineResult, ForecastError, SolverError};
pub use forecast::{Forecast, ForecastAlignment, ForecastProvider, ForecastSample, StaticForecast};
pub use mpc::{
    Estimator, InitialState, MpcConfig, PlantDisturbance, RecedingHorizonController, Simulator,
    StateFeedback,
};
pub use optimizer::{
    ActiveSetSolver, ControlBounds, HorizonPlan, HorizonProblem, ObjectiveWeights, Optimizer,
    SolverConfig,
};
pub use params::{ControlParameters, Location, MoistureState, Trajectory};
pub use plant::{DiscretizationScheme, Disturbance, LinearStep, PlantModel};
pub use report::{ActuationCommand, OutputLog, RunReport, StepOutcome, StepRecord};
pub use rule::{Decision, DecisionReason, RuleBasedController};
pub use sensor::{MoistureSensor, SimulatedProbe, StoredReading};
