//! Finite-horizon tracking problem and the solver capability.
//!
//! The discretized dynamics are linear, so the state trajectory is an affine
//! function of the controls. [`ActiveSetSolver`] substitutes the dynamics
//! into the objective (condensing) and solves the remaining quadratic
//! program over the controls, subject only to box bounds:
//!
//! ```text
//! x = G u + f
//! J(u) = (x - r)' Q (x - r) + rho * |D u - d0|^2
//! ```
//!
//! `G` is lower triangular with `G[k][j] = a^(k-j) * b`, `f` is the free
//! response (zero control, forecast disturbances), `D` differences
//! consecutive controls and `d0` carries the last applied control.

use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, SolverError};
use crate::plant::{Disturbance, LinearStep};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlBounds {
    pub min: f64,
    pub max: f64,
}

impl ControlBounds {
    pub fn clamp(&self, u: f64) -> f64 {
        u.clamp(self.min, self.max)
    }

    pub fn contains(&self, u: f64) -> bool {
        (self.min..=self.max).contains(&u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    /// Weight of `(target - x_k)^2` for `k = 1..N-1`.
    pub stage: f64,
    /// Weight of `(target - x_N)^2`.
    pub terminal: f64,
    /// Weight of `(u_k - u_{k-1})^2`.
    pub control_rate: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            stage: 1.0,
            terminal: 1.0,
            control_rate: 1e-4,
        }
    }
}

/// One horizon solve: everything the optimizer needs, nothing it doesn't.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonProblem {
    pub initial_state: f64,
    pub target: f64,
    pub step: LinearStep,
    /// One entry per horizon step; its length is the horizon.
    pub disturbances: Vec<Disturbance>,
    /// Control applied in the previous cycle (`u_{-1}` in the rate penalty).
    pub previous_control: f64,
    pub bounds: ControlBounds,
    pub weights: ObjectiveWeights,
}

impl HorizonProblem {
    pub fn horizon(&self) -> usize {
        self.disturbances.len()
    }

    pub fn validate(&self) -> Result<(), SolverError> {
        let mut errors: Vec<String> = Vec::new();

        if self.disturbances.is_empty() {
            errors.push("horizon must be at least 1".into());
        }
        let scalars = [
            ("initial_state", self.initial_state),
            ("target", self.target),
            ("a", self.step.a),
            ("b", self.step.b),
            ("previous_control", self.previous_control),
            ("bounds.min", self.bounds.min),
            ("bounds.max", self.bounds.max),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                errors.push(format!("{name} must be finite, got {value}"));
            }
        }
        if self.bounds.min > self.bounds.max {
            errors.push(format!(
                "bounds.min ({}) must not exceed bounds.max ({})",
                self.bounds.min, self.bounds.max
            ));
        }
        let w = &self.weights;
        for (name, value) in [
            ("stage", w.stage),
            ("terminal", w.terminal),
            ("control_rate", w.control_rate),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                errors.push(format!("weight {name} must be non-negative, got {value}"));
            }
        }
        if self
            .disturbances
            .iter()
            .any(|d| !(d.precipitation.is_finite() && d.evapotranspiration.is_finite()))
        {
            errors.push("disturbances must be finite".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SolverError::ProblemSetup {
                what: errors.join("; "),
            })
        }
    }

    /// States `x_0..x_N` produced by `controls` under the model.
    pub fn rollout(&self, controls: &[f64]) -> Vec<f64> {
        let mut states = Vec::with_capacity(controls.len() + 1);
        let mut x = self.initial_state;
        states.push(x);
        for (u, d) in controls.iter().zip(&self.disturbances) {
            x = self.step.next(x, *u, *d);
            states.push(x);
        }
        states
    }

    /// Objective value of a control sequence.
    pub fn cost(&self, controls: &[f64]) -> f64 {
        let states = self.rollout(controls);
        let n = controls.len();
        let w = &self.weights;

        let tracking: f64 = states
            .iter()
            .enumerate()
            .skip(1)
            .map(|(k, x)| {
                let q = if k == n { w.terminal } else { w.stage };
                q * (self.target - x).powi(2)
            })
            .sum();

        let mut prev = self.previous_control;
        let mut rate = 0.0;
        for &u in controls {
            rate += (u - prev).powi(2);
            prev = u;
        }
        tracking + w.control_rate * rate
    }
}

/// Result of one solve. Only the first control is ever applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonPlan {
    /// `x_0..x_N`
    pub states: Vec<f64>,
    /// `u_0..u_{N-1}`
    pub controls: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
}

impl HorizonPlan {
    pub fn first_control(&self) -> Option<f64> {
        self.controls.first().copied()
    }
}

/// Solver capability. Implementations must return controls inside the
/// problem's bounds or an error.
pub trait Optimizer {
    fn solve(&self, problem: &HorizonProblem) -> Result<HorizonPlan, SolverError>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn solve(&self, problem: &HorizonProblem) -> Result<HorizonPlan, SolverError> {
        (**self).solve(problem)
    }
}

// ---------------------------------------------------------------------------
// Active-set solver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub max_iterations: usize,
    /// Threshold for a zero step and for a negative multiplier.
    pub tolerance: f64,
    /// Wall-clock budget for one solve.
    #[serde(rename = "time_budget_ms", with = "budget_ms")]
    pub time_budget: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-9,
            time_budget: Duration::from_millis(250),
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_iterations == 0 {
            errors.push("solver.max_iterations must be at least 1".to_string());
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            errors.push(format!(
                "solver.tolerance must be positive, got {}",
                self.tolerance
            ));
        }
        if self.time_budget.is_zero() {
            errors.push("solver.time_budget_ms must be positive".to_string());
        }
        errors
    }
}

mod budget_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Primal active-set method for the condensed box-constrained QP.
///
/// Starts from the feasible point `clamp(0)`, keeps the bounds that are
/// active in a working set, takes Newton steps on the free controls and
/// releases the bound with the most negative multiplier until the KKT
/// conditions hold.
#[derive(Debug, Clone, Default)]
pub struct ActiveSetSolver {
    config: SolverConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Free,
    Lower,
    Upper,
}

impl ActiveSetSolver {
    pub fn new(config: SolverConfig) -> Result<Self, ConfigError> {
        ConfigError::check(config.validate())?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }
}

impl Optimizer for ActiveSetSolver {
    fn solve(&self, problem: &HorizonProblem) -> Result<HorizonPlan, SolverError> {
        problem.validate()?;
        let started = Instant::now();
        let cfg = &self.config;
        let (hessian, linear) = condense(problem);
        if hessian.iter().chain(linear.iter()).any(|v| !v.is_finite()) {
            return Err(SolverError::Numeric {
                what: "condensed problem has non-finite coefficients".into(),
            });
        }

        let n = problem.horizon();
        let ControlBounds { min: lo, max: hi } = problem.bounds;

        let mut u = DVector::from_element(n, problem.bounds.clamp(0.0));
        let mut working: Vec<Bound> = (0..n)
            .map(|i| {
                if u[i] <= lo {
                    Bound::Lower
                } else if u[i] >= hi {
                    Bound::Upper
                } else {
                    Bound::Free
                }
            })
            .collect();

        for iteration in 0..cfg.max_iterations {
            let elapsed = started.elapsed();
            if elapsed >= cfg.time_budget {
                return Err(SolverError::Timeout {
                    iterations: iteration,
                    elapsed,
                });
            }

            let gradient = &hessian * &u + &linear;
            let free: Vec<usize> = (0..n).filter(|&i| working[i] == Bound::Free).collect();
            let step = newton_step(&hessian, &gradient, &free)?;

            let step_norm = step.iter().map(|(_, p)| p * p).sum::<f64>().sqrt();
            if step_norm <= cfg.tolerance * (1.0 + u.norm()) {
                // Stationary on the current face. Check multipliers of the
                // bounds held in the working set.
                let release = (0..n)
                    .filter(|_| lo < hi)
                    .filter_map(|i| match working[i] {
                        Bound::Free => None,
                        Bound::Lower => Some((i, gradient[i])),
                        Bound::Upper => Some((i, -gradient[i])),
                    })
                    .filter(|&(_, lambda)| lambda < -cfg.tolerance)
                    .min_by(|a, b| a.1.total_cmp(&b.1));

                match release {
                    Some((i, lambda)) => {
                        debug!(iteration, index = i, lambda, "releasing bound");
                        working[i] = Bound::Free;
                    }
                    None => {
                        let controls: Vec<f64> =
                            u.iter().map(|&v| problem.bounds.clamp(v)).collect();
                        let plan = HorizonPlan {
                            states: problem.rollout(&controls),
                            cost: problem.cost(&controls),
                            controls,
                            iterations: iteration + 1,
                        };
                        debug!(
                            iterations = plan.iterations,
                            cost = plan.cost,
                            u0 = plan.controls[0],
                            elapsed_us = started.elapsed().as_micros() as u64,
                            "horizon solved"
                        );
                        return Ok(plan);
                    }
                }
                continue;
            }

            // Longest feasible fraction of the step; the first bound hit
            // joins the working set.
            let mut alpha = 1.0;
            let mut blocking: Option<(usize, Bound)> = None;
            for &(i, p) in &step {
                let (limit, side) = if p < 0.0 {
                    ((lo - u[i]) / p, Bound::Lower)
                } else if p > 0.0 {
                    ((hi - u[i]) / p, Bound::Upper)
                } else {
                    continue;
                };
                if limit < alpha {
                    alpha = limit.max(0.0);
                    blocking = Some((i, side));
                }
            }

            for &(i, p) in &step {
                u[i] += alpha * p;
            }
            if let Some((i, side)) = blocking {
                u[i] = if side == Bound::Lower { lo } else { hi };
                working[i] = side;
            }
        }

        Err(SolverError::ConvergenceFailed {
            what: format!(
                "no KKT point within {} iterations",
                cfg.max_iterations
            ),
        })
    }
}

/// Hessian and linear term of `1/2 u' H u + c' u`.
fn condense(problem: &HorizonProblem) -> (DMatrix<f64>, DVector<f64>) {
    let n = problem.horizon();
    let LinearStep { a, b } = problem.step;
    let w = &problem.weights;

    let mut gamma = DMatrix::<f64>::zeros(n, n);
    for row in 0..n {
        let mut coeff = b;
        for col in (0..=row).rev() {
            gamma[(row, col)] = coeff;
            coeff *= a;
        }
    }

    // Free response minus the target.
    let mut residual = DVector::<f64>::zeros(n);
    let mut x = problem.initial_state;
    for (k, d) in problem.disturbances.iter().enumerate() {
        x = a * x + b * d.net();
        residual[k] = x - problem.target;
    }

    let q = DMatrix::from_diagonal(&DVector::from_fn(n, |k, _| {
        if k + 1 == n {
            w.terminal
        } else {
            w.stage
        }
    }));

    let mut diff = DMatrix::<f64>::identity(n, n);
    for k in 1..n {
        diff[(k, k - 1)] = -1.0;
    }
    let mut d0 = DVector::<f64>::zeros(n);
    d0[0] = problem.previous_control;

    let gamma_t_q = gamma.transpose() * &q;
    let diff_t = diff.transpose();
    let hessian = (&gamma_t_q * &gamma + &diff_t * &diff * w.control_rate) * 2.0;
    let linear = (&gamma_t_q * &residual - &diff_t * &d0 * w.control_rate) * 2.0;
    (hessian, linear)
}

/// Newton step on the free controls with the others held fixed. Returns
/// `(index, component)` pairs.
fn newton_step(
    hessian: &DMatrix<f64>,
    gradient: &DVector<f64>,
    free: &[usize],
) -> Result<Vec<(usize, f64)>, SolverError> {
    if free.is_empty() {
        return Ok(Vec::new());
    }
    let m = free.len();
    let reduced = DMatrix::from_fn(m, m, |r, c| hessian[(free[r], free[c])]);
    let rhs = DVector::from_fn(m, |r, _| -gradient[free[r]]);
    let chol = reduced.cholesky().ok_or_else(|| SolverError::Numeric {
        what: format!("reduced Hessian on {m} free controls is not positive definite"),
    })?;
    let p = chol.solve(&rhs);
    Ok(free.iter().copied().zip(p.iter().copied()).collect())
}
