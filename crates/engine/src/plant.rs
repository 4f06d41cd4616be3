//! Soil-moisture dynamics.
//!
//! Continuous-time scalar model
//!
//! ```text
//! dx/dt = (1 - c) * x + u - e + p
//! ```
//!
//! with state `x`, irrigation input `u`, and exogenous precipitation `p` and
//! evapotranspiration `e`. Every discretization below is affine in the state
//! and the net input `u + p - e`, so a step reduces to a [`LinearStep`].

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Decay coefficient of the reference plant.
pub const DEFAULT_DECAY: f64 = 0.8;

/// Exogenous inputs over one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Disturbance {
    pub precipitation: f64,
    pub evapotranspiration: f64,
}

impl Disturbance {
    pub const ZERO: Self = Self {
        precipitation: 0.0,
        evapotranspiration: 0.0,
    };

    pub fn new(precipitation: f64, evapotranspiration: f64) -> Self {
        Self {
            precipitation,
            evapotranspiration,
        }
    }

    /// Net water added by the environment (`p - e`).
    pub fn net(self) -> f64 {
        self.precipitation - self.evapotranspiration
    }
}

/// Recognized ODE discretizations for the horizon problem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscretizationScheme {
    /// Explicit Euler.
    ForwardEuler,
    /// Radau collocation, degree 1, one finite element per step. For this
    /// model it coincides with the implicit Euler step.
    #[default]
    RadauCollocation,
    /// Exact solution with inputs held constant over the step.
    ZeroOrderHold,
}

/// `x_next = a * x + b * (u + p - e)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearStep {
    pub a: f64,
    pub b: f64,
}

impl LinearStep {
    pub fn next(&self, x: f64, u: f64, d: Disturbance) -> f64 {
        self.a * x + self.b * (u + d.net())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantModel {
    decay: f64,
}

impl Default for PlantModel {
    fn default() -> Self {
        Self {
            decay: DEFAULT_DECAY,
        }
    }
}

impl PlantModel {
    pub fn new(decay: f64) -> Result<Self, ConfigError> {
        if !decay.is_finite() {
            return Err(ConfigError::Invalid {
                violations: vec![format!("decay coefficient must be finite, got {decay}")],
            });
        }
        Ok(Self { decay })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    /// State coefficient `1 - c` of the right-hand side.
    fn rate(&self) -> f64 {
        1.0 - self.decay
    }

    pub fn derivative(&self, x: f64, u: f64, d: Disturbance) -> f64 {
        self.rate() * x + u - d.evapotranspiration + d.precipitation
    }

    /// Discretize with step `dt`. Fails when the implicit step is singular
    /// or flips sign (`1 - dt * (1 - c) <= 0`).
    pub fn discretize(
        &self,
        scheme: DiscretizationScheme,
        dt: f64,
    ) -> Result<LinearStep, ConfigError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(ConfigError::Invalid {
                violations: vec![format!("step size must be positive, got {dt}")],
            });
        }
        let lambda = self.rate();

        let step = match scheme {
            DiscretizationScheme::ForwardEuler => LinearStep {
                a: 1.0 + dt * lambda,
                b: dt,
            },
            DiscretizationScheme::RadauCollocation => {
                let denom = 1.0 - dt * lambda;
                if denom <= 0.0 {
                    return Err(ConfigError::Invalid {
                        violations: vec![format!(
                            "step size {dt} too large for radau collocation with decay {}",
                            self.decay
                        )],
                    });
                }
                LinearStep {
                    a: 1.0 / denom,
                    b: dt / denom,
                }
            }
            DiscretizationScheme::ZeroOrderHold => {
                if lambda.abs() < 1e-12 {
                    LinearStep { a: 1.0, b: dt }
                } else {
                    let a = (lambda * dt).exp();
                    LinearStep {
                        a,
                        b: (a - 1.0) / lambda,
                    }
                }
            }
        };
        Ok(step)
    }

    /// Advance the continuous model by `dt` with classical RK4 over
    /// `substeps` equal sub-intervals. Inputs are held over the interval.
    pub fn integrate(&self, x: f64, u: f64, d: Disturbance, dt: f64, substeps: usize) -> f64 {
        let n = substeps.max(1);
        let h = dt / n as f64;
        let f = |x: f64| self.derivative(x, u, d);

        let mut x = x;
        for _ in 0..n {
            let k1 = f(x);
            let k2 = f(x + 0.5 * h * k1);
            let k3 = f(x + 0.5 * h * k2);
            let k4 = f(x + h * k3);
            x += h / 6.0 * (k1 + 2.0 * k2 + 2.0 * k3 + k4);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 0.02;

    #[test]
    fn derivative_matches_reference_rhs() {
        let model = PlantModel::default();
        let d = Disturbance::new(0.3, 0.1);
        // (1 - 0.8) * 0.5 + 0.1 - 0.1 + 0.3
        let expected = 0.2 * 0.5 + 0.1 - 0.1 + 0.3;
        assert!((model.derivative(0.5, 0.1, d) - expected).abs() < 1e-12);
    }

    #[test]
    fn forward_euler_coefficients() {
        let step = PlantModel::default()
            .discretize(DiscretizationScheme::ForwardEuler, DT)
            .unwrap();
        assert!((step.a - 1.004).abs() < 1e-12);
        assert!((step.b - DT).abs() < 1e-12);
    }

    #[test]
    fn radau_is_implicit_euler() {
        let model = PlantModel::default();
        let step = model
            .discretize(DiscretizationScheme::RadauCollocation, DT)
            .unwrap();
        let (x, u, d) = (0.3, 0.1, Disturbance::new(0.05, 0.02));
        let next = step.next(x, u, d);
        // Implicit Euler residual: next - x - dt * f(next) == 0
        let residual = next - x - DT * model.derivative(next, u, d);
        assert!(residual.abs() < 1e-12, "residual {residual}");
    }

    #[test]
    fn schemes_agree_for_small_steps() {
        let model = PlantModel::default();
        let d = Disturbance::new(0.01, 0.03);
        let exact = model
            .discretize(DiscretizationScheme::ZeroOrderHold, 1e-4)
            .unwrap()
            .next(0.4, 0.1, d);
        for scheme in [
            DiscretizationScheme::ForwardEuler,
            DiscretizationScheme::RadauCollocation,
        ] {
            let approx = model.discretize(scheme, 1e-4).unwrap().next(0.4, 0.1, d);
            assert!((approx - exact).abs() < 1e-8, "{scheme:?}: {approx} vs {exact}");
        }
    }

    #[test]
    fn zero_order_hold_without_decay_term() {
        let model = PlantModel::new(1.0).unwrap();
        let step = model
            .discretize(DiscretizationScheme::ZeroOrderHold, DT)
            .unwrap();
        assert_eq!(step, LinearStep { a: 1.0, b: DT });
    }

    #[test]
    fn rk4_matches_zero_order_hold() {
        let model = PlantModel::default();
        let d = Disturbance::new(0.2, 0.1);
        let exact = model
            .discretize(DiscretizationScheme::ZeroOrderHold, DT)
            .unwrap()
            .next(0.25, 0.15, d);
        let rk4 = model.integrate(0.25, 0.15, d, DT, 10);
        assert!((rk4 - exact).abs() < 1e-12, "{rk4} vs {exact}");
    }

    #[test]
    fn non_positive_step_rejected() {
        let model = PlantModel::default();
        assert!(model
            .discretize(DiscretizationScheme::ForwardEuler, 0.0)
            .is_err());
        assert!(model
            .discretize(DiscretizationScheme::ForwardEuler, -0.02)
            .is_err());
    }

    #[test]
    fn oversized_implicit_step_rejected() {
        // 1 - dt * 0.2 <= 0 once dt >= 5
        let err = PlantModel::default()
            .discretize(DiscretizationScheme::RadauCollocation, 5.0)
            .unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn non_finite_decay_rejected() {
        assert!(PlantModel::new(f64::INFINITY).is_err());
    }
}
