//! Moisture sensor seam.
//!
//! The controllers only need a scalar reading. Two implementations ship:
//! [`StoredReading`], which returns whatever was last stored, and
//! [`SimulatedProbe`], a seeded random-walk probe for local runs.

use std::fmt;

use serde::{Deserialize, Serialize};

pub trait MoistureSensor {
    /// Synchronous read of the current soil moisture.
    fn read(&mut self) -> f64;

    /// Irrigation started or stopped. Physical probes ignore this.
    fn set_watering(&mut self, _active: bool) {}
}

impl<S: MoistureSensor + ?Sized> MoistureSensor for Box<S> {
    fn read(&mut self) -> f64 {
        (**self).read()
    }

    fn set_watering(&mut self, active: bool) {
        (**self).set_watering(active)
    }
}

// ---------------------------------------------------------------------------
// Stored reading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredReading {
    value: f64,
}

impl StoredReading {
    pub fn new(value: f64) -> Self {
        Self { value }
    }

    pub fn set(&mut self, value: f64) {
        self.value = value;
    }
}

impl MoistureSensor for StoredReading {
    fn read(&mut self) -> f64 {
        self.value
    }
}

// ---------------------------------------------------------------------------
// Simulated probe
// ---------------------------------------------------------------------------

/// Behaviour presets for [`SimulatedProbe`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// Starts mid-range and dries steadily.
    #[default]
    Drying,
    /// Hovers near the centre with little noise.
    Stable,
    /// Starts near the wet end, dries slowly.
    Wet,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

/// Random-walk moisture probe with mean reversion, drying drift, reading
/// noise and a wetting response while irrigation is active.
///
/// All randomness comes from one seeded generator, so two probes built with
/// the same arguments produce the same readings.
pub struct SimulatedProbe {
    rng: fastrand::Rng,
    /// Underlying "true" moisture. Evolves on every read.
    level: f64,
    dry: f64,
    wet: f64,
    center: f64,
    drift_per_read: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    watering: bool,
    wet_rate: f64,
}

impl SimulatedProbe {
    /// `dry`/`wet` bound the readings (in the caller's moisture unit,
    /// `dry < wet`).
    pub fn new(scenario: Scenario, dry: f64, wet: f64, seed: u64) -> Self {
        let range = wet - dry;
        // Fractions of the range per read. `start` is measured from the dry end.
        let (drift, walk, reversion, noise, start) = match scenario {
            Scenario::Drying => (0.002, 0.01, 0.02, 0.005, 0.5),
            Scenario::Stable => (0.0003, 0.004, 0.05, 0.002, 0.5),
            Scenario::Wet => (0.0005, 0.006, 0.02, 0.004, 0.8),
        };
        Self {
            rng: fastrand::Rng::with_seed(seed),
            level: dry + start * range,
            dry,
            wet,
            center: dry + 0.5 * range,
            drift_per_read: drift * range,
            walk_sigma: walk * range,
            mean_reversion: reversion,
            noise_sigma: noise * range,
            watering: false,
            wet_rate: 0.04 * range,
        }
    }

    /// Approximate N(0, 1) by the Irwin-Hall sum of 12 uniforms.
    fn std_normal(&mut self) -> f64 {
        (0..12).map(|_| self.rng.f64()).sum::<f64>() - 6.0
    }
}

impl MoistureSensor for SimulatedProbe {
    fn read(&mut self) -> f64 {
        let pull = self.mean_reversion * (self.center - self.level);
        let walk = self.walk_sigma * self.std_normal();
        let wet = if self.watering { self.wet_rate } else { 0.0 };

        self.level = (self.level - self.drift_per_read + pull + walk + wet)
            .clamp(self.dry, self.wet);

        let noise = self.noise_sigma * self.std_normal();
        (self.level + noise).clamp(self.dry, self.wet)
    }

    fn set_watering(&mut self, active: bool) {
        self.watering = active;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(probe: &mut SimulatedProbe, n: usize) -> Vec<f64> {
        (0..n).map(|_| probe.read()).collect()
    }

    fn mean(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn stored_reading_returns_last_value() {
        let mut s = StoredReading::new(35.0);
        assert_eq!(s.read(), 35.0);
        s.set(20.0);
        assert_eq!(s.read(), 20.0);
    }

    #[test]
    fn boxed_sensor_delegates() {
        let mut s: Box<dyn MoistureSensor> = Box::new(StoredReading::new(12.0));
        assert_eq!(s.read(), 12.0);
        s.set_watering(true);
        assert_eq!(s.read(), 12.0);
    }

    #[test]
    fn boxed_simulated_sensor_forwards_watering() {
        let mut plain = SimulatedProbe::new(Scenario::Drying, 0.0, 100.0, 4);
        let mut boxed: Box<dyn MoistureSensor> =
            Box::new(SimulatedProbe::new(Scenario::Drying, 0.0, 100.0, 4));
        plain.set_watering(true);
        boxed.set_watering(true);
        let boxed_readings: Vec<f64> = (0..10).map(|_| boxed.read()).collect();
        assert_eq!(collect(&mut plain, 10), boxed_readings);
    }

    #[test]
    fn readings_stay_in_range() {
        let mut probe = SimulatedProbe::new(Scenario::Drying, 10.0, 60.0, 7);
        for v in collect(&mut probe, 1000) {
            assert!((10.0..=60.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn same_seed_same_readings() {
        let mut a = SimulatedProbe::new(Scenario::Stable, 0.0, 1.0, 42);
        let mut b = SimulatedProbe::new(Scenario::Stable, 0.0, 1.0, 42);
        assert_eq!(collect(&mut a, 50), collect(&mut b, 50));
    }

    #[test]
    fn temporal_coherence() {
        let mut probe = SimulatedProbe::new(Scenario::Stable, 0.0, 100.0, 3);
        let samples = collect(&mut probe, 200);
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_jump < 10.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn watering_raises_readings() {
        let mut probe = SimulatedProbe::new(Scenario::Drying, 0.0, 100.0, 11);
        let before = mean(&collect(&mut probe, 20));
        probe.set_watering(true);
        collect(&mut probe, 30);
        let after = mean(&collect(&mut probe, 20));
        assert!(
            after > before,
            "watering should raise readings: before={before:.1} after={after:.1}"
        );
    }

    #[test]
    fn wet_scenario_starts_high() {
        let mut probe = SimulatedProbe::new(Scenario::Wet, 0.0, 100.0, 5);
        let avg = mean(&collect(&mut probe, 10));
        assert!(avg > 50.0, "wet scenario should start above midpoint: {avg:.1}");
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Drying.to_string(), "drying");
        assert_eq!(Scenario::Wet.to_string(), "wet");
    }
}
