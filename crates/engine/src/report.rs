//! Actuation commands, per-step run records and the daily output log.

use serde::{Deserialize, Serialize};
use time::{Date, PrimitiveDateTime};
use tracing::{debug, warn};

/// Water to deliver this cycle. Both fields are always non-negative; zero
/// means no irrigation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuationCommand {
    pub volume_ml: f64,
    pub duration_s: f64,
}

impl ActuationCommand {
    pub const NONE: Self = Self {
        volume_ml: 0.0,
        duration_s: 0.0,
    };

    /// Negative or non-finite inputs are clamped to zero.
    pub fn new(volume_ml: f64, duration_s: f64) -> Self {
        Self {
            volume_ml: non_negative(volume_ml),
            duration_s: non_negative(duration_s),
        }
    }

    pub fn is_none(&self) -> bool {
        self.volume_ml == 0.0 && self.duration_s == 0.0
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    /// The solve failed; zero control was applied.
    SolverFailure(String),
    /// No usable forecast; zero control was applied.
    ForecastUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub timestamp: PrimitiveDateTime,
    /// Planning state at the start of the step.
    pub state: f64,
    /// Simulator output at the end of the step.
    pub next_state: f64,
    /// `None` when no control was produced for this step.
    pub control: Option<f64>,
    pub volume_ml: f64,
    pub duration_s: f64,
    pub cumulative_volume_ml: f64,
    pub cumulative_duration_s: f64,
    pub outcome: StepOutcome,
}

/// Running totals over a batch of receding-horizon steps.
#[derive(Debug, Clone)]
pub struct RunAccumulator {
    soil_depth: f64,
    flow_factor: f64,
    report: RunReport,
}

impl RunAccumulator {
    pub fn new(soil_depth: f64, flow_factor: f64) -> Self {
        Self {
            soil_depth,
            flow_factor,
            report: RunReport::default(),
        }
    }

    /// Record one step. A missing control contributes nothing but is
    /// counted.
    pub fn record(
        &mut self,
        step: usize,
        timestamp: PrimitiveDateTime,
        state: f64,
        next_state: f64,
        control: Option<f64>,
        outcome: StepOutcome,
    ) -> &StepRecord {
        let r = &mut self.report;
        match &outcome {
            StepOutcome::Applied => {}
            StepOutcome::SolverFailure(_) => r.solver_failures += 1,
            StepOutcome::ForecastUnavailable(_) => r.forecast_failures += 1,
        }

        let (volume_ml, duration_s) = match control {
            Some(u) => {
                let volume = u * self.soil_depth;
                (volume, volume * self.flow_factor / 1000.0)
            }
            None => {
                r.missing_controls += 1;
                (0.0, 0.0)
            }
        };
        r.total_volume_ml += volume_ml;
        r.total_duration_s += duration_s;

        debug!(
            step,
            control,
            volume_ml,
            cumulative_volume_ml = r.total_volume_ml,
            "step recorded"
        );

        r.steps.push(StepRecord {
            step,
            timestamp,
            state,
            next_state,
            control,
            volume_ml,
            duration_s,
            cumulative_volume_ml: r.total_volume_ml,
            cumulative_duration_s: r.total_duration_s,
            outcome,
        });
        let last = r.steps.len() - 1;
        &r.steps[last]
    }

    pub fn finish(self) -> RunReport {
        self.report
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub steps: Vec<StepRecord>,
    pub total_volume_ml: f64,
    pub total_duration_s: f64,
    pub solver_failures: usize,
    pub forecast_failures: usize,
    pub missing_controls: usize,
}

impl RunReport {
    /// Run totals as a clamped command.
    pub fn command(&self) -> ActuationCommand {
        ActuationCommand::new(self.total_volume_ml, self.total_duration_s)
    }

    /// State after the last step, if any step ran.
    pub fn terminal_state(&self) -> Option<f64> {
        self.steps.last().map(|s| s.next_state)
    }

    pub fn controls(&self) -> Vec<Option<f64>> {
        self.steps.iter().map(|s| s.control).collect()
    }
}

// ---------------------------------------------------------------------------
// Daily output log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub timestamp: PrimitiveDateTime,
    pub output_volume_ml: f64,
}

/// `{timestamp, output volume}` rows for the current local day.
///
/// Append-only within a day. The first row of a later date clears the log;
/// rows dated before the current day (a clock stepped back) are ignored.
/// Rows are keyed by minute: a second row in the same minute is ignored.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    day: Option<Date>,
    rows: Vec<OutputRow>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the row was ignored, either as a same-minute
    /// duplicate or because its date precedes the current day.
    pub fn push(&mut self, timestamp: PrimitiveDateTime, output_volume_ml: f64) -> bool {
        let date = timestamp.date();
        if self.day.is_some_and(|day| date < day) {
            warn!(%date, "row predates the current output day, ignored");
            return false;
        }
        if self.day != Some(date) {
            if !self.rows.is_empty() {
                debug!(rows = self.rows.len(), %date, "new day, clearing output log");
            }
            self.rows.clear();
            self.day = Some(date);
        }

        let minute = (timestamp.hour(), timestamp.minute());
        if self
            .rows
            .iter()
            .any(|r| (r.timestamp.hour(), r.timestamp.minute()) == minute)
        {
            return false;
        }

        self.rows.push(OutputRow {
            timestamp,
            output_volume_ml,
        });
        true
    }

    pub fn rows(&self) -> &[OutputRow] {
        &self.rows
    }

    pub fn total_volume_ml(&self) -> f64 {
        self.rows.iter().map(|r| r.output_volume_ml).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: PrimitiveDateTime = datetime!(2024-05-01 10:00);

    #[test]
    fn command_clamps_negative_and_nan() {
        assert_eq!(ActuationCommand::new(-5.0, f64::NAN), ActuationCommand::NONE);
        assert!(ActuationCommand::new(-5.0, -1.0).is_none());
        let c = ActuationCommand::new(10.0, 3.9);
        assert_eq!(c.volume_ml, 10.0);
        assert_eq!(c.duration_s, 3.9);
    }

    #[test]
    fn accumulator_converts_control_to_volume_and_duration() {
        let mut acc = RunAccumulator::new(60.0, 0.39);
        let rec = acc
            .record(0, T0, 0.2, 0.21, Some(0.1), StepOutcome::Applied)
            .clone();
        assert!((rec.volume_ml - 6.0).abs() < 1e-12);
        assert!((rec.duration_s - 6.0 * 0.39 / 1000.0).abs() < 1e-12);

        acc.record(1, T0, 0.21, 0.22, Some(0.2), StepOutcome::Applied);
        let report = acc.finish();
        assert!((report.total_volume_ml - 18.0).abs() < 1e-12);
        assert_eq!(
            report.steps.last().unwrap().cumulative_volume_ml,
            report.total_volume_ml
        );
        assert_eq!(report.terminal_state(), Some(0.22));
    }

    #[test]
    fn missing_control_counts_but_adds_nothing() {
        let mut acc = RunAccumulator::new(60.0, 0.39);
        acc.record(0, T0, 0.2, 0.2, Some(0.1), StepOutcome::Applied);
        acc.record(
            1,
            T0,
            0.2,
            0.19,
            None,
            StepOutcome::SolverFailure("did not converge".into()),
        );
        acc.record(
            2,
            T0,
            0.19,
            0.18,
            None,
            StepOutcome::ForecastUnavailable("status 503".into()),
        );
        let report = acc.finish();
        assert_eq!(report.missing_controls, 2);
        assert_eq!(report.solver_failures, 1);
        assert_eq!(report.forecast_failures, 1);
        assert!((report.total_volume_ml - 6.0).abs() < 1e-12);
        assert_eq!(report.controls(), vec![Some(0.1), None, None]);
    }

    #[test]
    fn report_serializes_outcomes() {
        let mut acc = RunAccumulator::new(60.0, 0.39);
        acc.record(
            0,
            T0,
            0.2,
            0.2,
            None,
            StepOutcome::SolverFailure("timeout".into()),
        );
        let json = serde_json::to_string(&acc.finish()).unwrap();
        assert!(json.contains(r#""kind":"solver_failure""#), "{json}");
        assert!(json.contains(r#""detail":"timeout""#), "{json}");
    }

    #[test]
    fn output_log_appends_within_day() {
        let mut log = OutputLog::new();
        assert!(log.push(datetime!(2024-05-01 10:00), 5.0));
        assert!(log.push(datetime!(2024-05-01 10:01), 7.0));
        assert_eq!(log.rows().len(), 2);
        assert_eq!(log.total_volume_ml(), 12.0);
    }

    #[test]
    fn output_log_ignores_same_minute() {
        let mut log = OutputLog::new();
        assert!(log.push(datetime!(2024-05-01 10:00:05), 5.0));
        assert!(!log.push(datetime!(2024-05-01 10:00:40), 9.0));
        assert_eq!(log.rows().len(), 1);
        assert_eq!(log.rows()[0].output_volume_ml, 5.0);
    }

    #[test]
    fn output_log_resets_at_midnight() {
        let mut log = OutputLog::new();
        log.push(datetime!(2024-05-01 23:59), 5.0);
        log.push(datetime!(2024-05-02 00:00), 1.0);
        assert_eq!(log.rows().len(), 1);
        assert_eq!(log.rows()[0].timestamp, datetime!(2024-05-02 00:00));
        // Same wall-clock minute on the new day is not a duplicate.
        assert!(log.push(datetime!(2024-05-02 23:59), 2.0));
    }

    #[test]
    fn output_log_ignores_rows_from_an_earlier_day() {
        let mut log = OutputLog::new();
        log.push(datetime!(2024-05-02 00:05), 4.0);
        log.push(datetime!(2024-05-02 00:06), 3.0);
        // Clock stepped back across midnight.
        assert!(!log.push(datetime!(2024-05-01 23:58), 9.0));
        assert_eq!(log.rows().len(), 2);
        assert_eq!(log.total_volume_ml(), 7.0);
        assert!(log.push(datetime!(2024-05-02 00:07), 1.0));
    }
}
