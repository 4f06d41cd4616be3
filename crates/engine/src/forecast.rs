//! Hourly weather forecasts and the provider seam.
//!
//! A [`Forecast`] is an ordered series of hourly samples for one location.
//! Lookups use local wall-clock hours (`PrimitiveDateTime`), the same clock
//! the forecast service reports in.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Duration, PrimitiveDateTime, Time};
use tracing::debug;

use crate::error::ForecastError;
use crate::params::Location;
use crate::plant::Disturbance;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSample {
    pub timestamp: PrimitiveDateTime,
    pub precipitation: f64,
    pub evapotranspiration: f64,
    pub forecast_moisture: Option<f64>,
}

impl ForecastSample {
    pub fn disturbance(&self) -> Disturbance {
        Disturbance::new(self.precipitation, self.evapotranspiration)
    }
}

/// How horizon steps are matched to forecast samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastAlignment {
    /// Each step uses the sample for its own future hour. Past the end of the
    /// series the last sample is held.
    #[default]
    Timestamp,
    /// Every step uses the final sample of the fetch. Kept to reproduce
    /// legacy runs for comparison.
    LastSample,
}

/// Truncate to the start of the hour.
pub fn truncate_to_hour(t: PrimitiveDateTime) -> PrimitiveDateTime {
    t.replace_time(Time::MIDNIGHT) + Duration::hours(i64::from(t.hour()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    location: Location,
    samples: Vec<ForecastSample>,
}

impl Forecast {
    pub fn new(location: Location, mut samples: Vec<ForecastSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self { location, samples }
    }

    /// Parse an Open-Meteo hourly response.
    ///
    /// Hours with a `null` precipitation or evapotranspiration value are
    /// dropped, so a later lookup of that hour reports a gap.
    pub fn from_open_meteo(location: Location, json: &str) -> Result<Self, ForecastError> {
        let response: OpenMeteoResponse =
            serde_json::from_str(json).map_err(|e| ForecastError::Malformed {
                what: e.to_string(),
            })?;
        let hourly = response.hourly;

        let n = hourly.time.len();
        if hourly.precipitation.len() != n || hourly.et0_fao_evapotranspiration.len() != n {
            return Err(ForecastError::Malformed {
                what: format!(
                    "hourly arrays differ in length (time {n}, precipitation {}, \
                     et0_fao_evapotranspiration {})",
                    hourly.precipitation.len(),
                    hourly.et0_fao_evapotranspiration.len()
                ),
            });
        }

        let band = format!("soil_moisture_{}", location.depth_band());
        let moisture: Vec<Option<f64>> = match hourly.rest.get(&band) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ForecastError::Malformed {
                    what: format!("{band}: {e}"),
                }
            })?,
            None => vec![None; n],
        };
        if moisture.len() != n {
            return Err(ForecastError::Malformed {
                what: format!("{band} has {} entries, expected {n}", moisture.len()),
            });
        }

        let format = format_description!("[year]-[month]-[day]T[hour]:[minute]");
        let mut samples = Vec::with_capacity(n);
        for (i, raw) in hourly.time.iter().enumerate() {
            let timestamp =
                PrimitiveDateTime::parse(raw, format).map_err(|e| ForecastError::Malformed {
                    what: format!("timestamp {raw:?}: {e}"),
                })?;
            let (Some(precipitation), Some(evapotranspiration)) =
                (hourly.precipitation[i], hourly.et0_fao_evapotranspiration[i])
            else {
                debug!(%timestamp, "dropping forecast hour with missing values");
                continue;
            };
            samples.push(ForecastSample {
                timestamp,
                precipitation,
                evapotranspiration,
                forecast_moisture: moisture[i],
            });
        }

        Ok(Self::new(location, samples))
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn samples(&self) -> &[ForecastSample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The sample for the hour containing `now`. No nearest-hour guessing.
    pub fn sample_at(&self, now: PrimitiveDateTime) -> Result<&ForecastSample, ForecastError> {
        let hour = truncate_to_hour(now);
        self.samples
            .binary_search_by_key(&hour, |s| s.timestamp)
            .map(|i| &self.samples[i])
            .map_err(|_| ForecastError::Lookup { timestamp: hour })
    }

    /// Disturbances for `n` horizon steps, step `k` starting at
    /// `start + k * cycle`.
    pub fn disturbances(
        &self,
        start: PrimitiveDateTime,
        cycle: Duration,
        n: usize,
        alignment: ForecastAlignment,
    ) -> Result<Vec<Disturbance>, ForecastError> {
        let last = self.samples.last().ok_or(ForecastError::Empty)?;

        match alignment {
            ForecastAlignment::LastSample => Ok(vec![last.disturbance(); n]),
            ForecastAlignment::Timestamp => {
                let mut out = Vec::with_capacity(n);
                let mut t = start;
                for _ in 0..n {
                    let hour = truncate_to_hour(t);
                    // Latest sample at or before `hour`; first sample when
                    // `hour` precedes the series.
                    let idx = self
                        .samples
                        .partition_point(|s| s.timestamp <= hour)
                        .saturating_sub(1);
                    out.push(self.samples[idx].disturbance());
                    t += cycle;
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: HourlyBlock,
}

#[derive(Debug, Deserialize)]
struct HourlyBlock {
    time: Vec<String>,
    precipitation: Vec<Option<f64>>,
    et0_fao_evapotranspiration: Vec<Option<f64>>,
    #[serde(flatten)]
    rest: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Source of hourly forecasts. Called fresh for every decision; results are
/// never cached by the controllers.
pub trait ForecastProvider {
    fn fetch(&self, location: Location) -> Result<Forecast, ForecastError>;
}

impl<F> ForecastProvider for F
where
    F: Fn(Location) -> Result<Forecast, ForecastError>,
{
    fn fetch(&self, location: Location) -> Result<Forecast, ForecastError> {
        self(location)
    }
}

/// Serves the same forecast on every fetch, whatever location is asked for.
#[derive(Debug, Clone)]
pub struct StaticForecast {
    forecast: Forecast,
}

impl StaticForecast {
    pub fn new(forecast: Forecast) -> Self {
        Self { forecast }
    }
}

impl ForecastProvider for StaticForecast {
    fn fetch(&self, _location: Location) -> Result<Forecast, ForecastError> {
        Ok(self.forecast.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample(timestamp: PrimitiveDateTime, p: f64, e: f64) -> ForecastSample {
        ForecastSample {
            timestamp,
            precipitation: p,
            evapotranspiration: e,
            forecast_moisture: None,
        }
    }

    fn three_hours() -> Forecast {
        Forecast::new(
            Location::Warwick,
            vec![
                sample(datetime!(2024-05-01 10:00), 0.0, 0.4),
                sample(datetime!(2024-05-01 11:00), 0.1, 0.5),
                sample(datetime!(2024-05-01 12:00), 0.6, 0.2),
            ],
        )
    }

    const PAYLOAD: &str = r#"{
        "latitude": 52.375,
        "longitude": -1.56,
        "hourly_units": {"time": "iso8601", "precipitation": "mm"},
        "hourly": {
            "time": ["2024-05-01T00:00", "2024-05-01T01:00", "2024-05-01T02:00"],
            "precipitation": [0.0, null, 0.3],
            "et0_fao_evapotranspiration": [0.01, 0.02, 0.05],
            "soil_moisture_3_to_9cm": [0.31, 0.30, 0.29]
        }
    }"#;

    #[test]
    fn truncates_to_hour() {
        assert_eq!(
            truncate_to_hour(datetime!(2024-05-01 13:47:12)),
            datetime!(2024-05-01 13:00)
        );
    }

    #[test]
    fn parses_open_meteo_and_drops_null_hours() {
        let f = Forecast::from_open_meteo(Location::Warwick, PAYLOAD).unwrap();
        assert_eq!(f.samples().len(), 2);
        let s = f.sample_at(datetime!(2024-05-01 02:30)).unwrap();
        assert_eq!(s.precipitation, 0.3);
        assert_eq!(s.evapotranspiration, 0.05);
        assert_eq!(s.forecast_moisture, Some(0.29));

        let err = f.sample_at(datetime!(2024-05-01 01:15)).unwrap_err();
        assert_eq!(
            err,
            ForecastError::Lookup {
                timestamp: datetime!(2024-05-01 01:00)
            }
        );
    }

    #[test]
    fn other_depth_band_leaves_moisture_empty() {
        let f = Forecast::from_open_meteo(Location::Jeldu, PAYLOAD).unwrap();
        assert!(f.samples().iter().all(|s| s.forecast_moisture.is_none()));
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let json = r#"{"hourly": {
            "time": ["2024-05-01T00:00", "2024-05-01T01:00"],
            "precipitation": [0.0],
            "et0_fao_evapotranspiration": [0.1, 0.1]
        }}"#;
        let err = Forecast::from_open_meteo(Location::Warwick, json).unwrap_err();
        assert!(matches!(err, ForecastError::Malformed { .. }), "{err}");
    }

    #[test]
    fn bad_timestamp_is_malformed() {
        let json = r#"{"hourly": {
            "time": ["yesterday"],
            "precipitation": [0.0],
            "et0_fao_evapotranspiration": [0.1]
        }}"#;
        let err = Forecast::from_open_meteo(Location::Warwick, json).unwrap_err();
        assert!(err.to_string().contains("yesterday"));
    }

    #[test]
    fn samples_are_sorted() {
        let f = Forecast::new(
            Location::Warwick,
            vec![
                sample(datetime!(2024-05-01 12:00), 0.0, 0.0),
                sample(datetime!(2024-05-01 10:00), 0.0, 0.0),
            ],
        );
        assert!(f.samples()[0].timestamp < f.samples()[1].timestamp);
    }

    #[test]
    fn timestamp_alignment_indexes_forward() {
        let d = three_hours()
            .disturbances(
                datetime!(2024-05-01 10:30),
                Duration::minutes(30),
                4,
                ForecastAlignment::Timestamp,
            )
            .unwrap();
        // 10:30, 11:00, 11:30, 12:00
        assert_eq!(d[0], Disturbance::new(0.0, 0.4));
        assert_eq!(d[1], Disturbance::new(0.1, 0.5));
        assert_eq!(d[2], Disturbance::new(0.1, 0.5));
        assert_eq!(d[3], Disturbance::new(0.6, 0.2));
    }

    #[test]
    fn timestamp_alignment_holds_ends() {
        let f = three_hours();
        let before = f
            .disturbances(
                datetime!(2024-05-01 08:00),
                Duration::minutes(1),
                2,
                ForecastAlignment::Timestamp,
            )
            .unwrap();
        assert!(before.iter().all(|d| *d == Disturbance::new(0.0, 0.4)));

        let after = f
            .disturbances(
                datetime!(2024-05-01 18:00),
                Duration::hours(1),
                3,
                ForecastAlignment::Timestamp,
            )
            .unwrap();
        assert!(after.iter().all(|d| *d == Disturbance::new(0.6, 0.2)));
    }

    #[test]
    fn last_sample_alignment_repeats_final_value() {
        let d = three_hours()
            .disturbances(
                datetime!(2024-05-01 10:00),
                Duration::hours(1),
                5,
                ForecastAlignment::LastSample,
            )
            .unwrap();
        assert_eq!(d.len(), 5);
        assert!(d.iter().all(|d| *d == Disturbance::new(0.6, 0.2)));
    }

    #[test]
    fn empty_forecast_has_no_disturbances() {
        let f = Forecast::new(Location::Warwick, Vec::new());
        let err = f
            .disturbances(
                datetime!(2024-05-01 10:00),
                Duration::minutes(1),
                5,
                ForecastAlignment::Timestamp,
            )
            .unwrap_err();
        assert_eq!(err, ForecastError::Empty);
    }

    #[test]
    fn closures_are_providers() {
        let provider = |location: Location| -> Result<Forecast, ForecastError> {
            Err(ForecastError::Unavailable {
                location,
                reason: "status 503".into(),
            })
        };
        let err = provider.fetch(Location::Jeldu).unwrap_err();
        assert!(err.to_string().contains("jeldu"));

        let fixed = StaticForecast::new(three_hours());
        assert_eq!(fixed.fetch(Location::Warwick).unwrap().samples().len(), 3);
    }
}
