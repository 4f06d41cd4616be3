//! File-backed forecast source.
//!
//! An external fetcher drops the Open-Meteo response for the configured
//! location at `forecast_path`; every fetch re-reads it.

use std::path::PathBuf;

use irrigation_engine::{Forecast, ForecastError, ForecastProvider, Location};

#[derive(Debug, Clone)]
pub struct FileForecast {
    path: PathBuf,
}

impl FileForecast {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ForecastProvider for FileForecast {
    fn fetch(&self, location: Location) -> Result<Forecast, ForecastError> {
        let json = std::fs::read_to_string(&self.path).map_err(|e| ForecastError::Unavailable {
            location,
            reason: format!("{}: {e}", self.path.display()),
        })?;
        Forecast::from_open_meteo(location, &json)
    }
}
