//! Static controller configuration: site, calibration constants, gating
//! thresholds and the reference trajectory presets.
//!
//! Everything here is immutable once a controller is built. The only value
//! carried between control cycles is [`MoistureState`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Site selector. Picks the forecast source and the soil depth band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    /// Jeldu District, West Shewa Zone, Oromia (selector 1).
    Jeldu,
    /// Warwick University campus (selector 2).
    Warwick,
}

impl Location {
    pub fn from_selector(selector: u8) -> Result<Self, ConfigError> {
        match selector {
            1 => Ok(Self::Jeldu),
            2 => Ok(Self::Warwick),
            other => Err(ConfigError::UnknownLocation(other)),
        }
    }

    pub fn selector(self) -> u8 {
        match self {
            Self::Jeldu => 1,
            Self::Warwick => 2,
        }
    }

    /// Depth of the controlled soil layer in mm.
    pub fn soil_depth_mm(self) -> f64 {
        match self {
            Self::Jeldu => 540.0,
            Self::Warwick => 60.0,
        }
    }

    /// Soil-moisture band suffix used by the forecast payload
    /// (`soil_moisture_<band>`).
    pub fn depth_band(self) -> &'static str {
        match self {
            Self::Jeldu => "27_to_81cm",
            Self::Warwick => "3_to_9cm",
        }
    }

    pub fn coordinates(self) -> (f64, f64) {
        match self {
            Self::Jeldu => (9.30896538021007, 38.021007),
            Self::Warwick => (52.37574, -1.5595),
        }
    }

    /// IANA zone, URL-encoded the way the forecast service expects it.
    fn timezone(self) -> &'static str {
        match self {
            Self::Jeldu => "Africa%2FCairo",
            Self::Warwick => "Europe%2FLondon",
        }
    }

    /// One-day hourly forecast request for this site.
    pub fn forecast_url(self) -> String {
        let (lat, lon) = self.coordinates();
        format!(
            "https://api.open-meteo.com/v1/forecast?latitude={lat}&longitude={lon}\
             &hourly=precipitation,et0_fao_evapotranspiration,soil_moisture_{}\
             &timezone={}&forecast_days=1",
            self.depth_band(),
            self.timezone()
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jeldu => write!(f, "jeldu"),
            Self::Warwick => write!(f, "warwick"),
        }
    }
}

// ---------------------------------------------------------------------------
// Control parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlParameters {
    pub max_moisture: f64,
    pub min_moisture: f64,
    /// Forecast precipitation above this suppresses irrigation.
    pub rain_threshold: f64,
    /// Forecast evapotranspiration below this suppresses irrigation.
    pub et_threshold: f64,
    /// Pump calibration converting between duration and volume.
    pub flow_factor: f64,
    /// Fixed offset added to every computed duration (fill time of the tube).
    pub tube_constant: f64,
    pub location: Location,
    /// mm, fixed per location.
    pub soil_depth: f64,
}

impl ControlParameters {
    /// Calibration used for the rule-based controller at `location`.
    pub fn for_location(location: Location) -> Self {
        Self {
            max_moisture: 60.0,
            min_moisture: 30.0,
            rain_threshold: 0.2,
            et_threshold: 0.3,
            flow_factor: 0.39,
            tube_constant: 12.5,
            location,
            soil_depth: location.soil_depth_mm(),
        }
    }

    /// Validate every field. Returns an error listing every violation found
    /// (not just the first one).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let fields = [
            ("max_moisture", self.max_moisture),
            ("min_moisture", self.min_moisture),
            ("rain_threshold", self.rain_threshold),
            ("et_threshold", self.et_threshold),
            ("flow_factor", self.flow_factor),
            ("tube_constant", self.tube_constant),
            ("soil_depth", self.soil_depth),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                errors.push(format!("{name} must be finite, got {value}"));
            }
        }

        if self.min_moisture > self.max_moisture {
            errors.push(format!(
                "min_moisture ({}) must not exceed max_moisture ({})",
                self.min_moisture, self.max_moisture
            ));
        }
        if self.flow_factor <= 0.0 {
            errors.push(format!(
                "flow_factor must be positive, got {}",
                self.flow_factor
            ));
        }
        if self.soil_depth <= 0.0 {
            errors.push(format!(
                "soil_depth must be positive, got {}",
                self.soil_depth
            ));
        }
        if self.rain_threshold < 0.0 {
            errors.push(format!(
                "rain_threshold must not be negative, got {}",
                self.rain_threshold
            ));
        }
        if self.et_threshold < 0.0 {
            errors.push(format!(
                "et_threshold must not be negative, got {}",
                self.et_threshold
            ));
        }

        ConfigError::check(errors)
    }
}

// ---------------------------------------------------------------------------
// Reference trajectory
// ---------------------------------------------------------------------------

/// Growth-stage moisture target (volumetric fraction) tracked by the
/// receding-horizon controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trajectory {
    Early,
    Mid,
    Late,
}

impl Trajectory {
    /// Invalid selectors are a configuration error, never a silent default.
    pub fn from_selector(selector: u8) -> Result<Self, ConfigError> {
        match selector {
            1 => Ok(Self::Early),
            2 => Ok(Self::Mid),
            3 => Ok(Self::Late),
            other => Err(ConfigError::UnknownTrajectory(other)),
        }
    }

    pub fn target(self) -> f64 {
        match self {
            Self::Early => 0.42,
            Self::Mid => 0.45,
            Self::Late => 0.48,
        }
    }
}

// ---------------------------------------------------------------------------
// Carried state
// ---------------------------------------------------------------------------

/// Current soil-moisture level. The only value carried between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoistureState(pub f64);

impl MoistureState {
    pub fn value(self) -> f64 {
        self.0
    }

    pub(crate) fn set(&mut self, value: f64) {
        self.0 = value;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_params() -> ControlParameters {
        ControlParameters::for_location(Location::Warwick)
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(params: &ControlParameters, needle: &str) {
        let err = params.validate().unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Location ---------------------------------------------------------

    #[test]
    fn location_selectors_round_trip() {
        assert_eq!(Location::from_selector(1).unwrap(), Location::Jeldu);
        assert_eq!(Location::from_selector(2).unwrap(), Location::Warwick);
        assert_eq!(Location::Warwick.selector(), 2);
    }

    #[test]
    fn unknown_location_rejected() {
        assert_eq!(
            Location::from_selector(3),
            Err(ConfigError::UnknownLocation(3))
        );
    }

    #[test]
    fn soil_depth_follows_location() {
        assert_eq!(Location::Jeldu.soil_depth_mm(), 540.0);
        assert_eq!(Location::Warwick.soil_depth_mm(), 60.0);
        assert_eq!(valid_params().soil_depth, 60.0);
    }

    #[test]
    fn forecast_url_names_depth_band() {
        let url = Location::Warwick.forecast_url();
        assert!(url.contains("latitude=52.37574"));
        assert!(url.contains("soil_moisture_3_to_9cm"));
        assert!(url.contains("timezone=Europe%2FLondon"));
        assert!(Location::Jeldu.forecast_url().contains("soil_moisture_27_to_81cm"));
    }

    // -- Parameters -------------------------------------------------------

    #[test]
    fn defaults_pass() {
        valid_params().validate().unwrap();
    }

    #[test]
    fn equal_bounds_pass() {
        let mut p = valid_params();
        p.min_moisture = 40.0;
        p.max_moisture = 40.0;
        p.validate().unwrap();
    }

    #[test]
    fn min_above_max_rejected() {
        let mut p = valid_params();
        p.min_moisture = 70.0;
        assert_validation_err(&p, "min_moisture (70) must not exceed max_moisture (60)");
    }

    #[test]
    fn zero_flow_factor_rejected() {
        let mut p = valid_params();
        p.flow_factor = 0.0;
        assert_validation_err(&p, "flow_factor must be positive");
    }

    #[test]
    fn negative_flow_factor_rejected() {
        let mut p = valid_params();
        p.flow_factor = -0.39;
        assert_validation_err(&p, "flow_factor must be positive");
    }

    #[test]
    fn nan_rejected() {
        let mut p = valid_params();
        p.tube_constant = f64::NAN;
        assert_validation_err(&p, "tube_constant must be finite");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut p = valid_params();
        p.min_moisture = 90.0;
        p.flow_factor = 0.0;
        p.rain_threshold = -1.0;
        let msg = p.validate().unwrap_err().to_string();
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("max_moisture"));
        assert!(msg.contains("flow_factor"));
        assert!(msg.contains("rain_threshold"));
    }

    // -- Trajectory -------------------------------------------------------

    #[test]
    fn trajectory_presets() {
        assert_eq!(Trajectory::from_selector(1).unwrap().target(), 0.42);
        assert_eq!(Trajectory::from_selector(2).unwrap().target(), 0.45);
        assert_eq!(Trajectory::from_selector(3).unwrap().target(), 0.48);
    }

    #[test]
    fn trajectory_selector_four_is_config_error() {
        assert_eq!(
            Trajectory::from_selector(4),
            Err(ConfigError::UnknownTrajectory(4))
        );
        assert!(Trajectory::from_selector(0).is_err());
    }
}
