use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Error type for covariate operations
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CovariateError {
    #[error("Covariate '{name}' already has an observation at time {time}")]
    ObservationExists { name: String, time: f64 },
    #[error("Covariate '{name}' has no observations")]
    MissingSegments { name: String },
    #[error("Covariate '{name}' received a non-finite value at time {time}")]
    NonFinite { name: String, time: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CovariateObservation {
    time: f64,
    value: f64,
}

impl CovariateObservation {
    pub(crate) fn new(time: f64, value: f64) -> Self {
        CovariateObservation { time, value }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Method used to interpolate covariate values between observations
#[derive(Serialize, Clone, Debug, Deserialize, PartialEq)]
pub enum Interpolation {
    /// Linear interpolation between two points with slope and intercept
    Linear { slope: f64, intercept: f64 },
    /// Constant value carried forward
    CarryForward { value: f64 },
}

/// A segment of a piecewise interpolation function, valid on `[from, to)`.
#[derive(Serialize, Clone, Debug, Deserialize, PartialEq)]
struct CovariateSegment {
    from: f64,
    to: f64,
    method: Interpolation,
}

impl CovariateSegment {
    fn new(from: f64, to: f64, method: Interpolation) -> Self {
        CovariateSegment { from, to, method }
    }

    #[inline]
    fn interpolate(&self, time: f64) -> Option<f64> {
        if !self.in_interval(time) {
            return None;
        }
        match self.method {
            Interpolation::Linear { slope, intercept } => Some(slope * time + intercept),
            Interpolation::CarryForward { value } => Some(value),
        }
    }

    #[inline]
    fn in_interval(&self, time: f64) -> bool {
        self.from <= time && time < self.to
    }
}

/// A time-varying covariate consisting of raw observations and the piecewise
/// segments derived from them.
///
/// Segments are rebuilt whenever an observation changes, so interpolation
/// never sees stale data. Before the first observation the first value is
/// carried backwards, after the last one the last value is carried forward.
#[derive(Serialize, Clone, Debug, Deserialize, PartialEq)]
pub struct Covariate {
    name: String,
    observations: Vec<CovariateObservation>,
    segments: Vec<CovariateSegment>,
    /// Always use carry-forward interpolation
    fixed: bool,
}

impl Covariate {
    /// Create an empty covariate
    ///
    /// * `fixed` - use carry-forward instead of linear interpolation
    pub fn new(name: impl Into<String>, fixed: bool) -> Self {
        Covariate {
            name: name.into(),
            observations: Vec::new(),
            segments: Vec::new(),
            fixed,
        }
    }

    pub fn add_observation(&mut self, time: f64, value: f64) -> Result<(), CovariateError> {
        if !value.is_finite() {
            return Err(CovariateError::NonFinite {
                name: self.name.clone(),
                time,
            });
        }
        if self.observations.iter().any(|obs| obs.time == time) {
            return Err(CovariateError::ObservationExists {
                name: self.name.clone(),
                time,
            });
        }
        self.observations
            .push(CovariateObservation::new(time, value));
        self.observations.sort_by(|a, b| a.time.total_cmp(&b.time));
        self.build_segments();
        Ok(())
    }

    pub fn observations(&self) -> &[CovariateObservation] {
        &self.observations
    }

    fn build_segments(&mut self) {
        self.segments.clear();
        for (i, current) in self.observations.iter().enumerate() {
            let next = self.observations.get(i + 1);
            let to = next.map_or(f64::INFINITY, |next| next.time);
            let method = match next {
                Some(next) if !self.fixed => {
                    let slope = (next.value - current.value) / (next.time - current.time);
                    Interpolation::Linear {
                        slope,
                        intercept: current.value - slope * current.time,
                    }
                }
                _ => Interpolation::CarryForward {
                    value: current.value,
                },
            };
            self.segments
                .push(CovariateSegment::new(current.time, to, method));
        }
    }

    /// Interpolate the covariate value at a specific time
    #[inline]
    pub fn interpolate(&self, time: f64) -> Result<f64, CovariateError> {
        let first = self
            .observations
            .first()
            .ok_or_else(|| CovariateError::MissingSegments {
                name: self.name.clone(),
            })?;
        if time < first.time {
            return Ok(first.value);
        }
        if let Some(value) = self
            .segments
            .iter()
            .find(|segment| segment.in_interval(time))
            .and_then(|segment| segment.interpolate(time))
        {
            return Ok(value);
        }
        // only reachable for non-finite times
        self.observations
            .last()
            .map(|obs| obs.value)
            .ok_or_else(|| CovariateError::MissingSegments {
                name: self.name.clone(),
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switch between carry-forward and linear interpolation
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
        self.build_segments();
    }

    pub fn fixed(&self) -> bool {
        self.fixed
    }
}

/// A collection of [Covariate]s, keyed by name
#[derive(Serialize, Clone, Debug, Deserialize, Default, PartialEq)]
pub struct Covariates {
    covariates: BTreeMap<String, Covariate>,
}

impl Covariates {
    pub fn new() -> Self {
        Covariates {
            covariates: BTreeMap::new(),
        }
    }

    pub fn covariates(&self) -> impl Iterator<Item = &Covariate> {
        self.covariates.values()
    }

    pub fn get_covariate(&self, name: &str) -> Option<&Covariate> {
        self.covariates.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }

    /// Add an observation to a covariate, creating the covariate if it doesn't exist
    pub fn add_observation(
        &mut self,
        name: &str,
        time: f64,
        value: f64,
    ) -> Result<(), CovariateError> {
        self.covariates
            .entry(name.to_string())
            .or_insert_with(|| Covariate::new(name, false))
            .add_observation(time, value)
    }

    /// Set a covariate as fixed (carry-forward interpolation)
    pub fn set_covariate_fixed(&mut self, name: &str, fixed: bool) -> bool {
        if let Some(covariate) = self.covariates.get_mut(name) {
            covariate.set_fixed(fixed);
            true
        } else {
            false
        }
    }

    /// Interpolated value of `name` at `time`, `None` if the covariate is absent
    pub fn value(&self, name: &str, time: f64) -> Option<f64> {
        self.covariates
            .get(name)
            .and_then(|covariate| covariate.interpolate(time).ok())
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Covariates:")?;
        for covariate in self.covariates.values() {
            let method = if covariate.fixed { "carry-forward" } else { "linear" };
            write!(f, " {} ({})", covariate.name, method)?;
            for obs in &covariate.observations {
                write!(f, " {:.2}={:.2}", obs.time, obs.value)?;
            }
            write!(f, ";")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covariates_are_displayed_by_name() {
        let mut covariates = Covariates::new();
        covariates.add_observation("wt", 0.0, 70.0).unwrap();
        covariates.add_observation("wt", 12.0, 72.5).unwrap();
        covariates.add_observation("sex", 0.0, 1.0).unwrap();
        covariates.set_covariate_fixed("sex", true);
        assert_eq!(
            covariates.to_string(),
            "Covariates: sex (carry-forward) 0.00=1.00; wt (linear) 0.00=70.00 12.00=72.50;"
        );
    }

    #[test]
    fn test_covariate_linear_interpolation() {
        let segment = CovariateSegment::new(
            0.0,
            10.0,
            Interpolation::Linear {
                slope: 1.0,
                intercept: 0.0,
            },
        );
        assert_eq!(segment.interpolate(0.0), Some(0.0));
        assert_eq!(segment.interpolate(5.0), Some(5.0));
        assert_eq!(segment.interpolate(10.0), None);
    }

    #[test]
    fn test_covariate_data_api() {
        let mut covariates = Covariates::new();
        covariates.add_observation("weight", 0.0, 70.0).unwrap();
        covariates.add_observation("weight", 24.0, 75.0).unwrap();
        covariates.add_observation("weight", 12.0, 72.0).unwrap();
        covariates.add_observation("age", 0.0, 35.0).unwrap();
        covariates.set_covariate_fixed("age", true);

        let weight = covariates.get_covariate("weight").unwrap();
        assert_eq!(weight.interpolate(-5.0).unwrap(), 70.0);
        assert_eq!(weight.interpolate(6.0).unwrap(), 71.0);
        assert_eq!(weight.interpolate(18.0).unwrap(), 73.5);
        assert_eq!(weight.interpolate(30.0).unwrap(), 75.0);

        assert_eq!(covariates.value("age", 100.0), Some(35.0));
        assert_eq!(covariates.value("height", 0.0), None);
    }

    #[test]
    fn test_fixed_covariate_carries_forward() {
        let mut covariate = Covariate::new("dose_group", true);
        covariate.add_observation(0.0, 1.0).unwrap();
        covariate.add_observation(10.0, 2.0).unwrap();
        assert_eq!(covariate.interpolate(9.99).unwrap(), 1.0);
        assert_eq!(covariate.interpolate(10.0).unwrap(), 2.0);
    }

    #[test]
    fn switching_to_carry_forward_rebuilds_segments() {
        let mut covariates = Covariates::new();
        covariates.add_observation("bmi", 0.0, 25.0).unwrap();
        covariates.add_observation("bmi", 12.0, 26.0).unwrap();
        assert_eq!(covariates.value("bmi", 6.0), Some(25.5));
        assert!(covariates.set_covariate_fixed("bmi", true));
        assert_eq!(covariates.value("bmi", 6.0), Some(25.0));
        assert!(!covariates.set_covariate_fixed("crcl", true));
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let mut covariates = Covariates::new();
        assert!(matches!(
            covariates.add_observation("wt", 0.0, f64::NAN),
            Err(CovariateError::NonFinite { .. })
        ));
    }

    #[test]
    fn test_duplicate_time_is_rejected() {
        let mut covariate = Covariate::new("wt", false);
        covariate.add_observation(0.0, 70.0).unwrap();
        assert!(matches!(
            covariate.add_observation(0.0, 71.0),
            Err(CovariateError::ObservationExists { .. })
        ));
        assert!(Covariate::new("wt", false).interpolate(0.0).is_err());
    }
}
