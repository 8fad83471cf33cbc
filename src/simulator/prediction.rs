//! Prediction records and their CSV export.
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PkpdError;
use crate::simulator::solver::Trajectory;

/// Kind of the output a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    Continuous,
    Categorical,
    Event,
}

/// One observation record with its prediction
///
/// For continuous outputs `prediction` is the model output; for categorical
/// outputs it is the expected category, with the category probabilities
/// kept alongside; for event outputs it is the cumulative hazard since the
/// start of the simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub(crate) time: f64,
    pub(crate) outeq: usize,
    pub(crate) output: String,
    pub(crate) occasion: usize,
    pub(crate) kind: RecordKind,
    pub(crate) prediction: f64,
    pub(crate) population_prediction: Option<f64>,
    pub(crate) observation: Option<f64>,
    pub(crate) simulated: Option<f64>,
    pub(crate) residual: Option<f64>,
    pub(crate) censored: bool,
    pub(crate) probabilities: Option<Vec<f64>>,
    pub(crate) log_likelihood: Option<f64>,
    pub(crate) state: Vec<f64>,
}

impl Prediction {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn outeq(&self) -> usize {
        self.outeq
    }

    /// Name of the output
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn occasion(&self) -> usize {
        self.occasion
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Individual prediction (IPRED)
    pub fn prediction(&self) -> f64 {
        self.prediction
    }

    /// Population prediction (PRED), all random effects at zero
    pub fn population_prediction(&self) -> Option<f64> {
        self.population_prediction
    }

    pub fn observation(&self) -> Option<f64> {
        self.observation
    }

    /// Simulated value, present when the run drew random numbers
    pub fn simulated(&self) -> Option<f64> {
        self.simulated
    }

    /// Residual error realisation of a simulated continuous record
    pub fn residual(&self) -> Option<f64> {
        self.residual
    }

    /// The observed or simulated value is below the limit of quantification
    pub fn censored(&self) -> bool {
        self.censored
    }

    pub fn probabilities(&self) -> Option<&[f64]> {
        self.probabilities.as_deref()
    }

    /// Log-likelihood of the observed value, when there is one
    pub fn log_likelihood(&self) -> Option<f64> {
        self.log_likelihood
    }

    /// Full state vector at the record time
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// `prediction - observation`
    pub fn prediction_error(&self) -> Option<f64> {
        self.observation.map(|obs| self.prediction - obs)
    }
}

/// All records of one simulated individual
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectPredictions {
    pub(crate) id: String,
    pub(crate) replicate: usize,
    pub(crate) predictions: Vec<Prediction>,
    /// Resolved parameter values of each occasion
    pub(crate) parameters: Vec<Vec<f64>>,
    pub(crate) trajectory: Option<Trajectory>,
    pub(crate) warnings: Vec<String>,
}

impl SubjectPredictions {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn replicate(&self) -> usize {
        self.replicate
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn parameters(&self) -> &[Vec<f64>] {
        &self.parameters
    }

    pub fn trajectory(&self) -> Option<&Trajectory> {
        self.trajectory.as_ref()
    }

    /// Non-fatal problems met during the run, such as an unconverged steady state
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Joint log-likelihood of all observed records; `0` without observations
    pub fn log_likelihood(&self) -> f64 {
        self.predictions
            .iter()
            .filter_map(|p| p.log_likelihood)
            .sum()
    }

    pub fn squared_error(&self) -> f64 {
        self.predictions
            .iter()
            .filter_map(|p| p.prediction_error().map(|e| e * e))
            .sum()
    }

    pub fn flat_predictions(&self) -> Vec<f64> {
        self.predictions.iter().map(|p| p.prediction).collect()
    }

    pub fn flat_times(&self) -> Vec<f64> {
        self.predictions.iter().map(|p| p.time).collect()
    }

    pub fn flat_observations(&self) -> Vec<Option<f64>> {
        self.predictions.iter().map(|p| p.observation).collect()
    }

    /// Fill PRED from a run of the same subject with zero random effects
    pub(crate) fn attach_population(&mut self, population: &SubjectPredictions) {
        for (record, pred) in self.predictions.iter_mut().zip(&population.predictions) {
            record.population_prediction = Some(pred.prediction);
        }
    }
}

#[derive(Serialize)]
struct PredictionRow<'a> {
    id: &'a str,
    replicate: usize,
    time: f64,
    outeq: &'a str,
    occasion: usize,
    kind: RecordKind,
    pred: Option<f64>,
    ipred: f64,
    obs: Option<f64>,
    sim: Option<f64>,
    residual: Option<f64>,
    censored: bool,
    loglik: Option<f64>,
}

/// Predictions of a population run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationPredictions {
    subjects: Vec<SubjectPredictions>,
}

impl PopulationPredictions {
    pub fn new(subjects: Vec<SubjectPredictions>) -> Self {
        PopulationPredictions { subjects }
    }

    pub fn subjects(&self) -> &[SubjectPredictions] {
        &self.subjects
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn get(&self, id: &str, replicate: usize) -> Option<&SubjectPredictions> {
        self.subjects
            .iter()
            .find(|s| s.id == id && s.replicate == replicate)
    }

    /// Write one row per record, keyed by `(id, time, outeq, replicate)`
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), PkpdError> {
        let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(writer);
        for subject in &self.subjects {
            for p in &subject.predictions {
                writer.serialize(PredictionRow {
                    id: &subject.id,
                    replicate: subject.replicate,
                    time: p.time,
                    outeq: &p.output,
                    occasion: p.occasion,
                    kind: p.kind,
                    pred: p.population_prediction,
                    ipred: p.prediction,
                    obs: p.observation,
                    sim: p.simulated,
                    residual: p.residual,
                    censored: p.censored,
                    loglik: p.log_likelihood,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PkpdError> {
        let file = std::fs::File::create(path.as_ref())?;
        self.to_writer(file)
    }
}

impl From<Vec<SubjectPredictions>> for PopulationPredictions {
    fn from(subjects: Vec<SubjectPredictions>) -> Self {
        PopulationPredictions::new(subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(time: f64, prediction: f64, observation: Option<f64>) -> Prediction {
        Prediction {
            time,
            outeq: 0,
            output: "CObs".to_string(),
            occasion: 0,
            kind: RecordKind::Continuous,
            prediction,
            population_prediction: None,
            observation,
            simulated: None,
            residual: None,
            censored: false,
            probabilities: None,
            log_likelihood: observation.map(|_| -1.0),
            state: vec![prediction],
        }
    }

    #[test]
    fn aggregates_only_observed_records() {
        let subject = SubjectPredictions {
            id: "1".to_string(),
            predictions: vec![record(1.0, 2.0, Some(1.5)), record(2.0, 1.0, None)],
            ..SubjectPredictions::default()
        };
        assert_eq!(subject.log_likelihood(), -1.0);
        assert_eq!(subject.squared_error(), 0.25);
    }

    #[test]
    fn csv_has_one_row_per_record() {
        let subject = SubjectPredictions {
            id: "a".to_string(),
            predictions: vec![record(1.0, 2.0, Some(1.5)), record(2.0, 1.0, None)],
            ..SubjectPredictions::default()
        };
        let mut buffer = Vec::new();
        PopulationPredictions::new(vec![subject])
            .to_writer(&mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,replicate,time,outeq"));
        assert!(lines[2].starts_with("a,0,2.0,CObs"));
    }
}
