//! Parallel simulation of a population.
//!
//! Every `(replicate, subject)` pair is an independent work item with its own
//! random stream, seeded from `(seed, subject index, replicate)`. Results are
//! therefore identical whatever the number of threads or the order in which
//! rayon schedules the items.
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::Data;
use crate::error::PkpdError;
use crate::model::compiled::CompiledModel;
use crate::simulator::{
    PopulationPredictions, RandomEffects, SimulationOptions, Simulator, SubjectPredictions,
};

/// Cooperative cancellation shared between a caller and a running population
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop; individuals already started still finish
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one individual
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndividualStatus {
    Completed,
    CompletedWithWarnings { warnings: Vec<String> },
    Failed { kind: String, message: String },
    Cancelled,
}

impl IndividualStatus {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            IndividualStatus::Completed | IndividualStatus::CompletedWithWarnings { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndividualReport {
    pub id: String,
    pub replicate: usize,
    pub seed: u64,
    pub status: IndividualStatus,
    pub log_likelihood: Option<f64>,
}

/// Summary of a population run, serializable to JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationReport {
    pub model: String,
    pub version: u32,
    pub seed: u64,
    pub replicates: usize,
    pub eta_names: Vec<String>,
    /// Random effects of each individual, one row per report entry.
    /// Rows of cancelled individuals are NaN.
    pub eta: Array2<f64>,
    pub individuals: Vec<IndividualReport>,
    pub elapsed_seconds: f64,
}

impl PopulationReport {
    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, IndividualStatus::Completed))
    }

    pub fn with_warnings(&self) -> usize {
        self.count(|s| matches!(s, IndividualStatus::CompletedWithWarnings { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, IndividualStatus::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, IndividualStatus::Cancelled))
    }

    fn count(&self, f: impl Fn(&IndividualStatus) -> bool) -> usize {
        self.individuals.iter().filter(|i| f(&i.status)).count()
    }

    pub fn to_json(&self) -> Result<String, PkpdError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), PkpdError> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Predictions of the completed individuals and the report of all of them
#[derive(Debug, Clone)]
pub struct PopulationResult {
    pub predictions: PopulationPredictions,
    pub report: PopulationReport,
}

/// Seed of the random stream of one individual
pub fn individual_seed(seed: u64, subject: usize, replicate: usize) -> u64 {
    let stream = StdRng::seed_from_u64(seed).next_u64() ^ subject as u64;
    let stream = StdRng::seed_from_u64(stream).next_u64() ^ replicate as u64;
    StdRng::seed_from_u64(stream).next_u64()
}

/// Simulation of every subject of a dataset, optionally replicated.
///
/// ```rust
/// use std::sync::Arc;
/// use pkpdsim::prelude::*;
/// use pkpdsim::model::presets;
///
/// let model = presets::one_compartment(ResidualErrorModel::Proportional { b: 0.1 })
///     .compile()
///     .unwrap();
/// let subject = Subject::builder("1")
///     .bolus(0.0, 100.0, 0)
///     .missing_observation(12.0, 0)
///     .build()
///     .unwrap();
/// let result = PopulationSimulation::new(Arc::new(model))
///     .seed(42)
///     .replicates(10)
///     .run(&Data::new(vec![subject]))
///     .unwrap();
/// assert_eq!(result.report.completed(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct PopulationSimulation {
    model: Arc<CompiledModel>,
    options: SimulationOptions,
    seed: u64,
    replicates: usize,
    sample_random_effects: bool,
    budget: Option<Duration>,
    progress: bool,
    token: CancellationToken,
}

impl PopulationSimulation {
    pub fn new(model: Arc<CompiledModel>) -> Self {
        PopulationSimulation {
            model,
            options: SimulationOptions::default(),
            seed: 0,
            replicates: 1,
            sample_random_effects: true,
            budget: None,
            progress: false,
            token: CancellationToken::new(),
        }
    }

    pub fn options(mut self, options: SimulationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn replicates(mut self, replicates: usize) -> Self {
        self.replicates = replicates;
        self
    }

    /// With `false` every individual is typical and only residual error is drawn
    pub fn sample_random_effects(mut self, sample: bool) -> Self {
        self.sample_random_effects = sample;
        self
    }

    /// Wall-clock budget; individuals not started when it runs out are cancelled
    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn run(&self, data: &Data) -> Result<PopulationResult, PkpdError> {
        let model = self.model.as_ref();
        model.validate_data(data)?;
        self.options.solver.validate()?;
        self.options.steady_state.validate()?;

        let start = Instant::now();
        let deadline = self.budget.map(|budget| start + budget);
        let simulator = Simulator::with_options(model, self.options);
        let items: Vec<(usize, usize)> = (0..self.replicates)
            .flat_map(|replicate| (0..data.len()).map(move |subject| (replicate, subject)))
            .collect();
        info!(
            model = model.name(),
            individuals = items.len(),
            replicates = self.replicates,
            "starting population simulation"
        );

        let bar = if self.progress {
            let bar = ProgressBar::new(items.len() as u64);
            let style = ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} individuals",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            Some(bar)
        } else {
            None
        };

        let outcomes: Vec<Outcome> = items
            .par_iter()
            .map(|&(replicate, index)| {
                let subject = &data.subjects()[index];
                let seed = individual_seed(self.seed, index, replicate);
                let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
                let outcome = if self.token.is_cancelled() || expired {
                    Outcome::cancelled(subject.id(), replicate, seed)
                } else {
                    let mut rng = StdRng::seed_from_u64(seed);
                    let effects = if self.sample_random_effects {
                        RandomEffects::sample(model, subject.occasions().len(), &mut rng)
                    } else {
                        RandomEffects::zero(model)
                    };
                    let result = simulator.simulate_replicate(subject, &effects, &mut rng, replicate);
                    Outcome::finished(subject.id(), replicate, seed, effects, result)
                };
                if let Some(bar) = &bar {
                    bar.inc(1);
                }
                outcome
            })
            .collect();

        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }

        let n_eta = model.eta_names().len();
        let mut eta = Array2::from_elem((outcomes.len(), n_eta), f64::NAN);
        let mut individuals = Vec::with_capacity(outcomes.len());
        let mut subjects = Vec::new();
        for (row, outcome) in outcomes.into_iter().enumerate() {
            if let Some(effects) = &outcome.effects {
                for (j, value) in effects.eta.iter().enumerate().take(n_eta) {
                    eta[[row, j]] = *value;
                }
            }
            individuals.push(outcome.report);
            if let Some(predictions) = outcome.predictions {
                subjects.push(predictions);
            }
        }

        let report = PopulationReport {
            model: model.name().to_string(),
            version: model.version(),
            seed: self.seed,
            replicates: self.replicates,
            eta_names: model.eta_names().to_vec(),
            eta,
            individuals,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            completed = report.completed(),
            with_warnings = report.with_warnings(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            seconds = report.elapsed_seconds,
            "population simulation finished"
        );
        Ok(PopulationResult {
            predictions: PopulationPredictions::new(subjects),
            report,
        })
    }
}

struct Outcome {
    report: IndividualReport,
    effects: Option<RandomEffects>,
    predictions: Option<SubjectPredictions>,
}

impl Outcome {
    fn cancelled(id: &str, replicate: usize, seed: u64) -> Self {
        debug!(id, replicate, "individual cancelled");
        Outcome {
            report: IndividualReport {
                id: id.to_string(),
                replicate,
                seed,
                status: IndividualStatus::Cancelled,
                log_likelihood: None,
            },
            effects: None,
            predictions: None,
        }
    }

    fn finished(
        id: &str,
        replicate: usize,
        seed: u64,
        effects: RandomEffects,
        result: Result<SubjectPredictions, PkpdError>,
    ) -> Self {
        let (status, log_likelihood, predictions) = match result {
            Ok(predictions) => {
                let status = if predictions.warnings().is_empty() {
                    IndividualStatus::Completed
                } else {
                    IndividualStatus::CompletedWithWarnings {
                        warnings: predictions.warnings().to_vec(),
                    }
                };
                (status, Some(predictions.log_likelihood()), Some(predictions))
            }
            Err(error) => {
                warn!(id, replicate, kind = error.kind(), "{}", error);
                (
                    IndividualStatus::Failed {
                        kind: error.kind().to_string(),
                        message: error.to_string(),
                    },
                    None,
                    None,
                )
            }
        };
        Outcome {
            report: IndividualReport {
                id: id.to_string(),
                replicate,
                seed,
                status,
                log_likelihood,
            },
            effects: Some(effects),
            predictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::builder::SubjectBuilderExt;
    use crate::data::Subject;
    use crate::model::presets;
    use crate::simulator::observation::ResidualErrorModel;

    fn population() -> (Arc<CompiledModel>, Data) {
        let model = presets::one_compartment(ResidualErrorModel::Proportional { b: 0.1 })
            .compile()
            .unwrap();
        let subjects = (0..4)
            .map(|i| {
                Subject::builder(format!("{}", i + 1))
                    .bolus(0.0, 100.0, 0)
                    .missing_observation(2.0, 0)
                    .missing_observation(8.0, 0)
                    .build()
                    .unwrap()
            })
            .collect::<Vec<_>>();
        (Arc::new(model), Data::new(subjects))
    }

    #[test]
    fn seeds_differ_by_subject_and_replicate() {
        let a = individual_seed(1, 0, 0);
        assert_ne!(a, individual_seed(1, 1, 0));
        assert_ne!(a, individual_seed(1, 0, 1));
        assert_ne!(a, individual_seed(2, 0, 0));
        assert_eq!(a, individual_seed(1, 0, 0));
    }

    #[test]
    fn results_do_not_depend_on_thread_count() {
        let (model, data) = population();
        let run = || {
            PopulationSimulation::new(model.clone())
                .seed(7)
                .replicates(3)
                .run(&data)
                .unwrap()
        };
        let single = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap()
            .install(run);
        let many = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap()
            .install(run);
        assert_eq!(single.predictions, many.predictions);
        assert_eq!(single.report.eta, many.report.eta);
        assert_eq!(single.report.completed(), 12);
    }

    #[test]
    fn cancelled_before_start() {
        let (model, data) = population();
        let token = CancellationToken::new();
        token.cancel();
        let result = PopulationSimulation::new(model)
            .cancellation_token(token)
            .run(&data)
            .unwrap();
        assert_eq!(result.report.cancelled(), 4);
        assert!(result.predictions.is_empty());
        assert!(result.report.eta.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn exhausted_budget_cancels_everyone() {
        let (model, data) = population();
        let result = PopulationSimulation::new(model)
            .budget(Duration::ZERO)
            .run(&data)
            .unwrap();
        assert_eq!(result.report.cancelled(), 4);
    }

    #[test]
    fn report_serializes_to_json() {
        let (model, data) = population();
        let result = PopulationSimulation::new(model).seed(3).run(&data).unwrap();
        let json = result.report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["individuals"][0]["status"]["status"], "completed");
        assert_eq!(value["individuals"].as_array().unwrap().len(), 4);
    }
}
