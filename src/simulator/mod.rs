//! Simulation of individuals over their event timeline.
//!
//! A [Simulator] resolves the parameters of each occasion, then walks the
//! events of a [Subject] in order. The integrator restarts at every
//! discontinuity: doses, infusion ends, resets, occasion boundaries and
//! observation records.
pub mod cache;
pub mod compartment;
pub mod delay;
pub mod observation;
pub mod population;
pub mod prediction;
pub mod solver;
pub mod steady_state;

use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::{Covariates, Data, Event, Observation, Occasion, Reset, Subject};
use crate::error::PkpdError;
use crate::model::compiled::CompiledModel;
use crate::model::expr::Env;
use crate::simulator::compartment::{OdeSystem, Workspace};
use crate::simulator::delay::DelayKernel;
use crate::simulator::observation::{
    categorical_loglik, category_probabilities, censor, continuous_loglik, event_loglik,
    sample_category, CompiledOutputKind, EventClock,
};
use crate::simulator::solver::{Divergence, Solver};

pub use population::{
    CancellationToken, IndividualReport, IndividualStatus, PopulationReport, PopulationResult,
    PopulationSimulation,
};
pub use prediction::{PopulationPredictions, Prediction, RecordKind, SubjectPredictions};
pub use solver::{SolverOptions, Trajectory};
pub use steady_state::SteadyStateOptions;

/// Options of a single-individual run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationOptions {
    pub solver: SolverOptions,
    pub steady_state: SteadyStateOptions,
    /// Keep every accepted integrator step in the result
    pub record_trajectory: bool,
    /// Reuse deterministic predictions of identical inputs
    pub use_cache: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions {
            solver: SolverOptions::default(),
            steady_state: SteadyStateOptions::default(),
            record_trajectory: false,
            use_cache: true,
        }
    }
}

/// Random effects of one individual: `eta` for the whole subject and one
/// `kappa` vector per occasion.
///
/// An empty `eta` and missing `kappa` rows are read as zeros.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    pub eta: Vec<f64>,
    pub kappa: Vec<Vec<f64>>,
}

impl RandomEffects {
    pub fn new(eta: Vec<f64>) -> Self {
        RandomEffects {
            eta,
            kappa: Vec::new(),
        }
    }

    pub fn with_kappa(mut self, kappa: Vec<Vec<f64>>) -> Self {
        self.kappa = kappa;
        self
    }

    /// All random effects at zero, the typical individual
    pub fn zero(model: &CompiledModel) -> Self {
        RandomEffects::new(vec![0.0; model.eta_names().len()])
    }

    /// Draw `eta` from the between-subject covariance and one `kappa` per occasion
    pub fn sample<R: Rng + ?Sized>(model: &CompiledModel, occasions: usize, rng: &mut R) -> Self {
        let eta = model.sample_eta(rng);
        let kappa = (0..occasions).map(|_| model.sample_kappa(rng)).collect();
        RandomEffects { eta, kappa }
    }

    pub fn is_zero(&self) -> bool {
        self.eta.iter().chain(self.kappa.iter().flatten()).all(|v| *v == 0.0)
    }

    fn check(&self, model: &CompiledModel) -> Result<(), PkpdError> {
        let n_eta = model.eta_names().len();
        if !self.eta.is_empty() && self.eta.len() != n_eta {
            return Err(PkpdError::RandomEffects(format!(
                "model '{}' has {} random effects, {} given",
                model.name(),
                n_eta,
                self.eta.len()
            )));
        }
        let n_kappa = model.kappa_names().len();
        if let Some(row) = self.kappa.iter().find(|row| row.len() != n_kappa) {
            return Err(PkpdError::RandomEffects(format!(
                "model '{}' has {} inter-occasion effects, {} given",
                model.name(),
                n_kappa,
                row.len()
            )));
        }
        Ok(())
    }

    fn kappa_for(&self, occasion: usize, n: usize) -> Vec<f64> {
        self.kappa
            .get(occasion)
            .cloned()
            .unwrap_or_else(|| vec![0.0; n])
    }
}

/// Parameters of one occasion of one individual
#[derive(Debug, Clone, PartialEq)]
pub struct IndividualParameters {
    pub(crate) occasion: usize,
    pub(crate) start: f64,
    pub(crate) covariates: Vec<f64>,
    pub(crate) kappa: Vec<f64>,
    pub(crate) values: Vec<f64>,
    pub(crate) kernels: Vec<DelayKernel>,
}

impl IndividualParameters {
    pub fn occasion(&self) -> usize {
        self.occasion
    }

    /// Time the covariates were read at
    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn covariates(&self) -> &[f64] {
        &self.covariates
    }

    pub fn kappa(&self) -> &[f64] {
        &self.kappa
    }

    /// Parameter values in declaration order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn kernels(&self) -> &[DelayKernel] {
        &self.kernels
    }
}

/// Covariates of an occasion, or of the nearest earlier occasion that has any
fn covariate_source(occasions: &[Occasion], index: usize) -> Option<&Covariates> {
    occasions[..=index]
        .iter()
        .rev()
        .map(|occasion| occasion.covariates())
        .find(|covariates| !covariates.is_empty())
}

fn steady_state_interval(event: &Event) -> Option<f64> {
    match event {
        Event::Bolus(bolus) => bolus.steady_state(),
        Event::Infusion(infusion) => infusion.steady_state(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ActiveInfusion {
    pub end: f64,
    pub target: usize,
    pub rate: f64,
}

/// Parameters and covariate source in force between two occasion boundaries
#[derive(Clone, Copy)]
pub(crate) struct Segment<'a> {
    pub params: &'a IndividualParameters,
    pub covariates: Option<&'a Covariates>,
}

fn system<'s>(model: &'s CompiledModel, rates: &'s [f64], segment: &Segment<'s>) -> OdeSystem<'s> {
    OdeSystem {
        model,
        params: &segment.params.values,
        kernels: &segment.params.kernels,
        rates,
        covariates: if model.dynamic_covariates {
            segment.covariates
        } else {
            None
        },
    }
}

/// Mutable state of one individual while its events are processed
pub(crate) struct Run<'a> {
    pub model: &'a CompiledModel,
    pub id: &'a str,
    pub solver: Solver,
    pub t: f64,
    pub y: Vec<f64>,
    pub infusions: Vec<ActiveInfusion>,
    pub rates: Vec<f64>,
    pub work: Workspace,
    pub trajectory: Option<Trajectory>,
    pub clocks: Vec<EventClock>,
    steps: Trajectory,
}

// bisection of an event crossing, relative to the crossing time
const EVENT_TIME_TOL: f64 = 1e-10;
const MAX_BISECTIONS: usize = 100;

/// Time at which component `state` reaches `level`, between `ta` (state
/// `ya`, below the level) and `tb` (at or above it). Every trial point restarts the
/// integration from `ta`.
fn crossing<F>(
    solver: &Solver,
    mut rhs: F,
    ta: f64,
    ya: &[f64],
    tb: f64,
    state: usize,
    level: f64,
) -> Result<f64, Divergence>
where
    F: FnMut(f64, &[f64], &mut [f64]),
{
    let (mut lo, mut hi) = (ta, tb);
    let mut y = ya.to_vec();
    for _ in 0..MAX_BISECTIONS {
        if hi - lo <= EVENT_TIME_TOL * hi.abs().max(1.0) {
            break;
        }
        let mid = 0.5 * (lo + hi);
        y.copy_from_slice(ya);
        solver.integrate(&mut rhs, ta, mid, &mut y, None)?;
        if y[state] >= level {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Ok(hi)
}

impl<'a> Run<'a> {
    pub fn new(
        model: &'a CompiledModel,
        id: &'a str,
        options: SolverOptions,
        y: Vec<f64>,
        covariates: &[f64],
        record: bool,
    ) -> Self {
        let n = model.n_states();
        let trajectory = record.then(|| {
            let mut trajectory = Trajectory::new();
            trajectory.push(0.0, &y);
            trajectory
        });
        Run {
            model,
            id,
            solver: Solver::new(options),
            t: 0.0,
            y,
            infusions: Vec::new(),
            rates: vec![0.0; n],
            work: Workspace::new(model, covariates),
            trajectory,
            clocks: Vec::new(),
            steps: Trajectory::new(),
        }
    }

    /// Integrate up to `to`, stopping at every infusion end on the way
    pub fn advance(&mut self, to: f64, segment: &Segment) -> Result<(), PkpdError> {
        loop {
            let t = self.t;
            let next_end = self
                .infusions
                .iter()
                .map(|infusion| infusion.end)
                .filter(|end| *end > t && *end < to)
                .fold(f64::INFINITY, f64::min);
            let stop = if next_end.is_finite() { next_end } else { to };
            self.integrate(stop, segment)?;
            self.retire_infusions();
            if stop >= to {
                return Ok(());
            }
        }
    }

    fn integrate(&mut self, to: f64, segment: &Segment) -> Result<(), PkpdError> {
        if to < self.t {
            return Err(PkpdError::InvalidDosingSchedule {
                id: self.id.to_string(),
                reason: format!("cannot integrate back from time {} to {}", self.t, to),
            });
        }
        if to == self.t {
            return Ok(());
        }
        let id = self.id;
        let t0 = self.t;
        self.work.covariates.clone_from(&segment.params.covariates);
        let system = system(self.model, &self.rates, segment);
        let work = &mut self.work;
        let keep_steps = self.trajectory.is_some() || !self.clocks.is_empty();
        let steps = &mut self.steps;
        steps.clear();
        steps.push(t0, &self.y);
        self.solver
            .integrate(
                |t: f64, y: &[f64], dy: &mut [f64]| system.rhs(t, y, dy, work),
                t0,
                to,
                &mut self.y,
                keep_steps.then_some(&mut *steps),
            )
            .map_err(|divergence| divergence.into_error(id))?;
        self.t = to;

        for clock in self.clocks.iter_mut() {
            while clock.pending(self.y[clock.state]) {
                let Some(i) = steps
                    .states()
                    .iter()
                    .position(|y| y[clock.state] >= clock.level)
                else {
                    break;
                };
                let time = if i == 0 {
                    t0
                } else {
                    crossing(
                        &self.solver,
                        |t: f64, y: &[f64], dy: &mut [f64]| system.rhs(t, y, dy, work),
                        steps.times()[i - 1],
                        &steps.states()[i - 1],
                        steps.times()[i],
                        clock.state,
                        clock.level,
                    )
                    .map_err(|divergence| divergence.into_error(id))?
                };
                clock.fire(time);
            }
        }
        if let Some(trajectory) = self.trajectory.as_mut() {
            trajectory.extend_from(steps);
        }
        Ok(())
    }

    fn retire_infusions(&mut self) {
        let t = self.t;
        let before = self.infusions.len();
        self.infusions.retain(|infusion| infusion.end > t);
        if self.infusions.len() != before {
            self.update_rates();
        }
    }

    pub fn update_rates(&mut self) {
        self.rates.fill(0.0);
        for infusion in &self.infusions {
            self.rates[infusion.target] += infusion.rate;
        }
    }

    fn dose_target(&self, input: usize) -> Result<usize, PkpdError> {
        self.model
            .dose_targets
            .get(input)
            .copied()
            .ok_or_else(|| PkpdError::UnknownCompartment {
                name: format!("#{}", input),
                context: format!("dose of subject {}", self.id),
            })
    }

    /// Apply a bolus, or start an infusion, at the current time
    pub fn apply_dose(&mut self, event: &Event) -> Result<(), PkpdError> {
        match event {
            Event::Bolus(bolus) => {
                let target = self.dose_target(bolus.input())?;
                self.y[target] += bolus.amount();
            }
            Event::Infusion(infusion) => {
                let target = self.dose_target(infusion.input())?;
                if infusion.duration() > 0.0 {
                    self.infusions.push(ActiveInfusion {
                        end: self.t + infusion.duration(),
                        target,
                        rate: infusion.rate(),
                    });
                    self.update_rates();
                } else {
                    self.y[target] += infusion.amount();
                }
            }
            _ => return Ok(()),
        }
        self.record();
        Ok(())
    }

    /// Set the listed compartments to the reset value, in declaration order
    pub fn reset(&mut self, reset: &Reset) -> Result<(), PkpdError> {
        for compartment in reset.compartments() {
            if *compartment >= self.model.n_compartments() {
                return Err(PkpdError::UnknownCompartment {
                    name: format!("#{}", compartment),
                    context: format!("reset of subject {}", self.id),
                });
            }
            self.y[*compartment] = reset.value();
        }
        self.record();
        Ok(())
    }

    pub fn record(&mut self) {
        if let Some(trajectory) = self.trajectory.as_mut() {
            trajectory.push(self.t, &self.y);
        }
    }

    /// Evaluate `f` on the environment at the current time and state
    pub fn evaluate<T>(&mut self, segment: &Segment, f: impl FnOnce(&Env) -> T) -> T {
        self.work.covariates.clone_from(&segment.params.covariates);
        let system = system(self.model, &self.rates, segment);
        system.auxiliaries(self.t, &self.y, &mut self.work);
        let env = system.env(self.t, &self.y, &self.work);
        f(&env)
    }
}

/// Bookkeeping of event outputs between records
struct EventRecord {
    prediction: usize,
    output: usize,
    since: f64,
}

/// Runs single individuals of a compiled model
#[derive(Debug, Clone)]
pub struct Simulator<'a> {
    model: &'a CompiledModel,
    options: SimulationOptions,
}

impl<'a> Simulator<'a> {
    pub fn new(model: &'a CompiledModel) -> Self {
        Simulator {
            model,
            options: SimulationOptions::default(),
        }
    }

    pub fn with_options(model: &'a CompiledModel, options: SimulationOptions) -> Self {
        Simulator { model, options }
    }

    pub fn model(&self) -> &CompiledModel {
        self.model
    }

    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    /// Resolve the parameters of every occasion of `subject`.
    ///
    /// Covariates are read at the start of each occasion; the inter-occasion
    /// effects of the occasion are added on top of `eta`.
    pub fn resolve(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
    ) -> Result<Vec<IndividualParameters>, PkpdError> {
        effects.check(self.model)?;
        let model = self.model;
        let empty = Covariates::new();
        let n_kappa = model.kappa_names().len();
        let mut start = 0.0;
        let mut resolved = Vec::with_capacity(subject.occasions().len());
        for (i, occasion) in subject.occasions().iter().enumerate() {
            start = occasion.start_time().unwrap_or(start);
            let source = covariate_source(subject.occasions(), i).unwrap_or(&empty);
            let covariates = model.covariate_values(subject.id(), source, start)?;
            let kappa = effects.kappa_for(i, n_kappa);
            let values = model
                .resolver()
                .resolve(model.theta(), &effects.eta, &kappa, &covariates)
                .map_err(|err| match err {
                    PkpdError::UnresolvedParameter { symbol, context } => {
                        PkpdError::UnresolvedParameter {
                            symbol,
                            context: format!("{} (subject {}, occasion {})", context, subject.id(), i),
                        }
                    }
                    other => other,
                })?;
            let kernels = model.kernels(&values, &covariates)?;
            resolved.push(IndividualParameters {
                occasion: i,
                start,
                covariates,
                kappa,
                values,
                kernels,
            });
        }
        Ok(resolved)
    }

    /// Deterministic predictions (IPRED and PRED) of `subject`
    pub fn predict(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
    ) -> Result<SubjectPredictions, PkpdError> {
        if self.options.use_cache {
            if let Some(cached) = cache::get_entry(self.model, &self.options, subject, effects) {
                return Ok(cached);
            }
        }
        let predictions = self.with_population(subject, effects, self.run(subject, effects, None, 0)?)?;
        if self.options.use_cache {
            cache::insert_entry(self.model, &self.options, subject, effects, predictions.clone());
        }
        Ok(predictions)
    }

    /// Predictions plus simulated observations drawn from `rng`
    pub fn simulate<R: RngCore>(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
        rng: &mut R,
    ) -> Result<SubjectPredictions, PkpdError> {
        self.simulate_replicate(subject, effects, rng, 0)
    }

    pub(crate) fn simulate_replicate(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
        rng: &mut dyn RngCore,
        replicate: usize,
    ) -> Result<SubjectPredictions, PkpdError> {
        let individual = self.run(subject, effects, Some(rng), replicate)?;
        self.with_population(subject, effects, individual)
    }

    /// Typical-individual predictions of every subject, in parallel
    pub fn predict_population(&self, data: &Data) -> Result<PopulationPredictions, PkpdError> {
        let zero = RandomEffects::zero(self.model);
        let subjects = data
            .subjects()
            .par_iter()
            .map(|subject| self.predict(subject, &zero))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PopulationPredictions::new(subjects))
    }

    fn with_population(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
        mut individual: SubjectPredictions,
    ) -> Result<SubjectPredictions, PkpdError> {
        if effects.is_zero() {
            for record in individual.predictions.iter_mut() {
                record.population_prediction = Some(record.prediction);
            }
        } else {
            let population = self.run(subject, &RandomEffects::zero(self.model), None, 0)?;
            individual.attach_population(&population);
        }
        Ok(individual)
    }

    fn run(
        &self,
        subject: &Subject,
        effects: &RandomEffects,
        mut rng: Option<&mut dyn RngCore>,
        replicate: usize,
    ) -> Result<SubjectPredictions, PkpdError> {
        let model = self.model;
        let parameters = self.resolve(subject, effects)?;
        let y0 = match parameters.first() {
            Some(first) => model.initial_state(&first.values, &first.covariates),
            None => model.empty_state(&[], &[]),
        };
        let record = self.options.record_trajectory;
        let initial_covariates = parameters.first().map_or(&[][..], |p| &p.covariates[..]);
        let mut run = Run::new(
            model,
            subject.id(),
            self.options.solver,
            y0.as_slice().to_vec(),
            initial_covariates,
            record,
        );
        if let Some(rng) = rng.as_deref_mut() {
            for (index, output) in model.outputs.iter().enumerate() {
                if let CompiledOutputKind::Event { repeated, state, .. } = output.kind {
                    let start = run.y[state];
                    run.clocks
                        .push(EventClock::new(index, state, repeated, start, rng.next_u64()));
                }
            }
        }

        let n_outputs = model.outputs.len();
        let mut predictions = Vec::new();
        let mut warnings = Vec::new();
        let mut last_cumulative = vec![0.0; n_outputs];
        let mut last_record = vec![0.0; n_outputs];
        let mut event_records = Vec::new();

        for (i, (occasion, params)) in subject.occasions().iter().zip(&parameters).enumerate() {
            let segment = Segment {
                params,
                covariates: covariate_source(subject.occasions(), i),
            };
            for event in occasion.events() {
                run.advance(event.time(), &segment)?;
                match event {
                    Event::Bolus(_) | Event::Infusion(_) => {
                        if let Some(interval) = steady_state_interval(event) {
                            let converged = run.reach_steady_state(
                                event,
                                interval,
                                &segment,
                                &self.options.steady_state,
                            )?;
                            if !converged {
                                warn!(
                                    id = subject.id(),
                                    time = event.time(),
                                    periods = self.options.steady_state.max_periods,
                                    "steady state not reached"
                                );
                                warnings.push(format!(
                                    "steady state at time {} not reached after {} periods",
                                    event.time(),
                                    self.options.steady_state.max_periods
                                ));
                            }
                        }
                        run.apply_dose(event)?;
                    }
                    Event::Reset(reset) => run.reset(reset)?,
                    Event::Observation(observation) => {
                        let outeq = observation.outeq();
                        let (mut record, hazard) =
                            self.observe(&mut run, &segment, observation, rng.as_deref_mut())?;
                        record.occasion = i;
                        if record.kind == RecordKind::Event {
                            let cumulative = record.prediction;
                            let delta = cumulative - last_cumulative[outeq];
                            record.log_likelihood = observation
                                .value()
                                .map(|value| event_loglik(hazard, delta, value == 1.0));
                            event_records.push(EventRecord {
                                prediction: predictions.len(),
                                output: outeq,
                                since: last_record[outeq],
                            });
                            last_cumulative[outeq] = cumulative;
                            last_record[outeq] = observation.time();
                        }
                        predictions.push(record);
                    }
                }
            }
        }

        for record in &event_records {
            if let Some(clock) = run.clocks.iter().find(|c| c.output == record.output) {
                let prediction: &mut Prediction = &mut predictions[record.prediction];
                prediction.simulated = Some(clock.count(record.since, prediction.time) as f64);
            }
        }

        debug!(
            id = subject.id(),
            replicate,
            records = predictions.len(),
            "simulated individual"
        );

        Ok(SubjectPredictions {
            id: subject.id().to_string(),
            replicate,
            predictions,
            parameters: parameters.into_iter().map(|p| p.values).collect(),
            trajectory: if self.options.record_trajectory {
                run.trajectory
            } else {
                None
            },
            warnings,
        })
    }

    /// Prediction of one observation record at the current state, with the
    /// hazard at that time for event outputs (zero otherwise).
    ///
    /// The likelihood of event records depends on the previous record of the
    /// output and is left to the caller.
    fn observe<R: RngCore + ?Sized>(
        &self,
        run: &mut Run,
        segment: &Segment,
        observation: &Observation,
        rng: Option<&mut R>,
    ) -> Result<(Prediction, f64), PkpdError> {
        let output = self
            .model
            .outputs
            .get(observation.outeq())
            .ok_or_else(|| PkpdError::UnknownOutput {
                name: format!("#{}", observation.outeq()),
            })?;
        let mut record = Prediction {
            time: observation.time(),
            outeq: observation.outeq(),
            output: output.name.clone(),
            occasion: 0,
            kind: RecordKind::Continuous,
            prediction: 0.0,
            population_prediction: None,
            observation: observation.value(),
            simulated: None,
            residual: None,
            censored: observation.censored(),
            probabilities: None,
            log_likelihood: None,
            state: run.y.clone(),
        };
        let mut hazard_now = 0.0;
        match &output.kind {
            CompiledOutputKind::Continuous {
                prediction,
                error,
                bql,
                lloq,
            } => {
                let pred = run.evaluate(segment, |env| prediction.eval(env));
                let lloq = if *bql { observation.lloq().or(*lloq) } else { None };
                record.prediction = pred;
                record.log_likelihood = if observation.censored() {
                    lloq.or(observation.value())
                        .map(|limit| continuous_loglik(limit, pred, error, true))
                } else {
                    observation
                        .value()
                        .map(|value| continuous_loglik(value, pred, error, false))
                };
                if let Some(rng) = rng {
                    let z: f64 = rng.sample(StandardNormal);
                    let simulated = error.apply(pred, z);
                    let (reported, censored) = censor(simulated, lloq);
                    record.simulated = Some(reported);
                    record.residual = Some(simulated - pred);
                    record.censored = censored;
                }
            }
            CompiledOutputKind::Categorical { predictors } => {
                let linear: Vec<f64> =
                    run.evaluate(segment, |env| predictors.iter().map(|p| p.eval(env)).collect());
                let probabilities = category_probabilities(&linear);
                record.kind = RecordKind::Categorical;
                record.prediction = probabilities
                    .iter()
                    .enumerate()
                    .map(|(category, p)| category as f64 * p)
                    .sum();
                record.log_likelihood = observation
                    .value()
                    .map(|value| categorical_loglik(&probabilities, value));
                if let Some(rng) = rng {
                    record.simulated = Some(sample_category(&probabilities, rng) as f64);
                }
                record.probabilities = Some(probabilities);
            }
            CompiledOutputKind::Event { hazard, state, .. } => {
                hazard_now = run.evaluate(segment, |env| hazard.eval(env)).max(0.0);
                record.kind = RecordKind::Event;
                record.prediction = run.y[*state];
            }
        }
        Ok((record, hazard_now))
    }
}
