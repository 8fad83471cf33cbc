use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::data::{Covariates, Data, Event};
use crate::error::PkpdError;
use crate::model::expr::{BoundExpr, Env, Expr, Slot, SymbolTable};
use crate::model::parameter::{
    CompiledEffect, CompiledForm, CovariateEffect, EffectForm, ParameterForm, ParameterResolver,
};
use crate::model::{Covariance, ModelDefinition};
use crate::simulator::compartment::{CompiledFlow, Flow, FluxKind};
use crate::simulator::delay::{CompiledDelay, CompiledDelayKind, DelayKernel, DelayKind};
use crate::simulator::observation::{CompiledOutput, CompiledOutputKind, OutputKind};

static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// Summary of an output, as seen by data validation and readers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputType {
    Continuous { bql: bool, lloq: Option<f64> },
    Categorical { categories: usize },
    Event { repeated: bool },
}

/// A [ModelDefinition] with every symbol resolved to an index.
///
/// The state vector holds the compartments, then the stages of every delay,
/// then one cumulative hazard per event output.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub(crate) name: String,
    pub(crate) version: u32,
    /// Unique per compilation, shared by copies made with [CompiledModel::with_theta]
    pub(crate) instance: u64,
    pub(crate) theta_names: Vec<String>,
    pub(crate) theta: Vec<f64>,
    pub(crate) frozen: Vec<bool>,
    pub(crate) eta_names: Vec<String>,
    pub(crate) omega: DMatrix<f64>,
    /// Lower Cholesky factor of `omega`
    pub(crate) omega_factor: DMatrix<f64>,
    pub(crate) kappa_names: Vec<String>,
    pub(crate) kappa_sd: Vec<f64>,
    pub(crate) covariate_names: Vec<String>,
    pub(crate) carry_forward: Vec<bool>,
    pub(crate) resolver: ParameterResolver,
    pub(crate) compartment_names: Vec<String>,
    pub(crate) initial: Vec<Option<BoundExpr>>,
    pub(crate) algebraic: Vec<(String, BoundExpr)>,
    pub(crate) flows: Vec<CompiledFlow>,
    pub(crate) delays: Vec<CompiledDelay>,
    pub(crate) outputs: Vec<CompiledOutput>,
    pub(crate) hazards: Vec<(usize, BoundExpr)>,
    /// State receiving the doses addressed to each compartment
    pub(crate) dose_targets: Vec<usize>,
    pub(crate) n_states: usize,
    /// Some dynamic formula reads a covariate
    pub(crate) dynamic_covariates: bool,
}

fn parse_bind(source: &str, table: &SymbolTable, context: &str) -> Result<BoundExpr, PkpdError> {
    let expr = Expr::parse(source).map_err(|error| PkpdError::Expression {
        source_text: source.to_string(),
        context: context.to_string(),
        error,
    })?;
    expr.bind(table, context)
}

fn expect_slot(
    table: &SymbolTable,
    name: &str,
    context: &str,
    want: fn(Slot) -> Option<usize>,
) -> Result<usize, PkpdError> {
    table
        .get(name)
        .and_then(want)
        .ok_or_else(|| PkpdError::UnresolvedParameter {
            symbol: name.to_string(),
            context: context.to_string(),
        })
}

fn theta_slot(slot: Slot) -> Option<usize> {
    match slot {
        Slot::Theta(i) => Some(i),
        _ => None,
    }
}

fn eta_slot(slot: Slot) -> Option<usize> {
    match slot {
        Slot::Eta(i) => Some(i),
        _ => None,
    }
}

fn kappa_slot(slot: Slot) -> Option<usize> {
    match slot {
        Slot::Kappa(i) => Some(i),
        _ => None,
    }
}

fn covariate_slot(slot: Slot) -> Option<usize> {
    match slot {
        Slot::Covariate(i) => Some(i),
        _ => None,
    }
}

fn random_effect_factor(names: &[String], covariance: &Covariance) -> Result<(DMatrix<f64>, DMatrix<f64>), PkpdError> {
    let n = names.len();
    match covariance {
        Covariance::Diagonal(variances) => {
            if variances.len() != n {
                return Err(PkpdError::RandomEffects(format!(
                    "{} random effects but {} variances",
                    n,
                    variances.len()
                )));
            }
            if let Some(v) = variances.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
                return Err(PkpdError::RandomEffects(format!("invalid variance {}", v)));
            }
            let omega = DMatrix::from_diagonal(&DVector::from_column_slice(variances));
            let factor = omega.map(f64::sqrt);
            Ok((omega, factor))
        }
        Covariance::Block(rows) => {
            if rows.len() != n || rows.iter().any(|row| row.len() != n) {
                return Err(PkpdError::RandomEffects(format!(
                    "block covariance must be {}x{}",
                    n, n
                )));
            }
            let omega = DMatrix::from_fn(n, n, |i, j| rows[i][j]);
            if (0..n).any(|i| (0..i).any(|j| (omega[(i, j)] - omega[(j, i)]).abs() > 1e-12)) {
                return Err(PkpdError::RandomEffects(
                    "block covariance is not symmetric".to_string(),
                ));
            }
            let factor = omega
                .clone()
                .cholesky()
                .ok_or_else(|| {
                    PkpdError::RandomEffects("block covariance is not positive definite".to_string())
                })?
                .l();
            Ok((omega, factor))
        }
    }
}

impl CompiledModel {
    pub(crate) fn compile(definition: &ModelDefinition) -> Result<CompiledModel, PkpdError> {
        let theta_names: Vec<String> = definition.fixed_effects().iter().map(|f| f.name.clone()).collect();
        let theta: Vec<f64> = definition.fixed_effects().iter().map(|f| f.value).collect();
        let frozen: Vec<bool> = definition.fixed_effects().iter().map(|f| f.frozen).collect();
        let eta_names: Vec<String> = definition.random_effects().to_vec();
        let kappa_names: Vec<String> = definition.occasion_effects().iter().map(|o| o.name.clone()).collect();
        let covariate_names: Vec<String> = definition.covariates().iter().map(|c| c.name.clone()).collect();
        let param_names: Vec<String> = definition.parameters().iter().map(|p| p.name().to_string()).collect();
        let compartment_names: Vec<String> = definition.compartments().iter().map(|c| c.name.clone()).collect();

        // one namespace for every declared symbol
        let mut global = SymbolTable::new();
        global.insert("t", Slot::Time)?;
        for (i, name) in theta_names.iter().enumerate() {
            global.insert(name, Slot::Theta(i))?;
        }
        for (i, name) in eta_names.iter().enumerate() {
            global.insert(name, Slot::Eta(i))?;
        }
        for (i, name) in kappa_names.iter().enumerate() {
            global.insert(name, Slot::Kappa(i))?;
        }
        for (i, name) in covariate_names.iter().enumerate() {
            global.insert(name, Slot::Covariate(i))?;
        }
        for (i, name) in param_names.iter().enumerate() {
            global.insert(name, Slot::Param(i))?;
        }
        for (i, name) in compartment_names.iter().enumerate() {
            global.insert(name, Slot::State(i))?;
        }
        for (i, algebraic) in definition.algebraic().iter().enumerate() {
            global.insert(&algebraic.name, Slot::Algebraic(i))?;
        }
        for (i, delay) in definition.delays().iter().enumerate() {
            global.insert(&delay.name, Slot::Delay(i))?;
        }
        let mut output_names = SymbolTable::new();
        for (i, output) in definition.outputs().iter().enumerate() {
            output_names.insert(&output.name, Slot::Param(i))?;
        }

        let (omega, omega_factor) = random_effect_factor(&eta_names, definition.covariance())?;
        let mut kappa_sd = Vec::with_capacity(kappa_names.len());
        for effect in definition.occasion_effects() {
            if !(effect.variance.is_finite() && effect.variance >= 0.0) {
                return Err(PkpdError::RandomEffects(format!(
                    "inter-occasion variance of '{}' is {}",
                    effect.name, effect.variance
                )));
            }
            kappa_sd.push(effect.variance.sqrt());
        }

        // parameters see fixed effects, random effects, covariates and earlier parameters
        let mut scope = SymbolTable::new();
        for (i, name) in theta_names.iter().enumerate() {
            scope.insert(name, Slot::Theta(i))?;
        }
        for (i, name) in eta_names.iter().enumerate() {
            scope.insert(name, Slot::Eta(i))?;
        }
        for (i, name) in kappa_names.iter().enumerate() {
            scope.insert(name, Slot::Kappa(i))?;
        }
        for (i, name) in covariate_names.iter().enumerate() {
            scope.insert(name, Slot::Covariate(i))?;
        }
        let mut forms = Vec::with_capacity(param_names.len());
        for (i, parameter) in definition.parameters().iter().enumerate() {
            let context = format!("parameter '{}'", parameter.name());
            let form = match parameter.form() {
                ParameterForm::Structured {
                    style,
                    typical,
                    eta,
                    iov,
                    effects,
                } => {
                    let typical = expect_slot(&scope, typical, &context, theta_slot)?;
                    let eta = eta
                        .as_deref()
                        .map(|e| expect_slot(&scope, e, &context, eta_slot))
                        .transpose()?;
                    let iov = iov
                        .as_deref()
                        .map(|k| expect_slot(&scope, k, &context, kappa_slot))
                        .transpose()?;
                    let effects = effects
                        .iter()
                        .map(|effect| compile_effect(&scope, effect, &context))
                        .collect::<Result<Vec<_>, _>>()?;
                    CompiledForm::Structured {
                        style: *style,
                        typical,
                        eta,
                        iov,
                        effects,
                    }
                }
                ParameterForm::Formula(source) => {
                    CompiledForm::Formula(parse_bind(source, &scope, &context)?)
                }
            };
            forms.push(form);
            scope.insert(parameter.name(), Slot::Param(i))?;
        }
        let resolver = ParameterResolver::new(param_names.clone(), forms, covariate_names.clone());

        // initial values and delay settings are fixed for an occasion
        let mut fixed_scope = SymbolTable::new();
        for (i, name) in theta_names.iter().enumerate() {
            fixed_scope.insert(name, Slot::Theta(i))?;
        }
        for (i, name) in covariate_names.iter().enumerate() {
            fixed_scope.insert(name, Slot::Covariate(i))?;
        }
        for (i, name) in param_names.iter().enumerate() {
            fixed_scope.insert(name, Slot::Param(i))?;
        }

        let initial = definition
            .compartments()
            .iter()
            .map(|c| {
                c.initial
                    .as_deref()
                    .map(|source| {
                        parse_bind(source, &fixed_scope, &format!("initial value of '{}'", c.name))
                    })
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut dynamic = SymbolTable::new();
        dynamic.insert("t", Slot::Time)?;
        for (i, name) in compartment_names.iter().enumerate() {
            dynamic.insert(name, Slot::State(i))?;
        }
        for (i, name) in param_names.iter().enumerate() {
            dynamic.insert(name, Slot::Param(i))?;
        }
        for (i, name) in covariate_names.iter().enumerate() {
            dynamic.insert(name, Slot::Covariate(i))?;
        }
        for (i, delay) in definition.delays().iter().enumerate() {
            dynamic.insert(&delay.name, Slot::Delay(i))?;
        }
        let mut algebraic = Vec::with_capacity(definition.algebraic().len());
        for (i, def) in definition.algebraic().iter().enumerate() {
            let bound = parse_bind(&def.formula, &dynamic, &format!("algebraic '{}'", def.name))?;
            algebraic.push((def.name.clone(), bound));
            dynamic.insert(&def.name, Slot::Algebraic(i))?;
        }

        let compartment = |name: &str, context: &str| -> Result<usize, PkpdError> {
            compartment_names
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| PkpdError::UnknownCompartment {
                    name: name.to_string(),
                    context: context.to_string(),
                })
        };

        let mut flows = Vec::with_capacity(definition.flows().len());
        for (i, flow) in definition.flows().iter().enumerate() {
            let context = format!("flow {}", i + 1);
            let (from, to) = flow.endpoints();
            if from.is_none() && to.is_none() {
                return Err(PkpdError::UnknownCompartment {
                    name: String::new(),
                    context: format!("{} (no source and no target)", context),
                });
            }
            let from = from.map(|name| compartment(name, &context)).transpose()?;
            let to = to.map(|name| compartment(name, &context)).transpose()?;
            let bind = |source: &str| parse_bind(source, &dynamic, &context);
            let kind = match flow {
                Flow::Linear { rate, .. } => FluxKind::Linear { rate: bind(rate)? },
                Flow::Clearance {
                    clearance, volume, ..
                } => FluxKind::Clearance {
                    clearance: bind(clearance)?,
                    volume: bind(volume)?,
                },
                Flow::MichaelisMenten {
                    vmax, km, volume, ..
                } => FluxKind::MichaelisMenten {
                    vmax: bind(vmax)?,
                    km: bind(km)?,
                    volume: bind(volume)?,
                },
                Flow::Expression { rate, .. } => FluxKind::Expression { rate: bind(rate)? },
            };
            flows.push(CompiledFlow { from, to, kind });
        }

        let mut offset = compartment_names.len();
        let mut dose_targets: Vec<usize> = (0..compartment_names.len()).collect();
        let mut delays = Vec::with_capacity(definition.delays().len());
        for delay in definition.delays() {
            let context = format!("delay '{}'", delay.name);
            if delay.stages == 0 {
                return Err(PkpdError::InvalidDelay {
                    name: delay.name.clone(),
                    reason: "at least one stage is required".to_string(),
                });
            }
            let mean = parse_bind(&delay.mean, &fixed_scope, &context)?;
            let shape = parse_bind(&delay.shape, &fixed_scope, &context)?;
            if mean.is_constant() && shape.is_constant() {
                let env = Env::default();
                DelayKernel::new(&delay.name, mean.eval(&env), shape.eval(&env), delay.stages)?;
            }
            let kind = match &delay.kind {
                DelayKind::Signal { signal, hist } => CompiledDelayKind::Signal {
                    signal: parse_bind(signal, &dynamic, &context)?,
                    hist: parse_bind(hist, &fixed_scope, &context)?,
                },
                DelayKind::Dose { target } => {
                    let target = compartment(target, &context)?;
                    if dose_targets[target] != target {
                        return Err(PkpdError::InvalidDelay {
                            name: delay.name.clone(),
                            reason: format!(
                                "compartment '{}' already has a dose delay",
                                compartment_names[target]
                            ),
                        });
                    }
                    dose_targets[target] = offset;
                    CompiledDelayKind::Dose { target }
                }
            };
            delays.push(CompiledDelay {
                name: delay.name.clone(),
                kind,
                mean,
                shape,
                stages: delay.stages,
                offset,
            });
            offset += delay.stages;
        }

        let mut outputs = Vec::with_capacity(definition.outputs().len());
        let mut hazards = Vec::new();
        for output in definition.outputs() {
            let context = format!("output '{}'", output.name);
            if let Some(reason) = output.censoring_problem() {
                return Err(PkpdError::CensoringInconsistency {
                    output: output.name.clone(),
                    reason,
                });
            }
            let kind = match &output.kind {
                OutputKind::Continuous {
                    prediction,
                    error,
                    bql,
                    lloq,
                } => CompiledOutputKind::Continuous {
                    prediction: parse_bind(prediction, &dynamic, &context)?,
                    error: *error,
                    bql: *bql,
                    lloq: *lloq,
                },
                OutputKind::Categorical { predictors } => {
                    if predictors.is_empty() {
                        return Err(PkpdError::InvalidOutput {
                            name: output.name.clone(),
                            reason: "a categorical output needs at least one predictor".to_string(),
                        });
                    }
                    CompiledOutputKind::Categorical {
                        predictors: predictors
                            .iter()
                            .map(|p| parse_bind(p, &dynamic, &context))
                            .collect::<Result<Vec<_>, _>>()?,
                    }
                }
                OutputKind::Event { hazard, repeated } => {
                    let hazard = parse_bind(hazard, &dynamic, &context)?;
                    hazards.push((offset, hazard.clone()));
                    let state = offset;
                    offset += 1;
                    CompiledOutputKind::Event {
                        hazard,
                        repeated: *repeated,
                        state,
                    }
                }
            };
            outputs.push(CompiledOutput {
                name: output.name.clone(),
                kind,
            });
        }

        let reads_covariate = |e: &BoundExpr| e.reads(&|slot| matches!(slot, Slot::Covariate(_)));
        let dynamic_covariates = algebraic.iter().any(|(_, e)| reads_covariate(e))
            || flows.iter().any(|f| match &f.kind {
                FluxKind::Linear { rate } | FluxKind::Expression { rate } => reads_covariate(rate),
                FluxKind::Clearance { clearance, volume } => {
                    reads_covariate(clearance) || reads_covariate(volume)
                }
                FluxKind::MichaelisMenten { vmax, km, volume } => {
                    reads_covariate(vmax) || reads_covariate(km) || reads_covariate(volume)
                }
            })
            || delays.iter().any(|d| match &d.kind {
                CompiledDelayKind::Signal { signal, .. } => reads_covariate(signal),
                CompiledDelayKind::Dose { .. } => false,
            })
            || outputs.iter().any(|o| match &o.kind {
                CompiledOutputKind::Continuous { prediction, .. } => reads_covariate(prediction),
                CompiledOutputKind::Categorical { predictors } => predictors.iter().any(reads_covariate),
                CompiledOutputKind::Event { hazard, .. } => reads_covariate(hazard),
            });

        debug!(
            model = definition.name(),
            version = definition.version(),
            states = offset,
            "compiled model"
        );

        Ok(CompiledModel {
            name: definition.name().to_string(),
            version: definition.version(),
            instance: INSTANCES.fetch_add(1, Ordering::Relaxed),
            theta_names,
            theta,
            frozen,
            eta_names,
            omega,
            omega_factor,
            kappa_names,
            kappa_sd,
            covariate_names,
            carry_forward: definition.covariates().iter().map(|c| c.carry_forward).collect(),
            resolver,
            compartment_names,
            initial,
            algebraic,
            flows,
            delays,
            outputs,
            hazards,
            dose_targets,
            n_states: offset,
            dynamic_covariates,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Fixed-effect values, in declaration order
    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    pub fn theta_names(&self) -> &[String] {
        &self.theta_names
    }

    pub fn frozen(&self) -> &[bool] {
        &self.frozen
    }

    /// Copy of the model with other fixed-effect values
    pub fn with_theta(&self, theta: &[f64]) -> Result<CompiledModel, PkpdError> {
        if theta.len() != self.theta.len() {
            return Err(PkpdError::UnresolvedParameter {
                symbol: format!("{} fixed effects", theta.len()),
                context: format!("model '{}' declares {}", self.name, self.theta.len()),
            });
        }
        let mut model = self.clone();
        model.theta = theta.to_vec();
        Ok(model)
    }

    pub fn eta_names(&self) -> &[String] {
        &self.eta_names
    }

    pub fn omega(&self) -> &DMatrix<f64> {
        &self.omega
    }

    pub fn kappa_names(&self) -> &[String] {
        &self.kappa_names
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn parameter_names(&self) -> &[String] {
        self.resolver.names()
    }

    pub fn resolver(&self) -> &ParameterResolver {
        &self.resolver
    }

    pub fn compartment_names(&self) -> &[String] {
        &self.compartment_names
    }

    pub fn compartment_index(&self, name: &str) -> Option<usize> {
        self.compartment_names.iter().position(|c| c == name)
    }

    pub fn n_compartments(&self) -> usize {
        self.compartment_names.len()
    }

    /// Length of the state vector
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|o| o.name.as_str()).collect()
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|o| o.name == name)
    }

    pub fn output_type(&self, index: usize) -> Option<OutputType> {
        self.outputs.get(index).map(|o| match &o.kind {
            CompiledOutputKind::Continuous { bql, lloq, .. } => OutputType::Continuous {
                bql: *bql,
                lloq: *lloq,
            },
            CompiledOutputKind::Categorical { predictors } => OutputType::Categorical {
                categories: predictors.len() + 1,
            },
            CompiledOutputKind::Event { repeated, .. } => OutputType::Event { repeated: *repeated },
        })
    }

    /// Draw between-subject random effects, `eta = L z`
    pub fn sample_eta<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let n = self.eta_names.len();
        let z = DVector::from_iterator(n, (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)));
        (&self.omega_factor * z).iter().copied().collect()
    }

    /// Draw the inter-occasion random effects of one occasion
    pub fn sample_kappa<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        self.kappa_sd
            .iter()
            .map(|sd| sd * rng.sample::<f64, _>(StandardNormal))
            .collect()
    }

    /// Covariate values at `time`, in declaration order
    pub fn covariate_values(&self, id: &str, covariates: &Covariates, time: f64) -> Result<Vec<f64>, PkpdError> {
        self.covariate_names
            .iter()
            .map(|name| {
                covariates
                    .value(name, time)
                    .ok_or_else(|| PkpdError::UnresolvedParameter {
                        symbol: name.clone(),
                        context: format!("covariates of subject {}", id),
                    })
            })
            .collect()
    }

    /// Realise the delay kernels for one set of parameters
    pub fn kernels(&self, params: &[f64], covariates: &[f64]) -> Result<Vec<DelayKernel>, PkpdError> {
        let env = Env {
            params,
            covariates,
            theta: &self.theta,
            ..Env::default()
        };
        self.delays
            .iter()
            .map(|d| DelayKernel::new(&d.name, d.mean.eval(&env), d.shape.eval(&env), d.stages))
            .collect()
    }

    /// Initial state: declared compartment values, signal delays at their
    /// history value, empty dose chains and zero cumulative hazards
    pub fn initial_state(&self, params: &[f64], covariates: &[f64]) -> DVector<f64> {
        let env = Env {
            params,
            covariates,
            theta: &self.theta,
            ..Env::default()
        };
        let mut state = DVector::zeros(self.n_states);
        for (i, initial) in self.initial.iter().enumerate() {
            if let Some(expr) = initial {
                state[i] = expr.eval(&env);
            }
        }
        self.fill_history(&mut state, &env);
        state
    }

    /// Compartments and dose chains empty, signal delays at history
    pub(crate) fn empty_state(&self, params: &[f64], covariates: &[f64]) -> DVector<f64> {
        let env = Env {
            params,
            covariates,
            theta: &self.theta,
            ..Env::default()
        };
        let mut state = DVector::zeros(self.n_states);
        self.fill_history(&mut state, &env);
        state
    }

    fn fill_history(&self, state: &mut DVector<f64>, env: &Env) {
        for delay in &self.delays {
            if let CompiledDelayKind::Signal { hist, .. } = &delay.kind {
                let value = hist.eval(env);
                for i in delay.offset..delay.offset + delay.stages {
                    state[i] = value;
                }
            }
        }
    }

    /// Check a dataset against the model before any simulation.
    pub fn validate_data(&self, data: &Data) -> Result<(), PkpdError> {
        for subject in data.subjects() {
            for event in subject.events() {
                match event {
                    Event::Bolus(bolus) => self.check_compartment(bolus.input(), subject.id())?,
                    Event::Infusion(infusion) => {
                        self.check_compartment(infusion.input(), subject.id())?
                    }
                    Event::Reset(reset) => {
                        for c in reset.compartments() {
                            self.check_compartment(*c, subject.id())?;
                        }
                    }
                    Event::Observation(observation) => {
                        let output_type = self.output_type(observation.outeq()).ok_or_else(|| {
                            PkpdError::UnknownOutput {
                                name: format!("#{}", observation.outeq()),
                            }
                        })?;
                        let name = &self.outputs[observation.outeq()].name;
                        let invalid = |reason: String| PkpdError::InvalidObservation {
                            id: subject.id().to_string(),
                            time: observation.time(),
                            reason,
                        };
                        match output_type {
                            OutputType::Continuous { bql, .. } => {
                                if observation.censored() && !bql {
                                    return Err(PkpdError::CensoringInconsistency {
                                        output: name.clone(),
                                        reason: format!(
                                            "record of {} at time {} is flagged BQL but the output has no censoring",
                                            subject.id(),
                                            observation.time()
                                        ),
                                    });
                                }
                                if let Some(lloq) = observation.lloq() {
                                    if !lloq.is_finite() {
                                        return Err(PkpdError::CensoringInconsistency {
                                            output: name.clone(),
                                            reason: format!("record LLOQ {} is not finite", lloq),
                                        });
                                    }
                                }
                            }
                            OutputType::Categorical { categories } => {
                                if let Some(value) = observation.value() {
                                    if value.fract() != 0.0 || value < 0.0 || value >= categories as f64 {
                                        return Err(invalid(format!(
                                            "category {} of '{}' is not in 0..{}",
                                            value, name, categories
                                        )));
                                    }
                                }
                            }
                            OutputType::Event { .. } => {
                                if let Some(value) = observation.value() {
                                    if value != 0.0 && value != 1.0 {
                                        return Err(invalid(format!(
                                            "event record of '{}' must be 0 or 1, got {}",
                                            name, value
                                        )));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn check_compartment(&self, index: usize, id: &str) -> Result<(), PkpdError> {
        if index < self.compartment_names.len() {
            Ok(())
        } else {
            Err(PkpdError::UnknownCompartment {
                name: format!("#{}", index),
                context: format!("records of subject {}", id),
            })
        }
    }
}

fn compile_effect(scope: &SymbolTable, effect: &CovariateEffect, context: &str) -> Result<CompiledEffect, PkpdError> {
    let covariate = expect_slot(scope, effect.covariate(), context, covariate_slot)?;
    match effect {
        CovariateEffect::Continuous {
            coefficient,
            center,
            form,
            ..
        } => {
            let theta = expect_slot(scope, coefficient, context, theta_slot)?;
            Ok(match form {
                EffectForm::Power => {
                    let center = center.unwrap_or(1.0);
                    if !(center.is_finite() && center > 0.0) {
                        return Err(PkpdError::UnresolvedParameter {
                            symbol: effect.covariate().to_string(),
                            context: format!("{}: power effect center {} must be > 0", context, center),
                        });
                    }
                    CompiledEffect::Power {
                        covariate,
                        theta,
                        center,
                    }
                }
                EffectForm::Linear => CompiledEffect::Linear {
                    covariate,
                    theta,
                    center: center.unwrap_or(0.0),
                },
            })
        }
        CovariateEffect::Categorical {
            reference, levels, ..
        } => Ok(CompiledEffect::Categorical {
            covariate,
            reference: *reference,
            levels: levels
                .iter()
                .map(|(level, theta)| Ok((*level, expect_slot(scope, theta, context, theta_slot)?)))
                .collect::<Result<Vec<_>, PkpdError>>()?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParameterDef, ModelDefinition};
    use crate::simulator::compartment::Flow;
    use crate::simulator::delay::DelayDef;
    use crate::simulator::observation::{OutputDef, ResidualErrorModel};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn base() -> ModelDefinition {
        ModelDefinition::new("pk")
            .with_fixed_effect("tvCl", 1.0)
            .with_fixed_effect("tvV", 10.0)
            .with_parameter(ParameterDef::log_normal("Cl", "tvCl").eta("nCl"))
            .with_parameter(ParameterDef::log_normal("V", "tvV"))
            .with_random_effects(&["nCl"], Covariance::Diagonal(vec![0.09]))
            .with_compartment("central")
            .with_flow(Flow::clearance("central", None, "Cl", "V"))
            .with_output(OutputDef::continuous(
                "CObs",
                "central / V",
                ResidualErrorModel::Additive { a: 0.1 },
            ))
    }

    #[test]
    fn compiles_layout() {
        let model = base()
            .with_delay(DelayDef::signal("Ce", "central / V", "2", "3", 5))
            .with_output(OutputDef::event("death", "0.01 * Ce", false))
            .compile()
            .unwrap();
        assert_eq!(model.n_compartments(), 1);
        assert_eq!(model.n_states(), 1 + 5 + 1);
        assert_eq!(model.output_index("death"), Some(1));
    }

    #[test]
    fn undefined_symbol_fails_compilation() {
        let err = base()
            .with_parameter(ParameterDef::formula("Ka", "tvKa * 2"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnresolvedParameter { symbol, .. } if symbol == "tvKa"));
    }

    #[test]
    fn parameter_cannot_read_later_parameter() {
        let err = ModelDefinition::new("m")
            .with_parameter(ParameterDef::formula("A", "B + 1"))
            .with_parameter(ParameterDef::formula("B", "1"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnresolvedParameter { .. }));
    }

    #[test]
    fn bql_without_limit_is_inconsistent() {
        let err = base()
            .with_output(OutputDef {
                name: "CObs".to_string(),
                kind: OutputKind::Continuous {
                    prediction: "central / V".to_string(),
                    error: ResidualErrorModel::Additive { a: 0.1 },
                    bql: true,
                    lloq: None,
                },
            })
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::CensoringInconsistency { .. }));
    }

    #[test]
    fn invalid_constant_delay_fails_at_compile() {
        let err = base()
            .with_delay(DelayDef::signal("Ce", "central", "-1", "2", 4))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::InvalidDelay { .. }));
    }

    #[test]
    fn unknown_compartment_in_flow() {
        let err = base()
            .with_flow(Flow::linear("gut", Some("central"), "1"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnknownCompartment { .. }));
    }

    #[test]
    fn block_covariance_must_be_positive_definite() {
        let err = base()
            .with_random_effects(&["nCl"], Covariance::Block(vec![vec![-1.0]]))
            .compile()
            .unwrap_err();
        assert!(matches!(err, PkpdError::RandomEffects(_)));
    }

    #[test]
    fn eta_draws_follow_seed() {
        let model = base().compile().unwrap();
        let a = model.sample_eta(&mut StdRng::seed_from_u64(3));
        let b = model.sample_eta(&mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = base().with_compartment("Cl").compile().unwrap_err();
        assert!(matches!(err, PkpdError::DuplicateSymbol { .. }));
    }
}
