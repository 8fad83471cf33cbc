//! Process-wide cache of deterministic predictions.
//!
//! Entries are keyed by the subject's events, the compiled model (instance and
//! fixed effects), the random effects and the solver settings, so a hit is
//! only returned for bit-identical inputs.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::data::Subject;
use crate::model::compiled::CompiledModel;
use crate::simulator::{RandomEffects, SimulationOptions, SubjectPredictions};

const CACHE_SIZE: usize = 10000;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    subject: u64,
    model: u64,
    effects: u64,
}

fn hash_values<'v>(values: impl Iterator<Item = &'v f64>, hasher: &mut DefaultHasher) {
    for value in values {
        value.to_bits().hash(hasher);
    }
}

fn model_hash(model: &CompiledModel, options: &SimulationOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    model.instance.hash(&mut hasher);
    hash_values(model.theta().iter(), &mut hasher);
    let solver = &options.solver;
    hash_values(
        [solver.rtol, solver.atol, solver.h0, solver.h_max.unwrap_or(0.0)].iter(),
        &mut hasher,
    );
    solver.max_steps.hash(&mut hasher);
    options.steady_state.tolerance.to_bits().hash(&mut hasher);
    options.steady_state.max_periods.hash(&mut hasher);
    options.record_trajectory.hash(&mut hasher);
    hasher.finish()
}

fn effects_hash(effects: &RandomEffects) -> u64 {
    let mut hasher = DefaultHasher::new();
    effects.eta.len().hash(&mut hasher);
    hash_values(effects.eta.iter(), &mut hasher);
    for row in &effects.kappa {
        row.len().hash(&mut hasher);
        hash_values(row.iter(), &mut hasher);
    }
    hasher.finish()
}

fn key(
    model: &CompiledModel,
    options: &SimulationOptions,
    subject: &Subject,
    effects: &RandomEffects,
) -> CacheKey {
    CacheKey {
        subject: subject.hash(),
        model: model_hash(model, options),
        effects: effects_hash(effects),
    }
}

lazy_static! {
    static ref CACHE: DashMap<CacheKey, SubjectPredictions> = DashMap::with_capacity(CACHE_SIZE);
}

pub(crate) fn get_entry(
    model: &CompiledModel,
    options: &SimulationOptions,
    subject: &Subject,
    effects: &RandomEffects,
) -> Option<SubjectPredictions> {
    CACHE
        .get(&key(model, options, subject, effects))
        .map(|existing| existing.clone())
}

pub(crate) fn insert_entry(
    model: &CompiledModel,
    options: &SimulationOptions,
    subject: &Subject,
    effects: &RandomEffects,
    predictions: SubjectPredictions,
) {
    if CACHE.len() >= CACHE_SIZE {
        CACHE.clear();
    }
    CACHE.insert(key(model, options, subject, effects), predictions);
}

/// Drop every cached prediction
pub fn clear() {
    CACHE.clear();
}

/// Number of cached predictions
pub fn len() -> usize {
    CACHE.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::builder::SubjectBuilderExt;
    use crate::model::presets;
    use crate::simulator::observation::ResidualErrorModel;
    use crate::simulator::Simulator;

    #[test]
    fn identical_inputs_hit_the_cache() {
        let model = presets::one_compartment(ResidualErrorModel::Additive { a: 0.1 })
            .compile()
            .unwrap();
        let subject = Subject::builder("cached")
            .bolus(0.0, 50.0, 0)
            .missing_observation(2.0, 0)
            .build()
            .unwrap();
        let simulator = Simulator::new(&model);
        let effects = RandomEffects::new(vec![0.2, 0.0]);
        let first = simulator.predict(&subject, &effects).unwrap();
        let options = SimulationOptions::default();
        assert_eq!(get_entry(&model, &options, &subject, &effects), Some(first.clone()));
        assert_eq!(simulator.predict(&subject, &effects).unwrap(), first);

        let other = RandomEffects::new(vec![0.3, 0.0]);
        assert!(get_entry(&model, &options, &subject, &other).is_none());
    }

    #[test]
    fn new_fixed_effects_miss_the_cache() {
        let model = presets::one_compartment(ResidualErrorModel::Additive { a: 0.1 })
            .compile()
            .unwrap();
        let subject = Subject::builder("theta")
            .bolus(0.0, 50.0, 0)
            .missing_observation(2.0, 0)
            .build()
            .unwrap();
        let effects = RandomEffects::zero(&model);
        let options = SimulationOptions::default();
        Simulator::new(&model).predict(&subject, &effects).unwrap();
        let faster = model.with_theta(&[2.0, 10.0]).unwrap();
        assert!(get_entry(&faster, &options, &subject, &effects).is_none());
    }
}
