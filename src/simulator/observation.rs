//! Mapping of simulated trajectories to observation records.
//!
//! Three kinds of outputs are supported:
//!
//! - **Continuous** outputs carry a [ResidualErrorModel]. Simulation draws
//!   `f + sigma(f) * z`, values below the limit of quantification are censored
//!   and reported at the limit. The log-likelihood of a censored record is the
//!   normal CDF at the limit (M3).
//! - **Categorical** outputs hold `K - 1` ordered linear predictors with
//!   `P(Y <= c) = ilogit(eta_c)`.
//! - **Event** outputs integrate a hazard `h(t, state)`; event times are drawn
//!   by inverting the cumulative hazard.
//!
//! Nothing in this module mutates model or dosing state.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::model::expr::{ilogit, BoundExpr};

// ln(2π)
const LOG_2PI: f64 = 1.8378770664093453_f64;

/// Residual error of a continuous output, a function of the prediction `f`.
///
/// # Examples
///
/// ```rust
/// use pkpdsim::simulator::observation::ResidualErrorModel;
///
/// let additive = ResidualErrorModel::Additive { a: 0.5 };
/// assert!((additive.sigma(100.0) - 0.5).abs() < 1e-10);
///
/// let proportional = ResidualErrorModel::Proportional { b: 0.1 };
/// assert!((proportional.sigma(100.0) - 10.0).abs() < 1e-10);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ResidualErrorModel {
    /// `y = f + a * z`
    Additive { a: f64 },
    /// `y = f * (1 + b * z)`
    Proportional { b: f64 },
    /// `y = f + sqrt(a² + b² f²) * z`
    Combined { a: f64, b: f64 },
}

impl Default for ResidualErrorModel {
    fn default() -> Self {
        ResidualErrorModel::Additive { a: 1.0 }
    }
}

impl ResidualErrorModel {
    /// Standard deviation at prediction `f`.
    ///
    /// A small cutoff keeps the likelihood finite when `f` is zero under a
    /// proportional model.
    pub fn sigma(&self, prediction: f64) -> f64 {
        let raw = match self {
            ResidualErrorModel::Additive { a } => a.abs(),
            ResidualErrorModel::Proportional { b } => (b * prediction).abs(),
            ResidualErrorModel::Combined { a, b } => {
                (a.powi(2) + b.powi(2) * prediction.powi(2)).sqrt()
            }
        };
        raw.max(f64::EPSILON.sqrt())
    }

    pub fn variance(&self, prediction: f64) -> f64 {
        self.sigma(prediction).powi(2)
    }

    /// Realisation for the standard normal draw `z`
    pub fn apply(&self, prediction: f64, z: f64) -> f64 {
        match self {
            ResidualErrorModel::Additive { a } => prediction + a * z,
            ResidualErrorModel::Proportional { b } => prediction * (1.0 + b * z),
            ResidualErrorModel::Combined { .. } => prediction + self.sigma(prediction) * z,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        let valid = match self {
            ResidualErrorModel::Additive { a } => ok(*a),
            ResidualErrorModel::Proportional { b } => ok(*b),
            ResidualErrorModel::Combined { a, b } => ok(*a) && ok(*b),
        };
        if valid {
            Ok(())
        } else {
            Err(format!("residual error parameters must be finite and >= 0, got {:?}", self))
        }
    }
}

/// Kind of an observed output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputKind {
    Continuous {
        prediction: String,
        error: ResidualErrorModel,
        /// Censor values below `lloq`
        bql: bool,
        lloq: Option<f64>,
    },
    /// Cumulative-logit model over `predictors.len() + 1` ordered categories
    Categorical { predictors: Vec<String> },
    /// Time-to-event driven by `hazard`; `repeated` allows several events
    Event { hazard: String, repeated: bool },
}

/// An observed variable of the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub name: String,
    pub kind: OutputKind,
}

impl OutputDef {
    pub fn continuous(name: impl Into<String>, prediction: impl Into<String>, error: ResidualErrorModel) -> Self {
        OutputDef {
            name: name.into(),
            kind: OutputKind::Continuous {
                prediction: prediction.into(),
                error,
                bql: false,
                lloq: None,
            },
        }
    }

    /// Enable BQL censoring at `lloq` on a continuous output
    pub fn with_bql(mut self, lloq: f64) -> Self {
        if let OutputKind::Continuous {
            bql, lloq: limit, ..
        } = &mut self.kind
        {
            *bql = true;
            *limit = Some(lloq);
        }
        self
    }

    pub fn categorical(name: impl Into<String>, predictors: &[&str]) -> Self {
        OutputDef {
            name: name.into(),
            kind: OutputKind::Categorical {
                predictors: predictors.iter().map(|p| p.to_string()).collect(),
            },
        }
    }

    pub fn event(name: impl Into<String>, hazard: impl Into<String>, repeated: bool) -> Self {
        OutputDef {
            name: name.into(),
            kind: OutputKind::Event {
                hazard: hazard.into(),
                repeated,
            },
        }
    }

    /// Reason why the censoring configuration cannot be used, if any
    pub(crate) fn censoring_problem(&self) -> Option<String> {
        match &self.kind {
            OutputKind::Continuous { bql, lloq, error, .. } => match (bql, lloq) {
                (true, None) => Some("BQL censoring is enabled but no LLOQ is configured".to_string()),
                (false, Some(l)) => Some(format!(
                    "an LLOQ of {} is configured but BQL censoring is disabled",
                    l
                )),
                (true, Some(l)) if !l.is_finite() => Some(format!("LLOQ {} is not finite", l)),
                _ => error.validate().err(),
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledOutputKind {
    Continuous {
        prediction: BoundExpr,
        error: ResidualErrorModel,
        bql: bool,
        lloq: Option<f64>,
    },
    Categorical { predictors: Vec<BoundExpr> },
    Event {
        hazard: BoundExpr,
        repeated: bool,
        /// Index of the cumulative hazard in the state vector
        state: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledOutput {
    pub name: String,
    pub kind: CompiledOutputKind,
}

/// Log of the normal density
#[inline(always)]
pub fn lognormpdf(obs: f64, pred: f64, sigma: f64) -> f64 {
    let diff = obs - pred;
    -0.5 * LOG_2PI - sigma.ln() - (diff * diff) / (2.0 * sigma * sigma)
}

/// Log of the normal CDF, used for records below the limit of quantification.
///
/// Far in the lower tail (`z < -37`) the asymptote
/// `log Φ(z) ≈ log φ(z) - log(-z)` replaces the underflowing CDF.
#[inline(always)]
pub fn lognormcdf(obs: f64, pred: f64, sigma: f64) -> f64 {
    let Ok(norm) = Normal::new(pred, sigma) else {
        return f64::NAN;
    };
    let cdf = norm.cdf(obs);
    if cdf > 0.0 {
        return cdf.ln();
    }
    let z = (obs - pred) / sigma;
    lognormpdf(obs, pred, sigma) - z.abs().ln()
}

/// Apply BQL censoring: values below `lloq` are reported at the limit
pub fn censor(value: f64, lloq: Option<f64>) -> (f64, bool) {
    match lloq {
        Some(limit) if value < limit => (limit, true),
        _ => (value, false),
    }
}

/// Log-likelihood of a continuous record
pub fn continuous_loglik(
    observed: f64,
    prediction: f64,
    error: &ResidualErrorModel,
    censored: bool,
) -> f64 {
    let sigma = error.sigma(prediction);
    if censored {
        lognormcdf(observed, prediction, sigma)
    } else {
        lognormpdf(observed, prediction, sigma)
    }
}

/// Category probabilities of a cumulative-logit model.
///
/// `predictors` are the `K - 1` linear predictors of `P(Y <= c)`. Predictors
/// that are not increasing would give negative probabilities; those are
/// clamped at zero and the vector renormalised.
pub fn category_probabilities(predictors: &[f64]) -> Vec<f64> {
    let mut probabilities = Vec::with_capacity(predictors.len() + 1);
    let mut previous = 0.0;
    for eta in predictors {
        let cumulative = ilogit(*eta).max(previous);
        probabilities.push(cumulative - previous);
        previous = cumulative;
    }
    probabilities.push(1.0 - previous);
    let total: f64 = probabilities.iter().sum();
    if total > 0.0 && (total - 1.0).abs() > 1e-12 {
        probabilities.iter_mut().for_each(|p| *p /= total);
    }
    probabilities
}

/// Draw a category index from `probabilities`
pub fn sample_category<R: Rng + ?Sized>(probabilities: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut cumulative = 0.0;
    for (category, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return category;
        }
    }
    probabilities.len().saturating_sub(1)
}

/// `ln p_y` of an observed category
pub fn categorical_loglik(probabilities: &[f64], observed: f64) -> f64 {
    let index = observed.round();
    if index < 0.0 || (observed - index).abs() > 1e-9 {
        return f64::NEG_INFINITY;
    }
    probabilities
        .get(index as usize)
        .map_or(f64::NEG_INFINITY, |p| p.ln())
}

/// Log-likelihood of an event record.
///
/// * `hazard` - hazard at the record time
/// * `cumulative` - cumulative hazard accrued since the previous record
/// * `event` - the record is an event, not a right-censoring time
pub fn event_loglik(hazard: f64, cumulative: f64, event: bool) -> f64 {
    if event {
        hazard.ln() - cumulative
    } else {
        -cumulative
    }
}

/// Event process of one event output during a simulation.
///
/// An event fires when the cumulative hazard reaches `level`; the next level
/// lies an `Exp(1)` draw above it. Each clock owns its generator, seeded once
/// from the individual's stream.
#[derive(Debug, Clone)]
pub(crate) struct EventClock {
    pub output: usize,
    pub state: usize,
    pub level: f64,
    pub done: bool,
    pub times: Vec<f64>,
    repeated: bool,
    rng: StdRng,
}

impl EventClock {
    pub fn new(output: usize, state: usize, repeated: bool, start: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let level = start + rng.sample::<f64, _>(Exp1);
        EventClock {
            output,
            state,
            level,
            done: false,
            times: Vec::new(),
            repeated,
            rng,
        }
    }

    /// Record an event at `time` and move to the next level
    pub fn fire(&mut self, time: f64) {
        self.times.push(time);
        if self.repeated {
            self.level += self.rng.sample::<f64, _>(Exp1);
        } else {
            self.done = true;
        }
    }

    /// Whether the cumulative hazard `value` has reached the next event
    pub fn pending(&self, value: f64) -> bool {
        !self.done && value >= self.level
    }

    /// Events in `(from, to]`
    pub fn count(&self, from: f64, to: f64) -> usize {
        self.times.iter().filter(|t| **t > from && **t <= to).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn combined_sigma() {
        let model = ResidualErrorModel::Combined { a: 0.5, b: 0.1 };
        assert_relative_eq!(model.sigma(100.0), (0.25f64 + 100.0).sqrt());
        assert_relative_eq!(model.apply(100.0, 0.0), 100.0);
    }

    #[test]
    fn censoring_replaces_value_with_limit() {
        assert_eq!(censor(0.01, Some(0.05)), (0.05, true));
        assert_eq!(censor(0.1, Some(0.05)), (0.1, false));
        assert_eq!(censor(-1.0, None), (-1.0, false));
    }

    #[test]
    fn lognormcdf_far_tail_is_finite() {
        assert!(lognormcdf(-40.0, 0.0, 1.0).is_finite());
        assert_relative_eq!(lognormcdf(0.0, 0.0, 1.0), 0.5f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn category_probabilities_sum_to_one() {
        let p = category_probabilities(&[-1.0, 1.5]);
        assert_eq!(p.len(), 3);
        assert_relative_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(p[0], ilogit(-1.0));
        assert_relative_eq!(p[2], 1.0 - ilogit(1.5));
        // decreasing predictors are clamped
        let q = category_probabilities(&[1.0, -1.0]);
        assert!(q.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn category_draws_are_reproducible() {
        let p = category_probabilities(&[-0.5, 0.8]);
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..50).map(|_| sample_category(&p, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
        assert!(draw(7).iter().all(|c| *c < 3));
    }

    #[test]
    fn single_event_clock_stops() {
        let mut clock = EventClock::new(0, 1, false, 0.0, 11);
        assert!(clock.level > 0.0);
        assert!(clock.pending(clock.level));
        clock.fire(2.0);
        assert!(!clock.pending(f64::INFINITY));
        assert_eq!(clock.count(0.0, 2.0), 1);
        assert_eq!(clock.count(2.0, 5.0), 0);
    }

    #[test]
    fn repeated_event_levels_increase() {
        let mut clock = EventClock::new(0, 1, true, 0.5, 3);
        let mut levels = vec![clock.level];
        for time in 1..5 {
            clock.fire(time as f64);
            levels.push(clock.level);
        }
        assert!(levels.windows(2).all(|w| w[0] < w[1]));
        assert!(levels[0] > 0.5);
        let again = EventClock::new(0, 1, true, 0.5, 3);
        assert_eq!(again.level, levels[0]);
    }


    #[test]
    fn censoring_configuration() {
        let ok = OutputDef::continuous("C", "A/V", ResidualErrorModel::Additive { a: 0.1 }).with_bql(0.05);
        assert!(ok.censoring_problem().is_none());
        let mut missing = ok.clone();
        if let OutputKind::Continuous { lloq, .. } = &mut missing.kind {
            *lloq = None;
        }
        assert!(missing.censoring_problem().is_some());
    }
}
