//! Gamma-distributed delays realised as chains of linear stages.
//!
//! The delayed signal is `D(t) = ∫ g(u; τ, k) S(t - u) du` with `g` the gamma
//! density of mean `τ` and shape `k`. A chain of `N` stages sharing the rate
//! `r`, `dX_j/dt = r (X_{j-1} - X_j)` with `X_0 = S`, has stage outputs
//! `X_j = S * Erlang(j, r)`. The kernel is approximated by a mixture
//! `D = Σ w_j X_j`:
//!
//! * shape `k` integer and `k <= N`: exact, `r = k / τ` and `D = X_k`;
//! * otherwise `w_j = F(j / r) - F((j - 1) / r)` with `F` the gamma CDF and the
//!   tail mass lumped into `w_N`, after which `r` is rescaled so the mixture
//!   mean `Σ w_j j / r` equals `τ`. The first moment is exact for every `N`,
//!   higher moments converge as `N` grows.
//!
//! Dose delays use the same kernel as a Coxian chain: stage `j` sends the
//! fraction `p_j = w_j / (1 - Σ_{i<j} w_i)` of its outflow to the target and
//! the rest to stage `j + 1`, so the exit time has the mixture density and
//! mass is conserved.
use serde::{Deserialize, Serialize};
use statrs::function::gamma::checked_gamma_lr;

use crate::error::PkpdError;
use crate::model::expr::BoundExpr;

/// What a delay acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DelayKind {
    /// Delay of an expression; stages start at `hist`
    Signal { signal: String, hist: String },
    /// Delay of the doses administered to `target`; stages start empty
    Dose { target: String },
}

/// Declaration of a distributed delay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayDef {
    pub name: String,
    pub kind: DelayKind,
    /// Mean delay time `τ`
    pub mean: String,
    /// Gamma shape `k`
    pub shape: String,
    /// Number of ODE stages used to approximate the kernel
    pub stages: usize,
}

impl DelayDef {
    pub fn signal(
        name: impl Into<String>,
        signal: impl Into<String>,
        mean: impl Into<String>,
        shape: impl Into<String>,
        stages: usize,
    ) -> Self {
        DelayDef {
            name: name.into(),
            kind: DelayKind::Signal {
                signal: signal.into(),
                hist: "0".to_string(),
            },
            mean: mean.into(),
            shape: shape.into(),
            stages,
        }
    }

    pub fn dose(
        name: impl Into<String>,
        target: impl Into<String>,
        mean: impl Into<String>,
        shape: impl Into<String>,
        stages: usize,
    ) -> Self {
        DelayDef {
            name: name.into(),
            kind: DelayKind::Dose {
                target: target.into(),
            },
            mean: mean.into(),
            shape: shape.into(),
            stages,
        }
    }

    /// Value of the signal before time zero
    pub fn hist(mut self, hist: impl Into<String>) -> Self {
        if let DelayKind::Signal { hist: h, .. } = &mut self.kind {
            *h = hist.into();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledDelayKind {
    Signal { signal: BoundExpr, hist: BoundExpr },
    Dose { target: usize },
}

/// A delay bound to the model's symbols, with its stages at `offset` in the
/// state vector
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledDelay {
    pub name: String,
    pub kind: CompiledDelayKind,
    pub mean: BoundExpr,
    pub shape: BoundExpr,
    pub stages: usize,
    pub offset: usize,
}

/// Numeric realisation of a delay for one set of parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayKernel {
    rate: f64,
    /// Mixture weight of each used stage, summing to one
    weights: Vec<f64>,
    /// Coxian exit fraction of each used stage
    exits: Vec<f64>,
}

impl DelayKernel {
    /// Build the kernel of mean `mean`, shape `shape` on at most `stages` stages
    pub fn new(name: &str, mean: f64, shape: f64, stages: usize) -> Result<Self, PkpdError> {
        let invalid = |reason: String| PkpdError::InvalidDelay {
            name: name.to_string(),
            reason,
        };
        if stages == 0 {
            return Err(invalid("at least one stage is required".to_string()));
        }
        if !(mean.is_finite() && mean > 0.0) {
            return Err(invalid(format!("mean delay {} must be > 0", mean)));
        }
        if !(shape.is_finite() && shape > 0.0) {
            return Err(invalid(format!("shape {} must be > 0", shape)));
        }

        let rounded = shape.round();
        if (shape - rounded).abs() < 1e-12 && rounded as usize <= stages {
            let k = rounded as usize;
            let mut weights = vec![0.0; k];
            weights[k - 1] = 1.0;
            return Ok(DelayKernel::from_weights(k as f64 / mean, weights));
        }

        // cover the bulk of the gamma mass: mean + 4 sd
        let span = mean + 4.0 * mean / shape.sqrt();
        let rate = stages as f64 / span;
        let beta = shape / mean;
        let cdf = |x: f64| -> Result<f64, PkpdError> {
            if x <= 0.0 {
                return Ok(0.0);
            }
            checked_gamma_lr(shape, beta * x).map_err(|e| invalid(e.to_string()))
        };

        let mut weights = Vec::with_capacity(stages);
        let mut previous = 0.0;
        for j in 1..stages {
            let current = cdf(j as f64 / rate)?;
            weights.push((current - previous).max(0.0));
            previous = current;
        }
        weights.push((1.0 - previous).max(0.0));

        let total: f64 = weights.iter().sum();
        weights.iter_mut().for_each(|w| *w /= total);
        let stage_mean: f64 = weights
            .iter()
            .enumerate()
            .map(|(j, w)| w * (j + 1) as f64)
            .sum();
        Ok(DelayKernel::from_weights(stage_mean / mean, weights))
    }

    fn from_weights(rate: f64, weights: Vec<f64>) -> Self {
        let mut exits = Vec::with_capacity(weights.len());
        let mut remaining = 1.0;
        for w in &weights {
            exits.push(if remaining > 1e-15 {
                (w / remaining).clamp(0.0, 1.0)
            } else {
                1.0
            });
            remaining -= w;
        }
        if let Some(last) = exits.last_mut() {
            *last = 1.0;
        }
        DelayKernel {
            rate,
            weights,
            exits,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of stages carrying dynamics
    pub fn used_stages(&self) -> usize {
        self.weights.len()
    }

    /// Mean of the realised kernel, `Σ w_j j / r`
    pub fn mean(&self) -> f64 {
        self.weights
            .iter()
            .enumerate()
            .map(|(j, w)| w * (j + 1) as f64)
            .sum::<f64>()
            / self.rate
    }

    /// Delayed output `Σ w_j X_j`
    pub fn output(&self, stages: &[f64]) -> f64 {
        self.weights.iter().zip(stages).map(|(w, x)| w * x).sum()
    }

    /// Flux leaving a dose chain towards its target
    pub fn released(&self, stages: &[f64]) -> f64 {
        self.exits
            .iter()
            .zip(stages)
            .map(|(p, x)| p * self.rate * x)
            .sum()
    }

    /// Derivatives of a signal chain driven by `input`
    pub fn signal_rhs(&self, input: f64, stages: &[f64], dx: &mut [f64]) {
        let mut upstream = input;
        for (j, x) in stages.iter().enumerate() {
            dx[j] = if j < self.weights.len() {
                self.rate * (upstream - x)
            } else {
                0.0
            };
            upstream = *x;
        }
    }

    /// Derivatives of a Coxian dose chain; returns the flux into the target
    pub fn dose_rhs(&self, stages: &[f64], dx: &mut [f64]) -> f64 {
        let mut inflow = 0.0;
        let mut released = 0.0;
        for (j, x) in stages.iter().enumerate() {
            if j >= self.weights.len() {
                dx[j] = 0.0;
                continue;
            }
            let outflow = self.rate * x;
            dx[j] = inflow - outflow;
            released += self.exits[j] * outflow;
            inflow = (1.0 - self.exits[j]) * outflow;
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn integer_shape_is_exact_erlang() {
        let kernel = DelayKernel::new("d", 4.0, 2.0, 10).unwrap();
        assert_eq!(kernel.used_stages(), 2);
        assert_relative_eq!(kernel.rate(), 0.5);
        assert_eq!(kernel.weights(), &[0.0, 1.0]);
    }

    #[test]
    fn mixture_matches_mean_exactly() {
        for (mean, shape, stages) in [(5.0, 2.5, 20), (1.0, 0.7, 8), (12.0, 30.0, 15)] {
            let kernel = DelayKernel::new("d", mean, shape, stages).unwrap();
            assert_relative_eq!(kernel.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(kernel.mean(), mean, epsilon = 1e-10);
        }
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(
            DelayKernel::new("d", 0.0, 1.0, 5),
            Err(PkpdError::InvalidDelay { .. })
        ));
        assert!(DelayKernel::new("d", 1.0, -1.0, 5).is_err());
        assert!(DelayKernel::new("d", 1.0, 1.0, 0).is_err());
    }

    #[test]
    fn history_gives_history_output() {
        let kernel = DelayKernel::new("d", 3.0, 1.7, 12).unwrap();
        let stages = vec![2.5; 12];
        assert_relative_eq!(kernel.output(&stages), 2.5, epsilon = 1e-12);
        let mut dx = vec![0.0; 12];
        kernel.signal_rhs(2.5, &stages, &mut dx);
        assert!(dx.iter().all(|d| d.abs() < 1e-12));
    }

    #[test]
    fn dose_chain_conserves_mass() {
        let kernel = DelayKernel::new("d", 2.0, 3.3, 6).unwrap();
        let stages = vec![1.0, 0.5, 0.25, 0.1, 0.0, 0.3];
        let mut dx = vec![0.0; 6];
        let released = kernel.dose_rhs(&stages, &mut dx);
        let net: f64 = dx.iter().sum();
        assert_relative_eq!(net + released, 0.0, epsilon = 1e-12);
    }
}
