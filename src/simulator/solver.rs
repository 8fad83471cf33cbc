//! Adaptive integration of the model right-hand side.
//!
//! Each call drives `ode_solvers`' Dormand–Prince 5(4) stepper over one
//! smooth interval. The simulator restarts it at every discontinuity, so the
//! right-hand side never sees a dose or a reset inside an interval.
use std::cell::RefCell;

use ode_solvers::dop_shared::{IntegrationError, OutputType};
use ode_solvers::{DVector, Dopri5, System};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PkpdError;

type State = DVector<f64>;

// step controller of the stepper, PI stabilised
const SAFETY: f64 = 0.9;
const BETA: f64 = 0.04;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 10.0;
const STIFFNESS_CHECKS: u32 = 1000;

/// Tolerances and step limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step; `0` lets the stepper pick one
    pub h0: f64,
    /// Upper bound on the step, the whole interval when absent
    pub h_max: Option<f64>,
    /// Step budget of a single integration interval
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            rtol: 1e-6,
            atol: 1e-9,
            h0: 0.0,
            h_max: None,
            max_steps: 100_000,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), PkpdError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(PkpdError::Settings(format!("solver {} must be finite and > 0, got {}", name, v)))
            }
        };
        positive("rtol", self.rtol)?;
        positive("atol", self.atol)?;
        if !(self.h0.is_finite() && self.h0 >= 0.0) {
            return Err(PkpdError::Settings(format!("solver h0 must be >= 0, got {}", self.h0)));
        }
        if let Some(h_max) = self.h_max {
            positive("h_max", h_max)?;
        }
        if self.max_steps == 0 || self.max_steps > u32::MAX as usize {
            return Err(PkpdError::Settings(format!(
                "solver max_steps must be in 1..={}",
                u32::MAX
            )));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SolverError {
    #[error("step size underflow")]
    StepSizeTooSmall,
    #[error("step budget of {0} exhausted")]
    MaxSteps(usize),
    #[error("problem became stiff")]
    Stiff,
    #[error("state became non-finite")]
    NonFinite,
}

/// Where and why an integration stopped
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub time: f64,
    pub state: Vec<f64>,
    pub error: SolverError,
}

impl Divergence {
    pub fn into_error(self, id: &str) -> PkpdError {
        PkpdError::SimulationDiverged {
            id: id.to_string(),
            time: self.time,
            state: self.state,
            reason: self.error.to_string(),
        }
    }
}

/// Every accepted step of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    times: Vec<f64>,
    states: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, time: f64, state: &[f64]) {
        if self.times.last() == Some(&time) {
            if let Some(last) = self.states.last_mut() {
                last.copy_from_slice(state);
            }
            return;
        }
        self.times.push(time);
        self.states.push(state.to_vec());
    }

    pub(crate) fn clear(&mut self) {
        self.times.clear();
        self.states.clear();
    }

    pub(crate) fn extend_from(&mut self, other: &Trajectory) {
        for (time, state) in other.times.iter().zip(&other.states) {
            self.push(*time, state);
        }
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn states(&self) -> &[Vec<f64>] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// `(t, y[index])` at every recorded point
    pub fn component(&self, index: usize) -> Vec<(f64, f64)> {
        self.times
            .iter()
            .zip(&self.states)
            .map(|(t, y)| (*t, y[index]))
            .collect()
    }
}

/// Counters of one integration interval
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolveStats {
    pub evaluations: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Adapter from a slice closure to the stepper's vector system
struct Rhs<F>(RefCell<F>);

impl<F> System<f64, State> for Rhs<F>
where
    F: FnMut(f64, &[f64], &mut [f64]),
{
    fn system(&self, t: f64, y: &State, dy: &mut State) {
        let mut rhs = self.0.borrow_mut();
        (*rhs)(t, y.as_slice(), dy.as_mut_slice());
    }
}

/// Dormand–Prince integrator configured once per run
#[derive(Debug, Clone)]
pub struct Solver {
    options: SolverOptions,
}

impl Solver {
    pub fn new(options: SolverOptions) -> Self {
        Solver { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Advance `y` from `t0` to `t1` in place.
    ///
    /// Accepted steps are appended to `trajectory` when one is given, the
    /// last one stamped exactly `t1`.
    pub fn integrate<F>(
        &self,
        rhs: F,
        t0: f64,
        t1: f64,
        y: &mut [f64],
        trajectory: Option<&mut Trajectory>,
    ) -> Result<SolveStats, Divergence>
    where
        F: FnMut(f64, &[f64], &mut [f64]),
    {
        let span = t1 - t0;
        if span <= 0.0 || y.is_empty() {
            return Ok(SolveStats::default());
        }
        let opts = self.options;
        let mut stepper = Dopri5::from_param(
            Rhs(RefCell::new(rhs)),
            t0,
            t1,
            span,
            State::from_column_slice(y),
            opts.rtol,
            opts.atol,
            SAFETY,
            BETA,
            FAC_MIN,
            FAC_MAX,
            opts.h_max.unwrap_or(span).min(span),
            opts.h0.min(span),
            opts.max_steps as u32,
            STIFFNESS_CHECKS,
            OutputType::Sparse,
        );
        let outcome = stepper.integrate();
        let times = stepper.x_out();
        let states = stepper.y_out();

        let last = times
            .iter()
            .zip(states.iter())
            .filter(|(t, _)| **t > t0)
            .last();
        let stats = match outcome {
            Ok(stats) => stats,
            Err(error) => {
                let (time, state) = last.map_or((t0, y.to_vec()), |(t, s)| (*t, s.as_slice().to_vec()));
                return Err(Divergence {
                    time,
                    state,
                    error: match error {
                        IntegrationError::MaxNumStepReached { .. } => {
                            SolverError::MaxSteps(opts.max_steps)
                        }
                        IntegrationError::StepSizeUnderflow { .. } => SolverError::StepSizeTooSmall,
                        IntegrationError::StiffnessDetected { .. } => SolverError::Stiff,
                    },
                });
            }
        };
        let Some((_, end)) = last else {
            return Err(Divergence {
                time: t0,
                state: y.to_vec(),
                error: SolverError::MaxSteps(opts.max_steps),
            });
        };
        if let Some((time, state)) = times
            .iter()
            .zip(states.iter())
            .find(|(_, s)| s.iter().any(|v| !v.is_finite()))
        {
            return Err(Divergence {
                time: *time,
                state: state.as_slice().to_vec(),
                error: SolverError::NonFinite,
            });
        }

        if let Some(trajectory) = trajectory {
            let mut accepted = times.iter().zip(states.iter()).filter(|(t, _)| **t > t0).peekable();
            while let Some((time, state)) = accepted.next() {
                let time = if accepted.peek().is_none() { t1 } else { *time };
                trajectory.push(time, state.as_slice());
            }
        }
        y.copy_from_slice(end.as_slice());
        Ok(SolveStats {
            evaluations: stats.num_eval as usize,
            accepted: stats.accepted_steps as usize,
            rejected: stats.rejected_steps as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_decay() {
        let solver = Solver::new(SolverOptions::default());
        let mut y = [1.0];
        let stats = solver
            .integrate(|_, y, dy| dy[0] = -0.5 * y[0], 0.0, 4.0, &mut y, None)
            .unwrap();
        assert_relative_eq!(y[0], (-2.0f64).exp(), epsilon = 1e-6);
        assert!(stats.accepted > 0);
    }

    #[test]
    fn harmonic_oscillator_keeps_energy() {
        let options = SolverOptions {
            rtol: 1e-9,
            atol: 1e-12,
            ..SolverOptions::default()
        };
        let solver = Solver::new(options);
        let mut y = [1.0, 0.0];
        let mut trajectory = Trajectory::new();
        solver
            .integrate(
                |_, y, dy| {
                    dy[0] = y[1];
                    dy[1] = -y[0];
                },
                0.0,
                std::f64::consts::PI,
                &mut y,
                Some(&mut trajectory),
            )
            .unwrap();
        assert_relative_eq!(y[0], -1.0, epsilon = 1e-7);
        assert_relative_eq!(y[1], 0.0, epsilon = 1e-7);
        assert_eq!(trajectory.times().last(), Some(&std::f64::consts::PI));
        assert!(trajectory.times().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn blow_up_is_reported() {
        let solver = Solver::new(SolverOptions::default());
        let mut y = [1.0];
        let err = solver
            .integrate(|_, y, dy| dy[0] = y[0] * y[0], 0.0, 2.0, &mut y, None)
            .unwrap_err();
        assert!(err.time < 1.0 + 1e-6);
        let err = err.into_error("pt");
        assert!(matches!(err, PkpdError::SimulationDiverged { .. }));
    }

    #[test]
    fn step_budget_is_enforced() {
        let options = SolverOptions {
            max_steps: 3,
            h0: 1e-6,
            h_max: Some(1e-6),
            ..SolverOptions::default()
        };
        let solver = Solver::new(options);
        let mut y = [1.0];
        let err = solver
            .integrate(|_, _, dy| dy[0] = 1.0, 0.0, 1.0, &mut y, None)
            .unwrap_err();
        assert_eq!(err.error, SolverError::MaxSteps(3));
    }

    #[test]
    fn empty_interval_leaves_state() {
        let solver = Solver::new(SolverOptions::default());
        let mut y = [2.0];
        let stats = solver
            .integrate(|_, _, dy| dy[0] = 1.0, 3.0, 3.0, &mut y, None)
            .unwrap();
        assert_eq!(y, [2.0]);
        assert_eq!(stats, SolveStats::default());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = SolverOptions {
            h0: -1.0,
            ..SolverOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(SolverOptions::default().validate().is_ok());
    }
}
