//! Periodic steady state of a repeated dose.
//!
//! The dose is applied to an empty system and the interval simulated again
//! and again until two consecutive troughs agree. The state reached replaces
//! the current compartments and delay chains; cumulative hazards, event
//! clocks and the infusions already running are left untouched.
use serde::{Deserialize, Serialize};

use crate::data::Event;
use crate::error::PkpdError;
use crate::simulator::{Run, Segment};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SteadyStateOptions {
    /// Relative change between two troughs below which the state is periodic
    pub tolerance: f64,
    /// Cap on the number of simulated intervals
    pub max_periods: usize,
}

impl Default for SteadyStateOptions {
    fn default() -> Self {
        SteadyStateOptions {
            tolerance: 1e-6,
            max_periods: 200,
        }
    }
}

impl SteadyStateOptions {
    pub fn validate(&self) -> Result<(), PkpdError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(PkpdError::Settings(format!(
                "steady state tolerance must be > 0, got {}",
                self.tolerance
            )));
        }
        if self.max_periods < 2 {
            return Err(PkpdError::Settings(
                "steady state needs at least 2 periods".to_string(),
            ));
        }
        Ok(())
    }
}

impl Run<'_> {
    /// Replace the state by the trough of the periodic regime of `dose`
    /// repeated every `interval`. Returns `false` when the period cap was hit
    /// before convergence; the last trough is used in that case.
    pub(crate) fn reach_steady_state(
        &mut self,
        dose: &Event,
        interval: f64,
        segment: &Segment,
        options: &SteadyStateOptions,
    ) -> Result<bool, PkpdError> {
        let model = self.model;
        let t0 = self.t;
        let periodic = model.n_states() - model.hazards.len();
        let atol = self.solver.options().atol;

        let running = std::mem::take(&mut self.infusions);
        let trajectory = self.trajectory.take();
        let clocks = std::mem::take(&mut self.clocks);
        let hazards = self.y[periodic..].to_vec();

        let start = model.empty_state(&segment.params.values, &segment.params.covariates);
        self.y.copy_from_slice(start.as_slice());
        self.update_rates();

        let mut previous = self.y.clone();
        let mut converged = false;
        let mut outcome = Ok(());
        for period in 1..=options.max_periods {
            self.t = t0;
            outcome = self
                .apply_dose(dose)
                .and_then(|_| self.advance(t0 + interval, segment));
            if outcome.is_err() {
                break;
            }
            // infusions overlapping the next interval carry over into it
            for infusion in self.infusions.iter_mut() {
                infusion.end -= interval;
            }
            let settled = self.y[..periodic]
                .iter()
                .zip(&previous[..periodic])
                .all(|(x, p)| (x - p).abs() <= options.tolerance * x.abs() + atol);
            if period >= 2 && settled {
                converged = true;
                break;
            }
            previous.copy_from_slice(&self.y);
        }

        self.t = t0;
        self.y[periodic..].copy_from_slice(&hazards);
        self.infusions.extend(running);
        self.update_rates();
        self.trajectory = trajectory;
        self.clocks = clocks;
        outcome?;
        self.record();
        Ok(converged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        assert!(SteadyStateOptions::default().validate().is_ok());
        let options = SteadyStateOptions {
            max_periods: 1,
            ..SteadyStateOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
