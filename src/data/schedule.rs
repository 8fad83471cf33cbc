//! Expansion of dosing directives into explicit, time-ordered events.
//!
//! ```
//! use pkpdsim::data::schedule::DosingDirective;
//!
//! let events = DosingDirective::bolus(0.0, 100.0, 0)
//!     .addl(3, 12.0)
//!     .expand("pt1")
//!     .unwrap();
//! let times: Vec<f64> = events.iter().map(|e| e.time()).collect();
//! assert_eq!(times, vec![0.0, 12.0, 24.0, 36.0]);
//! ```
use serde::{Deserialize, Serialize};

use crate::data::event::{Bolus, Event, Infusion};
use crate::error::PkpdError;

/// How a dose enters its compartment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DoseRoute {
    Bolus,
    /// Zero-order input over `duration`
    Infusion { duration: f64 },
}

/// A dose together with its repetition information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingDirective {
    time: f64,
    amount: f64,
    input: usize,
    route: DoseRoute,
    addl: usize,
    ii: Option<f64>,
    steady_state: bool,
    occasion: usize,
}

impl DosingDirective {
    pub fn bolus(time: f64, amount: f64, input: usize) -> Self {
        DosingDirective {
            time,
            amount,
            input,
            route: DoseRoute::Bolus,
            addl: 0,
            ii: None,
            steady_state: false,
            occasion: 0,
        }
    }

    pub fn infusion(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        DosingDirective {
            route: DoseRoute::Infusion { duration },
            ..DosingDirective::bolus(time, amount, input)
        }
    }

    /// Zero-order dose given by its rate; the duration follows from `amount / rate`.
    pub fn infusion_rate(time: f64, amount: f64, input: usize, rate: f64) -> Self {
        DosingDirective::infusion(time, amount, input, amount / rate)
    }

    /// `addl` extra identical doses every `ii` time units after the first one.
    pub fn addl(mut self, addl: usize, ii: f64) -> Self {
        self.addl = addl;
        self.ii = Some(ii);
        self
    }

    /// The first dose starts from the periodic steady state of interval `ii`.
    pub fn steady_state(mut self, ii: f64) -> Self {
        self.steady_state = true;
        self.ii = Some(ii);
        self
    }

    pub fn occasion(mut self, occasion: usize) -> Self {
        self.occasion = occasion;
        self
    }

    /// Copy of the directive moved by `dt`, as a plain (non steady-state) dose
    pub fn shifted(&self, dt: f64) -> Self {
        DosingDirective {
            time: self.time + dt,
            steady_state: false,
            ..self.clone()
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn input(&self) -> usize {
        self.input
    }

    /// Check the directive before expansion.
    pub fn validate(&self, id: &str) -> Result<(), PkpdError> {
        let fail = |reason: String| {
            Err(PkpdError::InvalidDosingSchedule {
                id: id.to_string(),
                reason,
            })
        };
        if !self.time.is_finite() || self.time < 0.0 {
            return fail(format!("dose time {} must be finite and >= 0", self.time));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return fail(format!(
                "dose amount {} at time {} must be finite and >= 0",
                self.amount, self.time
            ));
        }
        if let DoseRoute::Infusion { duration } = self.route {
            if !duration.is_finite() || duration <= 0.0 {
                return fail(format!(
                    "infusion at time {} has duration {}, expected > 0 (rate must be positive)",
                    self.time, duration
                ));
            }
        }
        let needs_interval = self.addl > 0 || self.steady_state;
        match self.ii {
            Some(ii) if needs_interval && !(ii.is_finite() && ii > 0.0) => {
                return fail(format!(
                    "dosing interval II = {} at time {} must be > 0",
                    ii, self.time
                ));
            }
            None if needs_interval => {
                return fail(format!("dose at time {} repeats without II", self.time));
            }
            _ => {}
        }
        if let (true, Some(ii), DoseRoute::Infusion { duration }) =
            (self.steady_state, self.ii, self.route)
        {
            if duration > ii {
                return fail(format!(
                    "steady-state infusion at time {} lasts {} which exceeds II = {}",
                    self.time, duration, ii
                ));
            }
        }
        Ok(())
    }

    fn event_at(&self, time: f64, steady_state: Option<f64>) -> Event {
        let mut event = match self.route {
            DoseRoute::Bolus => {
                let mut bolus = Bolus::new(time, self.amount, self.input);
                bolus.set_steady_state(steady_state);
                Event::Bolus(bolus)
            }
            DoseRoute::Infusion { duration } => {
                let mut infusion = Infusion::new(time, self.amount, self.input, duration);
                infusion.set_steady_state(steady_state);
                Event::Infusion(infusion)
            }
        };
        event.set_occasion(self.occasion);
        event
    }

    /// The dose followed by its ADDL repetitions at `t0 + k * II`, `k = 1..=ADDL`.
    /// Only the first dose carries the steady-state flag.
    pub fn expand(&self, id: &str) -> Result<Vec<Event>, PkpdError> {
        self.validate(id)?;
        let ss = if self.steady_state { self.ii } else { None };
        let mut events = Vec::with_capacity(self.addl + 1);
        events.push(self.event_at(self.time, ss));
        if let Some(ii) = self.ii {
            let mut next = self.event_at(self.time, None);
            for _ in 0..self.addl {
                next.inc_time(ii);
                events.push(next.clone());
            }
        }
        Ok(events)
    }
}

/// One entry of a subject's declared schedule, in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScheduleEntry {
    Dose(DosingDirective),
    Event(Event),
}

/// Expand all directives and sort by time.
///
/// The sort is stable, so records sharing a time keep their declaration
/// order, and ADDL repetitions take the position of their directive.
pub fn build_schedule(id: &str, entries: &[ScheduleEntry]) -> Result<Vec<Event>, PkpdError> {
    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            ScheduleEntry::Dose(directive) => events.extend(directive.expand(id)?),
            ScheduleEntry::Event(event) => {
                validate_event(id, event)?;
                events.push(event.clone());
            }
        }
    }
    events.sort_by(|a, b| a.time().total_cmp(&b.time()));
    Ok(events)
}

fn validate_event(id: &str, event: &Event) -> Result<(), PkpdError> {
    let time = event.time();
    if !time.is_finite() || time < 0.0 {
        return Err(PkpdError::InvalidDosingSchedule {
            id: id.to_string(),
            reason: format!("event time {} must be finite and >= 0", time),
        });
    }
    match event {
        Event::Bolus(bolus) => {
            let mut directive = DosingDirective::bolus(time, bolus.amount(), bolus.input());
            if let Some(ii) = bolus.steady_state() {
                directive = directive.steady_state(ii);
            }
            directive.validate(id)
        }
        Event::Infusion(infusion) => {
            let mut directive = DosingDirective::infusion(
                time,
                infusion.amount(),
                infusion.input(),
                infusion.duration(),
            );
            if let Some(ii) = infusion.steady_state() {
                directive = directive.steady_state(ii);
            }
            directive.validate(id)
        }
        Event::Observation(_) | Event::Reset(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::event::{Observation, Reset};

    #[test]
    fn addl_generates_identical_doses() {
        let events = DosingDirective::infusion(0.0, 100.0, 0, 2.0)
            .addl(3, 12.0)
            .expand("pt1")
            .unwrap();
        assert_eq!(events.len(), 4);
        for (k, event) in events.iter().enumerate() {
            match event {
                Event::Infusion(inf) => {
                    assert_eq!(inf.time(), 12.0 * k as f64);
                    assert_eq!(inf.amount(), 100.0);
                    assert_eq!(inf.duration(), 2.0);
                }
                other => panic!("expected infusion, got {}", other),
            }
        }
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        for ii in [0.0, -12.0, f64::NAN] {
            let result = DosingDirective::bolus(0.0, 100.0, 0).addl(2, ii).expand("pt1");
            assert!(matches!(
                result,
                Err(PkpdError::InvalidDosingSchedule { .. })
            ));
        }
        assert!(DosingDirective::bolus(0.0, 100.0, 0)
            .steady_state(0.0)
            .expand("pt1")
            .is_err());
    }

    #[test]
    fn addl_zero_ignores_interval() {
        let events = DosingDirective::bolus(5.0, 10.0, 0)
            .addl(0, 0.0)
            .expand("pt1")
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn steady_state_infusion_must_fit_in_interval() {
        let result = DosingDirective::infusion(0.0, 100.0, 0, 30.0)
            .steady_state(24.0)
            .expand("pt1");
        assert!(result.is_err());
    }

    #[test]
    fn only_first_dose_carries_steady_state() {
        let events = DosingDirective::bolus(0.0, 100.0, 0)
            .steady_state(24.0)
            .addl(2, 24.0)
            .expand("pt1")
            .unwrap();
        let flags: Vec<Option<f64>> = events
            .iter()
            .map(|e| match e {
                Event::Bolus(b) => b.steady_state(),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![Some(24.0), None, None]);
    }

    #[test]
    fn schedule_is_sorted_with_stable_ties() {
        let entries = vec![
            ScheduleEntry::Event(Event::Observation(Observation::new(12.0, None, 0))),
            ScheduleEntry::Dose(DosingDirective::bolus(0.0, 100.0, 0).addl(1, 12.0)),
            ScheduleEntry::Event(Event::Reset(Reset::new(12.0, vec![1], 0.0))),
        ];
        let events = build_schedule("pt1", &entries).unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                Event::Bolus(_) => "dose",
                Event::Observation(_) => "obs",
                Event::Reset(_) => "reset",
                Event::Infusion(_) => "inf",
            })
            .collect();
        assert_eq!(kinds, vec!["dose", "obs", "dose", "reset"]);
    }

    #[test]
    fn negative_amount_is_rejected() {
        let entries = vec![ScheduleEntry::Event(Event::Bolus(Bolus::new(0.0, -1.0, 0)))];
        assert!(build_schedule("pt1", &entries).is_err());
    }
}
