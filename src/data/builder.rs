use crate::data::schedule::{build_schedule, DosingDirective, ScheduleEntry};
use crate::data::*;
use crate::error::PkpdError;

pub trait SubjectBuilderExt {
    fn builder(id: impl Into<String>) -> SubjectBuilder;
}

impl SubjectBuilderExt for Subject {
    fn builder(id: impl Into<String>) -> SubjectBuilder {
        SubjectBuilder {
            id: id.into(),
            occasions: Vec::new(),
            current: PendingOccasion::new(0),
            error: None,
        }
    }
}

struct PendingOccasion {
    index: usize,
    entries: Vec<ScheduleEntry>,
    covariates: Covariates,
}

impl PendingOccasion {
    fn new(index: usize) -> Self {
        PendingOccasion {
            index,
            entries: Vec::new(),
            covariates: Covariates::new(),
        }
    }
}

/// Fluent construction of a [Subject].
///
/// Dosing directives (ADDL, steady state) are expanded and validated in
/// [SubjectBuilder::build], which is where malformed schedules surface as
/// [PkpdError::InvalidDosingSchedule].
pub struct SubjectBuilder {
    id: String,
    occasions: Vec<PendingOccasion>,
    current: PendingOccasion,
    error: Option<PkpdError>,
}

impl SubjectBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn event(mut self, mut event: Event) -> Self {
        event.set_occasion(self.current.index);
        self.current.entries.push(ScheduleEntry::Event(event));
        self
    }

    pub fn dose(mut self, directive: DosingDirective) -> Self {
        let directive = directive.occasion(self.current.index);
        self.current.entries.push(ScheduleEntry::Dose(directive));
        self
    }

    pub fn bolus(self, time: f64, amount: f64, input: usize) -> Self {
        self.dose(DosingDirective::bolus(time, amount, input))
    }

    pub fn infusion(self, time: f64, amount: f64, input: usize, duration: f64) -> Self {
        self.dose(DosingDirective::infusion(time, amount, input, duration))
    }

    /// Zero-order dose given by amount and rate
    pub fn infusion_rate(self, time: f64, amount: f64, input: usize, rate: f64) -> Self {
        self.dose(DosingDirective::infusion_rate(time, amount, input, rate))
    }

    fn last_dose(&mut self, what: &str) -> Option<&mut DosingDirective> {
        let has_dose = self
            .current
            .entries
            .iter()
            .any(|entry| matches!(entry, ScheduleEntry::Dose(_)));
        if !has_dose {
            self.error.get_or_insert(PkpdError::InvalidDosingSchedule {
                id: self.id.clone(),
                reason: format!("{} without a preceding dose", what),
            });
            return None;
        }
        self.current
            .entries
            .iter_mut()
            .rev()
            .find_map(|entry| match entry {
                ScheduleEntry::Dose(directive) => Some(directive),
                ScheduleEntry::Event(_) => None,
            })
    }

    /// Repeat the most recent dose `addl` more times every `ii`
    pub fn addl(mut self, addl: usize, ii: f64) -> Self {
        if let Some(directive) = self.last_dose("ADDL") {
            *directive = directive.clone().addl(addl, ii);
        }
        self
    }

    /// Start the most recent dose from the periodic steady state of interval `ii`
    pub fn steady_state(mut self, ii: f64) -> Self {
        if let Some(directive) = self.last_dose("steady state") {
            *directive = directive.clone().steady_state(ii);
        }
        self
    }

    pub fn observation(self, time: f64, value: f64, outeq: usize) -> Self {
        self.event(Event::Observation(Observation::new(time, Some(value), outeq)))
    }

    /// Prediction-only record
    pub fn missing_observation(self, time: f64, outeq: usize) -> Self {
        self.event(Event::Observation(Observation::new(time, None, outeq)))
    }

    /// Record below the limit of quantification `lloq`
    pub fn censored_observation(self, time: f64, lloq: f64, outeq: usize) -> Self {
        let mut observation = Observation::new(time, Some(lloq), outeq);
        observation.set_censoring(true, Some(lloq));
        self.event(Event::Observation(observation))
    }

    /// Force `compartments` to `value` at `time`
    pub fn reset(self, time: f64, compartments: Vec<usize>, value: f64) -> Self {
        self.event(Event::Reset(Reset::new(time, compartments, value)))
    }

    pub fn covariate(mut self, name: &str, time: f64, value: f64) -> Self {
        if let Err(e) = self.current.covariates.add_observation(name, time, value) {
            self.error.get_or_insert(PkpdError::Covariate(e));
        }
        self
    }

    /// Covariate using carry-forward interpolation
    pub fn fixed_covariate(self, name: &str, time: f64, value: f64) -> Self {
        let mut builder = self.covariate(name, time, value);
        builder.current.covariates.set_covariate_fixed(name, true);
        builder
    }

    /// Repeat the last declared entry `n` times, shifted by `delta` each time
    pub fn repeat(mut self, n: usize, delta: f64) -> Self {
        let Some(last) = self.current.entries.last().cloned() else {
            self.error.get_or_insert(PkpdError::InvalidDosingSchedule {
                id: self.id.clone(),
                reason: "repeat without a preceding entry".to_string(),
            });
            return self;
        };
        for i in 1..=n {
            let shift = delta * i as f64;
            let entry = match &last {
                ScheduleEntry::Dose(directive) => ScheduleEntry::Dose(directive.shifted(shift)),
                ScheduleEntry::Event(event) => {
                    let mut event = event.clone();
                    event.inc_time(shift);
                    ScheduleEntry::Event(event)
                }
            };
            self.current.entries.push(entry);
        }
        self
    }

    /// Close the current occasion and start the next one
    pub fn new_occasion(mut self) -> Self {
        let index = self.current.index + 1;
        let finished = std::mem::replace(&mut self.current, PendingOccasion::new(index));
        self.occasions.push(finished);
        self
    }

    pub fn build(mut self) -> Result<Subject, PkpdError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if !self.current.entries.is_empty() || self.occasions.is_empty() {
            let index = self.current.index;
            let finished = std::mem::replace(&mut self.current, PendingOccasion::new(index));
            self.occasions.push(finished);
        }
        let mut occasions = Vec::with_capacity(self.occasions.len());
        for pending in self.occasions {
            let mut occasion = Occasion::new(pending.index);
            occasion.events = build_schedule(&self.id, &pending.entries)?;
            occasion.covariates = pending.covariates;
            occasions.push(occasion);
        }
        Subject::checked(self.id, occasions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_builder() {
        let subject = Subject::builder("test")
            .observation(3.0, 100.0, 0)
            .repeat(2, 0.5)
            .bolus(1.0, 100.0, 0)
            .infusion(0.0, 100.0, 0, 1.0)
            .repeat(3, 0.3)
            .new_occasion()
            .observation(10.0, 100.0, 0)
            .bolus(7.0, 100.0, 0)
            .repeat(3, 1.0)
            .build()
            .unwrap();
        assert_eq!(subject.id(), "test");
        assert_eq!(subject.occasions().len(), 2);
        assert_eq!(subject.occasions()[0].events().len(), 3 + 1 + 4);
        assert!(subject.occasions()[1]
            .events()
            .iter()
            .all(|event| event.occasion() == 1));
    }

    #[test]
    fn addl_is_expanded_at_build() {
        let subject = Subject::builder("pt")
            .bolus(0.0, 100.0, 0)
            .addl(3, 12.0)
            .build()
            .unwrap();
        let times: Vec<f64> = subject.events().map(|e| e.time()).collect();
        assert_eq!(times, vec![0.0, 12.0, 24.0, 36.0]);
    }

    #[test]
    fn addl_without_dose_fails() {
        let result = Subject::builder("pt")
            .observation(1.0, 1.0, 0)
            .addl(3, 12.0)
            .build();
        assert!(matches!(
            result,
            Err(PkpdError::InvalidDosingSchedule { .. })
        ));
    }

    #[test]
    fn invalid_interval_fails_at_build() {
        let result = Subject::builder("pt").bolus(0.0, 100.0, 0).addl(2, 0.0).build();
        assert!(result.is_err());
    }

    #[test]
    fn censored_observation_carries_lloq() {
        let subject = Subject::builder("pt")
            .censored_observation(4.0, 0.05, 0)
            .build()
            .unwrap();
        let obs = subject.observations().next().unwrap();
        assert!(obs.censored());
        assert_eq!(obs.lloq(), Some(0.05));
    }
}
