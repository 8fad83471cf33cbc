use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::data::*;
use crate::error::PkpdError;

/// The main data container for pharmacometric data
///
/// [Data] is a collection of [Subject] instances, which themselves contain
/// [Occasion] instances with [Event]s.
///
/// # Examples
///
/// ```
/// use pkpdsim::prelude::*;
///
/// let subject1 = Subject::builder("patient_001")
///     .bolus(0.0, 100.0, 0)
///     .observation(1.0, 5.0, 0)
///     .build()
///     .unwrap();
/// let subject2 = Subject::builder("patient_002")
///     .bolus(0.0, 120.0, 0)
///     .observation(1.0, 6.0, 0)
///     .build()
///     .unwrap();
///
/// let mut data = Data::new(vec![subject1]);
/// data.add_subject(subject2);
/// let filtered = data.filter_include(&["patient_001".to_string()]);
/// assert_eq!(filtered.len(), 1);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Data {
    subjects: Vec<Subject>,
}

impl Data {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Data { subjects }
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    pub fn add_subject(&mut self, subject: Subject) {
        self.subjects.push(subject);
    }

    pub fn get_subject(&self, id: &str) -> Option<&Subject> {
        self.subjects.iter().find(|subject| subject.id() == id)
    }

    /// Keep only the subjects whose ID is listed
    pub fn filter_include(&self, include: &[String]) -> Data {
        let subjects = self
            .subjects
            .iter()
            .filter(|subject| include.iter().any(|id| id == subject.id()))
            .cloned()
            .collect();
        Data::new(subjects)
    }

    /// Drop the subjects whose ID is listed
    pub fn filter_exclude(&self, exclude: &[String]) -> Data {
        let subjects = self
            .subjects
            .iter()
            .filter(|subject| !exclude.iter().any(|id| id == subject.id()))
            .cloned()
            .collect();
        Data::new(subjects)
    }

    /// Add prediction-only observations every `idelta` time units, up to the
    /// last observation or infusion end plus `tad`, for every output present
    /// in the dataset. Existing (time, output) pairs are left untouched.
    pub fn expand(&self, idelta: f64, tad: f64) -> Data {
        if idelta <= 0.0 {
            return self.clone();
        }
        let outeqs = self.output_equations();
        let last_time = self
            .subjects
            .iter()
            .map(|subject| subject.last_time())
            .fold(0.0_f64, f64::max)
            + tad;
        Data::new(
            self.subjects
                .iter()
                .map(|subject| subject.expand_to(idelta, last_time, &outeqs))
                .collect(),
        )
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subject> {
        self.subjects.iter()
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Output indices referenced by any observation, sorted
    pub fn output_equations(&self) -> Vec<usize> {
        let outeqs: BTreeSet<usize> = self
            .subjects
            .iter()
            .flat_map(|subject| subject.output_equations())
            .collect();
        outeqs.into_iter().collect()
    }
}

impl IntoIterator for Data {
    type Item = Subject;
    type IntoIter = std::vec::IntoIter<Subject>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.into_iter()
    }
}

impl<'a> IntoIterator for &'a Data {
    type Item = &'a Subject;
    type IntoIter = std::slice::Iter<'a, Subject>;
    fn into_iter(self) -> Self::IntoIter {
        self.subjects.iter()
    }
}

impl From<Vec<Subject>> for Data {
    fn from(subjects: Vec<Subject>) -> Self {
        Data::new(subjects)
    }
}

impl From<Subject> for Data {
    fn from(subject: Subject) -> Self {
        Data::new(vec![subject])
    }
}

/// A single individual
///
/// Occasions are consecutive windows of one continuous timeline: the state of
/// the system carries over from one occasion to the next, while parameters
/// (inter-occasion variability, occasion-start covariates) may change.
#[derive(Serialize, Debug, Deserialize, Clone, PartialEq)]
pub struct Subject {
    id: String,
    occasions: Vec<Occasion>,
}

impl Subject {
    pub(crate) fn new(id: String, occasions: Vec<Occasion>) -> Self {
        let mut subject = Subject { id, occasions };
        for occasion in subject.occasions.iter_mut() {
            occasion.sort();
        }
        subject
    }

    /// Like [Subject::new], rejecting occasions that start before the last
    /// event of the previous one
    pub(crate) fn checked(id: String, occasions: Vec<Occasion>) -> Result<Self, PkpdError> {
        let subject = Subject::new(id, occasions);
        let mut last: Option<(usize, f64)> = None;
        for occasion in &subject.occasions {
            let (Some(start), Some(end)) = (occasion.start_time(), occasion.end_time()) else {
                continue;
            };
            if let Some((previous, previous_end)) = last {
                if start < previous_end {
                    return Err(PkpdError::InvalidDosingSchedule {
                        id: subject.id.clone(),
                        reason: format!(
                            "occasion {} starts at time {}, before the last event of occasion {} at time {}",
                            occasion.index, start, previous, previous_end
                        ),
                    });
                }
            }
            last = Some((occasion.index, end));
        }
        Ok(subject)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn occasions(&self) -> &[Occasion] {
        &self.occasions
    }

    /// All events of all occasions, in simulation order
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.occasions.iter().flat_map(|occasion| occasion.events.iter())
    }

    /// Observation records in simulation order
    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.events().filter_map(|event| match event {
            Event::Observation(obs) => Some(obs),
            _ => None,
        })
    }

    pub fn output_equations(&self) -> BTreeSet<usize> {
        self.observations().map(|obs| obs.outeq()).collect()
    }

    /// Last observation time or infusion end
    pub fn last_time(&self) -> f64 {
        self.events()
            .map(|event| match event {
                Event::Infusion(infusion) => infusion.end_time(),
                other => other.time(),
            })
            .fold(0.0_f64, f64::max)
    }

    /// Stable hash of the subject's events, used to key cached predictions
    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        for occasion in &self.occasions {
            occasion.index.hash(&mut hasher);
            for event in &occasion.events {
                hash_event(event, &mut hasher);
            }
            for covariate in occasion.covariates.covariates() {
                covariate.name().hash(&mut hasher);
                for obs in covariate.observations() {
                    obs.time().to_bits().hash(&mut hasher);
                    obs.value().to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    /// See [Data::expand]
    pub fn expand(&self, idelta: f64, tad: f64) -> Subject {
        if idelta <= 0.0 {
            return self.clone();
        }
        let outeqs: Vec<usize> = self.output_equations().into_iter().collect();
        self.expand_to(idelta, self.last_time() + tad, &outeqs)
    }

    fn expand_to(&self, idelta: f64, last_time: f64, outeqs: &[usize]) -> Subject {
        let key = |time: f64| (time * 1e6).round() as i64;
        let existing: BTreeSet<(i64, usize)> = self
            .observations()
            .map(|obs| (key(obs.time()), obs.outeq()))
            .collect();
        let mut occasions = self.occasions.clone();
        let starts: Vec<f64> = occasions
            .iter()
            .map(|occasion| occasion.start_time().unwrap_or(0.0))
            .collect();

        let mut time = 0.0;
        while time <= last_time {
            let slot = starts.iter().rposition(|start| *start <= time).unwrap_or(0);
            if let Some(occasion) = occasions.get_mut(slot) {
                for &outeq in outeqs {
                    if !existing.contains(&(key(time), outeq)) {
                        let mut event = Event::Observation(Observation::new(time, None, outeq));
                        event.set_occasion(occasion.index);
                        occasion.events.push(event);
                    }
                }
            }
            time += idelta;
            time = (time * 1e6).round() / 1e6;
        }
        Subject::new(self.id.clone(), occasions)
    }
}

fn hash_event<H: Hasher>(event: &Event, hasher: &mut H) {
    event.time().to_bits().hash(hasher);
    match event {
        Event::Bolus(bolus) => {
            0u8.hash(hasher);
            bolus.amount().to_bits().hash(hasher);
            bolus.input().hash(hasher);
            bolus.steady_state().map(f64::to_bits).hash(hasher);
        }
        Event::Infusion(infusion) => {
            1u8.hash(hasher);
            infusion.amount().to_bits().hash(hasher);
            infusion.input().hash(hasher);
            infusion.duration().to_bits().hash(hasher);
            infusion.steady_state().map(f64::to_bits).hash(hasher);
        }
        Event::Observation(obs) => {
            2u8.hash(hasher);
            obs.outeq().hash(hasher);
            obs.value().map(f64::to_bits).hash(hasher);
            obs.censored().hash(hasher);
            obs.lloq().map(f64::to_bits).hash(hasher);
        }
        Event::Reset(reset) => {
            3u8.hash(hasher);
            reset.compartments().hash(hasher);
            reset.value().to_bits().hash(hasher);
        }
    }
}

/// A window of a subject's timeline sharing one set of occasion-level
/// parameters (covariates read at its start, its own inter-occasion effects).
#[derive(Serialize, Debug, Deserialize, Clone, PartialEq)]
pub struct Occasion {
    pub(crate) events: Vec<Event>,
    pub(crate) covariates: Covariates,
    pub(crate) index: usize,
}

impl Occasion {
    pub(crate) fn new(index: usize) -> Self {
        Occasion {
            events: Vec::new(),
            covariates: Covariates::new(),
            index,
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn covariates(&self) -> &Covariates {
        &self.covariates
    }

    /// Time of the earliest event, `None` for an empty occasion
    pub fn start_time(&self) -> Option<f64> {
        self.events
            .iter()
            .map(|event| event.time())
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Time of the latest event, `None` for an empty occasion
    pub fn end_time(&self) -> Option<f64> {
        self.events
            .iter()
            .map(|event| event.time())
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Stable sort by time; ties keep their declaration order
    pub(crate) fn sort(&mut self) {
        self.events.sort_by(|a, b| a.time().total_cmp(&b.time()));
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Data Overview: {} subjects", self.subjects.len())?;
        for subject in &self.subjects {
            writeln!(f, "{}", subject)?;
        }
        Ok(())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Subject ID: {}", self.id)?;
        for occasion in &self.occasions {
            writeln!(f, "{}", occasion)?;
        }
        Ok(())
    }
}

impl fmt::Display for Occasion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Occasion {}:", self.index)?;
        for event in &self.events {
            writeln!(f, "  {}", event)?;
        }
        writeln!(f, "  {}", self.covariates)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    fn sample_data() -> Data {
        let subject1 = Subject::builder("subject1")
            .bolus(0.0, 50.0, 0)
            .observation(1.0, 10.0, 0)
            .infusion(3.0, 100.0, 0, 1.0)
            .covariate("age", 0.0, 30.0)
            .new_occasion()
            .observation(12.0, 20.0, 1)
            .covariate("age", 12.0, 31.0)
            .build()
            .unwrap();
        let subject2 = Subject::builder("subject2")
            .bolus(0.0, 55.0, 0)
            .observation(1.5, 15.0, 0)
            .build()
            .unwrap();
        Data::new(vec![subject1, subject2])
    }

    #[test]
    fn filters_by_id() {
        let data = sample_data();
        assert_eq!(data.filter_include(&["subject1".to_string()]).len(), 1);
        let rest = data.filter_exclude(&["subject1".to_string()]);
        assert_eq!(rest.subjects()[0].id(), "subject2");
    }

    #[test]
    fn output_equations_are_collected() {
        assert_eq!(sample_data().output_equations(), vec![0, 1]);
    }

    #[test]
    fn expand_adds_grid_without_duplicates() {
        let data = sample_data();
        let expanded = data.expand(1.0, 0.0);
        let subject = expanded.get_subject("subject2").unwrap();
        // grid 0..=12 for both outputs, the observed (1.5, 0) stays single
        let count = subject.observations().count();
        assert_eq!(count, 13 * 2 + 1);
        let first = subject.observations().next().unwrap();
        assert_eq!(first.time(), 0.0);
        assert!(first.value().is_none());
    }

    #[test]
    fn expanded_points_land_in_their_occasion() {
        let subject = sample_data().subjects()[0].expand(1.0, 0.0);
        let late = &subject.occasions()[1];
        assert!(late
            .events()
            .iter()
            .all(|event| event.time() >= 12.0 && event.occasion() == 1));
    }

    #[test]
    fn occasions_must_follow_each_other() {
        let result = Subject::builder("late")
            .bolus(0.0, 100.0, 0)
            .observation(24.0, 1.0, 0)
            .new_occasion()
            .observation(12.0, 3.0, 0)
            .build();
        assert!(matches!(
            result,
            Err(PkpdError::InvalidDosingSchedule { ref id, .. }) if id == "late"
        ));

        // touching boundaries are fine
        let subject = Subject::builder("touching")
            .bolus(0.0, 100.0, 0)
            .observation(24.0, 1.0, 0)
            .new_occasion()
            .bolus(24.0, 100.0, 0)
            .build()
            .unwrap();
        assert_eq!(subject.occasions()[1].start_time(), Some(24.0));
        assert_eq!(subject.occasions()[0].end_time(), Some(24.0));
    }

    #[test]
    fn hash_is_sensitive_to_events() {
        let data = sample_data();
        let a = data.subjects()[0].hash();
        let b = data.subjects()[0].clone().hash();
        let c = data.subjects()[1].hash();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
