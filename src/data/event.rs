use std::fmt;

use serde::{Deserialize, Serialize};

/// Represents a pharmacokinetic/pharmacodynamic event
///
/// Events represent key occurrences in a PK/PD profile, including:
/// - [Bolus] doses (instantaneous drug input)
/// - [Infusion]s (zero-order drug input over a duration)
/// - [Observation]s (measured concentrations, categories or event records)
/// - [Reset]s (compartments forced to a value, e.g. an emptied urine collection)
#[derive(Serialize, Debug, Clone, Deserialize, PartialEq)]
pub enum Event {
    /// A bolus dose (instantaneous drug input)
    Bolus(Bolus),
    /// An infusion (continuous drug input over a duration)
    Infusion(Infusion),
    /// An observation of drug concentration or other measure
    Observation(Observation),
    /// A compartment reset
    Reset(Reset),
}

impl Event {
    /// Get the time of the event
    pub fn time(&self) -> f64 {
        match self {
            Event::Bolus(bolus) => bolus.time,
            Event::Infusion(infusion) => infusion.time,
            Event::Observation(observation) => observation.time,
            Event::Reset(reset) => reset.time,
        }
    }

    /// Occasion the event belongs to
    pub fn occasion(&self) -> usize {
        match self {
            Event::Bolus(bolus) => bolus.occasion,
            Event::Infusion(infusion) => infusion.occasion,
            Event::Observation(observation) => observation.occasion,
            Event::Reset(reset) => reset.occasion,
        }
    }

    pub(crate) fn set_occasion(&mut self, occasion: usize) {
        match self {
            Event::Bolus(bolus) => bolus.occasion = occasion,
            Event::Infusion(infusion) => infusion.occasion = occasion,
            Event::Observation(observation) => observation.occasion = occasion,
            Event::Reset(reset) => reset.occasion = occasion,
        }
    }

    /// Increment the event time by a specified delta
    pub(crate) fn inc_time(&mut self, dt: f64) {
        match self {
            Event::Bolus(bolus) => bolus.time += dt,
            Event::Infusion(infusion) => infusion.time += dt,
            Event::Observation(observation) => observation.time += dt,
            Event::Reset(reset) => reset.time += dt,
        }
    }

    pub fn is_dose(&self) -> bool {
        matches!(self, Event::Bolus(_) | Event::Infusion(_))
    }
}

/// Represents an instantaneous input of drug
///
/// A [Bolus] is a discrete amount of drug added to a specific compartment at a specific time.
#[derive(Serialize, Debug, Clone, Deserialize, PartialEq)]
pub struct Bolus {
    time: f64,
    amount: f64,
    input: usize,
    occasion: usize,
    steady_state: Option<f64>,
}

impl Bolus {
    /// Bolus of `amount` into compartment `input` (zero-indexed)
    pub fn new(time: f64, amount: f64, input: usize) -> Self {
        Bolus {
            time,
            amount,
            input,
            occasion: 0,
            steady_state: None,
        }
    }

    /// Get the amount of drug in the bolus
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the compartment number (zero-indexed) that receives the bolus
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the time of the bolus administration
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn occasion(&self) -> usize {
        self.occasion
    }

    /// Dosing interval when this dose starts from periodic steady state
    pub fn steady_state(&self) -> Option<f64> {
        self.steady_state
    }

    pub(crate) fn set_steady_state(&mut self, interval: Option<f64>) {
        self.steady_state = interval;
    }
}

/// Represents a continuous dose of drug over time
///
/// An [Infusion] administers drug at a constant rate over a specified duration.
#[derive(Serialize, Debug, Clone, Deserialize, PartialEq)]
pub struct Infusion {
    time: f64,
    amount: f64,
    input: usize,
    duration: f64,
    occasion: usize,
    steady_state: Option<f64>,
}

impl Infusion {
    /// Create a new infusion event
    ///
    /// # Arguments
    ///
    /// * `time` - Start time of the infusion
    /// * `amount` - Total amount of drug to be administered
    /// * `input` - The compartment number (zero-indexed) receiving the dose
    /// * `duration` - Duration of the infusion in time units
    pub fn new(time: f64, amount: f64, input: usize, duration: f64) -> Self {
        Infusion {
            time,
            amount,
            input,
            duration,
            occasion: 0,
            steady_state: None,
        }
    }

    /// Create an infusion from its rate, `amount = rate * duration`.
    pub fn from_rate(time: f64, rate: f64, input: usize, duration: f64) -> Self {
        Infusion::new(time, rate * duration, input, duration)
    }

    /// Get the total amount of drug provided over the infusion
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Get the compartment number (zero-indexed) that receives the infusion
    pub fn input(&self) -> usize {
        self.input
    }

    /// Get the duration of the infusion
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Zero-order rate, `amount / duration`
    pub fn rate(&self) -> f64 {
        self.amount / self.duration
    }

    /// Get the start time of the infusion
    ///
    /// The infusion continues from this time until time + duration.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Time at which the infusion stops
    pub fn end_time(&self) -> f64 {
        self.time + self.duration
    }

    pub fn occasion(&self) -> usize {
        self.occasion
    }

    pub fn steady_state(&self) -> Option<f64> {
        self.steady_state
    }

    pub(crate) fn set_steady_state(&mut self, interval: Option<f64>) {
        self.steady_state = interval;
    }
}

/// Represents an observation of drug concentration or other measured value
///
/// For categorical outputs the value is the category index, for event outputs
/// it is `1` when the event occurred at `time` and `0` for a censoring record.
#[derive(Serialize, Debug, Clone, Deserialize, PartialEq)]
pub struct Observation {
    time: f64,
    value: Option<f64>,
    outeq: usize,
    occasion: usize,
    censored: bool,
    lloq: Option<f64>,
}

impl Observation {
    /// Create a new observation
    ///
    /// # Arguments
    ///
    /// * `time` - Time of the observation
    /// * `value` - Observed value, `None` for a prediction-only record
    /// * `outeq` - Output number (zero-indexed) corresponding to this observation
    pub fn new(time: f64, value: Option<f64>, outeq: usize) -> Self {
        Observation {
            time,
            value,
            outeq,
            occasion: 0,
            censored: false,
            lloq: None,
        }
    }

    /// Get the time of the observation
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Get the value of the observation (e.g., drug concentration)
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Get the output number (zero-indexed) corresponding to this observation
    pub fn outeq(&self) -> usize {
        self.outeq
    }

    pub fn occasion(&self) -> usize {
        self.occasion
    }

    /// True when the record is below the limit of quantification
    pub fn censored(&self) -> bool {
        self.censored
    }

    /// Record-level limit of quantification, overriding the output's limit
    pub fn lloq(&self) -> Option<f64> {
        self.lloq
    }




    /// Mark the record as below quantification limit
    pub fn set_censoring(&mut self, censored: bool, lloq: Option<f64>) {
        self.censored = censored;
        self.lloq = lloq;
    }
}

/// Forces compartments to a value, applied after the records that precede it
/// at the same time.
#[derive(Serialize, Debug, Clone, Deserialize, PartialEq)]
pub struct Reset {
    time: f64,
    compartments: Vec<usize>,
    value: f64,
    occasion: usize,
}

impl Reset {
    pub fn new(time: f64, compartments: Vec<usize>, value: f64) -> Self {
        Reset {
            time,
            compartments,
            value,
            occasion: 0,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn compartments(&self) -> &[usize] {
        &self.compartments
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn occasion(&self) -> usize {
        self.occasion
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Bolus(bolus) => write!(
                f,
                "Bolus at time {:.2} with amount {:.2} in compartment {}{}",
                bolus.time,
                bolus.amount,
                bolus.input,
                bolus
                    .steady_state
                    .map(|ii| format!(" (steady state, II {:.2})", ii))
                    .unwrap_or_default()
            ),
            Event::Infusion(infusion) => write!(
                f,
                "Infusion starting at {:.2} with amount {:.2} over {:.2} in compartment {}{}",
                infusion.time,
                infusion.amount,
                infusion.duration,
                infusion.input,
                infusion
                    .steady_state
                    .map(|ii| format!(" (steady state, II {:.2})", ii))
                    .unwrap_or_default()
            ),
            Event::Observation(observation) => write!(
                f,
                "Observation at time {:.2}: {} (outeq {}){}",
                observation.time,
                observation
                    .value
                    .map(|v| format!("{:.4}", v))
                    .unwrap_or_else(|| ".".to_string()),
                observation.outeq,
                if observation.censored { " BQL" } else { "" }
            ),
            Event::Reset(reset) => write!(
                f,
                "Reset at time {:.2} of compartments {:?} to {:.2}",
                reset.time, reset.compartments, reset.value
            ),
        }
    }
}
