use thiserror::Error;

use crate::data::covariate::CovariateError;
use crate::model::expr::ParseError;

/// Errors raised while compiling models, building subjects or simulating.
///
/// Validation-time variants ([PkpdError::UnresolvedParameter],
/// [PkpdError::CensoringInconsistency], [PkpdError::InvalidDosingSchedule]) are
/// returned before any integration starts. [PkpdError::SimulationDiverged] is
/// only ever produced for a single individual.
#[derive(Error, Debug, Clone)]
pub enum PkpdError {
    #[error("Unresolved symbol '{symbol}' in {context}")]
    UnresolvedParameter { symbol: String, context: String },
    #[error("Invalid dosing schedule for {id}: {reason}")]
    InvalidDosingSchedule { id: String, reason: String },
    #[error("Simulation diverged for {id} at time {time}: {reason} (state: {state:?})")]
    SimulationDiverged {
        id: String,
        time: f64,
        state: Vec<f64>,
        reason: String,
    },
    #[error("Censoring configuration of output '{output}' is inconsistent: {reason}")]
    CensoringInconsistency { output: String, reason: String },
    #[error("Invalid delay '{name}': {reason}")]
    InvalidDelay { name: String, reason: String },
    #[error("Could not parse expression '{source_text}' in {context}: {error}")]
    Expression {
        source_text: String,
        context: String,
        error: ParseError,
    },
    #[error("Unknown function '{name}' with {arity} argument(s) in {context}")]
    UnknownFunction {
        name: String,
        arity: usize,
        context: String,
    },
    #[error("Symbol '{symbol}' is declared more than once")]
    DuplicateSymbol { symbol: String },
    #[error("Unknown compartment '{name}' referenced by {context}")]
    UnknownCompartment { name: String, context: String },
    #[error("Unknown output '{name}'")]
    UnknownOutput { name: String },
    #[error("Invalid output '{name}': {reason}")]
    InvalidOutput { name: String, reason: String },
    #[error("Invalid random effect structure: {0}")]
    RandomEffects(String),
    #[error("Model variable '{symbol}' has no column in the mapping")]
    UnmappedVariable { symbol: String },
    #[error("Mapped column '{column}' (for '{symbol}') is not present in the dataset")]
    UnknownColumn { column: String, symbol: String },
    #[error("Column mapping refers to '{symbol}', which the model does not declare")]
    UnknownSymbol { symbol: String },
    #[error("Invalid value '{value}' in column '{column}' at row {row}")]
    InvalidValue {
        column: String,
        row: usize,
        value: String,
    },
    #[error("Invalid observation for {id} at time {time}: {reason}")]
    InvalidObservation { id: String, time: f64, reason: String },
    #[error("Covariate error: {0}")]
    Covariate(#[from] CovariateError),
    #[error("Invalid settings: {0}")]
    Settings(String),
    #[error("CSV error: {0}")]
    Csv(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Failed to initialize logging: {0}")]
    Logger(String),
}

impl From<csv::Error> for PkpdError {
    fn from(error: csv::Error) -> Self {
        PkpdError::Csv(error.to_string())
    }
}

impl From<std::io::Error> for PkpdError {
    fn from(error: std::io::Error) -> Self {
        PkpdError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for PkpdError {
    fn from(error: serde_json::Error) -> Self {
        PkpdError::Serialization(error.to_string())
    }
}

impl From<config::ConfigError> for PkpdError {
    fn from(error: config::ConfigError) -> Self {
        PkpdError::Settings(error.to_string())
    }
}

impl PkpdError {
    /// Short machine-friendly name of the error kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PkpdError::UnresolvedParameter { .. } => "UnresolvedParameterError",
            PkpdError::InvalidDosingSchedule { .. } => "InvalidDosingScheduleError",
            PkpdError::SimulationDiverged { .. } => "SimulationDivergedError",
            PkpdError::CensoringInconsistency { .. } => "CensoringInconsistencyError",
            PkpdError::InvalidDelay { .. } => "InvalidDelayError",
            PkpdError::Expression { .. } | PkpdError::UnknownFunction { .. } => "ExpressionError",
            PkpdError::DuplicateSymbol { .. }
            | PkpdError::UnknownCompartment { .. }
            | PkpdError::UnknownOutput { .. }
            | PkpdError::InvalidOutput { .. }
            | PkpdError::RandomEffects(_) => "ModelError",
            PkpdError::UnmappedVariable { .. }
            | PkpdError::UnknownColumn { .. }
            | PkpdError::UnknownSymbol { .. }
            | PkpdError::InvalidValue { .. }
            | PkpdError::InvalidObservation { .. } => "DataError",
            PkpdError::Covariate(_) => "CovariateError",
            PkpdError::Settings(_) => "SettingsError",
            PkpdError::Csv(_) | PkpdError::Io(_) | PkpdError::Serialization(_) => "IoError",
            PkpdError::Logger(_) => "LoggerError",
        }
    }
}
