//! Explicit binding of dataset columns to model symbols.
//!
//! Nothing is inferred from column names: every dose, observation and
//! covariate column is listed against the compartment, output or covariate it
//! feeds. [ColumnMapping::resolve] checks the table against the dataset
//! headers and the compiled model before a single row is read.
//!
//! ```
//! use pkpdsim::data::mapping::ColumnMapping;
//!
//! let mapping = ColumnMapping::new("ID", "TIME")
//!     .dose("central", "AMT")
//!     .observation("CObs", "DV")
//!     .covariate("WT", "WEIGHT")
//!     .addl("ADDL")
//!     .ii("II");
//! assert_eq!(mapping.covariates().len(), 1);
//! ```
use serde::{Deserialize, Serialize};

use crate::error::PkpdError;
use crate::model::compiled::{CompiledModel, OutputType};

/// Dose columns feeding one compartment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseColumns {
    pub compartment: String,
    pub amount: String,
    /// Zero-order rate; a positive rate makes the dose an infusion
    pub rate: Option<String>,
    /// Infusion duration, used when no positive rate is given
    pub duration: Option<String>,
}

/// Observation columns of one output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationColumns {
    pub output: String,
    pub value: String,
    /// Non-zero marks a record below the limit of quantification
    pub bql: Option<String>,
    /// Per-record LLOQ, overriding the output's default
    pub lloq: Option<String>,
}

/// Columns of the compartment reset directive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetColumns {
    /// Non-zero triggers the reset
    pub flag: String,
    pub compartments: Vec<String>,
    /// Value to reset to; zero when unmapped
    pub value: Option<String>,
}

/// Table from model symbols to dataset columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    id: String,
    time: String,
    doses: Vec<DoseColumns>,
    observations: Vec<ObservationColumns>,
    covariates: Vec<(String, String)>,
    addl: Option<String>,
    ii: Option<String>,
    ss: Option<String>,
    mdv: Option<String>,
    occasion: Option<String>,
    reset: Option<ResetColumns>,
}

impl ColumnMapping {
    pub fn new(id: &str, time: &str) -> Self {
        ColumnMapping {
            id: id.to_string(),
            time: time.to_string(),
            doses: Vec::new(),
            observations: Vec::new(),
            covariates: Vec::new(),
            addl: None,
            ii: None,
            ss: None,
            mdv: None,
            occasion: None,
            reset: None,
        }
    }

    pub fn dose(self, compartment: &str, amount: &str) -> Self {
        self.dose_columns(DoseColumns {
            compartment: compartment.to_string(),
            amount: amount.to_string(),
            rate: None,
            duration: None,
        })
    }

    pub fn dose_with_rate(self, compartment: &str, amount: &str, rate: &str) -> Self {
        self.dose_columns(DoseColumns {
            compartment: compartment.to_string(),
            amount: amount.to_string(),
            rate: Some(rate.to_string()),
            duration: None,
        })
    }

    pub fn dose_with_duration(self, compartment: &str, amount: &str, duration: &str) -> Self {
        self.dose_columns(DoseColumns {
            compartment: compartment.to_string(),
            amount: amount.to_string(),
            rate: None,
            duration: Some(duration.to_string()),
        })
    }

    pub fn dose_columns(mut self, columns: DoseColumns) -> Self {
        self.doses.push(columns);
        self
    }

    pub fn observation(self, output: &str, value: &str) -> Self {
        self.observation_columns(ObservationColumns {
            output: output.to_string(),
            value: value.to_string(),
            bql: None,
            lloq: None,
        })
    }

    /// Observation with a BQL flag column and an optional per-record LLOQ column
    pub fn censored_observation(self, output: &str, value: &str, bql: &str, lloq: Option<&str>) -> Self {
        self.observation_columns(ObservationColumns {
            output: output.to_string(),
            value: value.to_string(),
            bql: Some(bql.to_string()),
            lloq: lloq.map(str::to_string),
        })
    }

    pub fn observation_columns(mut self, columns: ObservationColumns) -> Self {
        self.observations.push(columns);
        self
    }

    pub fn covariate(mut self, symbol: &str, column: &str) -> Self {
        self.covariates.push((symbol.to_string(), column.to_string()));
        self
    }

    pub fn addl(mut self, column: &str) -> Self {
        self.addl = Some(column.to_string());
        self
    }

    pub fn ii(mut self, column: &str) -> Self {
        self.ii = Some(column.to_string());
        self
    }

    pub fn ss(mut self, column: &str) -> Self {
        self.ss = Some(column.to_string());
        self
    }

    pub fn mdv(mut self, column: &str) -> Self {
        self.mdv = Some(column.to_string());
        self
    }

    pub fn occasion(mut self, column: &str) -> Self {
        self.occasion = Some(column.to_string());
        self
    }

    pub fn reset(mut self, flag: &str, compartments: &[&str], value: Option<&str>) -> Self {
        self.reset = Some(ResetColumns {
            flag: flag.to_string(),
            compartments: compartments.iter().map(|c| c.to_string()).collect(),
            value: value.map(str::to_string),
        });
        self
    }

    pub fn doses(&self) -> &[DoseColumns] {
        &self.doses
    }

    pub fn observations(&self) -> &[ObservationColumns] {
        &self.observations
    }

    pub fn covariates(&self) -> &[(String, String)] {
        &self.covariates
    }

    /// Check the mapping against `headers` and `model`, returning column
    /// positions and model indices. Header matching ignores case.
    pub fn resolve(&self, headers: &[String], model: &CompiledModel) -> Result<ResolvedMapping, PkpdError> {
        let headers: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let column = |name: &str, symbol: &str| -> Result<usize, PkpdError> {
            let wanted = name.trim().to_lowercase();
            headers
                .iter()
                .position(|h| *h == wanted)
                .ok_or_else(|| PkpdError::UnknownColumn {
                    column: name.to_string(),
                    symbol: symbol.to_string(),
                })
        };
        let optional = |name: &Option<String>, symbol: &str| -> Result<Option<usize>, PkpdError> {
            name.as_deref().map(|n| column(n, symbol)).transpose()
        };
        let compartment = |symbol: &str| -> Result<usize, PkpdError> {
            model
                .compartment_index(symbol)
                .ok_or_else(|| PkpdError::UnknownSymbol {
                    symbol: symbol.to_string(),
                })
        };

        let mut doses = Vec::with_capacity(self.doses.len());
        for dose in &self.doses {
            let symbol = &dose.compartment;
            doses.push(ResolvedDose {
                input: compartment(symbol)?,
                amount: column(&dose.amount, symbol)?,
                rate: optional(&dose.rate, symbol)?,
                duration: optional(&dose.duration, symbol)?,
            });
        }

        let mut observations = Vec::with_capacity(self.observations.len());
        for observation in &self.observations {
            let symbol = &observation.output;
            let outeq = model
                .output_index(symbol)
                .ok_or_else(|| PkpdError::UnknownSymbol {
                    symbol: symbol.clone(),
                })?;
            let censors = matches!(
                model.output_type(outeq),
                Some(OutputType::Continuous { bql: true, .. })
            );
            if observation.bql.is_some() && !censors {
                return Err(PkpdError::CensoringInconsistency {
                    output: symbol.clone(),
                    reason: "a BQL column is mapped but the output does not censor".to_string(),
                });
            }
            observations.push(ResolvedObservation {
                outeq,
                value: column(&observation.value, symbol)?,
                bql: optional(&observation.bql, symbol)?,
                lloq: optional(&observation.lloq, symbol)?,
            });
        }

        for (symbol, _) in &self.covariates {
            if !model.covariate_names().contains(symbol) {
                return Err(PkpdError::UnknownSymbol {
                    symbol: symbol.clone(),
                });
            }
        }
        let mut covariates = Vec::with_capacity(model.covariate_names().len());
        for (index, name) in model.covariate_names().iter().enumerate() {
            let (_, col) = self
                .covariates
                .iter()
                .find(|(symbol, _)| symbol == name)
                .ok_or_else(|| PkpdError::UnmappedVariable {
                    symbol: name.clone(),
                })?;
            covariates.push(ResolvedCovariate {
                name: name.clone(),
                column: column(col, name)?,
                carry_forward: model.carry_forward[index],
            });
        }

        if (self.addl.is_some() || self.ss.is_some()) && self.ii.is_none() {
            return Err(PkpdError::UnmappedVariable {
                symbol: "ii".to_string(),
            });
        }

        let reset = match &self.reset {
            Some(reset) => Some(ResolvedReset {
                flag: column(&reset.flag, "reset")?,
                compartments: reset
                    .compartments
                    .iter()
                    .map(|c| compartment(c))
                    .collect::<Result<Vec<_>, _>>()?,
                value: optional(&reset.value, "reset")?,
            }),
            None => None,
        };

        Ok(ResolvedMapping {
            id: column(&self.id, "id")?,
            time: column(&self.time, "time")?,
            doses,
            observations,
            covariates,
            addl: optional(&self.addl, "addl")?,
            ii: optional(&self.ii, "ii")?,
            ss: optional(&self.ss, "ss")?,
            mdv: optional(&self.mdv, "mdv")?,
            occasion: optional(&self.occasion, "occasion")?,
            reset,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDose {
    pub input: usize,
    pub amount: usize,
    pub rate: Option<usize>,
    pub duration: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObservation {
    pub outeq: usize,
    pub value: usize,
    pub bql: Option<usize>,
    pub lloq: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCovariate {
    pub name: String,
    pub column: usize,
    pub carry_forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReset {
    pub flag: usize,
    pub compartments: Vec<usize>,
    pub value: Option<usize>,
}

/// A [ColumnMapping] checked against a dataset: column positions and model
/// indices
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMapping {
    pub id: usize,
    pub time: usize,
    pub doses: Vec<ResolvedDose>,
    pub observations: Vec<ResolvedObservation>,
    pub covariates: Vec<ResolvedCovariate>,
    pub addl: Option<usize>,
    pub ii: Option<usize>,
    pub ss: Option<usize>,
    pub mdv: Option<usize>,
    pub occasion: Option<usize>,
    pub reset: Option<ResolvedReset>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::presets::one_compartment;
    use crate::simulator::observation::ResidualErrorModel;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn model() -> CompiledModel {
        one_compartment(ResidualErrorModel::Additive { a: 0.1 })
            .with_covariate("WT")
            .compile()
            .unwrap()
    }

    #[test]
    fn resolves_case_insensitively() {
        let mapping = ColumnMapping::new("ID", "Time")
            .dose("central", "amt")
            .observation("CObs", "DV")
            .covariate("WT", "wt");
        let resolved = mapping
            .resolve(&headers(&["id", "TIME", "AMT", "dv", "WT"]), &model())
            .unwrap();
        assert_eq!(resolved.time, 1);
        assert_eq!(resolved.doses[0].amount, 2);
        assert_eq!(resolved.covariates[0].column, 4);
    }

    #[test]
    fn unmapped_covariate_fails() {
        let mapping = ColumnMapping::new("ID", "TIME").observation("CObs", "DV");
        let err = mapping
            .resolve(&headers(&["ID", "TIME", "DV"]), &model())
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnmappedVariable { symbol } if symbol == "WT"));
    }

    #[test]
    fn missing_column_fails() {
        let mapping = ColumnMapping::new("ID", "TIME")
            .observation("CObs", "CONC")
            .covariate("WT", "WT");
        let err = mapping
            .resolve(&headers(&["ID", "TIME", "DV", "WT"]), &model())
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnknownColumn { column, .. } if column == "CONC"));
    }

    #[test]
    fn unknown_symbol_fails() {
        let mapping = ColumnMapping::new("ID", "TIME")
            .dose("gut", "AMT")
            .covariate("WT", "WT");
        let err = mapping
            .resolve(&headers(&["ID", "TIME", "AMT", "WT"]), &model())
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnknownSymbol { .. }));
    }

    #[test]
    fn bql_column_requires_censoring_output() {
        let mapping = ColumnMapping::new("ID", "TIME")
            .censored_observation("CObs", "DV", "BLQ", None)
            .covariate("WT", "WT");
        let err = mapping
            .resolve(&headers(&["ID", "TIME", "DV", "BLQ", "WT"]), &model())
            .unwrap_err();
        assert!(matches!(err, PkpdError::CensoringInconsistency { .. }));
    }

    #[test]
    fn addl_requires_interval() {
        let mapping = ColumnMapping::new("ID", "TIME")
            .dose("central", "AMT")
            .addl("ADDL")
            .covariate("WT", "WT");
        let err = mapping
            .resolve(&headers(&["ID", "TIME", "AMT", "ADDL", "WT"]), &model())
            .unwrap_err();
        assert!(matches!(err, PkpdError::UnmappedVariable { symbol } if symbol == "ii"));
    }
}
