use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use tracing::debug;

use crate::data::mapping::{ColumnMapping, ResolvedMapping};
use crate::data::schedule::{build_schedule, DosingDirective, ScheduleEntry};
use crate::data::*;
use crate::error::PkpdError;
use crate::model::compiled::CompiledModel;

/// Read a CSV dataset through an explicit [ColumnMapping]
///
/// The mapping is checked against the header row and the model before any
/// record is read, and the resulting [Data] goes through
/// [CompiledModel::validate_data], so every data error surfaces here rather
/// than during simulation.
///
/// # Format details
///
/// - Header names are matched case-insensitively, lines starting with `#` are skipped
/// - `.`, `NA` and empty cells are missing values
/// - Subjects keep the order of their first record
/// - A change in the occasion column starts a new occasion
/// - Within a row, observations come before doses, and the reset comes last
/// - Observation values are ignored when the MDV column is non-zero
///
/// ```rust,no_run
/// use pkpdsim::prelude::*;
/// use pkpdsim::data::parser::read_dataset;
/// use pkpdsim::model::presets::one_compartment;
///
/// let model = one_compartment(ResidualErrorModel::Proportional { b: 0.1 })
///     .compile()
///     .unwrap();
/// let mapping = ColumnMapping::new("ID", "TIME")
///     .dose("central", "AMT")
///     .observation("CObs", "DV");
/// let data = read_dataset("data.csv", &mapping, &model).unwrap();
/// println!("{} subjects", data.len());
/// ```
pub fn read_dataset(
    path: impl AsRef<Path>,
    mapping: &ColumnMapping,
    model: &CompiledModel,
) -> Result<Data, PkpdError> {
    let file = std::fs::File::open(path.as_ref())?;
    read_dataset_from_reader(file, mapping, model)
}

/// Same as [read_dataset], from any reader
pub fn read_dataset_from_reader<R: Read>(
    reader: R,
    mapping: &ColumnMapping,
    model: &CompiledModel,
) -> Result<Data, PkpdError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let columns = mapping.resolve(&headers, model)?;

    let mut subjects: Vec<PendingSubject> = Vec::new();
    for (position, record) in reader.records().enumerate() {
        let record = record?;
        let row = Row {
            record: &record,
            headers: &headers,
            line: position + 1,
        };
        let id = row.text(columns.id).ok_or_else(|| row.invalid(columns.id))?;
        let index = match subjects.iter().position(|s| s.id == id) {
            Some(index) => index,
            None => {
                subjects.push(PendingSubject::new(id));
                subjects.len() - 1
            }
        };
        subjects[index].push_row(&row, &columns)?;
    }

    let subjects = subjects
        .into_iter()
        .map(PendingSubject::build)
        .collect::<Result<Vec<_>, _>>()?;
    let data = Data::new(subjects);
    model.validate_data(&data)?;
    debug!(
        subjects = data.len(),
        events = data.iter().map(|s| s.events().count()).sum::<usize>(),
        "read dataset"
    );
    Ok(data)
}

fn is_missing(cell: &str) -> bool {
    cell.is_empty() || cell == "." || cell.eq_ignore_ascii_case("na")
}

struct Row<'a> {
    record: &'a StringRecord,
    headers: &'a [String],
    /// One-based data row number
    line: usize,
}

impl Row<'_> {
    fn invalid(&self, column: usize) -> PkpdError {
        PkpdError::InvalidValue {
            column: self.headers.get(column).cloned().unwrap_or_default(),
            row: self.line,
            value: self.record.get(column).unwrap_or_default().to_string(),
        }
    }

    fn text(&self, column: usize) -> Option<String> {
        self.record
            .get(column)
            .filter(|cell| !is_missing(cell))
            .map(str::to_string)
    }

    fn number(&self, column: usize) -> Result<Option<f64>, PkpdError> {
        match self.record.get(column) {
            Some(cell) if !is_missing(cell) => cell
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or_else(|| self.invalid(column)),
            _ => Ok(None),
        }
    }

    fn optional(&self, column: Option<usize>) -> Result<Option<f64>, PkpdError> {
        match column {
            Some(column) => self.number(column),
            None => Ok(None),
        }
    }

    fn flag(&self, column: Option<usize>) -> Result<bool, PkpdError> {
        Ok(self.optional(column)?.is_some_and(|v| v != 0.0))
    }

    fn count(&self, column: Option<usize>) -> Result<usize, PkpdError> {
        match (column, self.optional(column)?) {
            (Some(column), Some(v)) => {
                if v < 0.0 || v.fract() != 0.0 {
                    Err(self.invalid(column))
                } else {
                    Ok(v as usize)
                }
            }
            _ => Ok(0),
        }
    }
}

struct PendingOccasion {
    label: Option<String>,
    entries: Vec<ScheduleEntry>,
    covariates: Covariates,
}

struct PendingSubject {
    id: String,
    occasions: Vec<PendingOccasion>,
}

impl PendingSubject {
    fn new(id: String) -> Self {
        PendingSubject {
            id,
            occasions: Vec::new(),
        }
    }

    fn push_row(&mut self, row: &Row, columns: &ResolvedMapping) -> Result<(), PkpdError> {
        let time = row
            .number(columns.time)?
            .ok_or_else(|| row.invalid(columns.time))?;
        let label = columns.occasion.and_then(|c| row.text(c));
        let starts_new = match self.occasions.last() {
            None => true,
            Some(current) => columns.occasion.is_some() && label.is_some() && current.label != label,
        };
        if starts_new {
            self.occasions.push(PendingOccasion {
                label,
                entries: Vec::new(),
                covariates: Covariates::new(),
            });
        }
        let index = self.occasions.len() - 1;
        let Some(occasion) = self.occasions.last_mut() else {
            return Ok(());
        };

        let mdv = row.flag(columns.mdv)?;
        for observation in &columns.observations {
            let value = row.number(observation.value)?;
            let bql = row.flag(observation.bql)?;
            if mdv || (value.is_none() && !bql) {
                continue;
            }
            let lloq = row.optional(observation.lloq)?;
            let mut record = Observation::new(time, value.or(lloq), observation.outeq);
            if bql {
                record.set_censoring(true, lloq);
            }
            let mut event = Event::Observation(record);
            event.set_occasion(index);
            occasion.entries.push(ScheduleEntry::Event(event));
        }

        for dose in &columns.doses {
            let amount = match row.number(dose.amount)? {
                Some(amount) if amount != 0.0 => amount,
                _ => continue,
            };
            let rate = row.optional(dose.rate)?.filter(|r| *r > 0.0);
            let duration = row.optional(dose.duration)?.filter(|d| *d > 0.0);
            let mut directive = match (rate, duration) {
                (Some(rate), _) => DosingDirective::infusion_rate(time, amount, dose.input, rate),
                (None, Some(duration)) => DosingDirective::infusion(time, amount, dose.input, duration),
                (None, None) => DosingDirective::bolus(time, amount, dose.input),
            };
            let addl = row.count(columns.addl)?;
            let ii = row.optional(columns.ii)?;
            if addl > 0 {
                directive = directive.addl(addl, ii.unwrap_or(0.0));
            }
            if row.flag(columns.ss)? {
                directive = directive.steady_state(ii.unwrap_or(0.0));
            }
            occasion
                .entries
                .push(ScheduleEntry::Dose(directive.occasion(index)));
        }

        if let Some(reset) = &columns.reset {
            if row.flag(Some(reset.flag))? {
                let value = row.optional(reset.value)?.unwrap_or(0.0);
                let mut event = Event::Reset(Reset::new(time, reset.compartments.clone(), value));
                event.set_occasion(index);
                occasion.entries.push(ScheduleEntry::Event(event));
            }
        }

        for covariate in &columns.covariates {
            let Some(value) = row.number(covariate.column)? else {
                continue;
            };
            let existing = occasion
                .covariates
                .get_covariate(&covariate.name)
                .and_then(|c| c.observations().iter().find(|o| o.time() == time))
                .map(|o| o.value());
            match existing {
                Some(previous) if previous == value => {}
                _ => {
                    occasion
                        .covariates
                        .add_observation(&covariate.name, time, value)?;
                    occasion
                        .covariates
                        .set_covariate_fixed(&covariate.name, covariate.carry_forward);
                }
            }
        }
        Ok(())
    }

    fn build(self) -> Result<Subject, PkpdError> {
        let mut occasions = Vec::with_capacity(self.occasions.len());
        for (index, pending) in self.occasions.into_iter().enumerate() {
            let mut occasion = Occasion::new(index);
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
    use crate::model::presets::one_compartment;
    use crate::simulator::observation::{OutputDef, ResidualErrorModel};

    fn model() -> CompiledModel {
        one_compartment(ResidualErrorModel::Additive { a: 0.1 })
            .with_output(
                OutputDef::continuous("CObs", "central / V", ResidualErrorModel::Additive { a: 0.1 })
                    .with_bql(0.05),
            )
            .with_covariate("WT")
            .compile()
            .unwrap()
    }

    fn mapping() -> ColumnMapping {
        ColumnMapping::new("id", "time")
            .dose_with_rate("central", "amt", "rate")
            .censored_observation("CObs", "dv", "blq", None)
            .covariate("WT", "wt")
            .addl("addl")
            .ii("ii")
            .mdv("mdv")
            .occasion("occ")
    }

    const CSV: &str = "\
ID,TIME,AMT,RATE,DV,BLQ,WT,ADDL,II,MDV,OCC
# comment line
2,0,100,.,.,0,70,2,12,1,1
2,1,.,.,3.2,0,70,.,.,0,1
2,2,.,.,.,1,.,.,.,0,1
1,0,50,25,.,0,80,.,.,1,1
1,4,.,.,1.5,0,82,.,.,0,1
1,48,100,.,.,0,82,.,.,1,2
1,49,.,.,2.0,0,82,.,.,0,2
";

    #[test]
    fn reads_subjects_in_order_of_appearance() {
        let data = read_dataset_from_reader(CSV.as_bytes(), &mapping(), &model()).unwrap();
        let ids: Vec<&str> = data.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn expands_addl_and_censoring() {
        let data = read_dataset_from_reader(CSV.as_bytes(), &mapping(), &model()).unwrap();
        let subject = data.get_subject("2").unwrap();
        let doses: Vec<f64> = subject
            .events()
            .filter(|e| e.is_dose())
            .map(|e| e.time())
            .collect();
        assert_eq!(doses, vec![0.0, 12.0, 24.0]);
        let censored: Vec<&Observation> = subject.observations().filter(|o| o.censored()).collect();
        assert_eq!(censored.len(), 1);
        assert_eq!(censored[0].time(), 2.0);
    }

    #[test]
    fn occasion_column_splits_occasions() {
        let data = read_dataset_from_reader(CSV.as_bytes(), &mapping(), &model()).unwrap();
        let subject = data.get_subject("1").unwrap();
        assert_eq!(subject.occasions().len(), 2);
        assert!(matches!(subject.occasions()[0].events()[0], Event::Infusion(_)));
        assert_eq!(
            subject.occasions()[0].covariates().value("WT", 2.0),
            Some(81.0)
        );
    }

    #[test]
    fn malformed_number_is_reported_with_row() {
        let csv = "ID,TIME,AMT,RATE,DV,BLQ,WT,ADDL,II,MDV,OCC\n1,abc,.,.,.,0,70,.,.,0,1\n";
        let err = read_dataset_from_reader(csv.as_bytes(), &mapping(), &model()).unwrap_err();
        assert!(matches!(err, PkpdError::InvalidValue { row: 1, .. }));
    }
}
