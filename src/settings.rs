//! Run configuration read from a TOML file with environment overrides.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Environment variables use the `PKPDSIM_` prefix and `__` between nested
//! keys, e.g. `PKPDSIM_SOLVER__RTOL=1e-8`.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use serde::{Deserialize, Serialize};

use crate::data::Data;
use crate::error::PkpdError;
use crate::model::CompiledModel;
use crate::simulator::{
    PopulationSimulation, SimulationOptions, SolverOptions, SteadyStateOptions,
};

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

/// Integrator and steady-state settings
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SolverSettings {
    #[serde(default = "default_rtol")]
    pub rtol: f64,
    #[serde(default = "default_atol")]
    pub atol: f64,
    #[serde(default)]
    pub h0: f64,
    pub h_max: Option<f64>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_ss_tolerance")]
    pub ss_tolerance: f64,
    #[serde(default = "default_ss_max_periods")]
    pub ss_max_periods: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            rtol: default_rtol(),
            atol: default_atol(),
            h0: 0.0,
            h_max: None,
            max_steps: default_max_steps(),
            ss_tolerance: default_ss_tolerance(),
            ss_max_periods: default_ss_max_periods(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_replicates")]
    pub replicates: usize,
    /// Draw random effects; with `false` only residual error is simulated
    #[serde(default = "default_true")]
    pub random_effects: bool,
    /// Spacing of the prediction grid added to every subject, `0` to disable
    #[serde(default)]
    pub idelta: f64,
    /// Extra time simulated after the last event
    #[serde(default)]
    pub tad: f64,
    /// Wall-clock budget of a population run in seconds
    pub budget: Option<f64>,
    #[serde(default)]
    pub progress: bool,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub record_trajectory: bool,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        SimulationSettings {
            seed: default_seed(),
            replicates: default_replicates(),
            random_effects: true,
            idelta: 0.0,
            tad: 0.0,
            budget: None,
            progress: false,
            cache: true,
            record_trajectory: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file, relative to the output folder
    pub file: Option<String>,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        LogSettings {
            level: default_log_level(),
            file: None,
            stdout: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    #[serde(default = "default_output_path")]
    pub path: String,
    /// Predictions CSV file name
    #[serde(default = "default_predictions")]
    pub predictions: String,
    /// Population report JSON file name
    #[serde(default = "default_report")]
    pub report: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            path: default_output_path(),
            predictions: default_predictions(),
            report: default_report(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Read `path` (TOML) and apply `PKPDSIM_` environment overrides
    pub fn read(path: impl AsRef<Path>) -> Result<Settings, PkpdError> {
        let path = path.as_ref();
        let parsed = Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(environment())
            .build()?;
        let settings: Settings = parsed.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text, with environment overrides
    pub fn from_toml(text: &str) -> Result<Settings, PkpdError> {
        let parsed = Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .add_source(environment())
            .build()?;
        let settings: Settings = parsed.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), PkpdError> {
        self.simulation_options().solver.validate()?;
        self.simulation_options().steady_state.validate()?;
        if self.simulation.replicates == 0 {
            return Err(PkpdError::Settings("replicates must be > 0".to_string()));
        }
        if !(self.simulation.idelta >= 0.0 && self.simulation.tad >= 0.0) {
            return Err(PkpdError::Settings(
                "idelta and tad must be >= 0".to_string(),
            ));
        }
        if let Some(budget) = self.simulation.budget {
            if !(budget.is_finite() && budget >= 0.0) {
                return Err(PkpdError::Settings(format!("invalid budget {}", budget)));
            }
        }
        Ok(())
    }

    pub fn simulation_options(&self) -> SimulationOptions {
        SimulationOptions {
            solver: SolverOptions {
                rtol: self.solver.rtol,
                atol: self.solver.atol,
                h0: self.solver.h0,
                h_max: self.solver.h_max,
                max_steps: self.solver.max_steps,
            },
            steady_state: SteadyStateOptions {
                tolerance: self.solver.ss_tolerance,
                max_periods: self.solver.ss_max_periods,
            },
            record_trajectory: self.simulation.record_trajectory,
            use_cache: self.simulation.cache,
        }
    }

    pub fn budget(&self) -> Option<Duration> {
        self.simulation.budget.map(Duration::from_secs_f64)
    }

    /// Population run of `model` configured from the `[simulation]` section
    pub fn population(&self, model: Arc<CompiledModel>) -> PopulationSimulation {
        let simulation = PopulationSimulation::new(model)
            .options(self.simulation_options())
            .seed(self.simulation.seed)
            .replicates(self.simulation.replicates)
            .sample_random_effects(self.simulation.random_effects)
            .progress(self.simulation.progress);
        match self.budget() {
            Some(budget) => simulation.budget(budget),
            None => simulation,
        }
    }

    /// Add the `idelta` prediction grid to `data`
    pub fn expand(&self, data: &Data) -> Data {
        data.expand(self.simulation.idelta, self.simulation.tad)
    }

    /// Output folder joined with `file`
    pub fn output_file(&self, file: &str) -> std::path::PathBuf {
        Path::new(&self.output.path).join(file)
    }

    /// Dump the effective settings as JSON to `path`
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), PkpdError> {
        let serialized = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serialized)?;
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("PKPDSIM")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

// *********************************
// Default values for deserializing
// *********************************
fn default_true() -> bool {
    true
}

fn default_rtol() -> f64 {
    1e-6
}

fn default_atol() -> f64 {
    1e-9
}

fn default_max_steps() -> usize {
    100_000
}

fn default_ss_tolerance() -> f64 {
    1e-6
}

fn default_ss_max_periods() -> usize {
    200
}

fn default_seed() -> u64 {
    347
}

fn default_replicates() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_path() -> String {
    "outputs".to_string()
}

fn default_predictions() -> String {
    "predictions.csv".to_string()
}

fn default_report() -> String {
    "report.json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.solver, SolverSettings::default());
        assert_eq!(settings.simulation.seed, 347);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn sections_are_read() {
        let settings = Settings::from_toml(
            r#"
            [solver]
            rtol = 1e-8
            ss_max_periods = 50

            [simulation]
            seed = 12
            replicates = 100
            budget = 2.5

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(settings.solver.rtol, 1e-8);
        assert_eq!(settings.simulation_options().steady_state.max_periods, 50);
        assert_eq!(settings.simulation.replicates, 100);
        assert_eq!(settings.budget(), Some(Duration::from_millis(2500)));
        assert_eq!(settings.log.level, "debug");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Settings::from_toml("[simulation]\nreplicates = 0").unwrap_err();
        assert!(matches!(err, PkpdError::Settings(_)));
        let err = Settings::from_toml("[solver]\nrtol = -1.0").unwrap_err();
        assert!(matches!(err, PkpdError::Settings(_)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::from_toml("[solver]\nrtoll = 1e-3").is_err());
    }

    #[test]
    fn grid_follows_idelta() {
        use crate::data::builder::SubjectBuilderExt;
        use crate::data::Subject;

        let settings = Settings::from_toml("[simulation]\nidelta = 2.0\ntad = 4.0").unwrap();
        let subject = Subject::builder("1")
            .bolus(0.0, 100.0, 0)
            .observation(4.0, 1.0, 0)
            .build()
            .unwrap();
        let data = settings.expand(&Data::new(vec![subject]));
        let times: Vec<f64> = data.subjects()[0].observations().map(|o| o.time()).collect();
        assert_eq!(times, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn written_settings_read_back_as_json() {
        let path = std::env::temp_dir().join("pkpdsim_settings_test.json");
        let settings = Settings::new();
        settings.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(back, settings);
        std::fs::remove_file(path).ok();
    }
}
