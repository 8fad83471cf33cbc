//! Model definitions.
//!
//! A [ModelDefinition] is an immutable value: every `with_*` method returns a
//! new definition with its version incremented, leaving the original intact.
//! [ModelDefinition::compile] resolves every symbol and produces the
//! [CompiledModel] used for simulation.
//!
//! ```
//! use pkpdsim::prelude::*;
//!
//! let base = ModelDefinition::new("pk1")
//!     .with_fixed_effect("tvCl", 1.0)
//!     .with_fixed_effect("tvV", 10.0)
//!     .with_parameter(ParameterDef::log_normal("Cl", "tvCl"))
//!     .with_parameter(ParameterDef::log_normal("V", "tvV"))
//!     .with_compartment("central")
//!     .with_flow(Flow::clearance("central", None, "Cl", "V"))
//!     .with_output(OutputDef::continuous(
//!         "CObs",
//!         "central / V",
//!         ResidualErrorModel::Proportional { b: 0.1 },
//!     ));
//! let edited = base.with_fixed_effect("tvCl", 2.0);
//! assert_eq!(edited.version(), base.version() + 1);
//! assert!(edited.compile().is_ok());
//! ```
pub mod compiled;
pub mod expr;
pub mod parameter;
pub mod presets;

use serde::{Deserialize, Serialize};

pub use compiled::CompiledModel;
pub use parameter::{CovariateEffect, EffectForm, ParameterDef, ParameterForm, ParameterStyle};

use crate::error::PkpdError;
use crate::simulator::compartment::{CompartmentDef, Flow};
use crate::simulator::delay::DelayDef;
use crate::simulator::observation::OutputDef;

/// Population value of a fixed effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedEffect {
    pub name: String,
    pub value: f64,
    /// Excluded from re-estimation by external tools
    pub frozen: bool,
}

/// Covariance of the between-subject random effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Covariance {
    /// One variance per random effect
    Diagonal(Vec<f64>),
    /// Full symmetric matrix, row major
    Block(Vec<Vec<f64>>),
}

impl Default for Covariance {
    fn default() -> Self {
        Covariance::Diagonal(Vec::new())
    }
}

/// Inter-occasion random effect with its variance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccasionEffect {
    pub name: String,
    pub variance: f64,
}

/// A covariate read from subject data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateDef {
    pub name: String,
    /// Carry values forward between records instead of interpolating linearly
    pub carry_forward: bool,
}

/// Intermediate quantity evaluated at every right-hand side call, never integrated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgebraicDef {
    pub name: String,
    pub formula: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    name: String,
    version: u32,
    fixed_effects: Vec<FixedEffect>,
    random_effects: Vec<String>,
    covariance: Covariance,
    occasion_effects: Vec<OccasionEffect>,
    covariates: Vec<CovariateDef>,
    parameters: Vec<ParameterDef>,
    compartments: Vec<CompartmentDef>,
    algebraic: Vec<AlgebraicDef>,
    flows: Vec<Flow>,
    delays: Vec<DelayDef>,
    outputs: Vec<OutputDef>,
}

fn upsert<T>(items: &mut Vec<T>, item: T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        ModelDefinition {
            name: name.into(),
            version: 1,
            fixed_effects: Vec::new(),
            random_effects: Vec::new(),
            covariance: Covariance::default(),
            occasion_effects: Vec::new(),
            covariates: Vec::new(),
            parameters: Vec::new(),
            compartments: Vec::new(),
            algebraic: Vec::new(),
            flows: Vec::new(),
            delays: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn edit(&self, change: impl FnOnce(&mut ModelDefinition)) -> ModelDefinition {
        let mut next = self.clone();
        change(&mut next);
        next.version = self.version + 1;
        next
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fixed_effects(&self) -> &[FixedEffect] {
        &self.fixed_effects
    }

    pub fn random_effects(&self) -> &[String] {
        &self.random_effects
    }

    pub fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    pub fn occasion_effects(&self) -> &[OccasionEffect] {
        &self.occasion_effects
    }

    pub fn covariates(&self) -> &[CovariateDef] {
        &self.covariates
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn compartments(&self) -> &[CompartmentDef] {
        &self.compartments
    }

    pub fn algebraic(&self) -> &[AlgebraicDef] {
        &self.algebraic
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn delays(&self) -> &[DelayDef] {
        &self.delays
    }

    pub fn outputs(&self) -> &[OutputDef] {
        &self.outputs
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.edit(|m| m.name = name)
    }

    /// Add a fixed effect, or replace the value of an existing one
    pub fn with_fixed_effect(&self, name: &str, value: f64) -> Self {
        self.edit(|m| {
            let frozen = m
                .fixed_effects
                .iter()
                .find(|f| f.name == name)
                .is_some_and(|f| f.frozen);
            upsert(
                &mut m.fixed_effects,
                FixedEffect {
                    name: name.to_string(),
                    value,
                    frozen,
                },
                |f| f.name == name,
            )
        })
    }

    /// Add or replace a fixed effect marked as frozen
    pub fn with_frozen_fixed_effect(&self, name: &str, value: f64) -> Self {
        self.edit(|m| {
            upsert(
                &mut m.fixed_effects,
                FixedEffect {
                    name: name.to_string(),
                    value,
                    frozen: true,
                },
                |f| f.name == name,
            )
        })
    }

    /// Declare the between-subject random effects and their covariance
    pub fn with_random_effects(&self, names: &[&str], covariance: Covariance) -> Self {
        self.edit(|m| {
            m.random_effects = names.iter().map(|n| n.to_string()).collect();
            m.covariance = covariance;
        })
    }

    pub fn with_occasion_effect(&self, name: &str, variance: f64) -> Self {
        self.edit(|m| {
            upsert(
                &mut m.occasion_effects,
                OccasionEffect {
                    name: name.to_string(),
                    variance,
                },
                |o| o.name == name,
            )
        })
    }

    pub fn with_covariate(&self, name: &str) -> Self {
        self.with_covariate_def(CovariateDef {
            name: name.to_string(),
            carry_forward: false,
        })
    }

    pub fn with_covariate_def(&self, covariate: CovariateDef) -> Self {
        self.edit(|m| {
            let name = covariate.name.clone();
            upsert(&mut m.covariates, covariate, |c| c.name == name)
        })
    }

    /// Add a parameter, or replace the declaration of the same name in place
    pub fn with_parameter(&self, parameter: ParameterDef) -> Self {
        self.edit(|m| {
            let name = parameter.name().to_string();
            upsert(&mut m.parameters, parameter, |p| p.name() == name)
        })
    }

    pub fn with_compartment(&self, name: &str) -> Self {
        self.with_compartment_def(CompartmentDef::new(name))
    }

    pub fn with_compartment_def(&self, compartment: CompartmentDef) -> Self {
        self.edit(|m| {
            let name = compartment.name.clone();
            upsert(&mut m.compartments, compartment, |c| c.name == name)
        })
    }

    /// Move the named compartments to the front, in the given order
    pub fn with_compartment_order(&self, order: &[&str]) -> Self {
        self.edit(|m| {
            m.compartments.sort_by_key(|c| {
                order
                    .iter()
                    .position(|name| *name == c.name)
                    .unwrap_or(order.len())
            })
        })
    }

    pub fn with_algebraic(&self, name: &str, formula: &str) -> Self {
        self.edit(|m| {
            upsert(
                &mut m.algebraic,
                AlgebraicDef {
                    name: name.to_string(),
                    formula: formula.to_string(),
                },
                |a| a.name == name,
            )
        })
    }

    pub fn with_flow(&self, flow: Flow) -> Self {
        self.edit(|m| m.flows.push(flow))
    }

    /// Replace all flows
    pub fn with_flows(&self, flows: Vec<Flow>) -> Self {
        self.edit(|m| m.flows = flows)
    }

    pub fn with_delay(&self, delay: DelayDef) -> Self {
        self.edit(|m| {
            let name = delay.name.clone();
            upsert(&mut m.delays, delay, |d| d.name == name)
        })
    }

    pub fn with_output(&self, output: OutputDef) -> Self {
        self.edit(|m| {
            let name = output.name.clone();
            upsert(&mut m.outputs, output, |o| o.name == name)
        })
    }

    /// Resolve all symbols and validate the definition
    pub fn compile(&self) -> Result<CompiledModel, PkpdError> {
        CompiledModel::compile(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::observation::ResidualErrorModel;

    #[test]
    fn edits_produce_new_versions() {
        let v1 = ModelDefinition::new("m").with_fixed_effect("tvV", 10.0);
        let v2 = v1.with_fixed_effect("tvV", 12.0);
        assert_eq!(v2.version(), v1.version() + 1);
        assert_eq!(v1.fixed_effects()[0].value, 10.0);
        assert_eq!(v2.fixed_effects()[0].value, 12.0);
        assert_eq!(v2.fixed_effects().len(), 1);
    }

    #[test]
    fn replacing_a_parameter_keeps_its_position() {
        let m = ModelDefinition::new("m")
            .with_parameter(ParameterDef::formula("Cl", "1"))
            .with_parameter(ParameterDef::formula("V", "10"))
            .with_parameter(ParameterDef::formula("Cl", "2"));
        let names: Vec<&str> = m.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["Cl", "V"]);
        assert_eq!(m.parameters()[0].form(), &ParameterForm::Formula("2".to_string()));
    }

    #[test]
    fn frozen_flag_survives_value_edit() {
        let m = ModelDefinition::new("m")
            .with_frozen_fixed_effect("tvKa", 1.2)
            .with_fixed_effect("tvKa", 1.5);
        assert!(m.fixed_effects()[0].frozen);
    }

    #[test]
    fn definitions_serialize() {
        let m = ModelDefinition::new("m")
            .with_compartment("central")
            .with_output(OutputDef::continuous(
                "C",
                "central",
                ResidualErrorModel::Additive { a: 1.0 },
            ));
        let json = serde_json::to_string(&m).unwrap();
        let back: ModelDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
