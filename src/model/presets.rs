//! Ready-made structural models.
//!
//! Every preset declares log-normal parameters with between-subject variances
//! of 0.09 (about 30% CV) and a single continuous output `CObs` on the central
//! compartment. Doses go to compartment 0, which is `depot` for the oral
//! presets and `central` otherwise.
use crate::model::{Covariance, ModelDefinition, ParameterDef};
use crate::simulator::compartment::Flow;
use crate::simulator::observation::{OutputDef, ResidualErrorModel};

fn concentration(error: ResidualErrorModel) -> OutputDef {
    OutputDef::continuous("CObs", "central / V", error)
}

/// One compartment, linear clearance
///
/// Parameters `Cl` (tvCl = 1) and `V` (tvV = 10).
pub fn one_compartment(error: ResidualErrorModel) -> ModelDefinition {
    ModelDefinition::new("one_compartment")
        .with_fixed_effect("tvCl", 1.0)
        .with_fixed_effect("tvV", 10.0)
        .with_random_effects(&["nCl", "nV"], Covariance::Diagonal(vec![0.09, 0.09]))
        .with_parameter(ParameterDef::log_normal("Cl", "tvCl").eta("nCl"))
        .with_parameter(ParameterDef::log_normal("V", "tvV").eta("nV"))
        .with_compartment("central")
        .with_flow(Flow::clearance("central", None, "Cl", "V"))
        .with_output(concentration(error))
}

/// One compartment with first-order absorption from `depot` (tvKa = 1)
pub fn one_compartment_with_absorption(error: ResidualErrorModel) -> ModelDefinition {
    ModelDefinition::new("one_compartment_with_absorption")
        .with_fixed_effect("tvKa", 1.0)
        .with_fixed_effect("tvCl", 1.0)
        .with_fixed_effect("tvV", 10.0)
        .with_random_effects(
            &["nKa", "nCl", "nV"],
            Covariance::Diagonal(vec![0.09, 0.09, 0.09]),
        )
        .with_parameter(ParameterDef::log_normal("Ka", "tvKa").eta("nKa"))
        .with_parameter(ParameterDef::log_normal("Cl", "tvCl").eta("nCl"))
        .with_parameter(ParameterDef::log_normal("V", "tvV").eta("nV"))
        .with_compartment("depot")
        .with_compartment("central")
        .with_flow(Flow::linear("depot", Some("central"), "Ka"))
        .with_flow(Flow::clearance("central", None, "Cl", "V"))
        .with_output(concentration(error))
}

/// Two compartments with inter-compartmental clearance `Q` and peripheral
/// volume `V2`
pub fn two_compartments(error: ResidualErrorModel) -> ModelDefinition {
    ModelDefinition::new("two_compartments")
        .with_fixed_effect("tvCl", 1.0)
        .with_fixed_effect("tvV", 10.0)
        .with_fixed_effect("tvQ", 2.0)
        .with_fixed_effect("tvV2", 20.0)
        .with_random_effects(&["nCl", "nV"], Covariance::Diagonal(vec![0.09, 0.09]))
        .with_parameter(ParameterDef::log_normal("Cl", "tvCl").eta("nCl"))
        .with_parameter(ParameterDef::log_normal("V", "tvV").eta("nV"))
        .with_parameter(ParameterDef::log_normal("Q", "tvQ"))
        .with_parameter(ParameterDef::log_normal("V2", "tvV2"))
        .with_compartment("central")
        .with_compartment("peripheral")
        .with_flow(Flow::clearance("central", None, "Cl", "V"))
        .with_flow(Flow::clearance("central", Some("peripheral"), "Q", "V"))
        .with_flow(Flow::clearance("peripheral", Some("central"), "Q", "V2"))
        .with_output(concentration(error))
}

/// Two compartments with first-order absorption from `depot`
pub fn two_compartments_with_absorption(error: ResidualErrorModel) -> ModelDefinition {
    two_compartments(error)
        .with_name("two_compartments_with_absorption")
        .with_fixed_effect("tvKa", 1.0)
        .with_parameter(ParameterDef::log_normal("Ka", "tvKa"))
        .with_compartment("depot")
        .with_flows(vec![
            Flow::linear("depot", Some("central"), "Ka"),
            Flow::clearance("central", None, "Cl", "V"),
            Flow::clearance("central", Some("peripheral"), "Q", "V"),
            Flow::clearance("peripheral", Some("central"), "Q", "V2"),
        ])
        .with_compartment_order(&["depot", "central", "peripheral"])
}

/// Add a `urine` compartment collecting the eliminated amount, observed as
/// the cumulative excretion `Ae`.
///
/// Every flow of `definition` leaving the system becomes a flow into `urine`.
pub fn with_urine(definition: &ModelDefinition, error: ResidualErrorModel) -> ModelDefinition {
    let flows = definition
        .flows()
        .iter()
        .cloned()
        .map(|flow| match flow {
            Flow::Linear { from, to: None, rate } => Flow::Linear {
                from,
                to: Some("urine".to_string()),
                rate,
            },
            Flow::Clearance {
                from,
                to: None,
                clearance,
                volume,
            } => Flow::Clearance {
                from,
                to: Some("urine".to_string()),
                clearance,
                volume,
            },
            Flow::MichaelisMenten {
                from,
                to: None,
                vmax,
                km,
                volume,
            } => Flow::MichaelisMenten {
                from,
                to: Some("urine".to_string()),
                vmax,
                km,
                volume,
            },
            other => other,
        })
        .collect();
    definition
        .with_compartment("urine")
        .with_flows(flows)
        .with_output(OutputDef::continuous("Ae", "urine", error))
}
