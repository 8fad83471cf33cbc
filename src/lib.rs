//! Compartmental PK/PD model compiler and population simulator.
//!
//! Models are declared as immutable [model::ModelDefinition] values, compiled
//! into an index-resolved [model::CompiledModel], and simulated over the event
//! timeline of each [data::Subject] by a [simulator::Simulator] or, for a whole
//! dataset, by a [simulator::PopulationSimulation].
//!
//! ```
//! use pkpdsim::prelude::*;
//!
//! let model = ModelDefinition::new("pk")
//!     .with_fixed_effect("tvKe", 0.1)
//!     .with_fixed_effect("tvV", 10.0)
//!     .with_parameter(ParameterDef::log_normal("Ke", "tvKe"))
//!     .with_parameter(ParameterDef::log_normal("V", "tvV"))
//!     .with_compartment("central")
//!     .with_flow(Flow::linear("central", None, "Ke"))
//!     .with_output(OutputDef::continuous(
//!         "CObs",
//!         "central / V",
//!         ResidualErrorModel::Additive { a: 0.1 },
//!     ))
//!     .compile()
//!     .unwrap();
//!
//! let subject = Subject::builder("1")
//!     .bolus(0.0, 100.0, 0)
//!     .missing_observation(10.0, 0)
//!     .build()
//!     .unwrap();
//!
//! let predictions = Simulator::new(&model)
//!     .predict(&subject, &RandomEffects::zero(&model))
//!     .unwrap();
//! let c = predictions.predictions()[0].prediction();
//! assert!((c - 10.0 * (-1.0_f64).exp()).abs() < 1e-4);
//! ```
pub mod data;
pub mod error;
pub mod logger;
pub mod model;
pub mod settings;
pub mod simulator;

pub use error::PkpdError;

pub mod prelude {
    pub use crate::data::builder::SubjectBuilderExt;
    pub use crate::data::mapping::ColumnMapping;
    pub use crate::data::parser::{read_dataset, read_dataset_from_reader};
    pub use crate::data::{
        Bolus, Covariates, Data, DosingDirective, Event, Infusion, Observation, Occasion, Reset,
        Subject,
    };
    pub use crate::error::PkpdError;
    pub use crate::model::{
        AlgebraicDef, CompiledModel, Covariance, CovariateDef, CovariateEffect, EffectForm,
        ModelDefinition, ParameterDef, ParameterStyle,
    };
    pub use crate::settings::Settings;
    pub use crate::simulator::compartment::{CompartmentDef, Flow};
    pub use crate::simulator::delay::{DelayDef, DelayKind};
    pub use crate::simulator::observation::{OutputDef, OutputKind, ResidualErrorModel};
    pub use crate::simulator::{
        CancellationToken, IndividualStatus, PopulationPredictions, PopulationReport,
        PopulationResult, PopulationSimulation, Prediction, RandomEffects, RecordKind,
        SimulationOptions, Simulator, SolverOptions, SteadyStateOptions, SubjectPredictions,
        Trajectory,
    };
}
