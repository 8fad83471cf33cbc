use std::sync::Arc;

use approx::assert_relative_eq;
use pkpdsim::prelude::*;
use pkpdsim::simulator::population::individual_seed;

fn weight_model() -> Arc<CompiledModel> {
    let model = ModelDefinition::new("weight")
        .with_fixed_effect("tvCl", 1.0)
        .with_fixed_effect("tvV", 10.0)
        .with_random_effects(&["nCl", "nV"], Covariance::Diagonal(vec![0.09, 0.04]))
        .with_covariate("WT")
        .with_parameter(ParameterDef::formula("Cl", "tvCl * (WT / 70) * exp(nCl)"))
        .with_parameter(ParameterDef::log_normal("V", "tvV").eta("nV"))
        .with_compartment("central")
        .with_flow(Flow::clearance("central", None, "Cl", "V"))
        .with_output(OutputDef::continuous(
            "CObs",
            "central / V",
            ResidualErrorModel::Combined { a: 0.05, b: 0.1 },
        ))
        .compile()
        .unwrap();
    Arc::new(model)
}

fn subject(id: &str, weight: Option<f64>) -> Subject {
    let mut builder = Subject::builder(id)
        .bolus(0.0, 100.0, 0)
        .observation(1.0, 9.0, 0)
        .observation(4.0, 6.5, 0)
        .observation(12.0, 3.1, 0);
    if let Some(weight) = weight {
        builder = builder.covariate("WT", 0.0, weight);
    }
    builder.build().unwrap()
}

fn data() -> Data {
    Data::new(vec![
        subject("a", Some(60.0)),
        subject("b", Some(85.0)),
        subject("c", None),
    ])
}

#[test]
fn failed_individual_does_not_stop_the_run() {
    let result = PopulationSimulation::new(weight_model())
        .seed(7)
        .run(&data())
        .unwrap();
    let report = &result.report;

    assert_eq!(report.individuals.len(), 3);
    assert_eq!(report.completed(), 2);
    assert_eq!(report.failed(), 1);
    match &report.individuals[2].status {
        IndividualStatus::Failed { kind, message } => {
            assert_eq!(kind, "UnresolvedParameterError");
            assert!(message.contains("WT"));
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert!(report.individuals[2].log_likelihood.is_none());

    assert_eq!(result.predictions.len(), 2);
    assert!(result.predictions.get("c", 0).is_none());
    let a = result.predictions.get("a", 0).unwrap();
    assert_eq!(a.predictions().len(), 3);
    assert!(a.predictions().iter().all(|p| p.simulated().is_some()));
}

#[test]
fn individuals_are_seeded_by_position() {
    let simulation = PopulationSimulation::new(weight_model())
        .seed(11)
        .replicates(2);
    let result = simulation.run(&data()).unwrap();

    let seeds: Vec<(usize, u64)> = result
        .report
        .individuals
        .iter()
        .map(|i| (i.replicate, i.seed))
        .collect();
    assert_eq!(seeds.len(), 6);
    assert_eq!(seeds[0], (0, individual_seed(11, 0, 0)));
    assert_eq!(seeds[4], (1, individual_seed(11, 1, 1)));

    let again = simulation.run(&data()).unwrap();
    for (first, second) in result
        .predictions
        .subjects()
        .iter()
        .zip(again.predictions.subjects())
    {
        assert_eq!(first.flat_predictions(), second.flat_predictions());
        let sim = |s: &SubjectPredictions| -> Vec<Option<f64>> {
            s.predictions().iter().map(|p| p.simulated()).collect()
        };
        assert_eq!(sim(first), sim(second));
    }

    let first = result.predictions.get("a", 0).unwrap();
    let second = result.predictions.get("a", 1).unwrap();
    assert_ne!(first.flat_predictions(), second.flat_predictions());
}

#[test]
fn typical_individuals_share_population_predictions() {
    let result = PopulationSimulation::new(weight_model())
        .sample_random_effects(false)
        .run(&data())
        .unwrap();
    assert!(result
        .report
        .eta
        .iter()
        .take(2 * result.report.eta_names.len())
        .all(|eta| *eta == 0.0));
    for subject in result.predictions.subjects() {
        for record in subject.predictions() {
            assert_relative_eq!(
                record.prediction(),
                record.population_prediction().unwrap(),
                max_relative = 1e-12
            );
        }
    }
}

#[test]
fn sampled_effects_are_reported() {
    let result = PopulationSimulation::new(weight_model())
        .seed(3)
        .run(&data())
        .unwrap();
    let report = &result.report;
    assert_eq!(report.eta_names, vec!["nCl".to_string(), "nV".to_string()]);
    assert_eq!(report.eta.dim(), (3, 2));
    assert!(report.eta.row(0).iter().any(|eta| *eta != 0.0));

    // individual predictions move away from the typical ones
    let a = result.predictions.get("a", 0).unwrap();
    let record = &a.predictions()[1];
    assert!((record.prediction() - record.population_prediction().unwrap()).abs() > 0.0);
}

#[test]
fn capped_steady_state_completes_with_warnings() {
    let model = Arc::new(
        pkpdsim::model::presets::one_compartment(ResidualErrorModel::Additive { a: 0.1 })
            .compile()
            .unwrap(),
    );
    let steady = Subject::builder("ss")
        .bolus(0.0, 100.0, 0)
        .steady_state(12.0)
        .missing_observation(6.0, 0)
        .build()
        .unwrap();
    let single = Subject::builder("single")
        .bolus(0.0, 100.0, 0)
        .missing_observation(6.0, 0)
        .build()
        .unwrap();
    let options = SimulationOptions {
        steady_state: SteadyStateOptions {
            tolerance: 1e-14,
            max_periods: 2,
        },
        ..SimulationOptions::default()
    };
    let result = PopulationSimulation::new(model)
        .options(options)
        .sample_random_effects(false)
        .run(&Data::new(vec![steady, single]))
        .unwrap();
    let report = &result.report;
    assert_eq!(report.with_warnings(), 1);
    assert_eq!(report.completed(), 1);
    assert!(matches!(
        report.individuals[0].status,
        IndividualStatus::CompletedWithWarnings { ref warnings } if !warnings.is_empty()
    ));
    assert_eq!(report.individuals[1].status, IndividualStatus::Completed);
}

#[test]
fn cancelled_token_skips_every_individual() {
    let token = CancellationToken::new();
    let simulation = PopulationSimulation::new(weight_model()).cancellation_token(token.clone());
    token.cancel();
    assert!(simulation.token().is_cancelled());

    let result = simulation.run(&data()).unwrap();
    assert_eq!(result.report.cancelled(), 3);
    assert!(result.predictions.is_empty());
    assert!(result.report.eta.iter().all(|eta| eta.is_nan()));
}

#[test]
fn invalid_records_fail_the_whole_run() {
    let model = weight_model();
    let bad = Subject::builder("x")
        .bolus(0.0, 100.0, 3)
        .missing_observation(1.0, 0)
        .build()
        .unwrap();
    let err = PopulationSimulation::new(model)
        .run(&Data::new(vec![bad]))
        .unwrap_err();
    assert!(matches!(err, PkpdError::UnknownCompartment { .. }));
}

#[test]
fn results_are_written_to_disk() {
    let settings = Settings::from_toml(
        r#"
        [simulation]
        seed = 21
        replicates = 2
        "#,
    )
    .unwrap();
    let result = settings.population(weight_model()).run(&data()).unwrap();

    let folder = std::env::temp_dir().join(format!("pkpdsim_population_{}", std::process::id()));
    std::fs::create_dir_all(&folder).unwrap();
    let csv = folder.join(&settings.output.predictions);
    let json = folder.join(&settings.output.report);
    result.predictions.write_csv(&csv).unwrap();
    result.report.write_json(&json).unwrap();

    let text = std::fs::read_to_string(&csv).unwrap();
    let mut lines = text.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("id,replicate,time,outeq"));
    // 2 completed subjects, 2 replicates, 3 records each
    assert_eq!(lines.count(), 12);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
    assert_eq!(report["seed"], 21);
    assert_eq!(report["individuals"].as_array().unwrap().len(), 6);
    assert_eq!(report["individuals"][2]["status"]["status"], "failed");

    std::fs::remove_dir_all(&folder).ok();
}
