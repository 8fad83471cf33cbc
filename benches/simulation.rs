use std::sync::Arc;

use criterion::black_box;
use criterion::{criterion_group, criterion_main, Criterion};
use pkpdsim::model::presets;
use pkpdsim::prelude::*;

fn example_subject() -> Subject {
    Subject::builder("1")
        .bolus(0.0, 100.0, 0)
        .addl(6, 12.0)
        .observation(3.0, 0.1, 0)
        .observation(6.0, 0.4, 0)
        .observation(12.0, 1.0, 0)
        .observation(24.0, 1.1, 0)
        .observation(72.0, 1.3, 0)
        .build()
        .unwrap()
}

fn delayed_model() -> CompiledModel {
    presets::one_compartment_with_absorption(ResidualErrorModel::Proportional { b: 0.1 })
        .with_fixed_effect("tvMtt", 2.0)
        .with_parameter(ParameterDef::log_normal("Mtt", "tvMtt"))
        .with_delay(DelayDef::dose("absorption", "depot", "Mtt", "2.5", 10))
        .compile()
        .unwrap()
}

fn predict(model: &CompiledModel, subject: &Subject) {
    let simulator = Simulator::with_options(
        model,
        SimulationOptions {
            use_cache: false,
            ..SimulationOptions::default()
        },
    );
    black_box(simulator.predict(subject, &RandomEffects::zero(model)).unwrap());
}

fn population(model: &Arc<CompiledModel>, data: &Data) {
    let result = PopulationSimulation::new(model.clone())
        .seed(1)
        .run(data)
        .unwrap();
    black_box(result);
}

fn criterion_benchmark(c: &mut Criterion) {
    let subject = example_subject();
    let linear = presets::one_compartment(ResidualErrorModel::Additive { a: 0.1 })
        .compile()
        .unwrap();
    let two = presets::two_compartments_with_absorption(ResidualErrorModel::Additive { a: 0.1 })
        .compile()
        .unwrap();
    let delayed = delayed_model();

    c.bench_function("one_compartment", |b| {
        b.iter(|| predict(&linear, &subject))
    });
    c.bench_function("two_compartments_with_absorption", |b| {
        b.iter(|| predict(&two, &subject))
    });
    c.bench_function("gamma_absorption_delay", |b| {
        b.iter(|| predict(&delayed, &subject))
    });

    let data = Data::new(
        (0..100)
            .map(|i| {
                Subject::builder(format!("{}", i))
                    .bolus(0.0, 100.0, 0)
                    .addl(6, 12.0)
                    .missing_observation(3.0, 0)
                    .repeat(24, 3.0)
                    .build()
                    .unwrap()
            })
            .collect(),
    );
    let model = Arc::new(two);
    c.bench_function("population_100", |b| b.iter(|| population(&model, &data)));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
