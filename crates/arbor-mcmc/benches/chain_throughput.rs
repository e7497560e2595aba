use std::sync::Arc;

use arbor_mcmc::clock::StepClock;
use arbor_mcmc::{run, ModelSpec, RunConfig};
use criterion::{criterion_group, criterion_main, Criterion};

const MODEL: &str = r#"
state:
  - type: real
    id: rate
    values: [1.0]
    lower: 0.0
  - type: tree
    id: tree
    newick: "((((A:1,B:1):1,C:2):1,(D:1.5,E:1.5):1.5):1,((F:0.5,G:0.5):2,H:2.5):1.5);"
priors:
  - type: exponential
    id: rate.prior
    x: rate
    mean: 1.0
  - type: yule
    id: yule
    tree: tree
    birth_rate: rate
operators:
  - type: scale
    id: rate.scale
    weight: 1.0
    parameter: rate
    scale_factor: 0.5
  - type: up-down
    id: updown
    weight: 1.0
    up: [tree]
    down: [rate]
    scale_factor: 0.75
  - type: narrow-exchange
    id: narrow
    weight: 2.0
    tree: tree
  - type: wide-exchange
    id: wide
    weight: 1.0
    tree: tree
  - type: wilson-balding
    id: wb
    weight: 1.0
    tree: tree
  - type: epoch-flex
    id: flex
    weight: 1.0
    tree: tree
"#;

fn bench_chain(c: &mut Criterion) {
    let spec = ModelSpec::from_yaml_str(MODEL).unwrap();
    let mut config = RunConfig::default();
    config.chain_length = 5000;
    config.output.screen_every = 0;

    c.bench_function("chain_5000", |b| {
        b.iter(|| {
            let model = spec
                .build(Arc::new(StepClock::new(1.0)), &config.tuning)
                .unwrap();
            let _ = run(&config, model).unwrap();
        })
    });
}

criterion_group!(benches, bench_chain);
criterion_main!(benches);
