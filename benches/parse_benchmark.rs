use criterion::{black_box, criterion_group, criterion_main, Criterion};
use director::agency::NodeAllocator;
use director::config::{parse, tokenize, SharedConfig};

/// A deployment sized configuration: the reserved sections, forty controllers
/// and forty agents spread over the agent categories.
fn sample_config() -> String {
    let mut raw = String::from(
        "[director]\npoll_time = 0.5\nmsg_host = 127.0.0.1\n\n[broker]\ncommand = morbidsvr\n\n[agency]\n\n[webadmin]\n\n",
    );
    for i in 0..40 {
        raw.push_str(&format!(
            "[proc{i}]\ncontroller = director.controllers.commandline\ncommand = run-{i} --flag # trailing\n\n"
        ));
    }
    let cats = ["swipe", "printer", "display", "sale"];
    for i in 0..40 {
        raw.push_str(&format!(
            "[agent{i}]\ncat = {}\nagent = agency.testing.fake\n\n",
            cats[i % cats.len()]
        ));
    }
    raw
}

/// Benchmark tokenizing the raw text into sections
fn bench_tokenize(c: &mut Criterion) {
    let raw = sample_config();
    c.bench_function("tokenize", |b| {
        b.iter(|| tokenize(black_box(&raw)).unwrap());
    });
}

/// Benchmark full record recovery
fn bench_parse(c: &mut Criterion) {
    let raw = sample_config();
    c.bench_function("parse_records", |b| {
        b.iter(|| parse(black_box(&raw)).unwrap());
    });

    c.bench_function("shared_config_set", |b| {
        let config = SharedConfig::new();
        b.iter(|| config.set_cfg(black_box(&raw), "bench.cfg").unwrap());
    });
}

/// Benchmark node id allocation
fn bench_node_allocation(c: &mut Criterion) {
    c.bench_function("node_allocator_add", |b| {
        b.iter(|| {
            let mut nodes = NodeAllocator::new();
            for i in 0..40 {
                black_box(nodes.add("swipe", &format!("agent{i}"), None).unwrap());
            }
        });
    });
}

/// Benchmark exporting the configuration snapshot
fn bench_export(c: &mut Criterion) {
    let config = SharedConfig::from_raw(&sample_config(), "bench.cfg").unwrap();
    c.bench_function("export_configuration", |b| {
        b.iter(|| black_box(config.export_configuration().unwrap()));
    });
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_parse,
    bench_node_allocation,
    bench_export
);
criterion_main!(benches);
