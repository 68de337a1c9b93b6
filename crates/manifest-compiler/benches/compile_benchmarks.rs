//! Compiler throughput benchmarks.
//!
//! Measures the three stages a host pays for on startup: lexing, the full
//! uncached compile (parse + lower + hash), and a cache hit.
//!
//! Run with: `cargo bench --bench compile_benchmarks`

use std::sync::{Arc, Mutex};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use manifest_compiler::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A program with `entity_count` entities, each carrying properties, a
/// computed property, constraints, a policy and two commands.
fn generate_source(entity_count: usize) -> String {
    let mut src = String::from("event Changed\n");
    for i in 0..entity_count {
        src.push_str(&format!(
            r#"
entity Item{i} {{
    property name: string = "item{i}"
    property count: number = 0
    property price: number = 1.5
    versionProperty version
    computed total: number = self.count * self.price
    belongsTo owner: Item0
    constraint nonNegative: self.count >= 0 "count must be non-negative"
    constraint overrideable warn large: self.count < 1000 {{ code: LARGE_{i} }}
    policy canEdit: user.role == "admin" or user.id == self.ownerId
    command increment(amount: number = 1) emits Changed {{
        guard self.count + amount <= 1000
        mutate self.count = self.count + amount
        emit Tick {{ by: amount, label: `item ${{self.name}}` }}
    }}
    command rename(required name: string) {{
        guard name != ""
        mutate self.name = name
    }}
}}
"#
        ));
    }
    src
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_tokenize(c: &mut Criterion) {
    let source = generate_source(100);
    c.bench_function("tokenize_100_entities", |b| {
        b.iter(|| black_box(tokenize(black_box(&source))));
    });
}

fn bench_compile_uncached(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_uncached");
    for count in [10usize, 100, 500] {
        let source = generate_source(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &source, |b, src| {
            b.iter(|| {
                let out = compile_to_ir(black_box(src));
                black_box(out.ir);
            });
        });
    }
    group.finish();
}

fn bench_compile_cache_hit(c: &mut Criterion) {
    let source = generate_source(100);
    let cache = Arc::new(Mutex::new(IrCache::default()));
    let compiler = IrCompiler::with_cache(cache);
    // warm the cache
    let _ = compiler.compile(&source, CompileOptions::default());

    c.bench_function("compile_cache_hit_100_entities", |b| {
        b.iter(|| {
            let out = compiler.compile(black_box(&source), CompileOptions::default());
            black_box(out.ir);
        });
    });
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_compile_uncached,
    bench_compile_cache_hit,
);
criterion_main!(benches);
