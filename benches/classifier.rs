use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use tabular_ingest::classifier::KnownHeaders;
use tabular_ingest::classifier::tabular::assess;
use tabular_ingest::config::ClassifierConfig;

fn csv_lines(n: usize) -> Vec<String> {
    let mut out = vec!["id,name,email,phone".to_string()];
    out.extend((0..n).map(|i| format!("{i},Name {i},user{i}@example.com,555-{i:04}")));
    out
}

fn bench_assess(c: &mut Criterion) {
    let cfg = ClassifierConfig::default();
    let mut group = c.benchmark_group("tabular_assess");
    for rows in [1_000usize, 100_000] {
        let lines = csv_lines(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &lines, |b, lines| {
            b.iter(|| black_box(assess(black_box(lines), &cfg)))
        });
    }
    group.finish();
}

fn bench_header_match(c: &mut Criterion) {
    let Ok(known) = KnownHeaders::bundled() else {
        return;
    };
    let headers: Vec<String> = ["First Name", "E-mail", "Phone Number", "Company", "Notes"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    c.bench_function("known_headers_match", |b| {
        b.iter(|| black_box(known.match_headers(black_box(&headers))))
    });
}

criterion_group!(benches, bench_assess, bench_header_match);
criterion_main!(benches);
