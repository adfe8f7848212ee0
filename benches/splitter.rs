use std::collections::BTreeMap;
use std::hint::black_box;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use tabular_ingest::normalizer::split::RowSplitter;

fn lines(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            format!(
                "\"Last{i}, First{i}\";user{i}@example.com;Email: user{i}@example.com | +1 555 {i:04}"
            )
        })
        .collect()
}

fn bench_split(c: &mut Criterion) {
    let data = lines(10_000);
    let separators = vec![";".to_string(), ";".to_string()];
    let no_prefixes = BTreeMap::new();
    let prefixed: BTreeMap<usize, String> = [(2, "Email:".to_string())].into_iter().collect();

    let mut group = c.benchmark_group("row_splitter");
    group.throughput(Throughput::Elements(data.len() as u64));

    group.bench_function("separators_with_trailing_resplit", |b| {
        let splitter = RowSplitter::new(&separators, &no_prefixes);
        b.iter(|| {
            for line in &data {
                black_box(splitter.split(black_box(line)));
            }
        })
    });

    group.bench_function("separators_with_prefix", |b| {
        let splitter = RowSplitter::new(&separators, &prefixed);
        b.iter(|| {
            for line in &data {
                black_box(splitter.split(black_box(line)));
            }
        })
    });

    let no_separators: Vec<String> = Vec::new();
    group.bench_function("csv_dialect", |b| {
        let splitter = RowSplitter::new(&no_separators, &no_prefixes);
        b.iter(|| {
            for line in &data {
                black_box(splitter.split(black_box(line)));
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_split);
criterion_main!(benches);
