//! Grid resolution and chunk planning benchmark

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use vds_ingest::{ChunkPlan, DataType, GridResolver, HeaderIndex};

/// Regular survey with every seventh trace missing
fn header_index(inlines: i64, crosslines: i64) -> HeaderIndex {
    let mut il = Vec::new();
    let mut xl = Vec::new();
    let mut offsets = Vec::new();
    for i in 0..inlines {
        for x in 0..crosslines {
            let n = i * crosslines + x;
            if n % 7 == 3 {
                continue;
            }
            il.push(1000 + i);
            xl.push(2000 + x * 2);
            offsets.push(n as u64 * 3840);
        }
    }
    HeaderIndex::from_columns(
        vec!["inline".to_string(), "crossline".to_string()],
        vec![il, xl],
        offsets,
        1000,
        DataType::F32,
    )
    .unwrap()
}

fn benchmark_grid_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("grid_resolution");

    for side in [100i64, 400, 1000] {
        let index = header_index(side, side);
        group.throughput(Throughput::Elements(index.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), &index, |b, index| {
            let resolver = GridResolver::new();
            b.iter(|| black_box(resolver.resolve(index).unwrap()));
        });
    }

    group.finish();
}

fn benchmark_chunk_planning(c: &mut Criterion) {
    let index = header_index(400, 400);
    let grid = GridResolver::new().resolve(&index).unwrap();
    let plan = ChunkPlan::new(grid.shape(), &[64, 64])
        .unwrap()
        .with_samples(1000, Some(64))
        .unwrap();

    c.bench_function("plan_iteration", |b| {
        b.iter(|| black_box(plan.iter().map(|chunk| chunk.cell_count()).sum::<usize>()))
    });

    c.bench_function("live_cells_per_chunk", |b| {
        b.iter(|| {
            black_box(
                plan.iter()
                    .filter(|chunk| chunk.sample_block == 0)
                    .map(|chunk| chunk.live_cells(&grid.map).count())
                    .sum::<usize>(),
            )
        })
    });
}

criterion_group!(benches, benchmark_grid_resolution, benchmark_chunk_planning);
criterion_main!(benches);
