use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::block_on;
use futures::stream::{self, StreamExt};

use evalpipe_core::tee::{tee, tee_with_max_lag};

const LEN: usize = 10_000;

fn drain_round_robin(mut forks: Vec<evalpipe_core::tee::TeeStream<usize>>) -> usize {
    block_on(async {
        let mut total = 0;
        let mut live = forks.len();
        while live > 0 {
            live = 0;
            for fork in forks.iter_mut() {
                if let Some(value) = fork.next().await {
                    total += value;
                    live += 1;
                }
            }
        }
        total
    })
}

fn drain_sequential(forks: Vec<evalpipe_core::tee::TeeStream<usize>>) -> usize {
    block_on(async {
        let mut total = 0;
        for fork in forks {
            total += fork.fold(0, |acc, v| async move { acc + v }).await;
        }
        total
    })
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("tee_fan_out");

    for n in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::new("round_robin", n), &n, |b, &n| {
            b.iter(|| drain_round_robin(tee(stream::iter(0..black_box(LEN)), n)))
        });
        group.bench_with_input(BenchmarkId::new("sequential", n), &n, |b, &n| {
            b.iter(|| drain_sequential(tee(stream::iter(0..black_box(LEN)), n)))
        });
    }

    group.finish();
}

fn bench_bounded_lag(c: &mut Criterion) {
    let mut group = c.benchmark_group("tee_bounded_lag");

    for max_lag in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(max_lag), &max_lag, |b, &max_lag| {
            b.iter(|| drain_round_robin(tee_with_max_lag(stream::iter(0..black_box(LEN)), 4, max_lag)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fan_out, bench_bounded_lag);
criterion_main!(benches);
