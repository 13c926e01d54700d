use core::{fmt, hint::black_box};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use stallkeeper_server::server::{
    admission::{Admission, AdmissionController, slots::SlotTable},
    config::Limit,
    shutdown::ShutdownSignal,
};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;

#[derive(Clone, Copy, Debug)]
struct AdmissionBenchParams {
    workers: Limit,
    places: Limit,
    concurrency: usize,
}

impl fmt::Display for AdmissionBenchParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limit = |l: Limit| l.bounded().map_or("inf".to_string(), |n| n.to_string());
        write!(
            f,
            "workers/{}/places/{}/conc/{}",
            limit(self.workers),
            limit(self.places),
            self.concurrency
        )
    }
}

/// Full acquire/release cycles of worker slot plus resource slot.
fn admission_bench(c: &mut Criterion) {
    let limits = [
        (Limit::Unlimited, Limit::Unlimited),
        (Limit::Unlimited, Limit::Bounded(4)),
        (Limit::Bounded(8), Limit::Bounded(4)),
        (Limit::Bounded(64), Limit::Bounded(64)),
    ];
    let concurrency_cases = [1, 8, 64];

    let mut cases = Vec::new();
    for &(workers, places) in &limits {
        for &concurrency in &concurrency_cases {
            cases.push(AdmissionBenchParams {
                workers,
                places,
                concurrency,
            });
        }
    }

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();
    let cycles_per_task: u64 = 1_000;

    for params in cases {
        let mut group = c.benchmark_group("admission/cycle");
        group.throughput(Throughput::Elements(
            cycles_per_task * params.concurrency as u64,
        ));

        group.bench_function(params.to_string(), |b| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let controller = Arc::new(AdmissionController::new(params.workers, params.places));
                let start = Instant::now();
                for _ in 0..iters {
                    run_cycles(&controller, params.concurrency, cycles_per_task).await;
                }
                start.elapsed()
            });
        });

        group.finish();
    }
}

async fn run_cycles(controller: &Arc<AdmissionController>, concurrency: usize, cycles: u64) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..concurrency {
        let controller = Arc::clone(controller);
        tasks.push(tokio::spawn(async move {
            let shutdown = ShutdownSignal::detached();
            for _ in 0..cycles {
                let worker = controller.acquire_worker_slot(&shutdown).await.unwrap();
                let resource = controller.acquire_resource_slot(&shutdown).await.unwrap();
                let admission = Admission::new(worker, resource);
                black_box(admission.place());
                admission.release();
            }
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

/// Lowest-open-index assignment on a table kept half full.
fn slot_table_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("slots/assign_free");

    for capacity in [4, 64, 1024] {
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("capacity/{capacity}"), |b| {
            let mut table = SlotTable::new(capacity);
            for _ in 0..capacity / 2 {
                table.assign();
            }
            b.iter(|| {
                let index = table.assign().unwrap();
                table.free(black_box(index));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, admission_bench, slot_table_bench);
criterion_main!(benches);
