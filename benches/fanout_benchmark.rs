use aerobench::fanout::{FanOut, Task};
use aerobench::packages::ycsb::{combine, parse_output};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

fn tasks(count: usize) -> Vec<Task<String, usize>> {
    (0..count)
        .map(|i| {
            Task::new(format!("host-{}", i), move |_target, _cancel| async move {
                tokio::task::yield_now().await;
                Ok::<_, anyhow::Error>(i)
            })
        })
        .collect()
}

/// Dispatch overhead of the executor itself, with actions that do no work
fn bench_fanout_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_dispatch");

    for count in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("unbounded", count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let outcomes = FanOut::new("bench").run_all(tasks(count)).await.unwrap();
                    black_box(outcomes.len())
                })
            });
        });

        group.bench_with_input(BenchmarkId::new("max_parallel_8", count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let outcomes = FanOut::new("bench")
                        .max_parallel(Some(8))
                        .run_all(tasks(count))
                        .await
                        .unwrap();
                    black_box(outcomes.len())
                })
            });
        });
    }

    group.finish();
}

/// Synthetic YCSB report with a latency histogram, like a real client prints
fn ycsb_output() -> String {
    let mut out = String::from(
        "[OVERALL], RunTime(ms), 60000\n[OVERALL], Throughput(ops/sec), 16666.6\n",
    );
    for op in ["READ", "UPDATE"] {
        out.push_str(&format!("[{}], Operations, 500000\n", op));
        out.push_str(&format!("[{}], AverageLatency(us), 412.5\n", op));
        out.push_str(&format!("[{}], MinLatency(us), 98\n", op));
        out.push_str(&format!("[{}], MaxLatency(us), 51234\n", op));
        out.push_str(&format!("[{}], 95thPercentileLatency(us), 800\n", op));
        out.push_str(&format!("[{}], 99thPercentileLatency(us), 1300\n", op));
        out.push_str(&format!("[{}], Return=OK, 500000\n", op));
        for bucket in 0..1000 {
            out.push_str(&format!("[{}], {}, 12\n", op, bucket));
        }
    }
    out
}

fn bench_ycsb_results(c: &mut Criterion) {
    let output = ycsb_output();
    let mut group = c.benchmark_group("ycsb_results");

    group.bench_function("parse_output", |b| {
        b.iter(|| parse_output(black_box(&output)).unwrap());
    });

    let parsed = parse_output(&output).unwrap();
    for clients in [2, 16] {
        let results = vec![parsed.clone(); clients];
        group.bench_with_input(BenchmarkId::new("combine", clients), &results, |b, results| {
            b.iter(|| combine(black_box(results)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout_dispatch, bench_ycsb_results);
criterion_main!(benches);
