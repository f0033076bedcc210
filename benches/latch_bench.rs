//! Latch manager acquire/release overhead benchmarking.

use std::fmt;
use std::time::Duration;

use rangekv::concurrency::{LatchManager, SpanAccess, SpanScope, SpanSet};
use rangekv::kvpb::Span;
use rangekv::Ctx;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use tokio::runtime::Builder;

/// Number of unrelated latches already held when acquiring.
static HELD: [usize; 4] = [0, 16, 256, 4096];

struct BenchId(pub usize, pub SpanAccess);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:?}", self.0, self.1)
    }
}

fn point_spans(key: String, access: SpanAccess) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add(access, SpanScope::Global, Span::point(key));
    spans
}

fn latch_bench_group(c: &mut Criterion) {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let ctx = Ctx::background();

    let mut group = c.benchmark_group("latch_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for held in HELD {
        for access in [SpanAccess::ReadOnly, SpanAccess::ReadWrite] {
            let lm = LatchManager::new();
            let _guards: Vec<_> = (0..held)
                .map(|i| {
                    lm.try_acquire(point_spans(format!("held{:06}", i), access))
                        .unwrap()
                })
                .collect();

            group.bench_with_input(
                BenchmarkId::from_parameter(BenchId(held, access)),
                &BenchId(held, access),
                |b, bench_id| {
                    b.iter(|| {
                        let spans = point_spans("bench".into(), bench_id.1);
                        let guard =
                            runtime.block_on(lm.acquire(&ctx, spans)).unwrap();
                        black_box(guard);
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, latch_bench_group);
criterion_main!(benches);
