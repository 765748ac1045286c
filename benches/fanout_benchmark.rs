use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quote_stream::{
    logging,
    service::{
        context::QuoteContext,
        metrics::MetricsTx,
        poller::Poller,
        registry::SubscriberHandle,
        source::QuoteSource,
        testkit::{test_config, ScriptedSource},
    },
};
use tokio::runtime::Runtime;

fn bench_broadcast_fanout(c: &mut Criterion) {
    logging::set_silent(true);
    let source = ScriptedSource::new(Duration::ZERO);

    let mut group = c.benchmark_group("broadcast_fanout");
    for subscribers in [1usize, 16, 256] {
        let ctx = QuoteContext::new(
            test_config(),
            Arc::new(ScriptedSource::new(Duration::ZERO)) as Arc<dyn QuoteSource>,
            MetricsTx::noop(),
        );
        let receivers: Vec<_> = (0..subscribers)
            .map(|_| {
                let (handle, receiver) =
                    SubscriberHandle::new(ctx.registry.next_handle_id(), "AAPL", 16);
                ctx.registry.subscribe(handle);
                receiver
            })
            .collect();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| ctx.broadcaster.publish("AAPL", source.quote_for("AAPL")));
            },
        );
        drop(receivers);
    }
    group.finish();
}

fn bench_poll_cycle(c: &mut Criterion) {
    logging::set_silent(true);
    let rt = Runtime::new().expect("failed to create Tokio runtime");
    let tickers: BTreeSet<String> = (0..64).map(|idx| format!("T{idx:02}X")).collect();

    let mut group = c.benchmark_group("poll_cycle");
    group.throughput(Throughput::Elements(tickers.len() as u64));
    group.bench_function("gated_cycle_64_tickers", |b| {
        b.iter_custom(|iters| {
            let ctx = Arc::new(QuoteContext::new(
                test_config(),
                Arc::new(ScriptedSource::new(Duration::from_micros(50))) as Arc<dyn QuoteSource>,
                MetricsTx::noop(),
            ));
            let poller = Poller::new(Arc::clone(&ctx));
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let elapsed = rt.block_on(async {
                    let start = Instant::now();
                    let report = poller.run_cycle(tickers.clone()).await;
                    assert_eq!(report.updated, tickers.len(), "every ticker refreshed");
                    start.elapsed()
                });
                total += elapsed;
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_broadcast_fanout, bench_poll_cycle);
criterion_main!(benches);
