use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use coap_observe::{
    DeliveryHandle, DeliveryOutcome, HandlerError, NotificationType, ObserveConfig, ObserveServer, OutgoingMessage,
    Request, RequestContext, ResourceId, ResourceOptions, Response, SessionId, Token, Transport, TransportError,
};

/// Counts sends and discards the message.
#[derive(Default)]
struct NullTransport {
    next: AtomicU64,
}

impl Transport for NullTransport {
    fn send(&self, _: &SessionId, _: OutgoingMessage) -> Result<DeliveryHandle, TransportError> {
        Ok(DeliveryHandle::new(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

fn make_server(subscribers: u32, notification_type: NotificationType) -> (ObserveServer, ResourceId) {
    let cfg = ObserveConfig {
        max_subscribers_per_resource: 1 << 20,
        ..ObserveConfig::default()
    };
    let server = ObserveServer::new(cfg, Arc::new(NullTransport::default())).unwrap();
    let handler = |_: &RequestContext<'_>, response: &mut Response| -> Result<(), HandlerError> {
        response.payload = b"12:00:00".to_vec();
        Ok(())
    };
    let options = ResourceOptions::observable().with_notification_type(notification_type);
    let id = server.add_resource("time", options, Arc::new(handler)).unwrap();

    for i in 0..subscribers {
        let token = Token::new(i.to_be_bytes().to_vec()).unwrap();
        let session = SessionId::new(format!("10.0.{}.{}:5683", i / 256, i % 256));
        server.admit(id, &Request::get(session, token).with_observe(0)).unwrap();
    }
    (server, id)
}

fn bench_notify_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("notify_fanout");

    for subscribers in [1u32, 64, 1024] {
        group.throughput(Throughput::Elements(u64::from(subscribers)));
        group.bench_with_input(BenchmarkId::from_parameter(subscribers), &subscribers, |b, &n| {
            // Fresh registry per sample; setup excluded from timing.
            b.iter_custom(|iters| {
                let (server, id) = make_server(n, NotificationType::NonConfirmable);
                let start = Instant::now();
                for _ in 0..iters {
                    server.mark_changed(id, None).unwrap();
                }
                start.elapsed()
            });
        });
    }
    group.finish();
}

fn bench_confirmable_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("confirmable_cycle");
    group.throughput(Throughput::Elements(64));

    group.bench_function("notify_and_ack_64", |b| {
        b.iter_custom(|iters| {
            let (server, id) = make_server(64, NotificationType::Confirmable);
            let reporter = server.outcome_reporter();
            let mut next = 0u64;

            let start = Instant::now();
            for _ in 0..iters {
                let report = server.mark_changed(id, None).unwrap();
                for _ in 0..report.confirmable {
                    reporter.report(DeliveryHandle::new(next), DeliveryOutcome::Acknowledged);
                    next += 1;
                }
                server.process_outcomes().unwrap();
            }
            start.elapsed()
        });
    });
    group.finish();
}

fn bench_establish_cancel(c: &mut Criterion) {
    c.bench_function("gate/establish_cancel", |b| {
        b.iter_custom(|iters| {
            let (server, id) = make_server(256, NotificationType::NonConfirmable);
            let token = Token::new(vec![0xff, 0xee]).unwrap();

            let start = Instant::now();
            for _ in 0..iters {
                server
                    .admit(id, &Request::get("bench-peer", token.clone()).with_observe(0))
                    .unwrap();
                server
                    .admit(id, &Request::get("bench-peer", token.clone()).with_observe(1))
                    .unwrap();
            }
            start.elapsed()
        });
    });
}

criterion_group!(fanout, bench_notify_fanout, bench_confirmable_cycle, bench_establish_cancel);
criterion_main!(fanout);
