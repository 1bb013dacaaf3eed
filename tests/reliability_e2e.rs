use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use coap_observe::{
    DeliveryHandle, DeliveryOutcome, EvictionReason, HandlerError, NotificationType, ObserveConfig, ObserveEvent,
    ObserveServer, OutgoingMessage, Request, RequestContext, ResourceHandler, ResourceId, ResourceOptions, Response,
    ResponseCode, SessionId, Token, Transport, TransportError, Verdict,
};

#[derive(Default)]
struct RecordingTransport {
    next: AtomicU64,
    sent: Mutex<Vec<(DeliveryHandle, SessionId, OutgoingMessage)>>,
}

impl RecordingTransport {
    fn handles_for(&self, session: &str) -> Vec<DeliveryHandle> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| s.as_str() == session)
            .map(|(h, _, _)| *h)
            .collect()
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, session: &SessionId, message: OutgoingMessage) -> Result<DeliveryHandle, TransportError> {
        let handle = DeliveryHandle::new(self.next.fetch_add(1, Ordering::Relaxed));
        self.sent.lock().unwrap().push((handle, session.clone(), message));
        Ok(handle)
    }
}

fn ok_handler() -> Arc<dyn ResourceHandler> {
    Arc::new(|_: &RequestContext<'_>, response: &mut Response| -> Result<(), HandlerError> {
        response.payload = b"21.5".to_vec();
        Ok(())
    })
}

fn con_server(max_retransmit: u32) -> (ObserveServer, Arc<RecordingTransport>, ResourceId) {
    let transport = Arc::new(RecordingTransport::default());
    let cfg = ObserveConfig {
        max_retransmit,
        ..ObserveConfig::default()
    };
    let server = ObserveServer::new(cfg, transport.clone()).unwrap();
    let options = ResourceOptions::observable().with_notification_type(NotificationType::Confirmable);
    let id = server.add_resource("sensors/temp", options, ok_handler()).unwrap();
    (server, transport, id)
}

fn establish(server: &ObserveServer, id: ResourceId, session: &str, token: u8) {
    server
        .admit(id, &Request::get(session, Token::new(vec![token]).unwrap()).with_observe(0))
        .unwrap();
}

#[test]
fn exhausted_confirmable_evicts_exactly_that_subscriber() {
    let (server, transport, id) = con_server(2);
    establish(&server, id, "a", 1);
    establish(&server, id, "b", 2);

    server.mark_changed(id, None).unwrap();
    let lost = transport.handles_for("a")[0];
    let acked = transport.handles_for("b")[0];

    assert!(matches!(
        server.on_delivery_outcome(lost, DeliveryOutcome::TimedOutRetry).unwrap(),
        Verdict::Retrying { attempts: 1, .. }
    ));
    assert!(matches!(
        server.on_delivery_outcome(lost, DeliveryOutcome::TimedOutRetry).unwrap(),
        Verdict::Retrying { attempts: 2, .. }
    ));
    assert_eq!(server.subscriber_count(id).unwrap(), 2);

    let verdict = server.on_delivery_outcome(lost, DeliveryOutcome::TimedOutRetry).unwrap();
    assert!(matches!(
        verdict,
        Verdict::Evict {
            reason: EvictionReason::Exhausted,
            ..
        }
    ));
    assert!(matches!(
        server.on_delivery_outcome(acked, DeliveryOutcome::Acknowledged).unwrap(),
        Verdict::Delivered { .. }
    ));

    assert_eq!(server.subscriber_count(id).unwrap(), 1);
    assert!(server
        .find_subscription(id, &SessionId::new("a"), &Token::new(vec![1]).unwrap())
        .is_none());
    let b = server
        .find_subscription(id, &SessionId::new("b"), &Token::new(vec![2]).unwrap())
        .unwrap();
    assert_eq!(b.pending_confirmations, 0);
    assert_eq!(server.in_flight().unwrap(), 0);

    // The evicted observer is no longer notified.
    server.mark_changed(id, None).unwrap();
    assert_eq!(transport.handles_for("a").len(), 1);
    assert_eq!(transport.handles_for("b").len(), 2);
}

#[test]
fn reset_evicts_immediately() {
    let (server, transport, id) = con_server(4);
    establish(&server, id, "a", 1);
    server.mark_changed(id, None).unwrap();

    let handle = transport.handles_for("a")[0];
    let verdict = server.on_delivery_outcome(handle, DeliveryOutcome::Reset).unwrap();
    assert!(matches!(
        verdict,
        Verdict::Evict {
            reason: EvictionReason::Reset,
            ..
        }
    ));
    assert_eq!(server.subscriber_count(id).unwrap(), 0);

    // A duplicate outcome for a settled handle is ignored.
    assert_eq!(
        server.on_delivery_outcome(handle, DeliveryOutcome::Reset).unwrap(),
        Verdict::Unknown
    );
}

#[test]
fn stale_outcome_does_not_evict_reestablished_observer() {
    let (server, transport, id) = con_server(4);
    establish(&server, id, "a", 1);
    server.mark_changed(id, None).unwrap();
    let old = transport.handles_for("a")[0];

    // Client re-registers with the same token before the old CON settles.
    establish(&server, id, "a", 1);

    server.on_delivery_outcome(old, DeliveryOutcome::TimedOutExhausted).unwrap();
    assert_eq!(server.subscriber_count(id).unwrap(), 1);
}

#[test]
fn outcomes_reported_through_the_channel_are_applied_in_batch() {
    let (server, transport, id) = con_server(4);
    for token in 0..3 {
        establish(&server, id, &format!("peer-{token}"), token);
    }
    server.mark_changed(id, None).unwrap();
    assert_eq!(server.in_flight().unwrap(), 3);

    let reporter = server.outcome_reporter();
    let peer0 = transport.handles_for("peer-0")[0];
    let peer1 = transport.handles_for("peer-1")[0];
    let peer2 = transport.handles_for("peer-2")[0];

    let worker = thread::spawn(move || {
        assert!(reporter.report(peer0, DeliveryOutcome::Acknowledged));
        assert!(reporter.report(peer1, DeliveryOutcome::Reset));
        assert!(reporter.report(peer2, DeliveryOutcome::TimedOutExhausted));
    });
    worker.join().unwrap();

    assert_eq!(server.process_outcomes().unwrap(), 3);
    assert_eq!(server.process_outcomes().unwrap(), 0);
    assert_eq!(server.in_flight().unwrap(), 0);
    assert_eq!(server.subscriber_count(id).unwrap(), 1);
    assert_eq!(server.dropped_outcomes(), 0);
}

#[test]
fn full_outcome_queue_drops_and_counts() {
    let transport = Arc::new(RecordingTransport::default());
    let cfg = ObserveConfig {
        outcome_queue_capacity: 1,
        ..ObserveConfig::default()
    };
    let server = ObserveServer::new(cfg, transport).unwrap();
    let reporter = server.outcome_reporter();

    assert!(reporter.report(DeliveryHandle::new(1), DeliveryOutcome::Acknowledged));
    assert!(!reporter.report(DeliveryHandle::new(2), DeliveryOutcome::Acknowledged));
    assert_eq!(server.dropped_outcomes(), 1);
    assert_eq!(server.process_outcomes().unwrap(), 1);
}

#[test]
fn session_closed_clears_every_resource_for_that_peer() {
    let transport = Arc::new(RecordingTransport::default());
    let server = ObserveServer::new(ObserveConfig::default(), transport.clone()).unwrap();
    let temp = server
        .add_resource("temp", ResourceOptions::observable(), ok_handler())
        .unwrap();
    let humidity = server
        .add_resource("humidity", ResourceOptions::observable(), ok_handler())
        .unwrap();

    establish(&server, temp, "gone", 1);
    establish(&server, humidity, "gone", 2);
    establish(&server, humidity, "gone", 3);
    establish(&server, temp, "stays", 1);

    assert_eq!(server.session_closed(&SessionId::new("gone")).unwrap(), 3);
    assert_eq!(server.subscriber_count(temp).unwrap(), 1);
    assert_eq!(server.subscriber_count(humidity).unwrap(), 0);

    server.mark_changed(temp, None).unwrap();
    server.mark_changed(humidity, None).unwrap();
    assert_eq!(transport.count(), 1);
    assert!(transport.handles_for("gone").is_empty());
}

#[test]
fn error_notification_ends_observation() {
    let transport = Arc::new(RecordingTransport::default());
    let server = ObserveServer::new(ObserveConfig::default(), transport.clone()).unwrap();
    let broken = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&broken);
    let handler = move |_: &RequestContext<'_>, response: &mut Response| -> Result<(), HandlerError> {
        if flag.load(Ordering::SeqCst) {
            response.code = ResponseCode::ServiceUnavailable;
        }
        Ok(())
    };
    let id = server
        .add_resource("temp", ResourceOptions::observable(), Arc::new(handler))
        .unwrap();
    let events = server.events();
    establish(&server, id, "a", 1);

    broken.store(true, Ordering::SeqCst);
    let report = server.mark_changed(id, None).unwrap();
    assert_eq!(report.ended.len(), 1);
    assert_eq!(server.subscriber_count(id).unwrap(), 0);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2.code, ResponseCode::ServiceUnavailable);
    assert_eq!(sent[0].2.observe, None);
    drop(sent);

    let kinds: Vec<ObserveEvent> = events.try_iter().map(|e| e.event).collect();
    assert!(matches!(kinds[0], ObserveEvent::Established { .. }));
    assert!(matches!(
        kinds[1],
        ObserveEvent::Evicted {
            reason: EvictionReason::ErrorResponse,
            ..
        }
    ));
}

#[test]
fn concurrent_notifies_on_separate_resources() {
    let transport = Arc::new(RecordingTransport::default());
    let server = Arc::new(ObserveServer::new(ObserveConfig::default(), transport.clone()).unwrap());

    let ids: Vec<ResourceId> = (0..4)
        .map(|i| {
            let id = server
                .add_resource(&format!("r{i}"), ResourceOptions::observable(), ok_handler())
                .unwrap();
            for token in 0..8 {
                establish(&server, id, &format!("peer-{token}"), token);
            }
            id
        })
        .collect();

    let workers: Vec<_> = ids
        .iter()
        .map(|&id| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for _ in 0..10 {
                    server.mark_changed(id, None).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(transport.count(), 4 * 8 * 10);
    assert_eq!(transport.handles_for("peer-0").len(), 4 * 10);
    for id in ids {
        assert_eq!(server.subscriber_count(id).unwrap(), 8);
    }
}

/// Parks every send whose payload is `slow` until released.
struct GatedTransport {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
    next: AtomicU64,
}

impl Transport for GatedTransport {
    fn send(&self, _: &SessionId, message: OutgoingMessage) -> Result<DeliveryHandle, TransportError> {
        if message.payload == b"slow" {
            self.entered.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(DeliveryHandle::new(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

#[test]
fn slow_send_on_one_resource_does_not_block_another() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Arc::new(GatedTransport {
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
        next: AtomicU64::new(0),
    });
    let server = Arc::new(ObserveServer::new(ObserveConfig::default(), transport).unwrap());

    // Both resources send CONs, so both cycles need the supervisor.
    let payload_handler = |payload: &'static [u8]| -> Arc<dyn ResourceHandler> {
        Arc::new(move |_: &RequestContext<'_>, response: &mut Response| -> Result<(), HandlerError> {
            response.payload = payload.to_vec();
            Ok(())
        })
    };
    let options = ResourceOptions::observable().with_notification_type(NotificationType::Confirmable);
    let slow = server.add_resource("slow", options, payload_handler(b"slow")).unwrap();
    let fast = server.add_resource("fast", options, payload_handler(b"fast")).unwrap();
    establish(&server, slow, "a", 1);
    establish(&server, fast, "b", 2);

    let slow_server = Arc::clone(&server);
    let slow_worker = thread::spawn(move || slow_server.mark_changed(slow, None).unwrap());
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let fast_server = Arc::clone(&server);
    let fast_worker = thread::spawn(move || {
        let report = fast_server.mark_changed(fast, None).unwrap();
        done_tx.send(report.confirmable).unwrap();
    });

    let finished = done_rx.recv_timeout(Duration::from_secs(5));
    release_tx.send(()).unwrap();
    slow_worker.join().unwrap();
    fast_worker.join().unwrap();

    assert_eq!(finished, Ok(1));
    assert_eq!(server.in_flight().unwrap(), 2);
}

#[test]
fn concurrent_notifies_on_one_resource_reach_the_wire_in_order() {
    let transport = Arc::new(RecordingTransport::default());
    let server = Arc::new(ObserveServer::new(ObserveConfig::default(), transport.clone()).unwrap());
    let id = server
        .add_resource("temp", ResourceOptions::observable(), ok_handler())
        .unwrap();
    establish(&server, id, "a", 1);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                for _ in 0..25 {
                    server.mark_changed(id, None).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let observes: Vec<u32> = transport
        .sent
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(_, _, m)| m.observe)
        .collect();
    assert_eq!(observes, (1..=100).collect::<Vec<u32>>());

    let sub = server
        .find_subscription(id, &SessionId::new("a"), &Token::new(vec![1]).unwrap())
        .unwrap();
    assert_eq!(sub.last_sequence, 100);
}
