//! Pump, pool and listener behaviour with a scripted transport.
//!
//! # Design
//! `FakeTransport` records each exchange and its hand-off block without
//! doing any I/O. Tests play the transport side by hand between pumps, so
//! every interleaving is deterministic.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use netreq_core::descriptor::FORM_CONTENT_TYPE;
use netreq_core::{
    EngineConfig, ErrorKind, Exchange, Handoff, Listener, Outcome, Phase, ProgressMode, RequestBody,
    RequestDescriptor, RequestEvent, RequestManager, ResponseHead, Stage, Transport,
};

#[derive(Clone, Default)]
struct FakeTransport {
    exchanges: Rc<RefCell<Vec<(Exchange, Arc<Handoff>)>>>,
}

impl Transport for FakeTransport {
    fn begin(&self, exchange: Exchange, handoff: Arc<Handoff>) -> Result<(), ErrorKind> {
        handoff.set_upload_total(exchange.body.len());
        self.exchanges.borrow_mut().push((exchange, handoff));
        Ok(())
    }
}

impl FakeTransport {
    fn handoff(&self, index: usize) -> Arc<Handoff> {
        Arc::clone(&self.exchanges.borrow()[index].1)
    }

    fn started(&self) -> usize {
        self.exchanges.borrow().len()
    }

    fn respond(&self, index: usize, status: u16, headers: &[(&str, &str)]) {
        self.handoff(index).publish_head(ResponseHead {
            status,
            status_line: format!("HTTP/1.1 {status}"),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
    }

    fn complete(&self, index: usize, body: &[u8]) {
        let handoff = self.handoff(index);
        handoff.deliver(body).unwrap();
        handoff.finish(Ok(()));
        handoff.close();
    }

    /// Finish after an abort the way a real transport would.
    fn close_aborted(&self, index: usize) {
        let handoff = self.handoff(index);
        assert!(handoff.abort_requested());
        handoff.finish(Err(ErrorKind::Aborted));
        handoff.close();
    }
}

fn manager(transport: &FakeTransport) -> RequestManager {
    RequestManager::with_transport(
        EngineConfig {
            pump_interval_ms: 1,
            shutdown_drain_ms: 50,
            ..EngineConfig::default()
        },
        transport.clone(),
    )
}

fn get(path: &str) -> RequestDescriptor {
    RequestDescriptor::builder(format!("http://example.com{path}"))
        .build()
        .unwrap()
}

fn recorder() -> (Listener, Rc<RefCell<Vec<RequestEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    (
        Box::new(move |e: &RequestEvent| sink.borrow_mut().push(e.clone())),
        events,
    )
}

fn phases(events: &Rc<RefCell<Vec<RequestEvent>>>) -> Vec<Phase> {
    events.borrow().iter().map(|e| e.phase).collect()
}

// --- coalescing ---

#[test]
fn rapid_progress_is_coalesced_but_ended_arrives_once() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let descriptor = RequestDescriptor::builder("http://example.com/big")
        .progress(ProgressMode::Download)
        .min_notification_interval_ms(60_000)
        .build()
        .unwrap();
    let (listener, events) = recorder();
    manager.submit(descriptor, Some(listener));

    transport.respond(0, 200, &[("Content-Length", "20")]);
    manager.pump();
    let handoff = transport.handoff(0);
    for _ in 0..20 {
        handoff.deliver(b"x").unwrap();
        manager.pump();
    }
    handoff.finish(Ok(()));
    handoff.close();
    manager.pump();

    let progress = phases(&events).iter().filter(|p| **p == Phase::Progress).count();
    assert!(progress < 20, "progress fired {progress} times");
    assert_eq!(progress, 1);
    assert_eq!(phases(&events).iter().filter(|p| **p == Phase::Ended).count(), 1);
    assert_eq!(events.borrow().last().unwrap().bytes_transferred, 20);
}

// --- validation defaults ---

#[test]
fn post_text_without_content_type_is_sent_as_form() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let descriptor = RequestDescriptor::builder("http://example.com/form")
        .method("post")
        .body(RequestBody::text("a=1&b=2"))
        .build()
        .unwrap();
    assert_eq!(descriptor.headers().get("content-type"), Some(FORM_CONTENT_TYPE));

    manager.submit(descriptor, None);
    let exchanges = transport.exchanges.borrow();
    let (exchange, _) = &exchanges[0];
    assert_eq!(exchange.method, "POST");
    assert!(exchange
        .headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v == FORM_CONTENT_TYPE));
}

// --- cancellation ---

#[test]
fn cancel_before_any_callback_stays_silent() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let (listener, events) = recorder();
    let canceller = manager.submit(get("/slow"), Some(listener));

    assert!(canceller.cancel());
    manager.pump();
    assert_eq!(
        manager.stage(canceller.id()),
        Some(Stage::Ended(Outcome::Aborted))
    );
    // Not reusable until the transport lets go.
    assert_eq!(manager.active_count(), 1);

    transport.close_aborted(0);
    assert!(manager.pump_until(Duration::from_secs(1)));
    assert!(events.borrow().is_empty());
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.stage(canceller.id()), None);
}

#[test]
fn cancel_by_id_suppresses_further_callbacks() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let descriptor = RequestDescriptor::builder("http://example.com/big")
        .progress(ProgressMode::Download)
        .build()
        .unwrap();
    let (listener, events) = recorder();
    let canceller = manager.submit(descriptor, Some(listener));

    transport.respond(0, 200, &[]);
    manager.pump();
    assert_eq!(phases(&events), vec![Phase::Began]);

    assert!(manager.cancel(canceller.id()));
    assert!(!manager.cancel(canceller.id()));
    manager.pump();
    transport.close_aborted(0);
    manager.pump();
    assert_eq!(phases(&events), vec![Phase::Began]);
    assert_eq!(manager.active_count(), 0);
}

#[test]
fn abort_all_reports_only_to_requests_that_spoke() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);

    let loud = RequestDescriptor::builder("http://example.com/a")
        .progress(ProgressMode::Download)
        .build()
        .unwrap();
    let (loud_listener, loud_events) = recorder();
    manager.submit(loud, Some(loud_listener));
    let (quiet_listener, quiet_events) = recorder();
    manager.submit(get("/b"), Some(quiet_listener));

    transport.respond(0, 200, &[]);
    manager.pump();
    assert_eq!(phases(&loud_events), vec![Phase::Began]);

    manager.abort_all();
    manager.pump();
    transport.close_aborted(0);
    transport.close_aborted(1);
    assert!(manager.pump_until(Duration::from_secs(1)));

    assert_eq!(phases(&loud_events), vec![Phase::Began, Phase::Ended]);
    let end = loud_events.borrow().last().cloned().unwrap();
    assert!(end.is_error);
    assert_eq!(end.error_kind, Some(ErrorKind::Aborted));
    assert!(quiet_events.borrow().is_empty());
}

// --- pool ---

#[test]
fn pool_never_exceeds_peak_concurrency() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);

    for round in 0..3 {
        for _ in 0..3 {
            manager.submit(get("/x"), None);
        }
        for i in 0..3 {
            let index = round * 3 + i;
            transport.respond(index, 204, &[]);
            transport.complete(index, b"");
        }
        assert!(manager.pump_until(Duration::from_secs(1)));
        assert_eq!(manager.pooled_count(), 3);
    }
    assert_eq!(transport.started(), 9);
}

#[test]
fn ended_but_open_operation_is_not_reused() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let first = manager.submit(get("/first"), None);

    let handoff = transport.handoff(0);
    transport.respond(0, 200, &[]);
    handoff.finish(Ok(()));
    manager.pump();
    assert_eq!(manager.stage(first.id()), Some(Stage::Ended(Outcome::Success)));

    manager.submit(get("/second"), None);
    assert_eq!(manager.pooled_count(), 2);
    assert!(!Arc::ptr_eq(&transport.handoff(0), &transport.handoff(1)));

    handoff.close();
    transport.respond(1, 200, &[]);
    transport.complete(1, b"");
    assert!(manager.pump_until(Duration::from_secs(1)));

    manager.submit(get("/third"), None);
    assert_eq!(manager.pooled_count(), 2);
}

// --- re-entrancy ---

#[test]
fn listener_may_submit_follow_up_requests() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let weak = manager.downgrade();
    let (follow_listener, follow_events) = recorder();
    let follow_listener = RefCell::new(Some(follow_listener));

    let listener: Listener = Box::new(move |e: &RequestEvent| {
        if e.phase == Phase::Ended {
            let manager = weak.upgrade().unwrap();
            let follow = RequestDescriptor::builder("http://example.com/next")
                .build()
                .unwrap();
            manager.submit(follow, follow_listener.borrow_mut().take());
        }
    });
    manager.submit(get("/first"), Some(listener));

    transport.respond(0, 200, &[("Content-Type", "text/plain")]);
    transport.complete(0, b"one");
    manager.pump();
    assert_eq!(transport.started(), 2);

    transport.respond(1, 200, &[("Content-Type", "text/plain")]);
    transport.complete(1, b"two");
    assert!(manager.pump_until(Duration::from_secs(1)));
    assert_eq!(follow_events.borrow().last().unwrap().text(), Some("two"));
}

// --- failures ---

#[test]
fn transport_error_is_delivered_through_ended() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let (listener, events) = recorder();
    manager.submit(get("/x"), Some(listener));

    let handoff = transport.handoff(0);
    handoff.finish(Err(ErrorKind::ConnectionFailure));
    handoff.close();
    assert!(manager.pump_until(Duration::from_secs(1)));

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].error_kind, Some(ErrorKind::ConnectionFailure));
    assert_eq!(events[0].status, -1);
    assert_eq!(events[0].text(), Some("Connection failure"));
}

#[test]
fn malformed_url_fails_on_first_pump() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    let (listener, events) = recorder();
    manager.submit(RequestDescriptor::builder("http://").build().unwrap(), Some(listener));
    assert_eq!(transport.started(), 0);

    manager.pump();
    assert_eq!(events.borrow()[0].error_kind, Some(ErrorKind::InvalidUrl));
    assert_eq!(manager.active_count(), 0);
}

// --- shutdown ---

#[test]
fn dropping_the_manager_aborts_in_flight_requests() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    manager.submit(get("/hang"), None);
    let handoff = transport.handoff(0);

    drop(manager);
    assert!(handoff.abort_requested());
}

#[test]
fn shutdown_reports_undrained_operations() {
    let transport = FakeTransport::default();
    let manager = manager(&transport);
    manager.submit(get("/hang"), None);
    assert!(!manager.shutdown());

    transport.close_aborted(0);
    assert!(manager.shutdown());
    assert_eq!(manager.active_count(), 0);
}
