//! Dose controller behaviour against scripted mocks.
//!
//! Intervals are shrunk to a millisecond so sessions finish quickly; every
//! wait is bounded so a regression fails instead of hanging. Timeout
//! scenarios run on a `TestClock` at their real intervals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pidose_core::mocks::{LinkEvent, MockRelay, MockTransport};
use pidose_core::{
    DoseController, DoseOutcome, DoseReport, DoseSettings, DoseState, DoserError, PressAction,
    SubscriptionError,
};
use pidose_traits::clock::test_clock::TestClock;
use pidose_traits::{Clock, Relay};
use rstest::rstest;

type Ctl = DoseController<MockTransport, MockRelay>;

fn fast_settings() -> DoseSettings {
    DoseSettings {
        address: "00:1C:97:00:00:01".into(),
        connect_timeout: Duration::from_millis(1),
        subscribe_tries: 2_000,
        subscribe_interval: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        ..DoseSettings::default()
    }
}

fn controller(t: &MockTransport, r: &MockRelay, s: DoseSettings) -> Ctl {
    DoseController::builder()
        .with_transport(t.clone())
        .with_relay(r.clone())
        .with_settings(s)
        .build()
        .expect("valid controller")
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    f()
}

fn next_report(c: &Ctl) -> DoseReport {
    c.outcomes()
        .recv_timeout(Duration::from_secs(5))
        .expect("dose report within 5s")
}

const WAIT: Duration = Duration::from_secs(5);

/// Press, wait for the subscription, confirm it with a 0 g sample, and wait
/// for the relay to close.
fn start_dosing(c: &Ctl, t: &MockTransport, r: &MockRelay) {
    assert_eq!(c.on_press(), PressAction::Started);
    let link = t.link();
    assert!(wait_until(WAIT, || link.is_subscribed()), "never subscribed");
    assert!(!r.is_on(), "relay must wait for the first valid sample");
    link.push_grams(0.0);
    assert!(wait_until(WAIT, || r.is_on()), "relay never turned on");
}

#[test]
fn normal_dose_stops_at_target_minus_tolerance() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    assert!(c.connect_at_startup());
    assert_eq!(c.state(), DoseState::Idle);

    start_dosing(&c, &t, &r);
    assert_eq!(c.state(), DoseState::Dosing);

    let link = t.link();
    for g in [5.0, 10.0, 14.0] {
        link.push_grams(g);
        thread::sleep(Duration::from_millis(10));
        assert!(r.is_on(), "relay dropped early at {g} g");
    }
    link.push_grams(15.0);

    let rep = next_report(&c);
    assert_eq!(rep.outcome, DoseOutcome::Completed { final_g: 15.0 });
    assert!(rep.unsubscribe_attempted);
    assert!(!r.is_on());
    assert_eq!(r.on_calls(), 1);
    assert_eq!(link.subscribe_calls(), 1);
    assert_eq!(link.unsubscribe_calls(), 1);
    assert!(c.wait_idle(WAIT));
    assert_eq!(c.state(), DoseState::Idle);
    // one connect for the whole run
    assert_eq!(t.attempts(), 1);
}

#[test]
fn second_press_cancels_immediately() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    start_dosing(&c, &t, &r);

    let link = t.link();
    link.push_grams(5.0);
    thread::sleep(Duration::from_millis(10));

    assert_eq!(c.on_press(), PressAction::Cancelled);
    // handled in the press itself, before the session thread reacts
    assert!(!r.is_on());
    assert!(link.unsubscribe_calls() >= 1);
    assert!(!link.push_grams(20.0), "no subscriber may remain after cancel");

    let rep = next_report(&c);
    match rep.outcome {
        DoseOutcome::Cancelled { last_g: Some(g) } => assert!(g <= 5.0, "last_g {g}"),
        other => panic!("expected Cancelled, got {other:?}"),
    }
    assert!(c.wait_idle(WAIT));
    assert!(!r.is_on());
    assert_eq!(r.on_calls(), 1);
    assert_eq!(c.state(), DoseState::Idle);
}

#[test]
fn subscription_without_samples_times_out() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let clock = TestClock::new();
    let c: Ctl = DoseController::builder()
        .with_transport(t.clone())
        .with_relay(r.clone())
        .with_settings(DoseSettings {
            subscribe_tries: 20,
            subscribe_interval: Duration::from_millis(500),
            ..fast_settings()
        })
        .with_clock(clock.clone())
        .build()
        .expect("valid controller");
    let epoch = clock.now();
    assert_eq!(c.on_press(), PressAction::Started);

    let rep = next_report(&c);
    assert_eq!(
        rep.outcome,
        DoseOutcome::Failed(DoserError::SubscriptionFailure(
            SubscriptionError::NoSample { tries: 20 }
        ))
    );
    // twenty checks half a second apart, on the injected clock
    assert_eq!(rep.elapsed, Duration::from_secs(10));
    assert_eq!(clock.ms_since(epoch), 10_000);
    assert_eq!(r.on_calls(), 0, "relay must never turn on");
    assert!(rep.unsubscribe_attempted);
    assert_eq!(t.link().unsubscribe_calls(), 1);
    assert!(c.wait_idle(WAIT));
    assert_eq!(c.state(), DoseState::Idle);
}

#[test]
fn garbled_notification_is_ignored() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    start_dosing(&c, &t, &r);

    let link = t.link();
    for g in [1.0, 2.0, 3.0] {
        link.push_grams(g);
    }
    link.push(b"\x01\x02+0?000\r\n");
    thread::sleep(Duration::from_millis(20));
    assert!(r.is_on(), "a decode failure must not stop the dose");
    assert_eq!(c.state(), DoseState::Dosing);

    link.push_grams(15.5);
    let rep = next_report(&c);
    assert_eq!(rep.outcome, DoseOutcome::Completed { final_g: 15.5 });
    assert!(!r.is_on());
}

#[test]
fn startup_failure_then_dose_time_connect() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    t.fail_next(u32::MAX);
    let c = controller(&t, &r, fast_settings());
    assert!(!c.connect_at_startup());
    assert_eq!(t.attempts(), 10);
    assert_eq!(c.state(), DoseState::Idle);

    // scale powers up in time for the 31st dose-time attempt
    t.fail_next(30);
    start_dosing(&c, &t, &r);
    assert_eq!(t.attempts(), 10 + 31);

    t.link().push_grams(16.0);
    let rep = next_report(&c);
    assert_eq!(rep.outcome, DoseOutcome::Completed { final_g: 16.0 });
}

#[test]
fn dose_connect_exhaustion_is_connection_failure() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    t.fail_next(u32::MAX);
    let s = DoseSettings {
        dose_connect_tries: 5,
        ..fast_settings()
    };
    let c = controller(&t, &r, s);
    assert_eq!(c.on_press(), PressAction::Started);

    let rep = next_report(&c);
    match rep.outcome {
        DoseOutcome::Failed(DoserError::ConnectionFailure { attempts, .. }) => {
            assert_eq!(attempts, 5);
        }
        other => panic!("expected ConnectionFailure, got {other:?}"),
    }
    assert!(!rep.unsubscribe_attempted, "nothing to unsubscribe without a handle");
    assert_eq!(t.link().unsubscribe_calls(), 0);
    assert_eq!(r.on_calls(), 0);
    assert!(c.wait_idle(WAIT));
}

#[test]
fn cancel_while_subscribing_is_cancelled_dose() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    assert_eq!(c.on_press(), PressAction::Started);
    let link = t.link();
    assert!(wait_until(WAIT, || link.is_subscribed()));
    assert_eq!(c.state(), DoseState::Subscribing);

    assert_eq!(c.on_press(), PressAction::Cancelled);
    let rep = next_report(&c);
    assert_eq!(rep.outcome, DoseOutcome::Failed(DoserError::CancelledDose));
    assert_eq!(r.on_calls(), 0);
    assert!(c.wait_idle(WAIT));
    assert_eq!(c.state(), DoseState::Idle);
}

#[test]
fn rejected_subscribe_drops_handle_and_next_dose_reconnects() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    assert!(c.connect_at_startup());
    let link = t.link();
    link.reject_subscribe(true);

    assert_eq!(c.on_press(), PressAction::Started);
    match next_report(&c).outcome {
        DoseOutcome::Failed(DoserError::SubscriptionFailure(SubscriptionError::Rejected(_))) => {}
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(r.on_calls(), 0);
    assert!(c.wait_idle(WAIT));

    link.reject_subscribe(false);
    start_dosing(&c, &t, &r);
    assert_eq!(t.attempts(), 2);
    link.push_grams(15.0);
    assert!(next_report(&c).outcome.is_success());
}

#[test]
fn relay_failure_aborts_and_cleans_up() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    r.fail_on(true);
    let c = controller(&t, &r, fast_settings());
    assert_eq!(c.on_press(), PressAction::Started);
    let link = t.link();
    assert!(wait_until(WAIT, || link.is_subscribed()));
    link.push_grams(0.0);

    let rep = next_report(&c);
    assert!(matches!(rep.outcome, DoseOutcome::Failed(DoserError::Relay(_))));
    assert!(rep.unsubscribe_attempted);
    assert!(!r.is_on());
}

#[test]
fn failing_unsubscribe_is_tolerated() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    t.link().fail_unsubscribe(true);
    start_dosing(&c, &t, &r);
    t.link().push_grams(15.0);

    let rep = next_report(&c);
    assert!(rep.outcome.is_success());
    assert!(rep.unsubscribe_attempted);
    assert!(c.wait_idle(WAIT));
    assert_eq!(c.state(), DoseState::Idle);
    assert!(!r.is_on());
}

#[test]
fn max_run_limit_stops_a_stalled_dose() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let s = DoseSettings {
        max_run: Some(Duration::from_millis(200)),
        ..fast_settings()
    };
    let c = controller(&t, &r, s);
    start_dosing(&c, &t, &r);

    // no further samples: the weight never moves
    let rep = next_report(&c);
    assert_eq!(
        rep.outcome,
        DoseOutcome::Failed(DoserError::MaxRuntime { limit_ms: 200 })
    );
    assert!(!r.is_on());
}

#[test]
fn press_with_stray_relay_on_only_cancels() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    r.force_on();

    assert_eq!(c.on_press(), PressAction::Cancelled);
    assert!(!r.is_on());
    assert_eq!(c.state(), DoseState::Idle);
    assert_eq!(t.link().subscribe_calls(), 0);
    assert!(c.outcomes().try_recv().is_err());
}

#[test]
fn session_panic_still_runs_cleanup() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    r.panic_on(true);
    let c = controller(&t, &r, fast_settings());
    assert_eq!(c.on_press(), PressAction::Started);
    let link = t.link();
    assert!(wait_until(WAIT, || link.is_subscribed()));
    link.push_grams(0.0);

    assert!(c.wait_idle(WAIT));
    assert_eq!(c.state(), DoseState::Idle);
    assert!(!r.is_on());
    assert_eq!(link.unsubscribe_calls(), 1);

    // lock was released on unwind; the next press starts normally
    r.panic_on(false);
    start_dosing(&c, &t, &r);
    link.push_grams(16.0);
    assert!(
        c.outcomes()
            .recv_timeout(WAIT)
            .is_ok_and(|rep| rep.outcome.is_success())
    );
}

#[rstest]
#[case(1)]
#[case(3)]
fn relay_off_is_idempotent(#[case] times: usize) {
    let r = MockRelay::new();
    r.on().unwrap();
    for _ in 0..times {
        r.off().unwrap();
        assert!(!r.is_on());
    }
}

#[test]
fn shutdown_cancels_and_waits() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    start_dosing(&c, &t, &r);

    assert!(c.shutdown(WAIT));
    assert!(!r.is_on());
    assert_eq!(c.state(), DoseState::Idle);
    assert!(matches!(
        next_report(&c).outcome,
        DoseOutcome::Cancelled { .. }
    ));
}

#[test]
fn concurrent_presses_never_overlap_sessions() {
    let (t, r) = (MockTransport::new(), MockRelay::new());
    let c = controller(&t, &r, fast_settings());
    assert!(c.connect_at_startup());

    let link = t.link();
    let stop = Arc::new(AtomicBool::new(false));
    let feeder = {
        let link = Arc::clone(&link);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                link.push_grams(1.0);
                thread::sleep(Duration::from_micros(200));
            }
        })
    };

    let started = Arc::new(AtomicUsize::new(0));
    let pressers: Vec<_> = (0..4)
        .map(|_| {
            let c = c.clone();
            let started = Arc::clone(&started);
            thread::spawn(move || {
                for _ in 0..50 {
                    if c.on_press() == PressAction::Started {
                        started.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::sleep(Duration::from_micros(300));
                }
            })
        })
        .collect();
    for p in pressers {
        p.join().unwrap();
    }
    c.cancel();
    assert!(c.wait_idle(WAIT));
    stop.store(true, Ordering::Relaxed);
    feeder.join().unwrap();

    assert!(started.load(Ordering::Relaxed) >= 1);
    assert!(!r.is_on());
    assert_eq!(c.state(), DoseState::Idle);

    // every subscribe is followed by an unsubscribe before the next one
    let mut open = false;
    for e in link.events() {
        match e {
            LinkEvent::Subscribe => {
                assert!(!open, "two sessions subscribed at once");
                open = true;
            }
            LinkEvent::Unsubscribe => open = false,
        }
    }
    assert!(!open);
}
