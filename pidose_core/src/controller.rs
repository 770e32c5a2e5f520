//! Button-driven dose controller.
//!
//! A press either starts a dose session on a dedicated thread or cancels the
//! one in flight. The press handler never blocks on the radio: it flips
//! atomics, drives the relay off, and fires a best-effort unsubscribe.
//!
//! Per session:
//!
//! 1. connect (cached handle, else bounded retries)
//! 2. subscribe and wait for the first valid sample (bounded checks)
//! 3. relay on, poll the weight slot until `weight + tolerance >= target`
//! 4. cleanup: relay off, unsubscribe once, release the single-flight lock
//!
//! Step 4 lives in a drop guard, so it also runs if the session thread
//! unwinds.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use pidose_traits::clock::Clock;
use pidose_traits::{Relay, Transport};
use tracing::{debug, error, info, trace, warn};

use crate::config::DoseSettings;
use crate::connection::ConnectionManager;
use crate::error::{DoserError, SubscriptionError};
use crate::session::{DoseSession, Progress, SessionLock, SessionSlot};
use crate::status::{DoseOutcome, DoseReport, DoseState, PressAction, StateCell};
use crate::telemetry::TelemetryChannel;

pub(crate) const REPORT_QUEUE: usize = 32;

pub(crate) struct Inner<T: Transport, R> {
    pub(crate) settings: DoseSettings,
    pub(crate) relay: R,
    pub(crate) connection: ConnectionManager<T>,
    pub(crate) telemetry: TelemetryChannel,
    pub(crate) slot: Arc<SessionSlot>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) state: StateCell,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) reports_tx: xch::Sender<DoseReport>,
    pub(crate) reports_rx: xch::Receiver<DoseReport>,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; clones share the same relay, link, and session lock.
pub struct DoseController<T: Transport, R> {
    pub(crate) inner: Arc<Inner<T, R>>,
}

impl<T: Transport, R> Clone for DoseController<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, R> DoseController<T, R>
where
    T: Transport + 'static,
    R: Relay + Send + Sync + 'static,
{
    pub fn builder() -> crate::builder::DoseControllerBuilder<T, R> {
        crate::builder::DoseControllerBuilder::default()
    }

    pub fn settings(&self) -> &DoseSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> DoseState {
        self.inner.state.get()
    }

    pub fn relay_is_on(&self) -> bool {
        self.inner.relay.is_on()
    }

    /// Startup connect with the startup retry budget. `false` is not an
    /// error: the first dose will try again.
    pub fn connect_at_startup(&self) -> bool {
        self.inner.connection.connect_at_startup()
    }

    /// Receiver for per-session reports. Clones share one queue.
    pub fn outcomes(&self) -> xch::Receiver<DoseReport> {
        self.inner.reports_rx.clone()
    }

    /// Button handler.
    ///
    /// Relay on or a session in flight means cancel; otherwise a new session
    /// is started. The lock is taken here, before the thread exists, so two
    /// presses can never both start a session.
    pub fn on_press(&self) -> PressAction {
        let inner = &self.inner;
        if inner.relay.is_on() || inner.slot.is_held() {
            self.cancel();
            return PressAction::Cancelled;
        }
        let Some(lock) = inner.slot.try_acquire() else {
            // lost the race to another press
            self.cancel();
            return PressAction::Cancelled;
        };

        // a cancel racing the previous session's cleanup must not leak into this one
        inner.cancel.store(false, Ordering::Release);
        inner.state.set(DoseState::Subscribing);
        let worker = Arc::clone(inner);
        let spawned = std::thread::Builder::new()
            .name("dose-session".into())
            .spawn(move || run_session(&worker, lock));
        match spawned {
            Ok(h) => {
                info!(target_g = inner.settings.target_g, "dose started");
                *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(h);
                PressAction::Started
            }
            Err(e) => {
                // the closure (and the lock it owned) is already dropped
                error!(error = %e, "could not spawn dose thread");
                inner.cancel.store(false, Ordering::Release);
                inner.state.set(DoseState::Idle);
                inner.relay_off("spawn failure");
                PressAction::Refused
            }
        }
    }

    /// Request cancellation. Returns without waiting for the session.
    pub fn cancel(&self) {
        let inner = &self.inner;
        inner.cancel.store(true, Ordering::Release);
        if inner.slot.is_held() {
            for from in [DoseState::Subscribing, DoseState::Dosing] {
                if inner.state.transition(from, DoseState::Cancelling) {
                    break;
                }
            }
        } else {
            // nothing to cancel; the flag belongs to the next session
            inner.cancel.store(false, Ordering::Release);
        }
        info!("cancel requested");
        inner.relay_off("cancel");
        if let Some(handle) = inner.connection.current() {
            inner.telemetry.unsubscribe(&*handle);
        }
    }

    /// Block until no session is running, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let finished = self
                .inner
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_none_or(JoinHandle::is_finished);
            if finished && !self.inner.slot.is_held() {
                let h = self
                    .inner
                    .worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(h) = h
                    && h.join().is_err()
                {
                    warn!("dose thread panicked; cleanup ran on unwind");
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Cancel anything in flight, wait for it, and drop the scale handle.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.inner.slot.is_held() || self.inner.relay.is_on() {
            self.cancel();
        }
        let idle = self.wait_idle(timeout);
        if !idle {
            warn!(?timeout, "dose thread still running at shutdown");
        }
        self.inner.relay_off("shutdown");
        self.inner.connection.reset();
        idle
    }
}

impl<T: Transport, R: Relay> Inner<T, R> {
    fn relay_off(&self, why: &'static str) {
        match self.relay.off() {
            Ok(()) => debug!(why, "relay off"),
            Err(e) => error!(why, error = %e, "relay off failed"),
        }
    }

    fn dose(&self, cleanup: &mut SessionCleanup<'_, T, R>) -> DoseOutcome {
        let handle = match self.connection.ensure_connected_unless(&self.cancel) {
            Ok(h) => h,
            Err(e) => return DoseOutcome::Failed(e),
        };
        cleanup.handle = Some(Arc::clone(&handle));

        let mut session = DoseSession::new(
            self.settings.target_g,
            self.settings.tolerance_g,
            Arc::clone(&self.cancel),
        );
        if session.is_cancelled() {
            return DoseOutcome::Failed(DoserError::CancelledDose);
        }

        if let Err(e) = self.telemetry.subscribe(&*handle) {
            // the link is likely gone; reconnect on the next dose
            self.connection.reset();
            return DoseOutcome::Failed(e.into());
        }
        if let Err(e) = self.await_first_sample(&mut session) {
            return DoseOutcome::Failed(e);
        }

        if !self.state.transition(DoseState::Subscribing, DoseState::Dosing) {
            return DoseOutcome::Failed(DoserError::CancelledDose);
        }
        if let Err(e) = self.relay.on() {
            return DoseOutcome::Failed(DoserError::Relay(e.to_string()));
        }
        let relay_on_at = self.clock.now();
        if session.is_cancelled() {
            // the press already drove the relay off; ours came after it
            self.relay_off("cancelled during relay on");
            return DoseOutcome::Cancelled {
                last_g: session.last_weight_g(),
            };
        }
        info!(
            start_g = session.last_weight_g().unwrap_or_default(),
            target_g = self.settings.target_g,
            "relay on"
        );
        self.fill(&mut session, relay_on_at)
    }

    fn await_first_sample(&self, session: &mut DoseSession) -> Result<(), DoserError> {
        let tries = self.settings.subscribe_tries.max(1);
        for attempt in 1..=tries {
            if session.is_cancelled() {
                return Err(DoserError::CancelledDose);
            }
            if session.confirm_subscription(self.telemetry.slot().sample()) {
                debug!(attempt, "subscription confirmed");
                return Ok(());
            }
            self.clock.sleep(self.settings.subscribe_interval);
        }
        warn!(tries, "no valid weight sample; giving up on subscription");
        Err(SubscriptionError::NoSample { tries }.into())
    }

    fn fill(&self, session: &mut DoseSession, relay_on_at: Instant) -> DoseOutcome {
        loop {
            if session.is_cancelled() {
                info!(last_g = ?session.last_weight_g(), "dose cancelled");
                return DoseOutcome::Cancelled {
                    last_g: session.last_weight_g(),
                };
            }
            match session.observe(self.telemetry.slot().sample()) {
                Progress::TargetReached { weight_g } => {
                    self.relay_off("target reached");
                    info!(weight_g, target_g = self.settings.target_g, "target reached");
                    return DoseOutcome::Completed { final_g: weight_g };
                }
                Progress::Filling { weight_g } => trace!(weight_g, "filling"),
                Progress::Waiting => {}
            }
            if let Some(limit) = self.settings.max_run
                && self.clock.ms_since(relay_on_at) >= millis(limit)
            {
                let limit_ms = millis(limit);
                warn!(limit_ms, last_g = ?session.last_weight_g(), "max run time exceeded");
                return DoseOutcome::Failed(DoserError::MaxRuntime { limit_ms });
            }
            self.clock.sleep(self.settings.poll_interval);
        }
    }
}

/// Relay off, unsubscribe once, back to idle with the cancel flag cleared,
/// lock released. Runs explicitly at the end of a session and again from
/// `Drop` only if the session unwound before getting there.
struct SessionCleanup<'a, T: Transport, R: Relay> {
    inner: &'a Inner<T, R>,
    handle: Option<Arc<T::Peripheral>>,
    lock: Option<SessionLock>,
}

impl<T: Transport, R: Relay> SessionCleanup<'_, T, R> {
    /// Returns whether an unsubscribe was attempted.
    fn run(&mut self) -> bool {
        let Some(lock) = self.lock.take() else {
            return false;
        };
        self.inner.relay_off("session end");
        let attempted = match self.handle.take() {
            Some(h) => {
                self.inner.telemetry.unsubscribe(&*h);
                true
            }
            None => false,
        };
        self.inner.state.set(DoseState::Idle);
        self.inner.cancel.store(false, Ordering::Release);
        drop(lock);
        attempted
    }
}

impl<T: Transport, R: Relay> Drop for SessionCleanup<'_, T, R> {
    fn drop(&mut self) {
        if self.lock.is_some() {
            warn!("dose session unwinding; running cleanup");
            self.run();
        }
    }
}

fn run_session<T: Transport, R: Relay>(inner: &Inner<T, R>, lock: SessionLock) {
    let started = inner.clock.now();
    let mut cleanup = SessionCleanup {
        inner,
        handle: None,
        lock: Some(lock),
    };
    let outcome = inner.dose(&mut cleanup);
    let unsubscribe_attempted = cleanup.run();
    drop(cleanup);

    let elapsed = inner.clock.now().saturating_duration_since(started);
    let elapsed_ms = millis(elapsed);
    match &outcome {
        DoseOutcome::Completed { final_g } => {
            info!(final_g, target_g = inner.settings.target_g, elapsed_ms, "dose complete");
        }
        DoseOutcome::Cancelled { .. } | DoseOutcome::Failed(DoserError::CancelledDose) => {
            info!(elapsed_ms, "dose cancelled");
        }
        DoseOutcome::Failed(e) => error!(error = %e, elapsed_ms, "dose aborted"),
    }

    let report = DoseReport {
        outcome,
        target_g: inner.settings.target_g,
        elapsed,
        unsubscribe_attempted,
    };
    if inner.reports_tx.try_send(report).is_err() {
        debug!("report queue full; dropping dose report");
    }
}

#[inline]
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockRelay, MockTransport};
    use pidose_traits::BoxError;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings() -> DoseSettings {
        DoseSettings {
            address: "00:1C:97:00:00:01".into(),
            connect_timeout: Duration::from_millis(1),
            subscribe_tries: 2_000,
            subscribe_interval: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            ..DoseSettings::default()
        }
    }

    fn wait_subscribed(t: &MockTransport) {
        let link = t.link();
        let deadline = Instant::now() + WAIT;
        while !link.is_subscribed() {
            assert!(Instant::now() < deadline, "never subscribed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn stale_cancel_flag_is_cleared_when_a_session_starts() {
        let (t, r) = (MockTransport::new(), MockRelay::new());
        let c = DoseController::builder()
            .with_transport(t.clone())
            .with_relay(r.clone())
            .with_settings(settings())
            .build()
            .unwrap();

        // a cancel that landed after the last cleanup reset the flag
        c.inner.cancel.store(true, Ordering::Release);

        assert_eq!(c.on_press(), PressAction::Started);
        wait_subscribed(&t);
        t.link().push_grams(0.0);
        t.link().push_grams(16.0);
        let rep = c.outcomes().recv_timeout(WAIT).unwrap();
        assert_eq!(rep.outcome, DoseOutcome::Completed { final_g: 16.0 });
        assert!(c.wait_idle(WAIT));
    }

    /// Relay whose `on()` lands a cancel, as a press arriving mid-call would.
    #[derive(Clone, Default)]
    struct CancelOnRelay {
        on: Arc<AtomicBool>,
        ons: Arc<AtomicUsize>,
        cancel: Arc<OnceLock<Arc<AtomicBool>>>,
    }

    impl Relay for CancelOnRelay {
        fn on(&self) -> Result<(), BoxError> {
            self.ons.fetch_add(1, Ordering::SeqCst);
            self.on.store(true, Ordering::SeqCst);
            if let Some(flag) = self.cancel.get() {
                flag.store(true, Ordering::Release);
            }
            Ok(())
        }

        fn off(&self) -> Result<(), BoxError> {
            self.on.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_on(&self) -> bool {
            self.on.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn cancel_during_relay_on_switches_it_straight_back_off() {
        let t = MockTransport::new();
        let r = CancelOnRelay::default();
        let c = DoseController::builder()
            .with_transport(t.clone())
            .with_relay(r.clone())
            .with_settings(DoseSettings {
                // one fill tick would outlast the test
                poll_interval: Duration::from_secs(60),
                ..settings()
            })
            .build()
            .unwrap();
        assert!(r.cancel.set(Arc::clone(&c.inner.cancel)).is_ok());

        assert_eq!(c.on_press(), PressAction::Started);
        wait_subscribed(&t);
        t.link().push_grams(2.0);

        let rep = c.outcomes().recv_timeout(WAIT).unwrap();
        assert_eq!(rep.outcome, DoseOutcome::Cancelled { last_g: Some(2.0) });
        assert_eq!(r.ons.load(Ordering::SeqCst), 1);
        assert!(!r.is_on());
        assert!(c.wait_idle(WAIT));
        assert_eq!(c.state(), DoseState::Idle);
    }
}
