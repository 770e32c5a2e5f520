//! Test and helper mocks for pidose_core.
//!
//! All mocks are cheap `Clone` handles over shared state, so a test can hand
//! one copy to the controller and keep another to script and inspect it.
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pidose_traits::{BoxError, NotifyFn, Peripheral, Relay, Transport};

use crate::fixed_point::grams_to_dg;

/// Notification frame as the stock scale sends it: three header bytes, five
/// ASCII digits of tenths of a gram, CRLF. Decode with offset 3.
pub fn weight_frame(weight_dg: u32) -> Vec<u8> {
    let mut f = vec![0x01, 0x02, b'+'];
    f.extend_from_slice(format!("{:05}", weight_dg.min(99_999)).as_bytes());
    f.extend_from_slice(b"\r\n");
    f
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Subscribe,
    Unsubscribe,
}

/// Shared state behind every [`MockPeripheral`] a [`MockTransport`] hands out.
#[derive(Default)]
pub struct MockLink {
    callback: Mutex<Option<NotifyFn>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    reject_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    events: Mutex<Vec<LinkEvent>>,
}

impl MockLink {
    /// Deliver a raw payload to the subscriber, if any.
    pub fn push(&self, payload: &[u8]) -> bool {
        let cb = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        match cb.as_ref() {
            Some(f) => {
                f(payload);
                true
            }
            None => false,
        }
    }

    pub fn push_grams(&self, g: f32) -> bool {
        let dg = u32::try_from(grams_to_dg(g)).unwrap_or(0);
        self.push(&weight_frame(dg))
    }

    pub fn is_subscribed(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn reject_subscribe(&self, on: bool) {
        self.reject_subscribe.store(on, Ordering::SeqCst);
    }

    pub fn fail_unsubscribe(&self, on: bool) {
        self.fail_unsubscribe.store(on, Ordering::SeqCst);
    }

    /// Subscribe/unsubscribe calls in the order they happened.
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn log(&self, e: LinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(e);
    }
}

pub struct MockPeripheral {
    link: Arc<MockLink>,
}

impl Peripheral for MockPeripheral {
    fn subscribe(
        &self,
        _characteristic: &str,
        callback: NotifyFn,
        _wait_for_response: bool,
    ) -> Result<(), BoxError> {
        self.link.log(LinkEvent::Subscribe);
        self.link.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.link.reject_subscribe.load(Ordering::SeqCst) {
            return Err(Box::new(std::io::Error::other("characteristic not found")));
        }
        *self
            .link
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        Ok(())
    }

    fn unsubscribe(&self, _characteristic: &str, _wait_for_response: bool) -> Result<(), BoxError> {
        self.link.log(LinkEvent::Unsubscribe);
        self.link.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.link
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.link.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(Box::new(std::io::Error::other("link dropped mid-request")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    attempts: AtomicU32,
    fail_remaining: AtomicU32,
    fatal: AtomicBool,
    link: Arc<MockLink>,
}

/// Transport with scripted connect failures. Every successful connect returns
/// a view onto the same [`MockLink`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` connects with a retryable "not connected" error.
    pub fn fail_next(&self, n: u32) {
        self.state.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail every connect with a non-retryable error.
    pub fn fail_fatally(&self, on: bool) {
        self.state.fatal.store(on, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn link(&self) -> Arc<MockLink> {
        Arc::clone(&self.state.link)
    }
}

impl Transport for MockTransport {
    type Peripheral = MockPeripheral;

    fn connect(
        &self,
        _address: &str,
        _timeout: Duration,
        _auto_reconnect: bool,
    ) -> Result<MockPeripheral, BoxError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.fatal.load(Ordering::SeqCst) {
            return Err(Box::new(std::io::Error::other("adapter powered off")));
        }
        let remaining = self.state.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .fail_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Box::new(std::io::Error::other("peripheral not connected")));
        }
        Ok(MockPeripheral {
            link: Arc::clone(&self.state.link),
        })
    }
}

#[derive(Default)]
struct RelayState {
    on: AtomicBool,
    on_calls: AtomicUsize,
    off_calls: AtomicUsize,
    fail_on: AtomicBool,
    panic_on: AtomicBool,
}

/// Relay that records calls. Can be told to fail or panic when switched on.
#[derive(Clone, Default)]
pub struct MockRelay {
    state: Arc<RelayState>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_calls(&self) -> usize {
        self.state.on_calls.load(Ordering::SeqCst)
    }

    pub fn off_calls(&self) -> usize {
        self.state.off_calls.load(Ordering::SeqCst)
    }

    pub fn fail_on(&self, yes: bool) {
        self.state.fail_on.store(yes, Ordering::SeqCst);
    }

    pub fn panic_on(&self, yes: bool) {
        self.state.panic_on.store(yes, Ordering::SeqCst);
    }

    /// Force the output high behind the controller's back.
    pub fn force_on(&self) {
        self.state.on.store(true, Ordering::SeqCst);
    }
}

impl Relay for MockRelay {
    fn on(&self) -> Result<(), BoxError> {
        self.state.on_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.panic_on.load(Ordering::SeqCst) {
            panic!("mock relay driver panicked");
        }
        if self.state.fail_on.load(Ordering::SeqCst) {
            return Err(Box::new(std::io::Error::other("gpio write failed")));
        }
        self.state.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn off(&self) -> Result<(), BoxError> {
        self.state.off_calls.fetch_add(1, Ordering::SeqCst);
        self.state.on.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.state.on.load(Ordering::SeqCst)
    }
}
