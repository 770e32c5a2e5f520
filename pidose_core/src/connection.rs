//! Bounded-retry connection to the scale and the lazily-created shared handle.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pidose_traits::Transport;
use tracing::{debug, error, info, warn};

use crate::config::ScaleAddress;
use crate::error::{DoserError, Result};
use crate::hw_error::classify;

/// Try to connect up to `max_tries` times (0 is treated as 1).
///
/// `NotConnected` and `Timeout` failures are retried immediately; the
/// per-attempt `timeout` is the only pacing. Any other failure ends the loop
/// early. Either way the caller gets `ConnectionFailure` with the number of
/// attempts actually made.
pub fn connect<T: Transport + ?Sized>(
    transport: &T,
    address: &ScaleAddress,
    max_tries: u32,
    timeout: Duration,
    auto_reconnect: bool,
) -> Result<T::Peripheral> {
    connect_inner(transport, address, max_tries, timeout, auto_reconnect, None)
}

fn connect_inner<T: Transport + ?Sized>(
    transport: &T,
    address: &ScaleAddress,
    max_tries: u32,
    timeout: Duration,
    auto_reconnect: bool,
    cancel: Option<&AtomicBool>,
) -> Result<T::Peripheral> {
    let tries = max_tries.max(1);
    let mut cause = String::new();

    for attempt in 1..=tries {
        if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
            info!(attempt, "connect abandoned; dose cancelled");
            return Err(DoserError::CancelledDose);
        }
        debug!(attempt, tries, %address, "connecting to scale");
        match transport.connect(address.as_str(), timeout, auto_reconnect) {
            Ok(p) => {
                info!(attempt, %address, "scale connected");
                return Ok(p);
            }
            Err(e) => {
                cause = e.to_string();
                if !classify(&*e).is_retryable() {
                    error!(attempt, %address, error = %e, "scale connect failed");
                    return Err(DoserError::ConnectionFailure {
                        attempts: attempt,
                        cause,
                    });
                }
                warn!(attempt, tries, %address, error = %e, "scale not reachable");
            }
        }
    }

    error!(attempts = tries, %address, "giving up on scale connection");
    Err(DoserError::ConnectionFailure {
        attempts: tries,
        cause,
    })
}

/// Owns the transport and at most one live peripheral handle.
///
/// The handle is created at startup if possible, otherwise on the first dose
/// that needs it. The lock is never held across a connect, so readers such as
/// a cancelling button press never wait on the link.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    address: ScaleAddress,
    timeout: Duration,
    auto_reconnect: bool,
    startup_tries: u32,
    dose_tries: u32,
    handle: Mutex<Option<Arc<T::Peripheral>>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        address: ScaleAddress,
        timeout: Duration,
        auto_reconnect: bool,
        startup_tries: u32,
        dose_tries: u32,
    ) -> Self {
        Self {
            transport,
            address,
            timeout,
            auto_reconnect,
            startup_tries,
            dose_tries,
            handle: Mutex::new(None),
        }
    }

    /// Startup attempt. Failure is logged and leaves no handle.
    pub fn connect_at_startup(&self) -> bool {
        match connect(
            &self.transport,
            &self.address,
            self.startup_tries,
            self.timeout,
            self.auto_reconnect,
        ) {
            Ok(p) => {
                self.store(Some(Arc::new(p)));
                true
            }
            Err(e) => {
                warn!(error = %e, "scale unavailable at startup; will connect on first dose");
                false
            }
        }
    }

    /// Existing handle, or a fresh connection with the per-dose retry budget.
    pub fn ensure_connected(&self) -> Result<Arc<T::Peripheral>> {
        self.ensure_inner(None)
    }

    /// As [`Self::ensure_connected`], but gives up between attempts once
    /// `cancel` is set, with `CancelledDose`.
    pub fn ensure_connected_unless(&self, cancel: &AtomicBool) -> Result<Arc<T::Peripheral>> {
        self.ensure_inner(Some(cancel))
    }

    fn ensure_inner(&self, cancel: Option<&AtomicBool>) -> Result<Arc<T::Peripheral>> {
        if let Some(h) = self.current() {
            return Ok(h);
        }
        let p = Arc::new(connect_inner(
            &self.transport,
            &self.address,
            self.dose_tries,
            self.timeout,
            self.auto_reconnect,
            cancel,
        )?);
        self.store(Some(Arc::clone(&p)));
        Ok(p)
    }

    pub fn current(&self) -> Option<Arc<T::Peripheral>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the handle; the next dose reconnects.
    pub fn reset(&self) {
        if self.store(None) {
            info!(address = %self.address, "dropped scale handle");
        }
    }

    fn store(&self, h: Option<Arc<T::Peripheral>>) -> bool {
        let mut guard = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let had = guard.is_some();
        *guard = h;
        had
    }
}
