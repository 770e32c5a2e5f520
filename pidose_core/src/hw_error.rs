//! Classifies `Box<dyn Error>` from the transport boundary.
//!
//! The traits in `pidose_traits` return `Box<dyn Error + Send + Sync>`; the
//! connection manager only needs to know whether a failure is worth another
//! attempt. With the `hardware-errors` feature the known `HwError` variants are
//! matched exactly; otherwise (and for foreign errors) the message decides.

/// What kind of transport failure a boxed error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// The link is down or the peripheral is not (yet) reachable.
    NotConnected,
    Timeout,
    Other,
}

impl TransportFault {
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout)
    }
}

pub fn classify(e: &(dyn std::error::Error + 'static)) -> TransportFault {
    #[cfg(feature = "hardware-errors")]
    {
        use pidose_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::NotConnected => TransportFault::NotConnected,
                HwError::Timeout => TransportFault::Timeout,
                _ => TransportFault::Other,
            };
        }
    }

    let s = e.to_string().to_lowercase();
    if s.contains("not connected") || s.contains("notconnected") || s.contains("disconnected") {
        TransportFault::NotConnected
    } else if s.contains("timeout") || s.contains("timed out") {
        TransportFault::Timeout
    } else {
        TransportFault::Other
    }
}
