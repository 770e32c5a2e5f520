//! Simulated rig: a scale whose weight rises while the relay is on.
//!
//! `SimTransport` and `SimRelay` share one `SimScale`, so a dose driven through
//! the controller closes its own loop without any hardware. Notifications are
//! produced by one thread per subscription; the thread stops on unsubscribe or
//! when the peripheral is dropped.

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use pidose_traits::clock::{Clock, MonotonicClock};
use pidose_traits::{BoxError, Button, NotifyFn, Peripheral, PressFn, Relay, Transport};
use tracing::{debug, trace, warn};

use crate::error::HwError;

/// Address reported by the simulated transport's discovery.
pub const SIM_ADDRESS: &str = "00:1C:97:00:00:01";

/// Leading bytes placed before the weight digits in simulated frames.
const FRAME_HEADER: [u8; 3] = [0x01, 0x02, b'+'];
const FRAME_TRAILER: [u8; 2] = [b'\r', b'\n'];
const FRAME_PERIOD: Duration = Duration::from_millis(50);
const MAX_WEIGHT_DG: u32 = 99_999;

/// Tunables for the simulated scale.
#[derive(Debug, Clone)]
pub struct SimParams {
    /// Weight gained per second while the relay is on.
    pub rate_g_per_s: f32,
    /// When false, every connect attempt fails with `NotConnected`.
    pub online: bool,
    /// Replace every n-th frame with a garbled payload (0 disables).
    pub garble_every: u64,
    /// Offset of the five weight digits inside each frame.
    pub weight_offset: usize,
    /// Interval between notifications.
    pub frame_period: Duration,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            rate_g_per_s: 4.0,
            online: true,
            garble_every: 0,
            weight_offset: FRAME_HEADER.len(),
            frame_period: FRAME_PERIOD,
        }
    }
}

impl SimParams {
    /// Defaults overridden by `PIDOSE_SIM_RATE_G_PER_S`, `PIDOSE_SIM_OFFLINE`
    /// and `PIDOSE_SIM_GARBLE`.
    pub fn from_env() -> Self {
        let mut p = Self::default();
        if let Some(rate) = std::env::var("PIDOSE_SIM_RATE_G_PER_S")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|r| r.is_finite() && *r >= 0.0)
        {
            p.rate_g_per_s = rate;
        }
        if std::env::var("PIDOSE_SIM_OFFLINE").is_ok_and(|v| v == "1") {
            p.online = false;
        }
        if let Some(n) = std::env::var("PIDOSE_SIM_GARBLE")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            p.garble_every = n;
        }
        p
    }
}

/// Shared physical state of the simulated scale and relay.
#[derive(Debug)]
pub struct SimScale {
    weight_g: Mutex<f32>,
    relay_on: AtomicBool,
    online: AtomicBool,
    params: SimParams,
}

impl SimScale {
    pub fn new(params: SimParams) -> Arc<Self> {
        Arc::new(Self {
            weight_g: Mutex::new(0.0),
            relay_on: AtomicBool::new(false),
            online: AtomicBool::new(params.online),
            params,
        })
    }

    pub fn weight_g(&self) -> f32 {
        *self.weight_g.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Empty the cup.
    pub fn reset_weight(&self) {
        *self.weight_g.lock().unwrap_or_else(PoisonError::into_inner) = 0.0;
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn tick(&self, dt: Duration) -> f32 {
        let mut w = self.weight_g.lock().unwrap_or_else(PoisonError::into_inner);
        if self.relay_on.load(Ordering::SeqCst) {
            *w += self.params.rate_g_per_s * dt.as_secs_f32();
        }
        *w
    }
}

/// Build a transport/relay pair sharing one simulated scale.
pub fn rig(params: SimParams) -> (SimTransport, SimRelay, Arc<SimScale>) {
    let scale = SimScale::new(params);
    (
        SimTransport {
            scale: scale.clone(),
        },
        SimRelay {
            scale: scale.clone(),
        },
        scale,
    )
}

/// Encode a weight (tenths of a gram) the way the scale frames it.
pub fn encode_frame(weight_dg: u32, offset: usize) -> Vec<u8> {
    let mut frame: Vec<u8> = FRAME_HEADER.iter().copied().cycle().take(offset).collect();
    let digits = format!("{:05}", weight_dg.min(MAX_WEIGHT_DG));
    frame.extend_from_slice(digits.as_bytes());
    frame.extend_from_slice(&FRAME_TRAILER);
    frame
}

fn garble_frame(offset: usize) -> Vec<u8> {
    let mut frame = encode_frame(0, offset);
    if let Some(b) = frame.get_mut(offset + 2) {
        *b = b'?';
    }
    frame
}

pub struct SimTransport {
    scale: Arc<SimScale>,
}

impl Transport for SimTransport {
    type Peripheral = SimPeripheral;

    fn connect(
        &self,
        address: &str,
        timeout: Duration,
        _auto_reconnect: bool,
    ) -> Result<SimPeripheral, BoxError> {
        if !self.scale.online.load(Ordering::SeqCst) {
            // A powered-off scale costs a short wait before the stack gives up.
            MonotonicClock::new().sleep(timeout.min(Duration::from_millis(5)));
            return Err(Box::new(HwError::NotConnected));
        }
        debug!(address, "sim scale connected");
        Ok(SimPeripheral {
            scale: self.scale.clone(),
            streams: Mutex::new(HashMap::new()),
        })
    }

    fn discover(&self, _timeout: Duration) -> Result<Vec<String>, BoxError> {
        if self.scale.online.load(Ordering::SeqCst) {
            Ok(vec![SIM_ADDRESS.to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

struct Stream {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Stream {
    fn halt(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join.take()
            && handle.join().is_err()
        {
            warn!("sim notification thread panicked");
        }
    }
}

pub struct SimPeripheral {
    scale: Arc<SimScale>,
    streams: Mutex<HashMap<String, Stream>>,
}

impl Peripheral for SimPeripheral {
    fn subscribe(
        &self,
        characteristic: &str,
        callback: NotifyFn,
        _wait_for_response: bool,
    ) -> Result<(), BoxError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let scale = self.scale.clone();
        let clock = MonotonicClock::new();
        let join = std::thread::Builder::new()
            .name("sim-scale-notify".into())
            .spawn(move || {
                let period = scale.params.frame_period;
                let offset = scale.params.weight_offset;
                let garble_every = scale.params.garble_every;
                let mut frame_no: u64 = 0;
                while !stop_thread.load(Ordering::SeqCst) {
                    let w = scale.tick(period);
                    frame_no = frame_no.wrapping_add(1);
                    let frame = if garble_every > 0 && frame_no % garble_every == 0 {
                        garble_frame(offset)
                    } else {
                        // Weight is never negative and stays far below u32::MAX tenths.
                        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                        let dg = (w.max(0.0) * 10.0).round() as u32;
                        encode_frame(dg, offset)
                    };
                    trace!(frame_no, weight_g = w, "sim frame");
                    callback(&frame);
                    clock.sleep(period);
                }
            })
            .map_err(HwError::Io)?;

        let previous = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                characteristic.to_string(),
                Stream {
                    stop,
                    join: Some(join),
                },
            );
        if let Some(old) = previous {
            old.halt();
        }
        Ok(())
    }

    fn unsubscribe(&self, characteristic: &str, _wait_for_response: bool) -> Result<(), BoxError> {
        let stream = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(characteristic);
        match stream {
            Some(s) => {
                s.halt();
                Ok(())
            }
            None => {
                debug!(characteristic, "unsubscribe without active subscription");
                Ok(())
            }
        }
    }
}

impl Drop for SimPeripheral {
    fn drop(&mut self) {
        let streams: Vec<Stream> = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for s in streams {
            s.halt();
        }
    }
}

pub struct SimRelay {
    scale: Arc<SimScale>,
}

impl Relay for SimRelay {
    fn on(&self) -> Result<(), BoxError> {
        self.scale.relay_on.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn off(&self) -> Result<(), BoxError> {
        self.scale.relay_on.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.scale.relay_on.load(Ordering::SeqCst)
    }
}

/// Button backed by stdin: every line read counts as one press.
#[derive(Debug, Default)]
pub struct StdinButton {
    reader: Option<JoinHandle<()>>,
}

impl StdinButton {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Button for StdinButton {
    fn when_pressed(&mut self, mut callback: PressFn) -> Result<(), BoxError> {
        if self.reader.is_some() {
            return Err(Box::new(HwError::Gpio(
                "stdin button already has a press handler".into(),
            )));
        }
        let handle = std::thread::Builder::new()
            .name("stdin-button".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    if line.is_err() {
                        break;
                    }
                    callback();
                }
                debug!("stdin closed; button reader exiting");
            })
            .map_err(HwError::Io)?;
        self.reader = Some(handle);
        Ok(())
    }
}
