//! A stand-in for VTube Studio's public API server.
//!
//! The network half accepts one websocket client at a time; the device half answers the
//! requests the bridge issues. Both run on plain threads so tests can drive the device
//! from outside any async runtime.

mod device;
mod net;
mod protocol;

pub use crate::device::{DeviceLoop, DeviceState, MockModel};
pub use crate::net::NetworkThread;
pub use crate::protocol::{InboundMsg, OutboundMsg, INBOUND_CAP, OUTBOUND_CAP};

use crate::protocol::ApiEnvelope;
use crossbeam_channel::{bounded, Sender};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TICK: Duration = Duration::from_millis(5);

pub struct MockDevice {
    net: NetworkThread,
    control: DeviceControl,
    shutdown: Arc<AtomicBool>,
    device_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MockDevice {
    pub fn spawn_with_addr(addr: &str, state: DeviceState) -> Result<Self, String> {
        let (in_tx, in_rx) = bounded(INBOUND_CAP);
        let (out_tx, out_rx) = bounded(OUTBOUND_CAP);

        let net = NetworkThread::spawn_with_addr(addr, in_tx, out_rx)?;

        let state = Arc::new(Mutex::new(state));
        let control = DeviceControl {
            state: Arc::clone(&state),
            outbound_tx: out_tx.clone(),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        let mut device_loop = DeviceLoop::new(in_rx, out_tx, state);
        let device_thread = thread::spawn(move || {
            while !shutdown_for_thread.load(Ordering::Relaxed) {
                device_loop.tick();
                thread::sleep(TICK);
            }
        });

        Ok(Self {
            net,
            control,
            shutdown,
            device_thread: Mutex::new(Some(device_thread)),
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.net.listen_addr()
    }

    pub fn control(&self) -> DeviceControl {
        self.control.clone()
    }

    pub fn shutdown(&self) {
        self.net.shutdown();
        self.shutdown.store(true, Ordering::Relaxed);
        if let Ok(mut h) = self.device_thread.lock() {
            if let Some(h) = h.take() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Test-side handle for steering the device while a client is connected.
#[derive(Clone)]
pub struct DeviceControl {
    state: Arc<Mutex<DeviceState>>,
    outbound_tx: Sender<OutboundMsg>,
}

impl DeviceControl {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn deny_token_requests(&self, deny: bool) {
        self.lock().deny_token_requests = deny;
    }

    pub fn grant_token(&self, token: &str) {
        self.lock().valid_tokens.insert(token.to_string());
    }

    pub fn revoke_all_tokens(&self) {
        self.lock().valid_tokens.clear();
    }

    pub fn delay(&self, message_type: &str, delay: Duration) {
        self.lock().delays.insert(message_type.to_string(), delay);
    }

    pub fn fail(&self, message_type: &str) {
        self.lock().failing.insert(message_type.to_string());
    }

    pub fn recover(&self, message_type: &str) {
        self.lock().failing.remove(message_type);
    }

    pub fn set_current_model(&self, model_id: Option<&str>) {
        self.lock().current_model = model_id.map(str::to_string);
    }

    pub fn current_model(&self) -> Option<String> {
        self.lock().current_model.clone()
    }

    pub fn issued_tokens(&self) -> Vec<String> {
        self.lock().issued_tokens.clone()
    }

    pub fn triggered_hotkeys(&self) -> Vec<String> {
        self.lock().triggered_hotkeys.clone()
    }

    pub fn request_count(&self, message_type: &str) -> usize {
        self.lock()
            .request_log
            .iter()
            .filter(|m| m.as_str() == message_type)
            .count()
    }

    /// Closes the active client connection from the device side.
    pub fn kick_client(&self) {
        let _ = self.outbound_tx.try_send(OutboundMsg::Kick);
    }

    /// Pushes an `APIError` that does not answer any request.
    pub fn push_error(&self, error_id: i32, message: &str) {
        let envelope = ApiEnvelope::error("", error_id, message, 0);
        let _ = self.outbound_tx.try_send(OutboundMsg::Send { envelope });
    }
}
