//! Test doubles shared by the unit tests: a scriptable in-memory driver that
//! stands in for a USB stick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::error::DriverError;
use crate::message::{encode_message, next_message, AntMessage};

type Responder = Box<dyn FnMut(&AntMessage) -> Vec<AntMessage> + Send>;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    written: Vec<AntMessage>,
    responder: Option<Responder>,
}

/// In-memory [`Driver`]: bytes pushed with [`MockDriver::push_message`] are
/// read by the transport, frames written by the transport are decoded and
/// recorded, and an optional responder script turns each written message
/// into radio replies.
pub(crate) struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    /// Queue a message for the reader thread to receive.
    pub fn push_message(&self, msg: &AntMessage) {
        let bytes = encode_message(msg);
        self.state.lock().unwrap().rx.extend(bytes);
    }

    /// Queue raw bytes (for bad-frame tests).
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().rx.extend(bytes);
    }

    /// Everything the host has written so far, decoded.
    pub fn written(&self) -> Vec<AntMessage> {
        self.state.lock().unwrap().written.clone()
    }

    /// Install a script mapping each written message to radio replies.
    pub fn set_responder(
        &self,
        responder: impl FnMut(&AntMessage) -> Vec<AntMessage> + Send + 'static,
    ) {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }
}

impl Driver for MockDriver {
    fn read(&self, buf: &mut [u8]) -> Result<usize, DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.rx.is_empty() {
            drop(state);
            // Simulate the USB read timeout so the reader doesn't spin
            std::thread::sleep(Duration::from_millis(2));
            return Ok(0);
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<(), DriverError> {
        let mut buf = data.to_vec();
        let msg = next_message(&mut buf)
            .map_err(|e| DriverError::Io(format!("mock received bad frame: {}", e)))?
            .ok_or_else(|| DriverError::Io("mock received partial frame".into()))?;

        let mut state = self.state.lock().unwrap();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&msg),
            None => Vec::new(),
        };
        state.written.push(msg);
        for reply in replies {
            let bytes = encode_message(&reply);
            state.rx.extend(bytes);
        }
        Ok(())
    }

    fn close(&self) {}
}

/// Poll `cond` until it holds or `timeout_ms` elapses.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
