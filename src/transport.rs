//! Message transport over a [`Driver`]: a reader thread that frames the byte
//! stream, classifies each message as a response, channel event or data
//! frame, and dispatches it; plus the outgoing timeslot queue that interlocks
//! acknowledged/burst transmission with the radio's broadcast ticks.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::capabilities::{Capabilities, NodeInfo};
use crate::driver::Driver;
use crate::error::AntError;
use crate::message::*;

const MAX_QUEUED_RESPONSES: usize = 256;
const MAX_QUEUED_EVENTS: usize = 256;

/// Per-channel lifecycle state, updated by configuration calls and by
/// reader-side events (search timeout, channel closed, go-to-search).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unassigned,
    Assigned,
    Searching,
    Tracking,
    Closed,
}

/// What kind of data frame the transport routed to the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataKind {
    Broadcast,
    Acknowledge,
    Burst,
    BroadcastTx,
}

#[derive(Debug)]
pub(crate) struct DataMessage {
    pub kind: DataKind,
    pub channel: u8,
    pub data: Vec<u8>,
}

/// A classified response message, matched by callers through
/// [`TransportShared::wait_for_response`].
#[derive(Debug, Clone)]
pub struct Response {
    /// Channel the response refers to, if it carries one.
    pub channel: Option<u8>,
    /// The message id being responded to (or the notification's own id).
    pub id: u8,
    /// Response code when the message was a RESPONSE_CHANNEL ack.
    pub code: Option<u8>,
    pub data: Vec<u8>,
}

/// A channel event (RESPONSE_CHANNEL with sub-id 0x01).
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub channel: u8,
    pub code: u8,
    pub data: Vec<u8>,
}

/// State shared between the reader thread and the caller-side wait
/// facilities on Node and Channel.
pub(crate) struct TransportShared {
    responses: Mutex<VecDeque<Response>>,
    responses_cond: Condvar,
    events: Mutex<VecDeque<ChannelEvent>>,
    events_cond: Condvar,
    outgoing: Mutex<VecDeque<AntMessage>>,
    states: Mutex<HashMap<u8, Arc<Mutex<ChannelState>>>>,
    running: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TransportShared {
    fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            responses_cond: Condvar::new(),
            events: Mutex::new(VecDeque::new()),
            events_cond: Condvar::new(),
            outgoing: Mutex::new(VecDeque::new()),
            states: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn push_response(&self, response: Response) {
        let mut queue = lock(&self.responses);
        queue.push_back(response);
        // Bound growth if nothing is waiting
        while queue.len() > MAX_QUEUED_RESPONSES {
            queue.pop_front();
        }
        self.responses_cond.notify_all();
    }

    fn push_event(&self, event: ChannelEvent) {
        let mut queue = lock(&self.events);
        queue.push_back(event);
        while queue.len() > MAX_QUEUED_EVENTS {
            queue.pop_front();
        }
        self.events_cond.notify_all();
    }

    /// Block until a response to `id` arrives. Responses that came wrapped
    /// in a RESPONSE_CHANNEL ack carry a code; a non-zero code is an error.
    pub fn wait_for_response(&self, id: u8, timeout: Duration) -> Result<Response, AntError> {
        let response = self.wait_response_matching(id, timeout)?;
        match response.code {
            Some(code) if code != RESPONSE_NO_ERROR => {
                Err(AntError::ChannelResponse { command: id, code })
            }
            _ => Ok(response),
        }
    }

    /// Block until a reply with message id `id` arrives, without interpreting
    /// a response code. Used for requested messages (channel status/id,
    /// capabilities, serial, version).
    pub fn wait_for_special(&self, id: u8, timeout: Duration) -> Result<Response, AntError> {
        self.wait_response_matching(id, timeout)
    }

    fn wait_response_matching(&self, id: u8, timeout: Duration) -> Result<Response, AntError> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.responses);
        loop {
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                return Ok(queue.remove(pos).unwrap());
            }
            let now = Instant::now();
            if now >= deadline || !self.is_running() {
                return Err(AntError::ResponseTimeout(id));
            }
            let (guard, _) = self
                .responses_cond
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
    }

    /// Block until a channel event whose code is in `ok_codes` arrives.
    /// Failure codes surface as errors instead: transfer failures as
    /// [`AntError::TransferFailed`], a search timeout as
    /// [`AntError::SearchTimeout`].
    pub fn wait_for_event(&self, ok_codes: &[u8], timeout: Duration) -> Result<ChannelEvent, AntError> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.events);
        loop {
            let mut i = 0;
            while i < queue.len() {
                let code = queue[i].code;
                if ok_codes.contains(&code) {
                    return Ok(queue.remove(i).unwrap());
                }
                match code {
                    EVENT_TRANSFER_TX_FAILED | EVENT_TRANSFER_RX_FAILED | EVENT_RX_FAIL => {
                        let _ = queue.remove(i);
                        return Err(AntError::TransferFailed(code));
                    }
                    EVENT_RX_SEARCH_TIMEOUT => {
                        let _ = queue.remove(i);
                        return Err(AntError::SearchTimeout);
                    }
                    _ => i += 1,
                }
            }
            let now = Instant::now();
            if now >= deadline || !self.is_running() {
                return Err(AntError::EventTimeout);
            }
            let (guard, _) = self
                .events_cond
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            queue = guard;
        }
    }

    fn set_state(&self, channel: u8, state: ChannelState) {
        if let Some(slot) = lock(&self.states).get(&channel) {
            *lock(slot) = state;
        }
    }

    fn set_tracking_if_searching(&self, channel: u8) {
        if let Some(slot) = lock(&self.states).get(&channel) {
            let mut state = lock(slot);
            if *state == ChannelState::Searching {
                *state = ChannelState::Tracking;
            }
        }
    }
}

/// Owns the driver and the reader thread.
pub(crate) struct Transport {
    driver: Arc<dyn Driver>,
    shared: Arc<TransportShared>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Transport {
    /// Spawn the reader thread. Data frames are forwarded through `data_tx`
    /// to the node's dispatch loop; identity responses update `info`.
    pub fn start(
        driver: Arc<dyn Driver>,
        data_tx: Sender<DataMessage>,
        info: Arc<Mutex<NodeInfo>>,
    ) -> Self {
        let shared = Arc::new(TransportShared::new());
        let reader = {
            let driver = driver.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("antlink.reader".into())
                .spawn(move || reader_loop(driver, shared, data_tx, info))
                .unwrap_or_else(|e| panic!("failed to spawn reader thread: {}", e))
        };
        Self {
            driver,
            shared,
            reader: Mutex::new(Some(reader)),
        }
    }

    pub fn shared(&self) -> Arc<TransportShared> {
        self.shared.clone()
    }

    /// Write a message to the radio immediately, from the calling thread.
    pub fn write(&self, msg: &AntMessage) -> Result<(), AntError> {
        debug!("write message {:#04x}, {} bytes", msg.id, msg.data.len());
        self.driver.write(&encode_message(msg))?;
        Ok(())
    }

    /// Queue a message for transmission at the next broadcast tick.
    pub fn write_in_timeslot(&self, msg: AntMessage) {
        lock(&self.shared.outgoing).push_back(msg);
    }

    /// Queue a complete burst group atomically. The reader releases the
    /// whole group in one timeslot.
    pub fn write_burst_in_timeslot(&self, msgs: Vec<AntMessage>) {
        let mut queue = lock(&self.shared.outgoing);
        queue.extend(msgs);
    }

    /// Register the state slot the reader updates for `channel`.
    pub fn register_channel(&self, channel: u8, state: Arc<Mutex<ChannelState>>) {
        lock(&self.shared.states).insert(channel, state);
    }

    pub fn unregister_channel(&self, channel: u8) {
        lock(&self.shared.states).remove(&channel);
    }

    /// Stop the reader thread and release the driver. Idempotent.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::Relaxed) {
            debug!("stopping transport");
            if let Some(handle) = lock(&self.reader).take() {
                let _ = handle.join();
            }
            self.driver.close();
            // Unblock any stragglers still parked on the condvars
            self.shared.responses_cond.notify_all();
            self.shared.events_cond.notify_all();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

fn reader_loop(
    driver: Arc<dyn Driver>,
    shared: Arc<TransportShared>,
    data_tx: Sender<DataMessage>,
    info: Arc<Mutex<NodeInfo>>,
) {
    info!("transport reader started");

    let mut recv_buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut last_broadcast: HashMap<u8, Vec<u8>> = HashMap::new();
    let mut bursts: HashMap<u8, Vec<u8>> = HashMap::new();
    let mut consecutive_errors = 0u32;

    while shared.is_running() {
        let n = match driver.read(&mut chunk) {
            Ok(n) => {
                consecutive_errors = 0;
                n
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(
                    "reader USB error ({}/{}): {}",
                    consecutive_errors, MAX_CONSECUTIVE_READ_ERRORS, e
                );
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!("reader: too many consecutive USB errors, exiting");
                    break;
                }
                let backoff = Duration::from_millis((consecutive_errors as u64 * 100).min(1000));
                std::thread::sleep(backoff);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        recv_buffer.extend_from_slice(&chunk[..n]);

        loop {
            match next_message(&mut recv_buffer) {
                Ok(Some(msg)) => handle_message(
                    &msg,
                    &*driver,
                    &shared,
                    &data_tx,
                    &info,
                    &mut last_broadcast,
                    &mut bursts,
                ),
                Ok(None) => break,
                // Bad bytes were consumed by the decoder; keep going
                Err(e) => warn!("skipping bad frame: {}", e),
            }
        }
    }

    info!("transport reader stopped");
}

fn handle_message(
    msg: &AntMessage,
    driver: &dyn Driver,
    shared: &TransportShared,
    data_tx: &Sender<DataMessage>,
    info: &Arc<Mutex<NodeInfo>>,
    last_broadcast: &mut HashMap<u8, Vec<u8>>,
    bursts: &mut HashMap<u8, Vec<u8>>,
) {
    match msg.id {
        MSG_STARTUP | MSG_SERIAL_ERROR => {
            debug!("startup/serial-error notification {:#04x}", msg.id);
            shared.push_response(Response {
                channel: None,
                id: msg.id,
                code: None,
                data: msg.data.clone(),
            });
        }
        MSG_ANT_VERSION | MSG_CAPABILITIES | MSG_SERIAL_NUMBER => {
            update_node_info(msg, info);
            shared.push_response(Response {
                channel: None,
                id: msg.id,
                code: None,
                data: msg.data.clone(),
            });
        }
        MSG_ENABLE_EXT_RX | MSG_UNASSIGN_CHANNEL | MSG_CLOSE_CHANNEL => {
            shared.push_response(Response {
                channel: None,
                id: msg.id,
                code: None,
                data: msg.data.clone(),
            });
        }
        MSG_CHANNEL_STATUS | MSG_CHANNEL_ID => {
            if msg.data.is_empty() {
                warn!("empty payload for requested message {:#04x}", msg.id);
                return;
            }
            shared.push_response(Response {
                channel: Some(msg.data[0]),
                id: msg.id,
                code: None,
                data: msg.data[1..].to_vec(),
            });
        }
        MSG_CHANNEL_RESPONSE => {
            if msg.data.len() < 3 {
                warn!("short RESPONSE_CHANNEL payload: {:?}", msg.data);
                return;
            }
            let channel = msg.data[0];
            if msg.data[1] != 0x01 {
                // Ack for a configuration/control write
                shared.push_response(Response {
                    channel: Some(channel),
                    id: msg.data[1],
                    code: Some(msg.data[2]),
                    data: msg.data[2..].to_vec(),
                });
            } else {
                // Channel event
                let code = msg.data[2];
                if code == EVENT_TX {
                    // Master timeslot: hand to the dispatch loop so the
                    // profile can supply its next page
                    let _ = data_tx.send(DataMessage {
                        kind: DataKind::BroadcastTx,
                        channel,
                        data: msg.data[2..].to_vec(),
                    });
                } else {
                    match code {
                        EVENT_RX_SEARCH_TIMEOUT | EVENT_CHANNEL_CLOSED => {
                            shared.set_state(channel, ChannelState::Closed)
                        }
                        EVENT_RX_FAIL_GO_TO_SEARCH => {
                            shared.set_state(channel, ChannelState::Searching)
                        }
                        _ => {}
                    }
                    shared.push_event(ChannelEvent {
                        channel,
                        code,
                        data: msg.data[2..].to_vec(),
                    });
                }
            }
        }
        MSG_BROADCAST_DATA => {
            if msg.data.len() < 2 {
                warn!("short broadcast payload: {:?}", msg.data);
                return;
            }
            let channel = msg.data[0];
            let payload = &msg.data[1..];

            // Resent data only indicates a new channel timeslot
            let duplicate = last_broadcast
                .get(&channel)
                .map_or(false, |last| last.as_slice() == payload);
            if duplicate {
                debug!("no new data this period on channel {}", channel);
            } else {
                shared.set_tracking_if_searching(channel);
                let _ = data_tx.send(DataMessage {
                    kind: DataKind::Broadcast,
                    channel,
                    data: payload.to_vec(),
                });
                last_broadcast.insert(channel, payload.to_vec());
            }

            // A broadcast marks a timeslot boundary; the radio accepts one
            // queued acknowledged frame or one burst group now
            drain_timeslot(driver, shared);
        }
        MSG_ACKNOWLEDGED_DATA => {
            if msg.data.len() < 2 {
                warn!("short acknowledged payload: {:?}", msg.data);
                return;
            }
            let _ = data_tx.send(DataMessage {
                kind: DataKind::Acknowledge,
                channel: msg.data[0],
                data: msg.data[1..].to_vec(),
            });
        }
        MSG_BURST_TRANSFER_DATA => {
            if msg.data.len() < 2 {
                warn!("short burst payload: {:?}", msg.data);
                return;
            }
            let sequence = msg.data[0] >> 5;
            let channel = msg.data[0] & 0x1F;
            let payload = &msg.data[1..];

            // Low two bits are zero only on the first packet (a lone-packet
            // burst is sequence 0b100)
            if sequence & 0b011 == 0 {
                bursts.insert(channel, payload.to_vec());
            } else {
                match bursts.get_mut(&channel) {
                    Some(buffer) => buffer.extend_from_slice(payload),
                    None => {
                        // Continuation without a first packet
                        warn!(
                            "burst continuation (seq {}) on channel {} with no start, dropping",
                            sequence, channel
                        );
                        return;
                    }
                }
            }

            // Bit 2 marks the last packet
            if sequence & 0b100 != 0 {
                if let Some(buffer) = bursts.remove(&channel) {
                    let _ = data_tx.send(DataMessage {
                        kind: DataKind::Burst,
                        channel,
                        data: buffer,
                    });
                }
            }
        }
        other => warn!("unknown message id {:#04x}: {:?}", other, msg.data),
    }
}

/// Pop at most one acknowledged frame, or one complete burst group, and
/// write it out. Called on every observed broadcast tick.
fn drain_timeslot(driver: &dyn Driver, shared: &TransportShared) {
    let mut queue = lock(&shared.outgoing);
    while let Some(msg) = queue.pop_front() {
        if let Err(e) = driver.write(&encode_message(&msg)) {
            warn!("timeslot write failed: {}", e);
            break;
        }
        debug!("sent queued message {:#04x} in timeslot", msg.id);
        // Burst packets keep flowing until the one with the last-packet bit
        if msg.id != MSG_BURST_TRANSFER_DATA || msg.data[0] & 0x80 != 0 {
            break;
        }
    }
}

fn update_node_info(msg: &AntMessage, info: &Arc<Mutex<NodeInfo>>) {
    let mut info = lock(info);
    match msg.id {
        MSG_CAPABILITIES => {
            if let Some(caps) = Capabilities::parse(&msg.data) {
                info!(
                    "capabilities: max_channels {}, max_networks {}",
                    caps.max_channels, caps.max_networks
                );
                info.capabilities = Some(caps);
            } else {
                warn!("short capabilities payload: {:?}", msg.data);
            }
        }
        MSG_SERIAL_NUMBER => {
            if msg.data.len() >= 4 {
                let serial = u32::from_le_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]);
                info!("serial {}", serial);
                info.serial = Some(serial);
            }
        }
        MSG_ANT_VERSION => {
            let version: String = msg
                .data
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            info!("ant_version {}", version);
            info.ant_version = Some(version);
        }
        _ => {}
    }
}
