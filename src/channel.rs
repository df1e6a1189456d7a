//! Per-channel API: the configuration protocol, open/close and scan mode,
//! broadcast/acknowledged/burst transmission, and the data callbacks the
//! node's dispatch loop invokes.

use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::AntError;
use crate::message::*;
use crate::transport::{ChannelState, DataKind, Response, Transport, TransportShared};

/// Default window for configuration responses.
pub(crate) const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Window for TX-complete events on acknowledged and burst transfers.
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel assignment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelType {
    /// Slave: receive from a master
    BidirectionalReceive = 0x00,
    /// Master: broadcast a profile
    BidirectionalTransmit = 0x10,
    SharedBidirectionalReceive = 0x20,
    SharedBidirectionalTransmit = 0x30,
    UnidirectionalReceiveOnly = 0x40,
    UnidirectionalTransmitOnly = 0x50,
}

/// Channel configuration. Captured on the channel as the individual
/// configuration calls are made.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub channel_type: ChannelType,
    pub network_number: u8,
    /// 0 = wildcard
    pub device_number: u16,
    pub device_type: u8,
    /// 0 = wildcard
    pub transmission_type: u8,
    /// Message period in 1/32768 s units
    pub period: u16,
    /// MHz offset from 2400
    pub rf_frequency: u8,
    /// Search timeout in 2.5 s units (0xFF = forever)
    pub search_timeout: u8,
    pub extended_rx_enabled: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_type: ChannelType::BidirectionalReceive,
            network_number: 0,
            device_number: 0,
            device_type: 0,
            transmission_type: 0,
            period: 8070,
            rf_frequency: 57,
            search_timeout: 12,
            extended_rx_enabled: false,
        }
    }
}

pub type DataCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Default)]
struct Callbacks {
    broadcast: Option<DataCallback>,
    burst: Option<DataCallback>,
    acknowledge: Option<DataCallback>,
    broadcast_tx: Option<DataCallback>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One logical channel on the radio. Created through `Node::new_channel`;
/// the node owns the channel table, the channel holds only shared handles
/// back to the transport.
pub struct Channel {
    id: u8,
    transport: Arc<Transport>,
    shared: Arc<TransportShared>,
    state: Arc<Mutex<ChannelState>>,
    config: Mutex<ChannelConfig>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(id: u8, transport: Arc<Transport>) -> Arc<Self> {
        let shared = transport.shared();
        let state = Arc::new(Mutex::new(ChannelState::Unassigned));
        transport.register_channel(id, state.clone());
        Arc::new(Self {
            id,
            transport,
            shared,
            state,
            config: Mutex::new(ChannelConfig::default()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub fn config(&self) -> ChannelConfig {
        lock(&self.config).clone()
    }

    fn write_and_wait(&self, id: u8, data: Vec<u8>) -> Result<Response, AntError> {
        self.transport.write(&AntMessage::new(id, data))?;
        self.shared.wait_for_response(id, RESPONSE_TIMEOUT)
    }

    pub(crate) fn assign(
        &self,
        channel_type: ChannelType,
        network_number: u8,
        ext_assign: Option<u8>,
    ) -> Result<(), AntError> {
        let mut data = vec![self.id, channel_type as u8, network_number];
        if let Some(ext) = ext_assign {
            data.push(ext);
        }
        self.write_and_wait(MSG_ASSIGN_CHANNEL, data)?;
        {
            let mut config = lock(&self.config);
            config.channel_type = channel_type;
            config.network_number = network_number;
        }
        *lock(&self.state) = ChannelState::Assigned;
        Ok(())
    }

    pub fn unassign(&self) -> Result<(), AntError> {
        self.write_and_wait(MSG_UNASSIGN_CHANNEL, vec![self.id])?;
        *lock(&self.state) = ChannelState::Unassigned;
        Ok(())
    }

    /// Set the channel ID triple. Device number 0 searches for any master.
    pub fn set_id(
        &self,
        device_number: u16,
        device_type: u8,
        transmission_type: u8,
    ) -> Result<(), AntError> {
        let dn = device_number.to_le_bytes();
        self.write_and_wait(
            MSG_SET_CHANNEL_ID,
            vec![self.id, dn[0], dn[1], device_type, transmission_type],
        )?;
        let mut config = lock(&self.config);
        config.device_number = device_number;
        config.device_type = device_type;
        config.transmission_type = transmission_type;
        Ok(())
    }

    /// Set the message period in 1/32768 s units (e.g. 8070 for 4.06 Hz).
    pub fn set_period(&self, period: u16) -> Result<(), AntError> {
        let p = period.to_le_bytes();
        self.write_and_wait(MSG_SET_CHANNEL_PERIOD, vec![self.id, p[0], p[1]])?;
        lock(&self.config).period = period;
        Ok(())
    }

    /// Set the search timeout in 2.5 s units; 0xFF searches forever.
    pub fn set_search_timeout(&self, timeout: u8) -> Result<(), AntError> {
        self.write_and_wait(MSG_SET_CHANNEL_SEARCH_TIMEOUT, vec![self.id, timeout])?;
        lock(&self.config).search_timeout = timeout;
        Ok(())
    }

    /// Set the RF frequency as an offset in MHz from 2400.
    pub fn set_rf_freq(&self, rf_freq: u8) -> Result<(), AntError> {
        self.write_and_wait(MSG_SET_CHANNEL_RF_FREQ, vec![self.id, rf_freq])?;
        lock(&self.config).rf_frequency = rf_freq;
        Ok(())
    }

    /// Enable the extended receive header (master identity after the page).
    pub fn enable_extended_messages(&self, enable: bool) -> Result<(), AntError> {
        self.write_and_wait(MSG_ENABLE_EXT_RX, vec![self.id, enable as u8])?;
        lock(&self.config).extended_rx_enabled = enable;
        Ok(())
    }

    pub fn set_search_waveform(&self, waveform: u16) -> Result<(), AntError> {
        let w = waveform.to_le_bytes();
        self.write_and_wait(MSG_SET_SEARCH_WAVEFORM, vec![self.id, w[0], w[1]])?;
        Ok(())
    }

    /// Apply a full configuration in the canonical order.
    pub fn configure(&self, config: &ChannelConfig) -> Result<(), AntError> {
        self.set_id(
            config.device_number,
            config.device_type,
            config.transmission_type,
        )?;
        if config.extended_rx_enabled {
            self.enable_extended_messages(true)?;
        }
        self.set_period(config.period)?;
        self.set_rf_freq(config.rf_frequency)?;
        self.set_search_timeout(config.search_timeout)?;
        Ok(())
    }

    /// Open the channel; a slave starts searching for its master.
    pub fn open(&self) -> Result<(), AntError> {
        self.write_and_wait(MSG_OPEN_CHANNEL, vec![self.id])?;
        *lock(&self.state) = ChannelState::Searching;
        Ok(())
    }

    /// Open in RX scanning mode. The radio receives 100% of the time, so no
    /// other channel can be open; every master matching the channel ID mask
    /// is picked up regardless of period.
    pub fn open_rx_scan_mode(&self) -> Result<(), AntError> {
        self.write_and_wait(MSG_OPEN_RX_SCAN_MODE, vec![self.id, 0x01])?;
        *lock(&self.state) = ChannelState::Searching;
        Ok(())
    }

    /// Close the channel and wait for the radio to fully quiesce it
    /// (EVENT_CHANNEL_CLOSED).
    pub fn close(&self) -> Result<(), AntError> {
        debug!("closing channel {}", self.id);
        self.transport
            .write(&AntMessage::new(MSG_CLOSE_CHANNEL, vec![self.id]))?;
        // Only wait if the node is still consuming responses
        if self.shared.is_running() {
            self.shared
                .wait_for_response(MSG_CLOSE_CHANNEL, RESPONSE_TIMEOUT)?;
            self.shared
                .wait_for_event(&[EVENT_CHANNEL_CLOSED], RESPONSE_TIMEOUT)?;
        }
        *lock(&self.state) = ChannelState::Closed;
        Ok(())
    }

    /// Request a message (channel status, channel ID, ...) and wait for it.
    pub fn request_message(&self, message_id: u8) -> Result<Response, AntError> {
        debug!("requesting message {:#04x}", message_id);
        self.transport.write(&AntMessage::new(
            MSG_REQUEST_MESSAGE,
            vec![self.id, message_id],
        ))?;
        self.shared.wait_for_special(message_id, RESPONSE_TIMEOUT)
    }

    /// Send one 8-byte broadcast page immediately.
    pub fn send_broadcast_data(&self, data: &[u8]) -> Result<(), AntError> {
        let payload = self.data_payload(data)?;
        self.transport
            .write(&AntMessage::new(MSG_BROADCAST_DATA, payload))
    }

    /// Send one 8-byte page as an acknowledged transfer: the frame is queued
    /// for the next timeslot and the call blocks until the radio reports
    /// TRANSFER_TX_COMPLETED. A failed transfer is retried once; the second
    /// failure surfaces to the caller.
    pub fn send_acknowledged_data(&self, data: &[u8]) -> Result<(), AntError> {
        match self.acknowledged_once(data) {
            Err(AntError::TransferFailed(code)) => {
                warn!(
                    "channel {}: acknowledged send failed (event {:#04x}), retrying",
                    self.id, code
                );
                self.acknowledged_once(data)
            }
            result => result,
        }
    }

    fn acknowledged_once(&self, data: &[u8]) -> Result<(), AntError> {
        let payload = self.data_payload(data)?;
        self.transport
            .write_in_timeslot(AntMessage::new(MSG_ACKNOWLEDGED_DATA, payload));
        self.shared
            .wait_for_event(&[EVENT_TRANSFER_TX_COMPLETED], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    /// Send a multiple-of-8-byte payload as a burst transfer, queued as one
    /// atomic group for the next timeslot. Retried once on failure.
    pub fn send_burst_transfer(&self, data: &[u8]) -> Result<(), AntError> {
        if data.is_empty() || data.len() % 8 != 0 {
            return Err(AntError::ProtocolViolation(format!(
                "burst payload must be a non-empty multiple of 8 bytes, got {}",
                data.len()
            )));
        }
        match self.burst_once(data) {
            Err(AntError::TransferFailed(code)) => {
                warn!(
                    "channel {}: burst transfer failed (event {:#04x}), retrying",
                    self.id, code
                );
                self.burst_once(data)
            }
            result => result,
        }
    }

    fn burst_once(&self, data: &[u8]) -> Result<(), AntError> {
        self.transport
            .write_burst_in_timeslot(build_burst_packets(self.id, data));
        self.shared
            .wait_for_event(&[EVENT_TRANSFER_TX_START], TRANSFER_TIMEOUT)?;
        self.shared
            .wait_for_event(&[EVENT_TRANSFER_TX_COMPLETED], TRANSFER_TIMEOUT)?;
        Ok(())
    }

    fn data_payload(&self, data: &[u8]) -> Result<Vec<u8>, AntError> {
        if data.len() != 8 {
            return Err(AntError::ProtocolViolation(format!(
                "data page must be 8 bytes, got {}",
                data.len()
            )));
        }
        let mut payload = Vec::with_capacity(9);
        payload.push(self.id);
        payload.extend_from_slice(data);
        Ok(payload)
    }

    /// Install the broadcast-data callback. Receives the 8-byte page plus
    /// the extended header bytes when extended RX is enabled.
    pub fn on_broadcast(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        lock(&self.callbacks).broadcast = Some(Box::new(f));
    }

    /// Install the reassembled-burst callback.
    pub fn on_burst(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        lock(&self.callbacks).burst = Some(Box::new(f));
    }

    /// Install the acknowledged-data callback.
    pub fn on_acknowledge(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        lock(&self.callbacks).acknowledge = Some(Box::new(f));
    }

    /// Install the EVENT_TX callback (masters: supply the next page here).
    pub fn on_broadcast_tx(&self, f: impl FnMut(&[u8]) + Send + 'static) {
        lock(&self.callbacks).broadcast_tx = Some(Box::new(f));
    }

    pub(crate) fn dispatch(&self, kind: DataKind, data: &[u8]) {
        let mut callbacks = lock(&self.callbacks);
        let slot = match kind {
            DataKind::Broadcast => &mut callbacks.broadcast,
            DataKind::Burst => &mut callbacks.burst,
            DataKind::Acknowledge => &mut callbacks.acknowledge,
            DataKind::BroadcastTx => &mut callbacks.broadcast_tx,
        };
        if let Some(callback) = slot.as_mut() {
            callback(data);
        }
    }

    pub(crate) fn release(&self) {
        self.transport.unregister_channel(self.id);
    }
}

/// Split a payload into numbered burst packets: sequence 0, 1, 2, 3, 1, 2,
/// 3, ... with bit 2 set on the last packet. The low five bits of the first
/// byte carry the channel.
pub(crate) fn build_burst_packets(channel: u8, data: &[u8]) -> Vec<AntMessage> {
    let count = data.len() / 8;
    (0..count)
        .map(|i| {
            let mut sequence = if i == 0 { 0 } else { ((i - 1) % 3 + 1) as u8 };
            if i == count - 1 {
                sequence |= 0b100;
            }
            let mut payload = vec![(channel & 0x1F) | (sequence << 5)];
            payload.extend_from_slice(&data[i * 8..i * 8 + 8]);
            AntMessage::new(MSG_BURST_TRANSFER_DATA, payload)
        })
        .collect()
}
