//! The top-level node: owns the transport, the network-key and channel
//! tables, and the dispatch loop that routes data frames to per-channel
//! callbacks.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::capabilities::{Capabilities, NodeInfo};
use crate::channel::{Channel, ChannelType, RESPONSE_TIMEOUT};
use crate::driver::Driver;
use crate::error::AntError;
use crate::message::*;
use crate::transport::{ChannelEvent, ChannelState, DataMessage, Response, Transport, TransportShared};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A connected ANT radio. Creating a node resets the radio and requests its
/// capabilities and identity; those populate asynchronously as the responses
/// arrive.
pub struct Node {
    transport: Arc<Transport>,
    shared: Arc<TransportShared>,
    info: Arc<Mutex<NodeInfo>>,
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
    networks: Mutex<Vec<Option<[u8; 8]>>>,
    data_rx: Mutex<Option<Receiver<DataMessage>>>,
    running: AtomicBool,
}

impl Node {
    /// Open the first available USB radio and build a node on it.
    pub fn open() -> Result<Self, AntError> {
        let driver = crate::driver::UsbDriver::open()?;
        Self::with_driver(Arc::new(driver))
    }

    /// Build a node on an injected driver.
    pub fn with_driver(driver: Arc<dyn Driver>) -> Result<Self, AntError> {
        let (data_tx, data_rx) = mpsc::channel();
        let info = Arc::new(Mutex::new(NodeInfo::default()));
        let transport = Arc::new(Transport::start(driver, data_tx, info.clone()));
        let shared = transport.shared();

        let node = Self {
            transport,
            shared,
            info,
            channels: Mutex::new(Vec::new()),
            networks: Mutex::new(Vec::new()),
            data_rx: Mutex::new(Some(data_rx)),
            running: AtomicBool::new(true),
        };
        node.reset_system()?;
        node.request_identity()?;
        Ok(node)
    }

    fn reset_system(&self) -> Result<(), AntError> {
        self.transport
            .write(&AntMessage::new(MSG_SYSTEM_RESET, vec![0x00]))?;
        // The radio reports back with a startup notification once it is up
        // again; older sticks stay silent, so a timeout here is fine
        let _ = self
            .shared
            .wait_for_special(MSG_STARTUP, Duration::from_millis(600));
        Ok(())
    }

    /// Fire off the capability/identity requests without waiting, so they
    /// resolve while the caller configures channels.
    fn request_identity(&self) -> Result<(), AntError> {
        for id in [MSG_CAPABILITIES, MSG_SERIAL_NUMBER, MSG_ANT_VERSION] {
            self.transport
                .write(&AntMessage::new(MSG_REQUEST_MESSAGE, vec![0x00, id]))?;
        }
        Ok(())
    }

    /// Snapshot of the capability/identity data received so far.
    pub fn info(&self) -> NodeInfo {
        lock(&self.info).clone()
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        lock(&self.info).capabilities
    }

    /// Program an 8-byte network key into a network slot.
    pub fn set_network_key(&self, network: u8, key: &[u8; 8]) -> Result<(), AntError> {
        let max_networks = lock(&self.info).max_networks();
        if network >= max_networks {
            return Err(AntError::NetworkOutOfRange(network));
        }
        let mut data = vec![network];
        data.extend_from_slice(key);
        self.transport
            .write(&AntMessage::new(MSG_SET_NETWORK_KEY, data))?;
        self.shared
            .wait_for_response(MSG_SET_NETWORK_KEY, RESPONSE_TIMEOUT)?;

        let mut networks = lock(&self.networks);
        let slot = network as usize;
        if networks.len() <= slot {
            networks.resize(slot + 1, None);
        }
        networks[slot] = Some(*key);
        Ok(())
    }

    /// Allocate the lowest free channel, assign it on the radio and return
    /// it. The node keeps ownership of the channel table; the returned
    /// handle shares the same channel.
    pub fn new_channel(
        &self,
        channel_type: ChannelType,
        network_number: u8,
        ext_assign: Option<u8>,
    ) -> Result<Arc<Channel>, AntError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(AntError::Stopped);
        }
        let max_channels = lock(&self.info).max_channels();
        if network_number >= lock(&self.info).max_networks() {
            return Err(AntError::NetworkOutOfRange(network_number));
        }

        let channel = {
            let mut channels = lock(&self.channels);
            if channels.len() < max_channels as usize {
                channels.resize(max_channels as usize, None);
            }
            let index = channels
                .iter()
                .position(|slot| slot.is_none())
                .ok_or(AntError::OutOfChannels(max_channels))?;
            let channel = Channel::new(index as u8, self.transport.clone());
            channels[index] = Some(channel.clone());
            channel
        };
        info!("creating channel #{}", channel.id());

        if let Err(e) = channel.assign(channel_type, network_number, ext_assign) {
            warn!("assign of channel #{} failed: {}", channel.id(), e);
            self.forget_channel(channel.id());
            return Err(e);
        }
        Ok(channel)
    }

    /// Close, unassign and drop a channel.
    pub fn remove_channel(&self, channel: &Arc<Channel>) -> Result<(), AntError> {
        info!("removing channel #{}", channel.id());
        let result = channel.close().and_then(|_| channel.unassign());
        self.forget_channel(channel.id());
        result
    }

    fn forget_channel(&self, id: u8) {
        let mut channels = lock(&self.channels);
        if let Some(slot) = channels.get_mut(id as usize) {
            if let Some(channel) = slot.take() {
                channel.release();
            }
        }
    }

    /// Request a non-channel message (capabilities, serial, version) and
    /// wait for the reply.
    pub fn request_message(&self, message_id: u8) -> Result<Response, AntError> {
        self.transport.write(&AntMessage::new(
            MSG_REQUEST_MESSAGE,
            vec![0x00, message_id],
        ))?;
        self.shared.wait_for_special(message_id, RESPONSE_TIMEOUT)
    }

    /// Block until a response to `message_id` arrives.
    pub fn wait_for_response(&self, message_id: u8) -> Result<Response, AntError> {
        self.shared.wait_for_response(message_id, RESPONSE_TIMEOUT)
    }

    /// Block until a channel event with one of `ok_codes` arrives.
    pub fn wait_for_event(&self, ok_codes: &[u8]) -> Result<ChannelEvent, AntError> {
        self.shared.wait_for_event(ok_codes, RESPONSE_TIMEOUT)
    }

    /// Run the dispatch loop on the calling thread: consume routed data
    /// frames and invoke the owning channel's callbacks. Returns when
    /// [`Node::stop`] is called.
    pub fn start(&self) {
        let receiver = lock(&self.data_rx).take();
        let Some(receiver) = receiver else {
            warn!("dispatch loop already started once");
            return;
        };
        info!("dispatch loop started");

        while self.running.load(Ordering::Relaxed) {
            match receiver.recv_timeout(Duration::from_secs(1)) {
                Ok(data) => {
                    let channel = lock(&self.channels)
                        .get(data.channel as usize)
                        .and_then(|slot| slot.clone());
                    match channel {
                        Some(channel) => channel.dispatch(data.kind, &data.data),
                        None => debug!("data for unregistered channel {}", data.channel),
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("dispatch loop stopped");
    }

    /// Stop the node: close open channels best-effort, stop the transport
    /// and release the driver, and let the dispatch loop drain out.
    /// Idempotent.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            debug!("stopping node");
            let channels: Vec<Arc<Channel>> =
                lock(&self.channels).iter().flatten().cloned().collect();
            for channel in channels {
                if matches!(
                    channel.state(),
                    ChannelState::Searching | ChannelState::Tracking
                ) {
                    if let Err(e) = channel.close() {
                        warn!("closing channel #{} on stop: {}", channel.id(), e);
                    }
                }
            }
            self.transport.stop();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{wait_until, MockDriver};

    /// Replies like a freshly plugged ANTUSB-m: startup notification after
    /// reset, capabilities/serial/version when requested, no-error acks for
    /// everything channel-related.
    fn radio_responder(msg: &AntMessage) -> Vec<AntMessage> {
        match msg.id {
            MSG_SYSTEM_RESET => vec![AntMessage::new(MSG_STARTUP, vec![0x20])],
            MSG_REQUEST_MESSAGE => match msg.data[1] {
                MSG_CAPABILITIES => {
                    vec![AntMessage::new(MSG_CAPABILITIES, vec![8, 3, 0, 0x09, 0x46, 0])]
                }
                MSG_SERIAL_NUMBER => vec![AntMessage::new(
                    MSG_SERIAL_NUMBER,
                    vec![0x15, 0xCD, 0x5B, 0x07],
                )],
                MSG_ANT_VERSION => vec![AntMessage::new(MSG_ANT_VERSION, b"AJK1.05".to_vec())],
                _ => vec![],
            },
            MSG_SET_NETWORK_KEY => vec![AntMessage::new(
                MSG_CHANNEL_RESPONSE,
                vec![0x00, MSG_SET_NETWORK_KEY, RESPONSE_NO_ERROR],
            )],
            MSG_ASSIGN_CHANNEL
            | MSG_UNASSIGN_CHANNEL
            | MSG_SET_CHANNEL_ID
            | MSG_SET_CHANNEL_PERIOD
            | MSG_SET_CHANNEL_SEARCH_TIMEOUT
            | MSG_SET_CHANNEL_RF_FREQ
            | MSG_ENABLE_EXT_RX
            | MSG_OPEN_CHANNEL
            | MSG_OPEN_RX_SCAN_MODE => vec![AntMessage::new(
                MSG_CHANNEL_RESPONSE,
                vec![msg.data[0], msg.id, RESPONSE_NO_ERROR],
            )],
            MSG_CLOSE_CHANNEL => vec![
                AntMessage::new(
                    MSG_CHANNEL_RESPONSE,
                    vec![msg.data[0], msg.id, RESPONSE_NO_ERROR],
                ),
                AntMessage::new(
                    MSG_CHANNEL_RESPONSE,
                    vec![msg.data[0], 0x01, EVENT_CHANNEL_CLOSED],
                ),
            ],
            _ => vec![],
        }
    }

    fn test_node() -> (Arc<MockDriver>, Node) {
        let driver = MockDriver::new();
        driver.set_responder(radio_responder);
        let node = Node::with_driver(driver.clone() as Arc<dyn Driver>).unwrap();
        (driver, node)
    }

    #[test]
    fn startup_populates_capabilities() {
        let (_driver, node) = test_node();
        assert!(wait_until(|| node.capabilities().is_some(), 1000));
        let info = node.info();
        assert_eq!(info.max_channels(), 8);
        assert_eq!(info.max_networks(), 3);
        assert_eq!(info.serial, Some(123456789));
        assert_eq!(info.ant_version.as_deref(), Some("AJK1.05"));
        node.stop();
    }

    #[test]
    fn set_network_key_validates_range() {
        let (driver, node) = test_node();
        assert!(wait_until(|| node.capabilities().is_some(), 1000));

        node.set_network_key(0, &[0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45])
            .unwrap();
        let key_write = driver
            .written()
            .into_iter()
            .find(|m| m.id == MSG_SET_NETWORK_KEY)
            .unwrap();
        assert_eq!(
            key_write.data,
            vec![0x00, 0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45]
        );

        // Radio reported 3 networks
        assert!(matches!(
            node.set_network_key(3, &[0; 8]),
            Err(AntError::NetworkOutOfRange(3))
        ));
        node.stop();
    }

    #[test]
    fn channels_allocate_lowest_free_index() {
        let (_driver, node) = test_node();
        assert!(wait_until(|| node.capabilities().is_some(), 1000));

        let a = node
            .new_channel(ChannelType::BidirectionalReceive, 0, None)
            .unwrap();
        let b = node
            .new_channel(ChannelType::BidirectionalReceive, 0, None)
            .unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);

        node.remove_channel(&a).unwrap();
        let c = node
            .new_channel(ChannelType::BidirectionalReceive, 0, None)
            .unwrap();
        assert_eq!(c.id(), 0, "freed slot is reused first");
        node.stop();
    }

    #[test]
    fn channel_table_exhaustion() {
        let (_driver, node) = test_node();
        assert!(wait_until(|| node.capabilities().is_some(), 1000));

        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(
                node.new_channel(ChannelType::BidirectionalReceive, 0, None)
                    .unwrap(),
            );
        }
        assert!(matches!(
            node.new_channel(ChannelType::BidirectionalReceive, 0, None),
            Err(AntError::OutOfChannels(8))
        ));
        node.stop();
    }

    #[test]
    fn dispatch_loop_routes_broadcasts_to_callback() {
        let (driver, node) = test_node();
        let node = Arc::new(node);
        assert!(wait_until(|| node.capabilities().is_some(), 1000));

        let channel = node
            .new_channel(ChannelType::BidirectionalReceive, 0, None)
            .unwrap();
        let (seen_tx, seen_rx) = mpsc::channel();
        channel.on_broadcast(move |data| {
            let _ = seen_tx.send(data.to_vec());
        });

        let dispatcher = {
            let node = node.clone();
            std::thread::spawn(move || node.start())
        };

        let mut payload = vec![0x00];
        payload.extend_from_slice(&[0x04, 0, 0, 0, 0, 0, 0, 99]);
        driver.push_message(&AntMessage::new(MSG_BROADCAST_DATA, payload));

        let seen = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen[7], 99);

        node.stop();
        dispatcher.join().unwrap();
    }

    #[test]
    fn stop_is_idempotent() {
        let (_driver, node) = test_node();
        node.stop();
        node.stop();
    }
}
