//! The ANT-FS session engine: drives the Link, Authentication, Transport and
//! Disconnect layers over a single channel, using acknowledged sends for
//! 8-byte commands and bursts for everything larger.
//!
//! The session rides on a [`Node`] whose dispatch loop must be running (the
//! beacon and response queues are fed from the channel callbacks).

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelType};
use crate::error::{AntError, AntFsError};
use crate::fs::beacon::{Beacon, ClientDeviceState, BEACON_ID};
use crate::fs::command::{
    parse_response, AuthRequestType, Command, CommandResponse, AUTH_RESPONSE_ACCEPT,
    COMMAND_ID, DISCONNECT_RETURN_LINK, DOWNLOAD_OK, ERASE_SUCCESSFUL, UPLOAD_DATA_OK, UPLOAD_OK,
};
use crate::fs::commandpipe::{
    self, CommandPipe, CommandPipeResponse, COMMAND_PIPE_INDEX, PIPE_RESPONSE_OK, PIPE_TIME,
    TIME_FORMAT_DIRECTORY,
};
use crate::fs::crc::crc16;
use crate::fs::file::{Directory, ANTFS_EPOCH_UNIX, DIRECTORY_INDEX};
use crate::node::Node;

/// Leap-second offset clients expect baked into the transmitted time.
const UTC_TAI_OFFSET: i64 = 35;

/// Beacon period code sent in the Link command; 4 is 8 Hz, matching the
/// 4096-count channel period the session re-tunes to.
const LINK_PERIOD_CODE: u8 = 4;
const SESSION_CHANNEL_PERIOD: u16 = 4096;

/// How many beacons to re-read when the client is not yet in the state a
/// layer transition expects.
const STATE_RESYNC_BEACONS: usize = 5;

/// Session tuning. The defaults mirror a stock ANT-FS search: wildcard
/// device, RF 50 for search, RF 19 for the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host_serial: u32,
    /// Frequency the client searches on (MHz offset from 2400)
    pub search_rf_freq: u8,
    /// Frequency the Link command moves the session to
    pub session_rf_freq: u8,
    /// Device type to search for (0x01 = ANT-FS client)
    pub search_device_type: u8,
    pub beacon_timeout: Duration,
    pub command_timeout: Duration,
    pub pairing_timeout: Duration,
    /// Wall-clock ceiling on a download's silent queue-empty retries
    pub transfer_ceiling: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_serial: 1337,
            search_rf_freq: 50,
            session_rf_freq: 19,
            search_device_type: 0x01,
            beacon_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(15),
            pairing_timeout: Duration::from_secs(30),
            transfer_ceiling: Duration::from_secs(30),
        }
    }
}

/// Blocking FIFO fed by the channel callbacks.
struct SharedQueue<T> {
    items: Mutex<VecDeque<T>>,
    cond: Condvar,
}

impl<T> SharedQueue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.push_back(item);
        self.cond.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            items = guard;
        }
    }
}

/// An ANT-FS host session over one channel.
pub struct Session {
    channel: Arc<Channel>,
    config: SessionConfig,
    beacons: Arc<SharedQueue<Beacon>>,
    responses: Arc<SharedQueue<CommandResponse>>,
    last_beacon: Arc<Mutex<Option<Beacon>>>,
    sequence: AtomicU8,
}

impl Session {
    /// Allocate and configure a search channel for ANT-FS clients. The
    /// ANT-FS network key must already be programmed on network 0.
    pub fn new(node: &Node, config: SessionConfig) -> Result<Self, AntFsError> {
        let channel = node.new_channel(ChannelType::BidirectionalReceive, 0, None)?;

        let beacons = SharedQueue::new();
        let responses = SharedQueue::new();
        let last_beacon = Arc::new(Mutex::new(None));

        channel.on_broadcast(data_handler(
            beacons.clone(),
            responses.clone(),
            last_beacon.clone(),
        ));
        channel.on_burst(data_handler(
            beacons.clone(),
            responses.clone(),
            last_beacon.clone(),
        ));

        channel.set_period(SESSION_CHANNEL_PERIOD)?;
        channel.set_search_timeout(0xFF)?;
        channel.set_rf_freq(config.search_rf_freq)?;
        channel.set_search_waveform(0x0053)?;
        channel.set_id(0, config.search_device_type, 0)?;
        channel.open()?;
        info!("searching for ANT-FS clients on RF {}", config.search_rf_freq);

        Ok(Self {
            channel,
            config,
            beacons,
            responses,
            last_beacon,
            sequence: AtomicU8::new(0),
        })
    }

    /// Close and free the session channel.
    pub fn close(&self, node: &Node) -> Result<(), AntFsError> {
        node.remove_channel(&self.channel)?;
        Ok(())
    }

    /// Wait for the next beacon from a client.
    pub fn wait_for_beacon(&self) -> Result<Beacon, AntFsError> {
        self.beacons
            .pop(self.config.beacon_timeout)
            .ok_or(AntFsError::BeaconTimeout)
    }

    /// Wait until the client beacons the expected state, re-reading up to
    /// five consecutive beacons before giving up.
    pub fn wait_for_client_state(
        &self,
        expected: ClientDeviceState,
    ) -> Result<Beacon, AntFsError> {
        let mut actual = 0xFF;
        for _ in 0..STATE_RESYNC_BEACONS {
            let beacon = self.wait_for_beacon()?;
            match beacon.client_device_state() {
                Some(state) if state == expected => return Ok(beacon),
                state => {
                    debug!("client in {:?}, waiting for {:?}", state, expected);
                    actual = state.map_or(0xFF, |s| s as u8);
                }
            }
        }
        Err(AntFsError::UnexpectedClientState {
            expected: expected as u8,
            actual,
        })
    }

    /// Send the Link command and move the session to its own frequency and
    /// period. On success the client beacons Authentication.
    pub fn link(&self) -> Result<(), AntFsError> {
        self.send_command(&Command::Link {
            frequency: self.config.session_rf_freq,
            period: LINK_PERIOD_CODE,
            host_serial: self.config.host_serial,
        })?;

        self.channel.set_period(SESSION_CHANNEL_PERIOD)?;
        self.channel.set_search_timeout(3)?;
        self.channel.set_rf_freq(self.config.session_rf_freq)?;

        self.wait_for_client_state(ClientDeviceState::Authentication)?;
        info!("link established, client in authentication");
        Ok(())
    }

    /// Ask the client for its serial number and friendly name.
    pub fn authenticate_serial(&self) -> Result<(u32, String), AntFsError> {
        self.send_command(&Command::Authenticate {
            request: AuthRequestType::Serial,
            host_serial: self.config.host_serial,
            auth_string: Vec::new(),
        })?;
        match self.get_response(self.config.command_timeout)? {
            CommandResponse::Authenticate(response) => {
                Ok((response.client_serial, response.data_string()))
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Authenticate with a stored passkey. On accept the client moves to
    /// Transport.
    pub fn authenticate_passkey(&self, passkey: &[u8]) -> Result<Vec<u8>, AntFsError> {
        self.send_command(&Command::Authenticate {
            request: AuthRequestType::PasskeyExchange,
            host_serial: self.config.host_serial,
            auth_string: passkey.to_vec(),
        })?;
        self.finish_authentication(self.config.command_timeout)
    }

    /// Request pairing; the user confirms on the client within the pairing
    /// window. Returns the passkey to store for future sessions.
    pub fn authenticate_pairing(&self, friendly_name: &str) -> Result<Vec<u8>, AntFsError> {
        self.send_command(&Command::Authenticate {
            request: AuthRequestType::Pairing,
            host_serial: self.config.host_serial,
            auth_string: friendly_name.as_bytes().to_vec(),
        })?;
        self.finish_authentication(self.config.pairing_timeout)
    }

    fn finish_authentication(&self, timeout: Duration) -> Result<Vec<u8>, AntFsError> {
        match self.get_response(timeout)? {
            CommandResponse::Authenticate(response) => {
                if response.response == AUTH_RESPONSE_ACCEPT {
                    self.wait_for_client_state(ClientDeviceState::Transport)?;
                    info!("authenticated, client in transport");
                    Ok(response.data)
                } else {
                    // Rejected: drop back to link
                    let _ = self.disconnect();
                    Err(AntFsError::AuthenticationFailed(response.response))
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Download the file at `index`, following the client's chunking and CRC
    /// continuation. Queue-empty timeouts retry silently from the current
    /// offset until the configured wall-clock ceiling.
    pub fn download(
        &self,
        index: u16,
        mut progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<Vec<u8>, AntFsError> {
        let mut offset: u32 = 0;
        let mut initial = true;
        let mut crc_seed: u16 = 0;
        let mut accumulated: Vec<u8> = Vec::new();
        let deadline = Instant::now() + self.config.transfer_ceiling;

        loop {
            debug!("download {}, offset {}, seed {:#06x}", index, offset, crc_seed);
            self.send_command(&Command::DownloadRequest {
                index,
                offset,
                initial,
                crc_seed,
                max_block_size: 0,
            })?;

            let response = match self.get_response(self.config.command_timeout) {
                Ok(response) => response,
                Err(AntFsError::CommandTimeout) => {
                    if Instant::now() >= deadline {
                        return Err(AntFsError::CommandTimeout);
                    }
                    debug!("download {} timed out, retrying at offset {}", index, offset);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let response = match response {
                CommandResponse::Download(response) => response,
                other => return Err(unexpected(&other)),
            };
            if response.response != DOWNLOAD_OK {
                return Err(AntFsError::DownloadFailed(response.response));
            }

            let end = response.offset as usize + response.remaining as usize;
            if accumulated.len() < end {
                accumulated.resize(end, 0);
            }
            accumulated[response.offset as usize..end].copy_from_slice(&response.data);

            if let Some(callback) = progress.as_mut() {
                if response.size != 0 {
                    callback(end as f32 / response.size as f32);
                }
            }
            if end as u32 == response.size {
                return Ok(accumulated);
            }
            offset = end as u32;
            crc_seed = response.crc;
            initial = false;
        }
    }

    /// Download and parse the directory (file index 0).
    pub fn download_directory(&self) -> Result<Directory, AntFsError> {
        let data = self.download(DIRECTORY_INDEX, None)?;
        Directory::parse(&data)
    }

    /// Upload `data` to the file at `index`, in the block sizes the client
    /// requests, with the rolling CRC the protocol requires.
    pub fn upload(
        &self,
        index: u16,
        data: &[u8],
        mut progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<(), AntFsError> {
        let mut iteration = 0u32;
        loop {
            // First round starts at 0, later rounds continue from the
            // client's last data offset
            let request_offset = if iteration == 0 { 0 } else { 0xFFFF_FFFF };
            self.send_command(&Command::UploadRequest {
                index,
                max_size: data.len() as u32,
                offset: request_offset,
            })?;

            let response = match self.get_response(self.config.command_timeout)? {
                CommandResponse::Upload(response) => response,
                other => return Err(unexpected(&other)),
            };
            if response.response != UPLOAD_OK {
                return Err(AntFsError::UploadFailed(response.response));
            }
            let offset = response.last_data_offset as usize;
            let max_block = response.max_block_size as usize;
            if max_block == 0 || offset > data.len() {
                return Err(AntFsError::BadFrame(format!(
                    "client offered offset {} / block size {}",
                    offset, max_block
                )));
            }

            let slice = &data[offset..data.len().min(offset + max_block)];
            let crc_seed = response.crc;
            let crc_value = crc16(slice, crc_seed);
            self.send_command(&Command::UploadData {
                crc_seed,
                offset: offset as u32,
                data: slice.to_vec(),
                crc: crc_value,
            })?;

            match self.get_response(self.config.command_timeout)? {
                CommandResponse::UploadData(response) => {
                    if response.response != UPLOAD_DATA_OK {
                        return Err(AntFsError::UploadFailed(response.response));
                    }
                }
                other => return Err(unexpected(&other)),
            }

            if let Some(callback) = progress.as_mut() {
                if !data.is_empty() {
                    callback((offset + slice.len()) as f32 / data.len() as f32);
                }
            }
            if offset + slice.len() >= data.len() {
                return Ok(());
            }
            iteration += 1;
        }
    }

    /// Erase the file at `index`.
    pub fn erase(&self, index: u16) -> Result<(), AntFsError> {
        self.send_command(&Command::EraseRequest { index })?;
        match self.get_response(self.config.command_timeout)? {
            CommandResponse::Erase(response) => {
                if response.response == ERASE_SUCCESSFUL {
                    Ok(())
                } else {
                    Err(AntFsError::EraseFailed(response.response))
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Create a file of `file_type` through the command pipe and upload its
    /// body to the index the client assigns. Returns that index.
    pub fn create_file(
        &self,
        file_type: u8,
        data: &[u8],
        progress: Option<&mut dyn FnMut(f32)>,
    ) -> Result<u16, AntFsError> {
        let packet = CommandPipe::CreateFile {
            sequence: self.next_sequence(),
            size: data.len() as u32,
            data_type: 0x80,
            identifier: [file_type, 0x00, 0x00],
            identifier_mask: [0x00, 0xFF, 0xFF],
        };
        self.upload(COMMAND_PIPE_INDEX, &packet.encode(), None)?;

        match self.read_command_pipe()? {
            CommandPipeResponse::CreateFile(response) => {
                if response.response != PIPE_RESPONSE_OK {
                    return Err(AntFsError::CreateFileFailed(response.response));
                }
                info!("created file at index {}", response.index);
                self.upload(response.index, data, progress)?;
                Ok(response.index)
            }
            CommandPipeResponse::Response(response) => {
                Err(AntFsError::CreateFileFailed(response.response))
            }
        }
    }

    /// Set the client clock to now.
    pub fn set_time(&self) -> Result<(), AntFsError> {
        self.set_time_to(Utc::now())
    }

    /// Set the client clock to an explicit time.
    pub fn set_time_to(&self, time: DateTime<Utc>) -> Result<(), AntFsError> {
        // Clients expect the fixed UTC-TAI offset baked into the count
        let seconds = time.timestamp() - ANTFS_EPOCH_UNIX + UTC_TAI_OFFSET;
        let packet = CommandPipe::Time {
            sequence: self.next_sequence(),
            current_time: seconds as u32,
            system_time: 0,
            time_format: TIME_FORMAT_DIRECTORY,
        };
        self.upload(COMMAND_PIPE_INDEX, &packet.encode(), None)?;

        match self.read_command_pipe()? {
            CommandPipeResponse::Response(response)
                if response.request_id == PIPE_TIME && response.response == PIPE_RESPONSE_OK =>
            {
                Ok(())
            }
            CommandPipeResponse::Response(response) => {
                Err(AntFsError::TimeError(response.response))
            }
            other => Err(AntFsError::BadFrame(format!(
                "unexpected command pipe reply: {:?}",
                other
            ))),
        }
    }

    /// Tell the client to drop back to the Link layer.
    pub fn disconnect(&self) -> Result<(), AntFsError> {
        self.send_command(&Command::Disconnect {
            disconnect_type: DISCONNECT_RETURN_LINK,
            time_duration: 0,
            application_duration: 0,
        })
    }

    fn read_command_pipe(&self) -> Result<CommandPipeResponse, AntFsError> {
        let data = self.download(COMMAND_PIPE_INDEX, None)?;
        commandpipe::parse(&data)
    }

    fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Send a command: acknowledged for one page, burst for more. The
    /// channel already retries a failed transfer once; a second failure
    /// aborts the session back to Link.
    fn send_command(&self, command: &Command) -> Result<(), AntFsError> {
        self.wait_until_not_busy()?;
        let bytes = command.encode();
        let result = if bytes.len() == 8 {
            self.channel.send_acknowledged_data(&bytes)
        } else {
            self.channel.send_burst_transfer(&bytes)
        };
        match result {
            Ok(()) => Ok(()),
            Err(AntError::TransferFailed(code)) => {
                warn!("transfer failed twice, dropping session back to link");
                let disconnect = Command::Disconnect {
                    disconnect_type: DISCONNECT_RETURN_LINK,
                    time_duration: 0,
                    application_duration: 0,
                };
                let _ = self.channel.send_acknowledged_data(&disconnect.encode());
                Err(AntFsError::Ant(AntError::TransferFailed(code)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// A Busy beacon suspends commands until the client reports otherwise.
    fn wait_until_not_busy(&self) -> Result<(), AntFsError> {
        let deadline = Instant::now() + self.config.beacon_timeout;
        loop {
            let busy = self
                .last_beacon
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .map_or(false, |b| {
                    b.client_device_state() == Some(ClientDeviceState::Busy)
                });
            if !busy {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AntFsError::BeaconTimeout);
            }
            debug!("client busy, holding command");
            if self.beacons.pop(deadline - now).is_none() {
                return Err(AntFsError::BeaconTimeout);
            }
        }
    }

    fn get_response(&self, timeout: Duration) -> Result<CommandResponse, AntFsError> {
        self.responses
            .pop(timeout)
            .ok_or(AntFsError::CommandTimeout)
    }
}

fn unexpected(response: &CommandResponse) -> AntFsError {
    AntFsError::BadFrame(format!("unexpected response: {:?}", response))
}

/// Build the channel callback that splits incoming frames into beacons and
/// command responses. A burst from the client is its beacon followed by the
/// response bytes.
fn data_handler(
    beacons: Arc<SharedQueue<Beacon>>,
    responses: Arc<SharedQueue<CommandResponse>>,
    last_beacon: Arc<Mutex<Option<Beacon>>>,
) -> impl FnMut(&[u8]) + Send + 'static {
    move |data: &[u8]| {
        if data.is_empty() {
            return;
        }
        if data[0] == BEACON_ID && data.len() >= 8 {
            match Beacon::parse(&data[..8]) {
                Ok(beacon) => {
                    *last_beacon.lock().unwrap_or_else(|e| e.into_inner()) = Some(beacon);
                    beacons.push(beacon);
                }
                Err(e) => warn!("bad beacon: {}", e),
            }
            if data.len() > 8 && data[8] == COMMAND_ID {
                push_response(&responses, &data[8..]);
            }
        } else if data[0] == COMMAND_ID {
            push_response(&responses, data);
        }
    }
}

fn push_response(responses: &SharedQueue<CommandResponse>, data: &[u8]) {
    match parse_response(data) {
        Ok(response) => responses.push(response),
        Err(e) => warn!("bad command response: {}", e),
    }
}
