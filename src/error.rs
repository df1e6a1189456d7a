use thiserror::Error;

/// Errors from the byte-level radio link.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no compatible ANT radio found")]
    NotFound,
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("driver error: {0}")]
    Io(String),
    #[error("write timed out")]
    Timeout,
}

/// Errors from the ANT protocol layers (framing, transport, node, channel).
#[derive(Error, Debug)]
pub enum AntError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("bad sync byte {0:#04x}")]
    BadSync(u8),
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    BadChecksum { expected: u8, actual: u8 },
    #[error("timed out waiting for response to message {0:#04x}")]
    ResponseTimeout(u8),
    #[error("timed out waiting for a channel event")]
    EventTimeout,
    #[error("transfer failed (event code {0:#04x})")]
    TransferFailed(u8),
    #[error("search timed out before a master was found")]
    SearchTimeout,
    #[error("command {command:#04x} rejected with code {code:#04x}")]
    ChannelResponse { command: u8, code: u8 },
    #[error("all {0} channels are in use")]
    OutOfChannels(u8),
    #[error("network number {0} out of range")]
    NetworkOutOfRange(u8),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("node is not running")]
    Stopped,
}

/// Errors loading or saving the scanner's device store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from an ANT-FS session. Variants carrying a `u8` hold the response
/// code the client returned.
#[derive(Error, Debug)]
pub enum AntFsError {
    #[error(transparent)]
    Ant(#[from] AntError),
    #[error("authentication failed (response {0:#04x})")]
    AuthenticationFailed(u8),
    #[error("download failed (response {0:#04x})")]
    DownloadFailed(u8),
    #[error("upload failed (response {0:#04x})")]
    UploadFailed(u8),
    #[error("erase failed (response {0:#04x})")]
    EraseFailed(u8),
    #[error("create file failed (response {0:#04x})")]
    CreateFileFailed(u8),
    #[error("set time failed (response {0:#04x})")]
    TimeError(u8),
    #[error("client in unexpected state {actual:#04x}, expected {expected:#04x}")]
    UnexpectedClientState { expected: u8, actual: u8 },
    #[error("timed out waiting for a beacon")]
    BeaconTimeout,
    #[error("timed out waiting for a command response")]
    CommandTimeout,
    #[error("malformed ANT-FS frame: {0}")]
    BadFrame(String),
}
