use crate::error::AntError;

/// Sync byte that starts every ANT frame.
pub const ANT_SYNC: u8 = 0xA4;

// Configuration messages (host -> radio)
pub const MSG_UNASSIGN_CHANNEL: u8 = 0x41;
pub const MSG_ASSIGN_CHANNEL: u8 = 0x42;
pub const MSG_SET_CHANNEL_PERIOD: u8 = 0x43;
pub const MSG_SET_CHANNEL_SEARCH_TIMEOUT: u8 = 0x44;
pub const MSG_SET_CHANNEL_RF_FREQ: u8 = 0x45;
pub const MSG_SET_NETWORK_KEY: u8 = 0x46;
pub const MSG_SET_SEARCH_WAVEFORM: u8 = 0x49;
pub const MSG_SET_CHANNEL_ID: u8 = 0x51;
pub const MSG_ENABLE_EXT_RX: u8 = 0x66;

// Control messages (host -> radio)
pub const MSG_SYSTEM_RESET: u8 = 0x4A;
pub const MSG_OPEN_CHANNEL: u8 = 0x4B;
pub const MSG_CLOSE_CHANNEL: u8 = 0x4C;
pub const MSG_REQUEST_MESSAGE: u8 = 0x4D;
pub const MSG_OPEN_RX_SCAN_MODE: u8 = 0x5B;

// Data messages (both directions)
pub const MSG_BROADCAST_DATA: u8 = 0x4E;
pub const MSG_ACKNOWLEDGED_DATA: u8 = 0x4F;
pub const MSG_BURST_TRANSFER_DATA: u8 = 0x50;

// Notifications and requested responses (radio -> host)
pub const MSG_STARTUP: u8 = 0x6F;
pub const MSG_SERIAL_ERROR: u8 = 0xAE;
pub const MSG_CHANNEL_RESPONSE: u8 = 0x40;
pub const MSG_CHANNEL_STATUS: u8 = 0x52;
pub const MSG_CHANNEL_ID: u8 = 0x51;
pub const MSG_ANT_VERSION: u8 = 0x3E;
pub const MSG_CAPABILITIES: u8 = 0x54;
pub const MSG_SERIAL_NUMBER: u8 = 0x61;

// Channel event codes, carried in MSG_CHANNEL_RESPONSE with sub-id 0x01
pub const RESPONSE_NO_ERROR: u8 = 0x00;
pub const EVENT_RX_SEARCH_TIMEOUT: u8 = 0x01;
pub const EVENT_RX_FAIL: u8 = 0x02;
pub const EVENT_TX: u8 = 0x03;
pub const EVENT_TRANSFER_RX_FAILED: u8 = 0x04;
pub const EVENT_TRANSFER_TX_COMPLETED: u8 = 0x05;
pub const EVENT_TRANSFER_TX_FAILED: u8 = 0x06;
pub const EVENT_CHANNEL_CLOSED: u8 = 0x07;
pub const EVENT_RX_FAIL_GO_TO_SEARCH: u8 = 0x08;
pub const EVENT_CHANNEL_COLLISION: u8 = 0x09;
pub const EVENT_TRANSFER_TX_START: u8 = 0x0A;

/// Flag byte that introduces the extended receive header after an 8-byte
/// data page (device number u16 LE, device type, transmission type).
pub const EXT_FLAG_CHANNEL_ID: u8 = 0x80;

/// A decoded ANT message: one frame with the sync, length and checksum
/// stripped off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntMessage {
    pub id: u8,
    pub data: Vec<u8>,
}

impl AntMessage {
    pub fn new(id: u8, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

/// Encode a message into wire format: sync, length, id, payload, XOR checksum.
pub fn encode_message(msg: &AntMessage) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + msg.data.len());
    packet.push(ANT_SYNC);
    packet.push(msg.data.len() as u8);
    packet.push(msg.id);
    packet.extend_from_slice(&msg.data);
    let checksum = packet.iter().fold(0u8, |acc, &b| acc ^ b);
    packet.push(checksum);
    packet
}

/// Decode the next complete message from the head of `buf`, consuming its
/// bytes. Returns `Ok(None)` when more bytes are needed; the caller appends
/// further reads to the same buffer and calls again.
///
/// On `BadSync` one byte is consumed, on `BadChecksum` the whole offending
/// frame is, so decoding always makes progress after an error.
pub fn next_message(buf: &mut Vec<u8>) -> Result<Option<AntMessage>, AntError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != ANT_SYNC {
        let byte = buf[0];
        buf.remove(0);
        return Err(AntError::BadSync(byte));
    }
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = buf[1] as usize;
    let total = len + 4; // sync + length + id + payload + checksum
    if buf.len() < total {
        return Ok(None);
    }

    let expected = buf[..total - 1].iter().fold(0u8, |acc, &b| acc ^ b);
    let actual = buf[total - 1];
    if expected != actual {
        buf.drain(..total);
        return Err(AntError::BadChecksum { expected, actual });
    }

    let id = buf[2];
    let data = buf[3..3 + len].to_vec();
    buf.drain(..total);
    Ok(Some(AntMessage { id, data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = AntMessage::new(MSG_SYSTEM_RESET, vec![0x00]);
        let mut encoded = encode_message(&msg);
        assert_eq!(encoded[0], ANT_SYNC);
        assert_eq!(encoded[1], 1); // length
        assert_eq!(encoded[2], MSG_SYSTEM_RESET);
        assert_eq!(encoded[3], 0x00); // data

        let decoded = next_message(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.id, MSG_SYSTEM_RESET);
        assert_eq!(decoded.data, vec![0x00]);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_checksum_is_xor_of_preceding_bytes() {
        let msg = AntMessage::new(0x42, vec![0x00, 0x00, 0x01]);
        let encoded = encode_message(&msg);
        let checksum = *encoded.last().unwrap();
        let xor: u8 = encoded[..encoded.len() - 1]
            .iter()
            .fold(0u8, |acc, &b| acc ^ b);
        assert_eq!(checksum, xor);
    }

    #[test]
    fn test_decode_known_response_frame() {
        let mut buf = vec![0xA4, 0x03, 0x40, 0x00, 0x46, 0x00, 0xA1];
        let msg = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.id, 0x40);
        assert_eq!(msg.data, vec![0x00, 0x46, 0x00]);
    }

    #[test]
    fn test_decode_bad_checksum() {
        let mut buf = vec![0xA4, 0x03, 0x40, 0x00, 0x46, 0x00, 0xA0];
        match next_message(&mut buf) {
            Err(AntError::BadChecksum { expected, actual }) => {
                assert_eq!(expected, 0xA1);
                assert_eq!(actual, 0xA0);
            }
            other => panic!("expected BadChecksum, got {:?}", other),
        }
        // Offending frame fully consumed so decoding can continue
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_bad_sync_skips_one_byte() {
        let mut buf = vec![0x17, 0xA4, 0x01, 0x4A, 0x00];
        match next_message(&mut buf) {
            Err(AntError::BadSync(byte)) => assert_eq!(byte, 0x17),
            other => panic!("expected BadSync, got {:?}", other),
        }
        assert_eq!(buf[0], 0xA4);
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let full = encode_message(&AntMessage::new(0x4E, vec![0; 9]));
        let mut buf = full[..5].to_vec();
        assert!(next_message(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[5..]);
        let msg = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(msg.id, 0x4E);
        assert_eq!(msg.data.len(), 9);
    }

    #[test]
    fn test_decode_multiple_messages() {
        let mut buf = encode_message(&AntMessage::new(MSG_SYSTEM_RESET, vec![0x00]));
        buf.extend_from_slice(&encode_message(&AntMessage::new(0x42, vec![0x01, 0x02])));

        let first = next_message(&mut buf).unwrap().unwrap();
        let second = next_message(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, MSG_SYSTEM_RESET);
        assert_eq!(second.id, 0x42);
        assert_eq!(second.data, vec![0x01, 0x02]);
        assert!(next_message(&mut buf).unwrap().is_none());
    }
}
