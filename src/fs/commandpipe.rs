//! Command-pipe packets, exchanged through the reserved file index 0xFFFE:
//! the host uploads a packet and downloads the client's reply. Every packet
//! starts with a 4-byte header `command, reserved, reserved, sequence`.

use crate::error::AntFsError;

/// Reserved file index for the command pipe.
pub const COMMAND_PIPE_INDEX: u16 = 0xFFFE;

pub const PIPE_REQUEST: u8 = 0x01;
pub const PIPE_RESPONSE: u8 = 0x02;
pub const PIPE_TIME: u8 = 0x03;
pub const PIPE_CREATE_FILE: u8 = 0x04;
pub const PIPE_DIRECTORY_FILTER: u8 = 0x05;
pub const PIPE_SET_AUTHENTICATION_PASSKEY: u8 = 0x06;
pub const PIPE_SET_CLIENT_FRIENDLY_NAME: u8 = 0x07;
pub const PIPE_FACTORY_RESET: u8 = 0x08;

// Command-pipe response codes
pub const PIPE_RESPONSE_OK: u8 = 0x00;
pub const PIPE_RESPONSE_FAILED: u8 = 0x01;
pub const PIPE_RESPONSE_REJECTED: u8 = 0x02;
pub const PIPE_RESPONSE_NOT_SUPPORTED: u8 = 0x03;

/// Time formats for the Time packet.
pub const TIME_FORMAT_DIRECTORY: u8 = 0x00;
pub const TIME_FORMAT_SYSTEM: u8 = 0x01;
pub const TIME_FORMAT_COUNTER: u8 = 0x02;

/// A host-to-client command-pipe packet. The sequence number comes from the
/// session, which keeps it monotonically increasing modulo 256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPipe {
    Request {
        sequence: u8,
        request_id: u8,
    },
    Time {
        sequence: u8,
        current_time: u32,
        system_time: u32,
        time_format: u8,
    },
    CreateFile {
        sequence: u8,
        size: u32,
        data_type: u8,
        identifier: [u8; 3],
        identifier_mask: [u8; 3],
    },
}

impl CommandPipe {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            CommandPipe::Request {
                sequence,
                request_id,
            } => vec![PIPE_REQUEST, 0, 0, *sequence, *request_id, 0, 0, 0],
            CommandPipe::Time {
                sequence,
                current_time,
                system_time,
                time_format,
            } => {
                let mut out = vec![PIPE_TIME, 0, 0, *sequence];
                out.extend_from_slice(&current_time.to_le_bytes());
                out.extend_from_slice(&system_time.to_le_bytes());
                out.push(*time_format);
                out.extend_from_slice(&[0; 3]);
                out
            }
            CommandPipe::CreateFile {
                sequence,
                size,
                data_type,
                identifier,
                identifier_mask,
            } => {
                let mut out = vec![PIPE_CREATE_FILE, 0, 0, *sequence];
                out.extend_from_slice(&size.to_le_bytes());
                out.push(*data_type);
                out.extend_from_slice(identifier);
                out.push(0);
                out.extend_from_slice(identifier_mask);
                out
            }
        }
    }
}

/// A generic command-pipe response: which request it answers and how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeResponse {
    pub sequence: u8,
    pub request_id: u8,
    pub response: u8,
}

/// The response to a CreateFile, reporting where the new file landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateFileResponse {
    pub sequence: u8,
    pub response: u8,
    pub data_type: u8,
    pub identifier: [u8; 3],
    /// Index to upload the file body to
    pub index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPipeResponse {
    Response(PipeResponse),
    CreateFile(CreateFileResponse),
}

/// Parse the blob downloaded from the command-pipe index.
pub fn parse(data: &[u8]) -> Result<CommandPipeResponse, AntFsError> {
    if data.len() < 8 {
        return Err(AntFsError::BadFrame(format!(
            "command pipe packet needs 8 bytes, got {}",
            data.len()
        )));
    }
    if data[0] != PIPE_RESPONSE {
        return Err(AntFsError::BadFrame(format!(
            "unexpected command pipe type {:#04x}",
            data[0]
        )));
    }
    let sequence = data[3];
    let request_id = data[4];
    let response = data[6];

    if request_id == PIPE_CREATE_FILE && data.len() >= 14 {
        return Ok(CommandPipeResponse::CreateFile(CreateFileResponse {
            sequence,
            response,
            data_type: data[8],
            identifier: [data[9], data[10], data[11]],
            index: u16::from_le_bytes([data[12], data[13]]),
        }));
    }
    Ok(CommandPipeResponse::Response(PipeResponse {
        sequence,
        request_id,
        response,
    }))
}
