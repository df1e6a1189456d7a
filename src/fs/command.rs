//! ANT-FS command and response frames. Every frame starts `0x44` followed by
//! a subtype byte; responses set bit 7 of the request's subtype. Eight-byte
//! commands travel as acknowledged data, longer ones (and all responses) as
//! bursts with the last two bytes of the final block carrying a CRC or
//! padding.

use crate::error::AntFsError;

/// First byte of every ANT-FS command frame.
pub const COMMAND_ID: u8 = 0x44;

pub const CMD_LINK: u8 = 0x02;
pub const CMD_DISCONNECT: u8 = 0x03;
pub const CMD_AUTHENTICATE: u8 = 0x04;
pub const CMD_PING: u8 = 0x05;
pub const CMD_DOWNLOAD_REQUEST: u8 = 0x09;
pub const CMD_UPLOAD_REQUEST: u8 = 0x0A;
pub const CMD_ERASE_REQUEST: u8 = 0x0B;
pub const CMD_UPLOAD_DATA: u8 = 0x0C;

pub const RESP_AUTHENTICATE: u8 = 0x84;
pub const RESP_DOWNLOAD: u8 = 0x89;
pub const RESP_UPLOAD: u8 = 0x8A;
pub const RESP_ERASE: u8 = 0x8B;
pub const RESP_UPLOAD_DATA: u8 = 0x8C;

/// Authenticate request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthRequestType {
    Passthrough = 0x00,
    /// Ask for the client's serial and friendly name
    Serial = 0x01,
    Pairing = 0x02,
    PasskeyExchange = 0x03,
}

/// Disconnect command types.
pub const DISCONNECT_RETURN_LINK: u8 = 0x00;
pub const DISCONNECT_RETURN_BROADCAST: u8 = 0x01;

// Authenticate response types
pub const AUTH_RESPONSE_NA: u8 = 0x00;
pub const AUTH_RESPONSE_ACCEPT: u8 = 0x01;
pub const AUTH_RESPONSE_REJECT: u8 = 0x02;

// Download response codes
pub const DOWNLOAD_OK: u8 = 0x00;
pub const DOWNLOAD_NOT_EXIST: u8 = 0x01;
pub const DOWNLOAD_NOT_READABLE: u8 = 0x02;
pub const DOWNLOAD_NOT_READY: u8 = 0x03;
pub const DOWNLOAD_INVALID_REQUEST: u8 = 0x04;
pub const DOWNLOAD_BAD_CRC: u8 = 0x05;

// Upload response codes
pub const UPLOAD_OK: u8 = 0x00;
pub const UPLOAD_NOT_EXIST: u8 = 0x01;
pub const UPLOAD_NOT_WRITEABLE: u8 = 0x02;
pub const UPLOAD_NOT_ENOUGH_SPACE: u8 = 0x03;
pub const UPLOAD_INVALID_REQUEST: u8 = 0x04;
pub const UPLOAD_NOT_READY: u8 = 0x05;

// Upload data response codes
pub const UPLOAD_DATA_OK: u8 = 0x00;
pub const UPLOAD_DATA_FAILED: u8 = 0x01;

// Erase response codes
pub const ERASE_SUCCESSFUL: u8 = 0x00;
pub const ERASE_FAILED: u8 = 0x01;
pub const ERASE_NOT_READY: u8 = 0x02;

/// A host-to-client ANT-FS command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Link {
        /// RF frequency the session moves to (MHz offset from 2400)
        frequency: u8,
        /// Beacon period code (4 = 8 Hz)
        period: u8,
        host_serial: u32,
    },
    Disconnect {
        disconnect_type: u8,
        time_duration: u8,
        application_duration: u8,
    },
    Authenticate {
        request: AuthRequestType,
        host_serial: u32,
        auth_string: Vec<u8>,
    },
    Ping,
    DownloadRequest {
        index: u16,
        offset: u32,
        initial: bool,
        crc_seed: u16,
        max_block_size: u32,
    },
    UploadRequest {
        index: u16,
        max_size: u32,
        offset: u32,
    },
    EraseRequest {
        index: u16,
    },
    UploadData {
        crc_seed: u16,
        offset: u32,
        data: Vec<u8>,
        crc: u16,
    },
}

impl Command {
    /// Serialize to wire bytes. Eight-byte frames are sent acknowledged,
    /// anything longer as a burst.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Link {
                frequency,
                period,
                host_serial,
            } => {
                let mut out = vec![COMMAND_ID, CMD_LINK, *frequency, *period];
                out.extend_from_slice(&host_serial.to_le_bytes());
                out
            }
            Command::Disconnect {
                disconnect_type,
                time_duration,
                application_duration,
            } => vec![
                COMMAND_ID,
                CMD_DISCONNECT,
                *disconnect_type,
                *time_duration,
                *application_duration,
                0,
                0,
                0,
            ],
            Command::Authenticate {
                request,
                host_serial,
                auth_string,
            } => {
                let mut out = vec![
                    COMMAND_ID,
                    CMD_AUTHENTICATE,
                    *request as u8,
                    auth_string.len() as u8,
                ];
                out.extend_from_slice(&host_serial.to_le_bytes());
                out.extend_from_slice(auth_string);
                pad_to_block(&mut out);
                out
            }
            Command::Ping => vec![COMMAND_ID, CMD_PING, 0, 0, 0, 0, 0, 0],
            Command::DownloadRequest {
                index,
                offset,
                initial,
                crc_seed,
                max_block_size,
            } => {
                let mut out = vec![COMMAND_ID, CMD_DOWNLOAD_REQUEST];
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.push(0);
                out.push(*initial as u8);
                out.extend_from_slice(&crc_seed.to_le_bytes());
                out.extend_from_slice(&max_block_size.to_le_bytes());
                out
            }
            Command::UploadRequest {
                index,
                max_size,
                offset,
            } => {
                let mut out = vec![COMMAND_ID, CMD_UPLOAD_REQUEST];
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(&max_size.to_le_bytes());
                out.extend_from_slice(&[0; 4]);
                out.extend_from_slice(&offset.to_le_bytes());
                out
            }
            Command::EraseRequest { index } => {
                let mut out = vec![COMMAND_ID, CMD_ERASE_REQUEST];
                out.extend_from_slice(&index.to_le_bytes());
                out.extend_from_slice(&[0; 4]);
                out
            }
            Command::UploadData {
                crc_seed,
                offset,
                data,
                crc,
            } => {
                let mut out = vec![COMMAND_ID, CMD_UPLOAD_DATA];
                out.extend_from_slice(&crc_seed.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(data);
                pad_to_block(&mut out);
                // CRC rides in the last two bytes of a trailing block
                out.extend_from_slice(&[0; 6]);
                out.extend_from_slice(&crc.to_le_bytes());
                out
            }
        }
    }
}

fn pad_to_block(out: &mut Vec<u8>) {
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateResponse {
    pub response: u8,
    pub client_serial: u32,
    /// Friendly name or passkey, depending on the request
    pub data: Vec<u8>,
}

impl AuthenticateResponse {
    pub fn data_string(&self) -> String {
        self.data
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResponse {
    pub response: u8,
    pub remaining: u32,
    pub offset: u32,
    pub size: u32,
    pub data: Vec<u8>,
    pub crc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadResponse {
    pub response: u8,
    pub last_data_offset: u32,
    pub max_file_size: u32,
    pub max_block_size: u32,
    pub crc: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadDataResponse {
    pub response: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseResponse {
    pub response: u8,
}

/// A client-to-host response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Authenticate(AuthenticateResponse),
    Download(DownloadResponse),
    Upload(UploadResponse),
    UploadData(UploadDataResponse),
    Erase(EraseResponse),
}

/// Parse a response frame (burst payload with the beacon already stripped).
pub fn parse_response(data: &[u8]) -> Result<CommandResponse, AntFsError> {
    if data.len() < 8 {
        return Err(AntFsError::BadFrame(format!(
            "response needs at least 8 bytes, got {}",
            data.len()
        )));
    }
    if data[0] != COMMAND_ID {
        return Err(AntFsError::BadFrame(format!(
            "command tag {:#04x} is not 0x44",
            data[0]
        )));
    }
    match data[1] {
        RESP_AUTHENTICATE => {
            let auth_len = data[3] as usize;
            if data.len() < 8 + auth_len {
                return Err(AntFsError::BadFrame("authenticate response truncated".into()));
            }
            Ok(CommandResponse::Authenticate(AuthenticateResponse {
                response: data[2],
                client_serial: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                data: data[8..8 + auth_len].to_vec(),
            }))
        }
        RESP_DOWNLOAD => {
            if data.len() < 16 {
                return Err(AntFsError::BadFrame("download response truncated".into()));
            }
            let remaining = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
            let offset = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
            let size = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
            let (payload, crc) = if remaining > 0 {
                if data.len() < 16 + remaining as usize + 2 {
                    return Err(AntFsError::BadFrame("download data truncated".into()));
                }
                let payload = data[16..16 + remaining as usize].to_vec();
                let crc = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
                (payload, crc)
            } else {
                (Vec::new(), 0)
            };
            Ok(CommandResponse::Download(DownloadResponse {
                response: data[2],
                remaining,
                offset,
                size,
                data: payload,
                crc,
            }))
        }
        RESP_UPLOAD => {
            if data.len() < 16 {
                return Err(AntFsError::BadFrame("upload response truncated".into()));
            }
            let crc = if data.len() >= 24 {
                u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]])
            } else {
                0
            };
            Ok(CommandResponse::Upload(UploadResponse {
                response: data[2],
                last_data_offset: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
                max_file_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
                max_block_size: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
                crc,
            }))
        }
        RESP_UPLOAD_DATA => Ok(CommandResponse::UploadData(UploadDataResponse {
            response: data[2],
        })),
        RESP_ERASE => Ok(CommandResponse::Erase(EraseResponse { response: data[2] })),
        other => Err(AntFsError::BadFrame(format!(
            "unknown response subtype {:#04x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_serial_wire_format() {
        let command = Command::Authenticate {
            request: AuthRequestType::Serial,
            host_serial: 123456789,
            auth_string: Vec::new(),
        };
        assert_eq!(
            command.encode(),
            vec![0x44, 0x04, 0x01, 0x00, 0x15, 0xCD, 0x5B, 0x07]
        );
    }

    #[test]
    fn authenticate_pairing_wire_format() {
        let command = Command::Authenticate {
            request: AuthRequestType::Pairing,
            host_serial: 987654321,
            auth_string: b"hello".to_vec(),
        };
        assert_eq!(
            command.encode(),
            vec![
                0x44, 0x04, 0x02, 0x05, 0xB1, 0x68, 0xDE, 0x3A, 0x68, 0x65, 0x6C, 0x6C, 0x6F,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn download_request_wire_format() {
        let command = Command::DownloadRequest {
            index: 0x005F,
            offset: 0xBA00,
            initial: false,
            crc_seed: 0xC29E,
            max_block_size: 0,
        };
        assert_eq!(
            command.encode(),
            vec![
                0x44, 0x09, 0x5F, 0x00, 0x00, 0xBA, 0x00, 0x00, 0x00, 0x00, 0x9E, 0xC2, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn link_command_is_one_acknowledged_page() {
        let command = Command::Link {
            frequency: 19,
            period: 4,
            host_serial: 1337,
        };
        let bytes = command.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &[0x44, 0x02, 19, 4]);
        assert_eq!(&bytes[4..], &1337u32.to_le_bytes());
    }

    #[test]
    fn parse_download_response_ok() {
        let data = [
            0x44, 0x89, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00,
            0x00, 0x00, 0x02, 0x00, 0x00, 0x01, 0x03, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0xBC, 0xAD,
        ];
        match parse_response(&data).unwrap() {
            CommandResponse::Download(response) => {
                assert_eq!(response.response, DOWNLOAD_OK);
                assert_eq!(response.remaining, 8);
                assert_eq!(response.offset, 0);
                assert_eq!(response.size, 8);
                assert_eq!(response.data, vec![2, 0, 0, 1, 3, 0, 3, 0]);
                assert_eq!(response.crc, 44476);
            }
            other => panic!("expected Download, got {:?}", other),
        }
    }

    #[test]
    fn parse_download_response_not_readable() {
        let data = [
            0x44, 0x89, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x77, 0xEF,
            0x24, 0xAE,
        ];
        match parse_response(&data).unwrap() {
            CommandResponse::Download(response) => {
                assert_eq!(response.response, DOWNLOAD_NOT_READABLE);
                assert_eq!(response.remaining, 0);
                assert!(response.data.is_empty());
                assert_eq!(response.crc, 0);
            }
            other => panic!("expected Download, got {:?}", other),
        }
    }

    #[test]
    fn parse_authenticate_response_with_passkey() {
        let mut data = vec![0x44, 0x84, AUTH_RESPONSE_ACCEPT, 4];
        data.extend_from_slice(&66881u32.to_le_bytes());
        data.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);
        match parse_response(&data).unwrap() {
            CommandResponse::Authenticate(response) => {
                assert_eq!(response.response, AUTH_RESPONSE_ACCEPT);
                assert_eq!(response.client_serial, 66881);
                assert_eq!(response.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
            }
            other => panic!("expected Authenticate, got {:?}", other),
        }
    }

    #[test]
    fn upload_data_pads_and_appends_crc() {
        let command = Command::UploadData {
            crc_seed: 0x1234,
            offset: 16,
            data: vec![1, 2, 3],
            crc: 0xAABB,
        };
        let bytes = command.encode();
        // header(8) + padded data(8) + crc block(8)
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..2], &[0x44, 0x0C]);
        assert_eq!(&bytes[2..4], &[0x34, 0x12]);
        assert_eq!(&bytes[8..16], &[1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[22..], &[0xBB, 0xAA]);
    }

    #[test]
    fn erase_request_wire_format() {
        let bytes = Command::EraseRequest { index: 0x0102 }.encode();
        assert_eq!(bytes, vec![0x44, 0x0B, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_response(&[0x43, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(parse_response(&[0x44, 0x89]).is_err());
        assert!(parse_response(&[0x44, 0x77, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
