//! Command datagrams exchanged with observers and the device.
//!
//! Every command starts with a 2-byte little-endian header: the top two bits are `01`
//! (command, not data) and the low 14 bits carry the command id.
//!
//! ```text
//! DATABASE       [0x4001][utf-8 database path, may be empty]
//! STOP_PAUSE     [0x400A]
//! START_RESUME   [0x400B]
//! REQUEST_BUFFERS[0x4006][x: u8][y: u8][p: u8][region: u8]
//! ```

use crate::error::{FecError, FecResult};

const COMMAND_FLAG: u16 = 0x4000;
const COMMAND_MASK: u16 = 0xC000;
const COMMAND_ID_MASK: u16 = 0x3FFF;

/// Size of the command header in bytes.
pub const HEADER_LEN: usize = 2;

/// Longest database path that fits in a single command packet.
pub const MAX_DATABASE_PATH_LENGTH: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandId {
    Database = 1,
    EventStop = 3,
    RequestBuffers = 6,
    StopPause = 10,
    StartResume = 11,
}

impl CommandId {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(CommandId::Database),
            3 => Some(CommandId::EventStop),
            6 => Some(CommandId::RequestBuffers),
            10 => Some(CommandId::StopPause),
            11 => Some(CommandId::StartResume),
            _ => None,
        }
    }

    /// Encoded header for this command.
    pub fn header(self) -> [u8; HEADER_LEN] {
        (COMMAND_FLAG | self as u16).to_le_bytes()
    }
}

/// Messages of the notification protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMessage {
    /// The database has been written. Sent by the toolchain with the path (if any); echoed
    /// back without a path by observers to confirm they have read it.
    DatabaseReady(Option<String>),
    StartResume,
    StopPause,
}

impl NotifyMessage {
    pub fn command_id(&self) -> CommandId {
        match self {
            NotifyMessage::DatabaseReady(_) => CommandId::Database,
            NotifyMessage::StartResume => CommandId::StartResume,
            NotifyMessage::StopPause => CommandId::StopPause,
        }
    }

    pub fn encode(&self) -> FecResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&self.command_id().header());
        if let NotifyMessage::DatabaseReady(Some(path)) = self {
            if path.len() > MAX_DATABASE_PATH_LENGTH {
                return Err(FecError::DatabasePathTooLong(path.len()));
            }
            buf.extend_from_slice(path.as_bytes());
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> FecResult<Self> {
        match decode_command(data)? {
            CommandId::Database => {
                let payload = &data[HEADER_LEN..];
                if payload.is_empty() {
                    return Ok(NotifyMessage::DatabaseReady(None));
                }
                let path = std::str::from_utf8(payload)
                    .map_err(|e| FecError::Protocol(format!("Database path is not UTF-8: {e}")))?;
                Ok(NotifyMessage::DatabaseReady(Some(path.to_string())))
            }
            CommandId::StartResume => Ok(NotifyMessage::StartResume),
            CommandId::StopPause => Ok(NotifyMessage::StopPause),
            other => Err(FecError::Protocol(format!(
                "Command {other:?} is not part of the notification protocol"
            ))),
        }
    }
}

/// A core asking the host to drain one of its recording regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub region: u8,
}

impl BufferRequest {
    const LEN: usize = HEADER_LEN + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&CommandId::RequestBuffers.header());
        buf.extend_from_slice(&[self.x, self.y, self.p, self.region]);
        buf
    }

    pub fn decode(data: &[u8]) -> FecResult<Self> {
        let command = decode_command(data)?;
        if command != CommandId::RequestBuffers {
            return Err(FecError::Protocol(format!(
                "Expected a buffer request, got {command:?}"
            )));
        }
        if data.len() < Self::LEN {
            return Err(FecError::Protocol(
                "Insufficient data for buffer request".to_string(),
            ));
        }
        Ok(Self {
            x: data[2],
            y: data[3],
            p: data[4],
            region: data[5],
        })
    }
}

/// Reads and validates the command header of a datagram.
pub fn decode_command(data: &[u8]) -> FecResult<CommandId> {
    if data.len() < HEADER_LEN {
        return Err(FecError::Protocol(
            "Insufficient data for command header".to_string(),
        ));
    }
    let header = u16::from_le_bytes([data[0], data[1]]);
    if header & COMMAND_MASK != COMMAND_FLAG {
        return Err(FecError::Protocol(format!(
            "Header 0x{header:04X} is not a command"
        )));
    }
    let id = header & COMMAND_ID_MASK;
    CommandId::from_u16(id).ok_or_else(|| FecError::Protocol(format!("Unknown command id {id}")))
}
