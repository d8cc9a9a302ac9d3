//! Host-to-device event buffers.
//!
//! Keys to send are grouped by timestamp and written to the device as event packets:
//!
//! ```text
//! [header: u16 = 0x3800 | count][timestamp: u32][key: u32] * count
//! ```
//!
//! A stop command (`0x4003`) follows the last packet when every event fits in the buffer.

use crate::error::{FecError, FecResult};
use crate::network::protocol::{CommandId, HEADER_LEN};
use std::collections::BTreeMap;

/// 32-bit keys, timestamp prefix present.
const EVENT_DATA_HEADER: u16 = 0x3800;
const COUNT_MASK: u16 = 0x00FF;
const KEY_BYTES: usize = 4;

/// Header plus timestamp.
pub const EVENT_PREFIX_LEN: usize = HEADER_LEN + 4;

/// Largest key count a packet header can carry.
pub const MAX_KEYS_PER_PACKET: usize = 255;

/// Events of one timestamp carried in one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPacket {
    pub timestamp: u32,
    pub keys: Vec<u32>,
}

impl EventPacket {
    pub fn encoded_len(&self) -> usize {
        EVENT_PREFIX_LEN + self.keys.len() * KEY_BYTES
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let header = EVENT_DATA_HEADER | self.keys.len() as u16;
        buf.extend_from_slice(&header.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        for key in &self.keys {
            buf.extend_from_slice(&key.to_le_bytes());
        }
    }

    pub fn decode(data: &[u8]) -> FecResult<Self> {
        if data.len() < EVENT_PREFIX_LEN {
            return Err(FecError::Protocol("Insufficient data for event packet".to_string()));
        }
        let header = u16::from_le_bytes([data[0], data[1]]);
        if header & !COUNT_MASK != EVENT_DATA_HEADER {
            return Err(FecError::Protocol(format!(
                "Header 0x{header:04X} is not a timestamped event packet"
            )));
        }
        let count = (header & COUNT_MASK) as usize;
        let needed = EVENT_PREFIX_LEN + count * KEY_BYTES;
        if data.len() < needed {
            return Err(FecError::Protocol(format!(
                "Event packet declares {count} keys but holds {} bytes",
                data.len()
            )));
        }
        let word = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        Ok(Self {
            timestamp: word(HEADER_LEN),
            keys: (0..count).map(|i| word(EVENT_PREFIX_LEN + i * KEY_BYTES)).collect(),
        })
    }
}

/// Keys per timestamp for one send region, with a cursor over what has been sent.
#[derive(Debug, Clone, Default)]
pub struct SendingRegion {
    events: Vec<(u32, Vec<u32>)>,
    timestamp_pos: usize,
    key_pos: usize,
}

impl SendingRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: BTreeMap<u32, Vec<u32>>) -> Self {
        Self {
            events: events.into_iter().filter(|(_, keys)| !keys.is_empty()).collect(),
            ..Self::default()
        }
    }

    pub fn add_key(&mut self, timestamp: u32, key: u32) {
        self.add_keys(timestamp, [key]);
    }

    pub fn add_keys(&mut self, timestamp: u32, keys: impl IntoIterator<Item = u32>) {
        let idx = match self.events.binary_search_by_key(&timestamp, |(t, _)| *t) {
            Ok(idx) => idx,
            Err(idx) => {
                self.events.insert(idx, (timestamp, Vec::new()));
                idx
            }
        };
        self.events[idx].1.extend(keys);
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u32> + '_ {
        self.events.iter().map(|(t, _)| *t)
    }

    pub fn n_keys(&self, timestamp: u32) -> usize {
        self.events
            .binary_search_by_key(&timestamp, |(t, _)| *t)
            .map(|idx| self.events[idx].1.len())
            .unwrap_or(0)
    }

    pub fn is_next_timestamp(&self) -> bool {
        self.timestamp_pos < self.events.len()
    }

    pub fn next_timestamp(&self) -> Option<u32> {
        self.events.get(self.timestamp_pos).map(|(t, _)| *t)
    }

    /// Takes up to `max_keys` unsent keys of the next timestamp.
    pub fn next_packet(&mut self, max_keys: usize) -> Option<EventPacket> {
        let (timestamp, keys) = self.events.get(self.timestamp_pos)?;
        let take = max_keys.min(MAX_KEYS_PER_PACKET).min(keys.len() - self.key_pos);
        if take == 0 {
            return None;
        }
        let packet = EventPacket {
            timestamp: *timestamp,
            keys: keys[self.key_pos..self.key_pos + take].to_vec(),
        };
        self.key_pos += take;
        if self.key_pos == keys.len() {
            self.timestamp_pos += 1;
            self.key_pos = 0;
        }
        Some(packet)
    }

    /// Encodes as many events as fit in `capacity` bytes, in packets of at most
    /// `max_packet_bytes`. A stop command is appended when nothing is left to send and there
    /// is room for it.
    pub fn fill_buffer(&mut self, capacity: usize, max_packet_bytes: usize) -> Vec<u8> {
        let packet_keys = max_packet_bytes.saturating_sub(EVENT_PREFIX_LEN) / KEY_BYTES;
        let mut buf = Vec::new();
        while self.is_next_timestamp() {
            let room = capacity.saturating_sub(buf.len() + EVENT_PREFIX_LEN) / KEY_BYTES;
            match self.next_packet(packet_keys.min(room)) {
                Some(packet) => packet.encode_into(&mut buf),
                None => break,
            }
        }
        if !self.is_next_timestamp() && buf.len() + HEADER_LEN <= capacity {
            buf.extend_from_slice(&CommandId::EventStop.header());
        }
        buf
    }

    /// Moves the cursor back to the first event.
    pub fn rewind(&mut self) {
        self.timestamp_pos = 0;
        self.key_pos = 0;
    }
}
