//! The device transport, consumed as a collaborator.
//!
//! The coordinator only needs to read and write device memory, and to open one packet
//! listener per connection class. Retries and acknowledgements are the transport's business.

use crate::error::FecResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Category of network endpoint. Only one listener ever exists per class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionClass {
    /// Event packets and buffer requests from cores.
    Eieio,
    /// Monitor-processor traffic.
    Scamp,
    Notification,
    Custom(String),
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Eieio => f.write_str("eieio"),
            ConnectionClass::Scamp => f.write_str("scamp"),
            ConnectionClass::Notification => f.write_str("notification"),
            ConnectionClass::Custom(name) => f.write_str(name),
        }
    }
}

/// Invoked with the raw bytes of every datagram a listener receives.
pub type PacketCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A receiving endpoint shared by every vertex of one connection class.
pub trait PacketListener: Send + Sync {
    fn add_callback(&self, callback: PacketCallback);

    /// Stops delivering packets. Closing twice is harmless.
    fn close(&self);
}

/// Device memory access and listener creation.
#[async_trait]
pub trait Transceiver: Send + Sync {
    async fn read_memory(&self, x: u32, y: u32, address: u32, length: usize) -> FecResult<Bytes>;

    async fn write_memory(&self, x: u32, y: u32, address: u32, data: &[u8]) -> FecResult<()>;

    /// Little-endian word at `address`.
    async fn read_word(&self, x: u32, y: u32, address: u32) -> FecResult<u32> {
        let bytes = self.read_memory(x, y, address, 4).await?;
        let word: [u8; 4] = bytes.as_ref().try_into().map_err(|_| {
            crate::error::FecError::Transport(format!(
                "Short read of {} bytes at 0x{address:08X} on ({x}, {y})",
                bytes.len()
            ))
        })?;
        Ok(u32::from_le_bytes(word))
    }

    async fn open_listener(&self, class: &ConnectionClass) -> FecResult<Arc<dyn PacketListener>>;
}
