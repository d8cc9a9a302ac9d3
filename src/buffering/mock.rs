//! Mock Transceiver
//!
//! Simulated device memory and listeners for testing the coordinator without hardware.
//! Memory is kept sparsely, byte by byte per chip, so headers and data can sit at any
//! address. Reads of unwritten bytes return zeros.
//!
//! # Example
//!
//! ```rust,ignore
//! let txrx = MockTransceiver::new();
//! txrx.write_recording_header(0, 0, 0x1000, &[(1024, 3, false, 0x2000)]);
//! txrx.set_memory(0, 0, 0x2000, b"abc");
//! txrx.deliver(&ConnectionClass::Eieio, &request.encode());
//! ```

use crate::buffering::transport::{ConnectionClass, PacketCallback, PacketListener, Transceiver};
use crate::error::{FecError, FecResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Listener that hands delivered packets to its callbacks.
#[derive(Default)]
pub struct MockListener {
    callbacks: Mutex<Vec<PacketCallback>>,
    closed: AtomicBool,
}

impl MockListener {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn deliver(&self, packet: &[u8]) {
        if self.is_closed() {
            return;
        }
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for callback in callbacks {
            callback(packet);
        }
    }
}

impl PacketListener for MockListener {
    fn add_callback(&self, callback: PacketCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory stand-in for the device transport.
#[derive(Default)]
pub struct MockTransceiver {
    memory: Mutex<HashMap<(u32, u32), BTreeMap<u64, u8>>>,
    listeners: Mutex<Vec<(ConnectionClass, Arc<MockListener>)>>,
    reads: AtomicUsize,
    read_delay: Option<Duration>,
}

impl MockTransceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read sleeps for `delay` first.
    pub fn with_read_delay(delay: Duration) -> Self {
        Self {
            read_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_memory(&self, x: u32, y: u32, address: u32, data: &[u8]) {
        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let chip = memory.entry((x, y)).or_default();
        for (offset, &byte) in data.iter().enumerate() {
            chip.insert(u64::from(address) + offset as u64, byte);
        }
    }

    pub fn memory(&self, x: u32, y: u32, address: u32, length: usize) -> Vec<u8> {
        let memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(chip) = memory.get(&(x, y)) else {
            return vec![0; length];
        };
        let start = u64::from(address);
        (start..start + length as u64)
            .map(|i| chip.get(&i).copied().unwrap_or(0))
            .collect()
    }

    /// Writes a recording header: `(space, size, missing, data address)` per region.
    pub fn write_recording_header(&self, x: u32, y: u32, address: u32, regions: &[(u32, u32, bool, u32)]) {
        let mut header = (regions.len() as u32).to_le_bytes().to_vec();
        for &(space, size, missing, data_address) in regions {
            let size_word = if missing { size | 0x8000_0000 } else { size };
            header.extend_from_slice(&space.to_le_bytes());
            header.extend_from_slice(&size_word.to_le_bytes());
            header.extend_from_slice(&data_address.to_le_bytes());
        }
        self.set_memory(x, y, address, &header);
    }

    /// Updates the recorded size of one region in an existing header.
    pub fn set_recorded_size(&self, x: u32, y: u32, header_address: u32, region: u32, size: u32) {
        self.set_memory(x, y, header_address + 4 + region * 12 + 4, &size.to_le_bytes());
    }

    /// Hands `packet` to every open listener of `class`.
    pub fn deliver(&self, class: &ConnectionClass, packet: &[u8]) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner).clone();
        for (listener_class, listener) in listeners {
            if &listener_class == class {
                listener.deliver(packet);
            }
        }
    }

    /// Listeners opened so far, including closed ones.
    pub fn listeners_opened(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn listener(&self, index: usize) -> Option<Arc<MockListener>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|(_, l)| l.clone())
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transceiver for MockTransceiver {
    async fn read_memory(&self, x: u32, y: u32, address: u32, length: usize) -> FecResult<Bytes> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::from(self.memory(x, y, address, length)))
    }

    async fn write_memory(&self, x: u32, y: u32, address: u32, data: &[u8]) -> FecResult<()> {
        if address.checked_add(data.len() as u32).is_none() {
            return Err(FecError::Transport(format!("Write past end of memory at 0x{address:08X}")));
        }
        self.set_memory(x, y, address, data);
        Ok(())
    }

    async fn open_listener(&self, class: &ConnectionClass) -> FecResult<Arc<dyn PacketListener>> {
        let listener = Arc::new(MockListener::default());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((class.clone(), listener.clone()));
        Ok(listener)
    }
}
