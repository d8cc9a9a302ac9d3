//! Buffer drain coordinator.
//!
//! Vertices register through [`BufferDrainCoordinator::add_listener`]. Vertices sharing a
//! connection class share a single listener, whose callback turns `REQUEST_BUFFERS` datagrams
//! into pending drains. Draining a region reads its recording header, fetches only the bytes
//! added since the previous drain and appends them to the [`RegionStore`].
//!
//! Drains of different regions run concurrently; drains of the same region are serialised so
//! bytes are stored in the order the core produced them.
//!
//! A recorded size smaller than what has already been stored means the core started a new
//! recording, which is then read from its start. [`BufferDrainCoordinator::reset`] prepares
//! every region for that the same way.

use crate::buffering::sending::SendingRegion;
use crate::buffering::transport::{ConnectionClass, PacketListener, Transceiver};
use crate::buffering::vertex::{BufferedVertex, Placement, VertexPhase};
use crate::config::BufferingConfig;
use crate::data::{CursorFactory, RegionKey, RegionStore};
use crate::error::{FecError, FecResult};
use crate::network::protocol::BufferRequest;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Bit 31 of a region's size word: the core lost data for this region.
const MISSING_FLAG: u32 = 0x8000_0000;
const REGION_ENTRY_BYTES: u32 = 12;
/// Largest single memory read issued while draining.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Result of draining one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// New bytes were fetched and stored.
    Drained { bytes: usize },
    /// Nothing new since the previous drain.
    Complete,
    /// The recording header does not describe this region.
    NotPresent,
}

/// One recording region's entry in the recording header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingRegionHeader {
    pub space: u32,
    pub size: u32,
    pub missing: bool,
    pub data_address: u32,
}

impl RecordingRegionHeader {
    pub fn parse(entry: &[u8]) -> FecResult<Self> {
        if entry.len() < REGION_ENTRY_BYTES as usize {
            return Err(FecError::Transport(format!(
                "Recording header entry has {} bytes, expected {REGION_ENTRY_BYTES}",
                entry.len()
            )));
        }
        let word = |i: usize| u32::from_le_bytes([entry[i], entry[i + 1], entry[i + 2], entry[i + 3]]);
        let size_word = word(4);
        Ok(Self {
            space: word(0),
            size: size_word & !MISSING_FLAG,
            missing: size_word & MISSING_FLAG != 0,
            data_address: word(8),
        })
    }
}

/// A listener and the vertices consuming it.
pub struct ListenerRegistration {
    pub listener: Arc<dyn PacketListener>,
    pub vertices: BTreeSet<String>,
}

pub struct BufferDrainCoordinator {
    transceiver: Arc<dyn Transceiver>,
    store: RegionStore,
    cursors: CursorFactory,
    drain_timeout: Duration,
    max_in_flight: usize,
    max_packet_bytes: usize,
    vertices: RwLock<BTreeMap<String, Arc<dyn BufferedVertex>>>,
    phases: Mutex<HashMap<String, VertexPhase>>,
    listeners: tokio::sync::Mutex<HashMap<ConnectionClass, ListenerRegistration>>,
    /// Bytes of each region already stored, locked for the length of a drain.
    consumed: Mutex<HashMap<RegionKey, Arc<tokio::sync::Mutex<u32>>>>,
    pending: Arc<Mutex<BTreeSet<RegionKey>>>,
    sending: tokio::sync::Mutex<BTreeMap<(String, u32), SendingRegion>>,
    cancelled: AtomicBool,
}

impl BufferDrainCoordinator {
    pub fn new(
        transceiver: Arc<dyn Transceiver>,
        store: RegionStore,
        cursors: CursorFactory,
        config: &BufferingConfig,
    ) -> Self {
        Self {
            transceiver,
            store,
            cursors,
            drain_timeout: config.drain_timeout(),
            max_in_flight: config.max_in_flight.max(1),
            max_packet_bytes: config.max_packet_bytes,
            vertices: RwLock::new(BTreeMap::new()),
            phases: Mutex::new(HashMap::new()),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            consumed: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
            sending: tokio::sync::Mutex::new(BTreeMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &RegionStore {
        &self.store
    }

    /// Registers a vertex and attaches it to the listener of its connection class, opening
    /// that listener only if none exists yet. The vertex label is stored as its core's name.
    pub async fn add_listener(&self, vertex: Arc<dyn BufferedVertex>) -> FecResult<Arc<dyn PacketListener>> {
        self.check_cancelled()?;
        let label = vertex.label().to_string();
        let class = vertex.connection_class();

        // Held across the open so two registrations cannot both create a listener.
        let mut listeners = self.listeners.lock().await;
        let listener = match listeners.get_mut(&class) {
            Some(registration) => {
                debug!(vertex = %label, %class, "Reusing listener");
                registration.vertices.insert(label.clone());
                registration.listener.clone()
            }
            None => {
                let listener = self.transceiver.open_listener(&class).await?;
                let pending = self.pending.clone();
                listener.add_callback(Arc::new(move |packet: &[u8]| match BufferRequest::decode(packet) {
                    Ok(request) => {
                        let key = RegionKey::new(
                            request.x.into(),
                            request.y.into(),
                            request.p.into(),
                            request.region.into(),
                        );
                        pending.lock().unwrap_or_else(PoisonError::into_inner).insert(key);
                    }
                    Err(e) => debug!("Ignoring packet: {e}"),
                }));
                info!(vertex = %label, %class, "Opened listener");
                listeners.insert(
                    class,
                    ListenerRegistration {
                        listener: listener.clone(),
                        vertices: BTreeSet::from([label.clone()]),
                    },
                );
                listener
            }
        };
        drop(listeners);

        let placement = vertex.placement();
        let store = self.store.clone();
        let name = label.clone();
        tokio::task::spawn_blocking(move || store.set_core_name(placement.x, placement.y, placement.p, &name))
            .await??;

        write(&self.vertices).insert(label.clone(), vertex);
        self.set_phase(&label, VertexPhase::Listening);
        Ok(listener)
    }

    /// Number of listeners currently open.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Vertices sharing the listener of `class`.
    pub async fn listener_consumers(&self, class: &ConnectionClass) -> Vec<String> {
        self.listeners
            .lock()
            .await
            .get(class)
            .map(|r| r.vertices.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn vertex_phase(&self, label: &str) -> VertexPhase {
        lock(&self.phases)
            .get(label)
            .copied()
            .unwrap_or(VertexPhase::Unregistered)
    }

    /// Regions asked for by cores and not drained yet.
    pub fn pending_requests(&self) -> Vec<RegionKey> {
        lock(&self.pending).iter().copied().collect()
    }

    /// Fetches the bytes recorded into `region` since the previous drain and stores them.
    #[instrument(skip(self), err)]
    pub async fn drain(&self, label: &str, region: u32) -> FecResult<DrainOutcome> {
        let vertex = self.vertex(label)?;
        let receiver = vertex.as_receiver().ok_or_else(|| FecError::RegionNotRecorded {
            vertex: label.to_string(),
            region,
        })?;
        if !receiver.recorded_region_ids().contains(&region) {
            return Err(FecError::RegionNotRecorded {
                vertex: label.to_string(),
                region,
            });
        }
        let header_address = receiver.recording_header_address();
        let placement = vertex.placement();

        let previous = self.vertex_phase(label);
        self.set_phase(label, VertexPhase::Draining);
        match self.drain_region(placement, header_address, region).await {
            Ok(outcome) => {
                self.set_phase(label, VertexPhase::Drained);
                Ok(outcome)
            }
            Err(e) => {
                self.set_phase(label, previous);
                Err(e)
            }
        }
    }

    async fn drain_region(&self, placement: Placement, header_address: u32, region: u32) -> FecResult<DrainOutcome> {
        let key = RegionKey::new(placement.x, placement.y, placement.p, region);
        let region_lock = lock(&self.consumed).entry(key).or_default().clone();
        let mut consumed = region_lock.lock().await;

        let (x, y) = (placement.x, placement.y);
        let n_regions = self
            .bounded(key, self.transceiver.read_word(x, y, header_address))
            .await?;
        if region >= n_regions {
            debug!(region = %key, n_regions, "Region not in recording header");
            return Ok(DrainOutcome::NotPresent);
        }

        let entry_address = region
            .checked_mul(REGION_ENTRY_BYTES)
            .and_then(|offset| offset.checked_add(4))
            .and_then(|offset| header_address.checked_add(offset))
            .ok_or_else(|| {
                FecError::Transport(format!(
                    "Recording header entry of region {key} lies beyond the address space"
                ))
            })?;
        let entry = self
            .bounded(key, self.transceiver.read_memory(x, y, entry_address, REGION_ENTRY_BYTES as usize))
            .await?;
        let header = RecordingRegionHeader::parse(&entry)?;
        if header.size < *consumed {
            info!(region = %key, size = header.size, consumed = *consumed, "Core restarted recording");
            *consumed = 0;
        }
        if header.size == *consumed {
            return Ok(DrainOutcome::Complete);
        }

        let start = header.data_address.checked_add(*consumed);
        let end = header.data_address.checked_add(header.size);
        let (Some(start), Some(_)) = (start, end) else {
            return Err(FecError::Transport(format!(
                "Recorded data of region {key} at 0x{:08X} with size {} lies beyond the address space",
                header.data_address, header.size
            )));
        };

        let length = (header.size - *consumed) as usize;
        let mut cursor = self.cursors.create(length)?;
        let mut offset = 0;
        while offset < length {
            let chunk = READ_CHUNK_BYTES.min(length - offset);
            // start + length fits in u32, checked above
            let address = start + offset as u32;
            let bytes = self
                .bounded(key, self.transceiver.read_memory(x, y, address, chunk))
                .await?;
            cursor.write(&bytes)?;
            offset += chunk;
        }
        let data = cursor.read_all()?;

        let store = self.store.clone();
        let missing = header.missing;
        tokio::task::spawn_blocking(move || store.store_recording(key, &data, missing)).await??;
        *consumed = header.size;

        if missing {
            warn!(region = %key, "Core reported lost recording data");
        }
        debug!(region = %key, bytes = length, "Drained region");
        Ok(DrainOutcome::Drained { bytes: length })
    }

    /// Drains every recorded region of every registered vertex, at most `max_in_flight` at a
    /// time. Stops at the first failure.
    pub async fn drain_all(&self) -> FecResult<Vec<(RegionKey, DrainOutcome)>> {
        let mut jobs = Vec::new();
        for vertex in read(&self.vertices).values() {
            if let Some(receiver) = vertex.as_receiver() {
                for region in receiver.recorded_region_ids() {
                    jobs.push((vertex.label().to_string(), vertex.placement(), region));
                }
            }
        }
        info!(regions = jobs.len(), "Draining all recorded regions");

        let mut results: Vec<(RegionKey, DrainOutcome)> = stream::iter(jobs)
            .map(|(label, placement, region)| async move {
                let outcome = self.drain(&label, region).await?;
                Ok::<_, FecError>((RegionKey::new(placement.x, placement.y, placement.p, region), outcome))
            })
            .buffer_unordered(self.max_in_flight)
            .try_collect()
            .await?;
        results.sort_by_key(|(key, _)| *key);
        Ok(results)
    }

    /// Drains the regions cores have asked for through their listeners.
    pub async fn drain_requested(&self) -> FecResult<Vec<(RegionKey, DrainOutcome)>> {
        let requested = std::mem::take(&mut *lock(&self.pending));
        let by_placement: HashMap<Placement, String> = read(&self.vertices)
            .values()
            .map(|v| (v.placement(), v.label().to_string()))
            .collect();

        let mut results = Vec::with_capacity(requested.len());
        for key in requested {
            let Some(label) = by_placement.get(&Placement::new(key.x, key.y, key.p)) else {
                warn!(region = %key, "Buffer request from a core with no registered vertex");
                continue;
            };
            let outcome = self.drain(label, key.region).await?;
            results.push((key, outcome));
        }
        Ok(results)
    }

    /// Stored data of a recorded region and whether it is missing.
    pub async fn get_recording(&self, label: &str, region: u32) -> FecResult<(Vec<u8>, bool)> {
        let vertex = self.vertex(label)?;
        let records = vertex
            .as_receiver()
            .map(|r| r.recorded_region_ids().contains(&region))
            .unwrap_or(false);
        if !records {
            return Err(FecError::RegionNotRecorded {
                vertex: label.to_string(),
                region,
            });
        }
        let placement = vertex.placement();
        let key = RegionKey::new(placement.x, placement.y, placement.p, region);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.get_region_data(key)).await?
    }

    /// Writes the first buffer-full of events of every send region. Returns the bytes written.
    pub async fn load_initial_buffers(&self) -> FecResult<usize> {
        let senders: Vec<Arc<dyn BufferedVertex>> = read(&self.vertices)
            .values()
            .filter(|v| v.as_sender().is_some())
            .cloned()
            .collect();

        let mut sending = self.sending.lock().await;
        let mut total = 0;
        for vertex in senders {
            let Some(sender) = vertex.as_sender() else { continue };
            let placement = vertex.placement();
            for region in sender.send_region_ids() {
                self.check_cancelled()?;
                let entry = sending
                    .entry((vertex.label().to_string(), region))
                    .or_insert_with(|| SendingRegion::from_events(sender.send_events(region)));
                let data = entry.fill_buffer(sender.send_region_size(region), self.max_packet_bytes);
                let key = RegionKey::new(placement.x, placement.y, placement.p, region);
                let address = sender.send_region_address(region);
                self.bounded(key, self.transceiver.write_memory(placement.x, placement.y, address, &data))
                    .await?;
                debug!(region = %key, bytes = data.len(), "Loaded send buffer");
                total += data.len();
            }
        }
        Ok(total)
    }

    /// Moves a send region back to its first event. Stored recordings are untouched.
    pub async fn rewind(&self, label: &str, region: u32) -> FecResult<()> {
        self.vertex(label)?;
        let mut sending = self.sending.lock().await;
        let entry = sending
            .get_mut(&(label.to_string(), region))
            .ok_or_else(|| FecError::RegionNotSent {
                vertex: label.to_string(),
                region,
            })?;
        entry.rewind();
        self.set_phase(label, VertexPhase::Rewound);
        debug!(vertex = label, region, "Rewound send region");
        Ok(())
    }

    /// Prepares for a new run: rewinds every send region and forgets how much of each
    /// recording has been drained, so the next drain reads the new recording from its start.
    /// Data already stored is kept.
    pub async fn reset(&self) {
        let mut sending = self.sending.lock().await;
        for ((label, _), region) in sending.iter_mut() {
            region.rewind();
            self.set_phase(label, VertexPhase::Rewound);
        }

        let regions: Vec<Arc<tokio::sync::Mutex<u32>>> = lock(&self.consumed).values().cloned().collect();
        for region in &regions {
            *region.lock().await = 0;
        }
        info!(send_regions = sending.len(), recording_regions = regions.len(), "Reset buffers");
    }

    /// Cancels in-flight work and closes every listener. Idempotent.
    pub async fn shutdown(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut listeners = self.listeners.lock().await;
        for (class, registration) in listeners.drain() {
            debug!(%class, consumers = registration.vertices.len(), "Closing listener");
            registration.listener.close();
        }
        info!("Buffer manager stopped");
    }

    fn vertex(&self, label: &str) -> FecResult<Arc<dyn BufferedVertex>> {
        read(&self.vertices)
            .get(label)
            .cloned()
            .ok_or_else(|| FecError::UnknownVertex(label.to_string()))
    }

    fn set_phase(&self, label: &str, phase: VertexPhase) {
        lock(&self.phases).insert(label.to_string(), phase);
    }

    fn check_cancelled(&self) -> FecResult<()> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(FecError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one transport call under the drain timeout, refusing to start after shutdown.
    async fn bounded<T>(&self, key: RegionKey, call: impl Future<Output = FecResult<T>>) -> FecResult<T> {
        self.check_cancelled()?;
        match tokio::time::timeout(self.drain_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FecError::DrainTimeout {
                x: key.x,
                y: key.y,
                p: key.p,
                region: key.region,
                timeout_ms: self.drain_timeout.as_millis() as u64,
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_entry_splits_missing_flag() {
        let mut entry = Vec::new();
        entry.extend_from_slice(&1024u32.to_le_bytes());
        entry.extend_from_slice(&(100u32 | MISSING_FLAG).to_le_bytes());
        entry.extend_from_slice(&0x7000_0000u32.to_le_bytes());

        let header = RecordingRegionHeader::parse(&entry).unwrap();
        assert_eq!(
            header,
            RecordingRegionHeader {
                space: 1024,
                size: 100,
                missing: true,
                data_address: 0x7000_0000,
            }
        );
        assert!(RecordingRegionHeader::parse(&entry[..8]).is_err());
    }
}
