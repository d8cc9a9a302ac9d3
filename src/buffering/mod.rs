//! Draining recorded data from device buffers, and pre-loading buffers the device sends from.
pub mod coordinator;
pub mod mock;
pub mod sending;
pub mod transport;
pub mod vertex;

pub use coordinator::{BufferDrainCoordinator, DrainOutcome, ListenerRegistration, RecordingRegionHeader};
pub use sending::{EventPacket, SendingRegion};
pub use transport::{ConnectionClass, PacketCallback, PacketListener, Transceiver};
pub use vertex::{BufferedVertex, Placement, ReceivesBuffersToHost, SendsBuffersFromHost, VertexPhase};
