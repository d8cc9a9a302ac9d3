//! Capabilities a placed vertex declares to the buffer manager.
//!
//! A vertex that records data into device buffers exposes [`ReceivesBuffersToHost`]; one that
//! is pre-loaded with events to send exposes [`SendsBuffersFromHost`]. The coordinator asks
//! for these capabilities instead of knowing concrete vertex types.

use crate::buffering::transport::ConnectionClass;
use std::collections::BTreeMap;
use std::fmt;

/// Core a vertex runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub p: u32,
}

impl Placement {
    pub fn new(x: u32, y: u32, p: u32) -> Self {
        Self { x, y, p }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.p)
    }
}

/// Recording capability: the core writes into circular buffers the host drains.
pub trait ReceivesBuffersToHost: Send + Sync {
    /// Region ids this vertex records into.
    fn recorded_region_ids(&self) -> Vec<u32>;

    /// Device address of the recording header.
    ///
    /// ```text
    /// [n_regions: u32]
    /// per region: [space: u32][size: u32, bit 31 = data lost][data address: u32]
    /// ```
    fn recording_header_address(&self) -> u32;
}

/// Send capability: events are pre-loaded into device buffers before the run.
pub trait SendsBuffersFromHost: Send + Sync {
    fn send_region_ids(&self) -> Vec<u32>;

    /// Device address of a send buffer.
    fn send_region_address(&self, region: u32) -> u32;

    /// Capacity of a send buffer in bytes.
    fn send_region_size(&self, region: u32) -> usize;

    /// Keys to send, grouped by timestamp.
    fn send_events(&self, region: u32) -> BTreeMap<u32, Vec<u32>>;
}

/// A placed vertex that takes part in buffering.
pub trait BufferedVertex: Send + Sync {
    /// Unique name of the vertex.
    fn label(&self) -> &str;

    fn placement(&self) -> Placement;

    /// Listener class the vertex's traffic arrives on.
    fn connection_class(&self) -> ConnectionClass {
        ConnectionClass::Eieio
    }

    fn as_receiver(&self) -> Option<&dyn ReceivesBuffersToHost> {
        None
    }

    fn as_sender(&self) -> Option<&dyn SendsBuffersFromHost> {
        None
    }
}

/// Where a vertex is in its buffering life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexPhase {
    Unregistered,
    Listening,
    Draining,
    Rewound,
    Drained,
}
