//! # Front-End Buffering Core
//!
//! Host-side services for a many-core simulation machine: draining recordings out of on-device
//! circular buffers into a queryable store, and telling external observers when that store is
//! ready and when the run changes phase.
//!
//! ## Crate Structure
//!
//! - **`buffering`**: The `BufferDrainCoordinator`, which shares one listener per connection
//!   class between vertices, drains recording regions on demand and pre-loads send buffers.
//!   The device transport is consumed through the `Transceiver` trait.
//! - **`data`**: `BufferedCursor` byte buffers (in memory or spilled to a temporary file), the
//!   SQLite-backed `RegionStore`, and the `SeriesReconciler` that merges per-core recording
//!   tables into one view per signal.
//! - **`network`**: The notification protocol. `ControlChannel` broadcasts database-ready,
//!   start/resume and stop/pause to observers; `ObserverConnection` is the observer's end.
//! - **`config`**: Figment-based `FecConfig` (TOML plus `FEC_` environment variables).
//! - **`error`**: The crate-wide `FecError` enum.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.

pub mod buffering;
pub mod config;
pub mod data;
pub mod error;
pub mod network;
pub mod tracing_setup;

pub use error::{FecError, FecResult};
