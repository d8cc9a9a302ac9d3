//! Host-side storage: byte cursors, region content and reconciled recordings.
pub mod cursor;
pub mod db;
pub mod region_store;
pub mod series;

pub use cursor::{new_cursor, BufferedCursor, CursorFactory, FileCursor, MemoryCursor, Whence};
pub use db::Database;
pub use region_store::{RegionInfo, RegionKey, RegionStore, UpsertStrategy};
pub use series::{DataType, SeriesData, SeriesReconciler, Signal};
