//! Dataset indexing, loading and Burn-compatible batching for BEV detection rasters.
//!
//! Layout under a dataset root:
//! - `ImageSets/<split>.txt`: sample ids, one per line (optional)
//! - `bev/<id>.png`: RGB bird's-eye-view raster
//! - `labels/<id>.txt`: object labels (see `data_contracts::ObjectLabel`)

pub mod batch;
pub mod index;
pub mod loader;
pub mod types;

pub use batch::{create_train_dataloader, create_val_dataloader, BatchIter, BevBatch, HostBatch};
pub use index::index_split;
pub use loader::load_sample;
pub use types::*;
