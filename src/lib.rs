pub mod types;
pub mod header;
pub mod layout;
pub mod disk;
pub mod compress;
pub mod crypto;
pub mod block;
pub mod index;
pub mod codec;
pub mod set;
pub mod store;
pub mod retention;
pub mod consolidate;
pub mod error;

pub use header::{FormatCaps, Header};
pub use codec::{ImageReader, ImageWriter};
pub use index::{BlockIndex, BlockKey, DeltaPayload, IndexEntry};
pub use layout::{DiskLayout, FileLayout, PartitionLayout};
pub use set::{BackupDefinition, BackupSet, SetStore};
pub use store::{BlockStore, StoreLimits};
pub use consolidate::ConsolidationEngine;
pub use retention::{RetentionAction, RetentionConfig};
pub use error::{Error, Result};
