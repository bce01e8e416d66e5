//! Wavestore storage layer
//!
//! This module provides everything below the query engine:
//!
//! - **types**: Core data structures (SeedName, TimeRange, FileDescriptor, julian days)
//! - **mseed**: MiniSEED record header access and record building
//! - **codec**: Sample codec seam (plain integer encodings)
//! - **index_file**: Index/data file contract and on-disk implementation
//! - **pool**: Shared pool of open index-file handles
//! - **buffer_pool**: Scratch buffers for extent reads
//! - **directory**: Day → files cache refreshed in the background
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Query Path:
//!   julian day → FileDirectoryCache → FileDescriptor
//!              → IndexFilePool → IndexFile
//!              → master block → index chain → extent → records
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use wavestore::storage::{FileDirectoryCache, IndexFilePool, DiskOpener};
//!
//! let cache = FileDirectoryCache::new(vec!["/data/wave".into()]);
//! cache.refresh();
//! let pool = IndexFilePool::new(DiskOpener);
//! for desc in cache.files_for_day(2_456_678) {
//!     let file = pool.get_or_open(&desc).unwrap();
//!     println!("{} channels in {:?}", file.channels().unwrap().len(), desc.path);
//! }
//! ```

pub mod buffer_pool;
pub mod codec;
pub mod directory;
pub mod error;
pub mod index_file;
pub mod mseed;
pub mod pool;
pub mod types;

// Re-export commonly used types
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use codec::{encoding, PlainCodec, SampleCodec};
pub use directory::{FileDirectoryCache, ScanStats};
pub use error::{CodecError, StorageError, StorageResult};
pub use index_file::{
    DiskIndexFile, DiskOpener, Extent, IndexBlock, IndexFile, IndexFileOpener, IndexFileWriter,
    MasterEntry, EXTENT_BLOCKS, EXTENT_BYTES,
};
pub use mseed::{RecordBuilder, RecordHeader, BLOCK_SIZE};
pub use pool::{IndexFilePool, PoolStats};
pub use types::{FileDescriptor, SeedName, TimeRange};
