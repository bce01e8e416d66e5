//! # Wavestore
//!
//! Continuous seismic waveform store: day-partitioned MiniSEED files on
//! disk, an in-memory realtime buffer per channel, and a line-protocol
//! query server over both.
//!
//! ## Features
//!
//! - **Day/node partitions**: index + data file pairs found by a background directory scan
//! - **Extent chains**: per-channel index blocks pointing at 64-block extents
//! - **Realtime spans**: time-anchored buffers with measured sample rates
//! - **Query protocol**: data, gap headers, listings and privileged deletes
//!
//! ## Modules
//!
//! - [`storage`]: Record format, index files, handle pool, directory cache
//! - [`realtime`]: Realtime span buffers and their registry
//! - [`query`]: Command parser and disk query engine
//! - [`server`]: TCP listeners and housekeeping tasks
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wavestore::{Config, Context, QuerySession};
//!
//! let ctx = Arc::new(Context::new(Config::load_default()));
//! ctx.directory.refresh();
//!
//! let mut session = QuerySession::new(Arc::clone(&ctx), "127.0.0.1".parse().unwrap());
//! let mut out = Vec::new();
//! session
//!     .handle_line("'-s' 'IUANMO BHZ00' '-b' '2014/01/20 12:00:00' '-d' '60'\t", &mut out)
//!     .unwrap();
//! println!("{} bytes", out.len());
//! ```

pub mod config;
pub mod context;
pub mod query;
pub mod realtime;
pub mod server;
pub mod storage;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError};
pub use context::Context;

pub use storage::{
    FileDescriptor, FileDirectoryCache, IndexFile, IndexFilePool, RecordHeader, SeedName,
    StorageError, StorageResult, TimeRange,
};

pub use realtime::{RealtimeSpan, SpanRegistry, TimeSeriesBlock};

pub use query::{DiskQueryEngine, QueryCommand, QueryError, QueryParameters, QuerySession};

pub use server::{Server, ServerError};
