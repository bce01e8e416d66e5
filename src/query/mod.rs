//! Wavestore query layer
//!
//! Answers text commands against the on-disk store and the realtime cache:
//!
//! - **command**: Command-line parsing (`-b`, `-d`, `-e`, `-ls`, `-delete`, ...)
//! - **filter**: Exclusions, restricted prefixes and station/ring selection
//! - **engine**: DiskQueryEngine, the per-connection state machine
//! - **delete**: Record tombstoning and trimming
//! - **dedup**: Duplicate-suppressing result array
//! - **listing**: `-ls`, `-lsc` and `-lsrt` lines
//! - **session**: One connection's command loop and sentinels
//!
//! # Command Language
//!
//! ```text
//! <mask> -b 2014/01/20 12:00:00 -d 300 [-gaps] [-exclude list] [-delazc ...]\t
//! <mask> -b 2014,020 -e 2014,021 -ls\n
//! ```
//!
//! A trailing `\t` keeps the connection open and asks for an `<EOR>`
//! sentinel; a trailing `\n` closes it after the reply.

pub mod command;
pub mod dedup;
pub mod delete;
pub mod engine;
pub mod error;
pub mod filter;
pub mod listing;
pub mod session;

pub use command::{QueryCommand, QueryMode, Terminator};
pub use dedup::{ResultArraySink, ResultEntry};
pub use delete::{DeleteOutcome, DeleteTombstone};
pub use engine::{DiskQueryEngine, EngineState, QueryParameters, RecordSink};
pub use error::{QueryError, QueryResult};
pub use filter::{
    ChannelFilter, ExclusionLists, MetadataLookup, PrefixRestrictions, RestrictionSource,
    RingSpec, StationTable,
};
pub use session::{QuerySession, EOR, ERR};
