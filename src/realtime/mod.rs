//! Realtime memory cache
//!
//! - **anchors**: offset ↔ time anchors (TimeAnchorIndex)
//! - **rate**: measured sample rate (RateEstimator)
//! - **runs**: intervals holding real data (RunList)
//! - **block**: compressed/raw input blocks (TimeSeriesBlock)
//! - **span**: per-channel shiftable buffer (RealtimeSpan)
//! - **registry**: channel → span table (SpanRegistry)
//!
//! ```text
//! Ingest Path:
//!   TimeSeriesBlock → SpanRegistry → RealtimeSpan
//!                                     ├─ TimeAnchorIndex
//!                                     ├─ RateEstimator
//!                                     └─ RunList
//! Export Path:
//!   RealtimeSpan::make_trace_buf → TraceChunk
//! ```

pub mod anchors;
pub mod block;
pub mod rate;
pub mod registry;
pub mod runs;
pub mod span;

pub use anchors::{Anchor, TimeAnchorIndex};
pub use block::TimeSeriesBlock;
pub use rate::RateEstimator;
pub use registry::{SharedSpan, SpanRegistry, SpanSummary};
pub use runs::{Run, RunList};
pub use span::{RealtimeSpan, ShiftOutcome, TraceChunk, FILL};
