//! Shared service state
//!
//! Everything that outlives a single request is built once here and handed
//! to the server, the ingest listener and every query session.

use crate::config::Config;
use crate::query::engine::DiskQueryEngine;
use crate::query::filter::{
    ExclusionLists, MetadataLookup, PrefixRestrictions, RestrictionSource, StationTable,
};
use crate::realtime::SpanRegistry;
use crate::storage::{
    BufferPool, DiskOpener, FileDirectoryCache, IndexFilePool, PlainCodec, SampleCodec,
    EXTENT_BYTES,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Context {
    pub config: Config,
    pub directory: Arc<FileDirectoryCache>,
    pub pool: Arc<IndexFilePool>,
    pub spans: Arc<SpanRegistry>,
    pub exclusions: Arc<ExclusionLists>,
    pub restrictions: Arc<dyn RestrictionSource>,
    pub metadata: Arc<dyn MetadataLookup>,
    pub codec: Arc<dyn SampleCodec>,
    pub buffers: BufferPool,
    privileged: Vec<IpAddr>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let codec: Arc<dyn SampleCodec> = Arc::new(PlainCodec);

        let directory = FileDirectoryCache::new(config.storage.root_paths()).with_intervals(
            config.storage.scan_interval(),
            config.storage.midnight_scan_interval(),
        );

        let privileged = config
            .query
            .privileged_hosts
            .iter()
            .filter_map(|host| match host.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(host = %host, "Ignoring privileged host that is not an IP address");
                    None
                }
            })
            .collect();

        Self {
            directory: Arc::new(directory),
            pool: Arc::new(IndexFilePool::new(DiskOpener)),
            spans: Arc::new(SpanRegistry::new(&config.realtime, Arc::clone(&codec))),
            exclusions: Arc::new(ExclusionLists::from_config(&config.query)),
            restrictions: Arc::new(PrefixRestrictions::new(config.query.restricted.clone())),
            metadata: Arc::new(StationTable::from_config(&config.metadata.stations)),
            buffers: BufferPool::new(EXTENT_BYTES, config.storage.buffer_pool_size),
            codec,
            privileged,
            config,
        }
    }

    /// Builder: replace the station lookup behind `-delazc`
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataLookup>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Builder: replace the codec (e.g. one that understands Steim)
    pub fn with_codec(mut self, codec: Arc<dyn SampleCodec>) -> Self {
        self.spans = Arc::new(SpanRegistry::new(&self.config.realtime, Arc::clone(&codec)));
        self.codec = codec;
        self
    }

    /// A fresh engine for one connection
    pub fn engine(&self) -> DiskQueryEngine {
        DiskQueryEngine::new(Arc::clone(&self.directory), Arc::clone(&self.pool))
            .with_restrictions(Arc::clone(&self.restrictions))
            .with_exclusions(Arc::clone(&self.exclusions))
            .with_codec(Arc::clone(&self.codec))
            .with_buffers(self.buffers.clone())
            .with_limits(
                self.config.query.max_days,
                self.config.storage.max_record_size,
                Duration::from_secs(self.config.query.handle_touch_secs),
            )
    }

    /// Whether a peer may see restricted channels
    pub fn is_privileged(&self, peer: &IpAddr) -> bool {
        self.privileged.contains(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privileged_hosts() {
        let mut config = Config::default();
        config.query.privileged_hosts = vec!["127.0.0.1".into(), "not-an-ip".into(), "::1".into()];
        let ctx = Context::new(config);

        assert!(ctx.is_privileged(&"127.0.0.1".parse().unwrap()));
        assert!(ctx.is_privileged(&"::1".parse().unwrap()));
        assert!(!ctx.is_privileged(&"10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_engine_uses_configured_limits() {
        let mut config = Config::default();
        config.query.max_days = 2;
        config.storage.roots = vec![tempfile::tempdir().unwrap().path().display().to_string()];
        let ctx = Context::new(config);

        let mut engine = ctx.engine();
        let t0 = 1_390_219_200_000;
        let err = engine
            .set_parameters(crate::query::engine::QueryParameters::new(t0, t0 + 3 * 86_400_000))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::query::QueryError::RangeTooLarge { days: 3, max: 2 }
        ));
    }
}
