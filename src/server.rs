//! TCP front end
//!
//! Two listeners share one [`Context`]:
//!
//! - the query port speaks the line protocol answered by [`QuerySession`];
//!   each connection runs on a blocking worker because the engine does
//!   synchronous file I/O
//! - the optional ingest port accepts a stream of raw MiniSEED records and
//!   feeds them to the realtime span registry
//!
//! Housekeeping runs alongside: directory rescans, idle handle eviction and
//! a periodic realtime memory report.

use crate::context::Context;
use crate::query::command::Terminator;
use crate::query::session::QuerySession;
use crate::realtime::TimeSeriesBlock;
use crate::storage::mseed::RecordHeader;
use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Longest command line accepted before the connection is dropped
const MAX_LINE: usize = 4096;

/// Bytes read before an ingested record's length is known
const INGEST_HEADER: usize = 64;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

pub struct Server {
    ctx: Arc<Context>,
    shutdown: Arc<RwLock<bool>>,
}

impl Server {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Bind the configured ports and serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> ServerResult<()> {
        let server = &self.ctx.config.server;
        let addr = format!("{}:{}", server.host, server.port);
        let listener = bind(&addr).await?;

        let ingest = match self.ctx.config.realtime.ingest_port {
            0 => None,
            port => Some(bind(&format!("{}:{}", server.host, port)).await?),
        };

        self.serve(listener, ingest, shutdown_signal()).await
    }

    /// Serve on already-bound listeners until `stop` resolves
    pub async fn serve(
        &self,
        listener: TcpListener,
        ingest: Option<TcpListener>,
        stop: impl Future<Output = ()>,
    ) -> ServerResult<()> {
        let mut tasks = vec![
            self.ctx.directory.start_background_refresh(),
            self.start_handle_eviction(),
            self.start_stats_report(),
        ];
        if let Some(ingest) = ingest {
            tracing::info!("Wavestore ingest listening on {}", ingest.local_addr()?);
            tasks.push(self.start_ingest(ingest));
        }

        tracing::info!("Wavestore query server listening on {}", listener.local_addr()?);
        tokio::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
            }
        }

        *self.shutdown.write().await = true;
        self.ctx.directory.shutdown().await;
        for task in tasks {
            task.abort();
        }
        tracing::info!("Wavestore server shut down");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let timeout = Duration::from_secs(ctx.config.server.read_timeout_secs);

        let stream = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            s.set_read_timeout(Some(timeout))?;
            Ok(s)
        }) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer = %peer, "Cannot configure connection: {}", e);
                return;
            }
        };

        let span = tracing::info_span!("connection", id = %Uuid::new_v4(), peer = %peer);
        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            tracing::debug!("Connection opened");
            let mut session = QuerySession::new(ctx, peer_ip(&peer));
            match serve_connection(&mut session, stream) {
                Ok(()) => tracing::debug!(commands = session.commands(), "Connection closed"),
                Err(e) => tracing::warn!("Connection dropped: {}", e),
            }
        });
    }

    fn start_handle_eviction(&self) -> JoinHandle<()> {
        let pool = Arc::clone(&self.ctx.pool);
        let idle = self.ctx.config.storage.idle_handle();
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(idle.max(Duration::from_secs(1)) / 2);
            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    break;
                }
                let closed = pool.evict_idle(idle);
                if closed > 0 {
                    tracing::debug!(closed, open = pool.len(), "Idle index files closed");
                }
            }
        })
    }

    fn start_stats_report(&self) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        let every = Duration::from_secs(ctx.config.realtime.stats_interval_secs.max(1));
        let shutdown = Arc::clone(&self.shutdown);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    break;
                }
                let pool = ctx.pool.stats();
                tracing::info!(
                    spans = ctx.spans.len(),
                    span_bytes = ctx.spans.memory_usage(),
                    open_files = pool.open_handles,
                    "Realtime memory"
                );
            }
        })
    }

    fn start_ingest(&self, listener: TcpListener) -> JoinHandle<()> {
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            match ingest_stream(&ctx, stream).await {
                                Ok(records) => {
                                    tracing::debug!(peer = %peer, records, "Ingest feed closed")
                                }
                                Err(e) => {
                                    tracing::warn!(peer = %peer, "Ingest feed dropped: {}", e)
                                }
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Ingest accept failed: {}", e),
                }
            }
        })
    }
}

/// Bind `addr`, naming it in the error
async fn bind(addr: &str) -> ServerResult<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Command loop for one client; returns when the client closes or asks to
fn serve_connection<S: Read + Write>(session: &mut QuerySession, mut stream: S) -> std::io::Result<()> {
    let mut pending = Vec::new();
    loop {
        let line = match read_command(&mut stream, &mut pending)? {
            Some(line) => line,
            None => return Ok(()),
        };
        match session.handle_line(&line, &mut stream) {
            Ok(Terminator::KeepOpen) => continue,
            Ok(Terminator::Close) => return Ok(()),
            Err(e) => return Err(std::io::Error::other(e.to_string())),
        }
    }
}

/// Next command up to and including its `\t` or `\n`
///
/// A final unterminated line is returned as is; `None` means the client is
/// done.
fn read_command<R: Read>(stream: &mut R, pending: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\t' || b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        if pending.len() > MAX_LINE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("command longer than {} bytes", MAX_LINE),
            ));
        }

        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            if pending.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(None);
            }
            let line = std::mem::take(pending);
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}

/// Feed records from one ingest connection into the span registry
async fn ingest_stream(ctx: &Context, mut stream: TcpStream) -> std::io::Result<usize> {
    let max_record = ctx.config.storage.max_record_size;
    let mut accepted = 0;
    loop {
        let mut record = vec![0u8; INGEST_HEADER];
        match stream.read_exact(&mut record).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(accepted),
            Err(e) => return Err(e),
        }

        let header = RecordHeader::parse(&record)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        if header.record_length < INGEST_HEADER || header.record_length > max_record {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                format!("record length {} for {}", header.record_length, header.seed_name),
            ));
        }
        record.resize(header.record_length, 0);
        stream.read_exact(&mut record[INGEST_HEADER..]).await?;

        match TimeSeriesBlock::from_record(&record) {
            Ok(block) => {
                if ctx.spans.on_ingest(&block) {
                    accepted += 1;
                }
            }
            Err(e) => tracing::warn!(channel = %header.seed_name, "Ingested record rejected: {}", e),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

/// Address a client is known by in logs and privilege checks
pub fn peer_ip(addr: &SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::query::session::EOR;
    use crate::storage::index_file::IndexFileWriter;
    use crate::storage::mseed::{RecordBuilder, BLOCK_SIZE};
    use crate::storage::types::{julian_from_millis, SeedName};
    use std::io::Cursor;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    // 2014-01-20 12:00:00 UTC
    const T0: i64 = 1_390_219_200_000;

    fn record(start_ms: i64, fill: i32) -> Vec<u8> {
        RecordBuilder::new(SeedName::new("USDUG  BHZ00"), start_ms * 1000, 40.0)
            .build(&[fill; 100])
            .unwrap()
    }

    fn context(root: &std::path::Path) -> Arc<Context> {
        let mut config = Config::default();
        config.storage.roots = vec![root.display().to_string()];
        config.query.nice_bytes = 0;
        let ctx = Arc::new(Context::new(config));
        ctx.directory.refresh();
        ctx
    }

    #[test]
    fn test_read_command_splits_on_terminators() {
        let mut input = Cursor::new(b"'-lsc'\t'-ls'\n'-lsrt'".to_vec());
        let mut pending = Vec::new();

        assert_eq!(read_command(&mut input, &mut pending).unwrap().unwrap(), "'-lsc'\t");
        assert_eq!(read_command(&mut input, &mut pending).unwrap().unwrap(), "'-ls'\n");
        assert_eq!(read_command(&mut input, &mut pending).unwrap().unwrap(), "'-lsrt'");
        assert!(read_command(&mut input, &mut pending).unwrap().is_none());
    }

    #[test]
    fn test_read_command_rejects_runaway_lines() {
        let mut input = Cursor::new(vec![b'x'; MAX_LINE * 2]);
        let mut pending = Vec::new();
        let err = read_command(&mut input, &mut pending).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_peer_ip_unmaps_v4() {
        let addr: SocketAddr = "[::ffff:10.0.0.5]:4000".parse().unwrap();
        assert_eq!(peer_ip(&addr), "10.0.0.5".parse::<IpAddr>().unwrap());
        let addr: SocketAddr = "[::1]:4000".parse().unwrap();
        assert_eq!(peer_ip(&addr), "::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_query_over_tcp() {
        let dir = tempdir().unwrap();
        let records = [record(T0, 1), record(T0 + 2500, 2)];
        let mut writer = IndexFileWriter::create(dir.path(), julian_from_millis(T0), "CI").unwrap();
        for r in &records {
            writer.append(r).unwrap();
        }
        writer.finish().unwrap();

        let server = Server::new(context(dir.path()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .serve(listener, None, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"'-s' 'USDUG  BHZ00' '-b' '2014/01/20 12:00:00' '-d' '5'\t")
            .await
            .unwrap();
        let mut reply = vec![0u8; 3 * BLOCK_SIZE];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..BLOCK_SIZE], &records[0][..]);
        assert_eq!(&reply[BLOCK_SIZE..2 * BLOCK_SIZE], &records[1][..]);
        assert!(reply[2 * BLOCK_SIZE..].starts_with(EOR));

        client
            .write_all(b"'-lsc' '-b' '2014/01/20 00:00:00' '-d' '86400'\n")
            .await
            .unwrap();
        let mut listing = String::new();
        client.read_to_string(&mut listing).await.unwrap();
        assert!(listing.starts_with("USDUG  BHZ00 #days=0001 14020"), "{}", listing);

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ingest_feeds_spans() {
        let dir = tempdir().unwrap();
        let ctx = context(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let feeder = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let now = chrono::Utc::now().timestamp_millis();
            for i in 0..3 {
                client.write_all(&record(now - 60_000 + i * 2500, i as i32)).await.unwrap();
            }
        });

        let (stream, _) = listener.accept().await.unwrap();
        feeder.await.unwrap();
        let accepted = ingest_stream(&ctx, stream).await.unwrap();

        assert_eq!(accepted, 3);
        let summaries = ctx.spans.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].channel.as_str(), "USDUG  BHZ00");
    }
}
