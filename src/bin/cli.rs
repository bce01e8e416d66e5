//! Wavestore CLI
//!
//! Command-line interface for Wavestore operations:
//! - Query data and listings from a running server
//! - Delete data (from a privileged host)
//! - Scan data roots and import MiniSEED files into day partitions
//! - Feed records to the realtime ingest port

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;
use wavestore::query::command::{parse_duration, parse_time};
use wavestore::query::session::{EOR, ERR};
use wavestore::storage::mseed::{RecordHeader, BLOCK_SIZE};
use wavestore::storage::types::format_millis;
use wavestore::storage::{FileDirectoryCache, IndexFileWriter};

#[derive(Parser)]
#[command(name = "wavestore")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Continuous seismic waveform store")]
#[command(long_about = "Wavestore keeps day-partitioned MiniSEED data on disk and the most recent\nhour of every channel in memory, and answers queries over a line protocol.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Query server address
    #[arg(long, default_value = "127.0.0.1:2061", global = true)]
    pub server: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

/// Time window shared by the server commands
#[derive(clap::Args, Clone)]
pub struct Window {
    /// Begin time ("2014/01/20 12:00:00" or "2014,020-12:00:00")
    #[arg(short, long)]
    pub begin: Option<String>,
    /// Duration in seconds, or days with a `d` suffix
    #[arg(short, long)]
    pub duration: Option<String>,
    /// End time, instead of a duration
    #[arg(short, long, conflicts_with = "duration")]
    pub end: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch records for channels matching a mask
    Query {
        /// Channel regular expression over NNSSSSSCCCLL names
        mask: String,
        #[command(flatten)]
        window: Window,
        /// Only record headers
        #[arg(long)]
        gaps: bool,
        /// Suppress duplicate records
        #[arg(long)]
        dedup: bool,
        /// Read from the realtime buffers instead of disk
        #[arg(long, conflicts_with = "dedup")]
        realtime: bool,
        /// Write the raw records here instead of summarizing them
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List index files
    Ls {
        #[command(flatten)]
        window: Window,
    },

    /// List channels and the days they cover
    Lsc {
        /// Channel regular expression
        mask: Option<String>,
        #[command(flatten)]
        window: Window,
    },

    /// List realtime buffers
    Lsrt {
        /// Channel regular expression
        mask: Option<String>,
    },

    /// Delete records in a time window
    Delete {
        /// Channel regular expression
        mask: String,
        #[command(flatten)]
        window: Window,
    },

    /// Scan data roots and report what was found
    Scan {
        /// Directories to scan
        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },

    /// Import MiniSEED files into day partitions
    Import {
        /// MiniSEED files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Destination directory
        #[arg(short = 'o', long)]
        dir: PathBuf,
        /// Node name used in partition file names
        #[arg(short, long, default_value = "CI")]
        node: String,
        /// Parse only, write nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Send MiniSEED files to a realtime ingest port
    Ingest {
        /// MiniSEED files
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Ingest address
        #[arg(long)]
        to: String,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Query {
            mask,
            window,
            gaps,
            dedup,
            realtime,
            output,
        } => {
            let mut tokens = vec!["-s".to_string(), mask.clone()];
            tokens.extend(window_tokens(window)?);
            if *gaps {
                tokens.push("-gaps".into());
            }
            if *dedup {
                tokens.push("-dedup".into());
            }
            if *realtime {
                tokens.push("-rt".into());
            }

            let reply = request(&cli.server, &tokens)?;
            check_reply(&reply)?;

            match output {
                Some(path) => {
                    std::fs::write(path, &reply)?;
                    println!("Wrote {} bytes to {:?}", reply.len(), path);
                }
                None => {
                    let chunk = if *gaps { 64 } else { 0 };
                    print_records(&reply, chunk, &cli.format)?;
                }
            }
        }

        Commands::Ls { window } => {
            let mut tokens = vec!["-ls".to_string()];
            tokens.extend(window_tokens(window)?);
            print_lines(&request(&cli.server, &tokens)?, &cli.format)?;
        }

        Commands::Lsc { mask, window } => {
            let mut tokens = mask_tokens(mask.as_deref());
            tokens.push("-lsc".into());
            tokens.extend(window_tokens(window)?);
            print_lines(&request(&cli.server, &tokens)?, &cli.format)?;
        }

        Commands::Lsrt { mask } => {
            let mut tokens = mask_tokens(mask.as_deref());
            tokens.push("-lsrt".into());
            print_lines(&request(&cli.server, &tokens)?, &cli.format)?;
        }

        Commands::Delete { mask, window } => {
            if window.begin.is_none() {
                bail!("delete needs --begin");
            }
            let mut tokens = vec!["-s".to_string(), mask.clone(), "-delete".to_string()];
            tokens.extend(window_tokens(window)?);
            let reply = request(&cli.server, &tokens)?;
            check_reply(&reply)?;
            let lines = String::from_utf8_lossy(&reply);
            let freed = lines.lines().filter(|l| l.starts_with("DEL ")).count();
            print_lines(&reply, &cli.format)?;
            if cli.format != "json" {
                println!("{} whole-record slots freed", freed);
            }
        }

        Commands::Scan { roots } => {
            let cache = FileDirectoryCache::new(roots.clone());
            let stats = cache.refresh();

            if cli.format == "json" {
                let body = serde_json::json!({
                    "files": stats.files,
                    "days": stats.days,
                    "duplicates": stats.duplicates,
                    "collisions": stats.collisions,
                    "ignored": stats.ignored,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("{:<40} {:>10} {:>6}", "File", "Julian", "Node");
                println!("{}", "-".repeat(58));
                for desc in cache.all_files() {
                    println!(
                        "{:<40} {:>10} {:>6}",
                        desc.path.display().to_string(),
                        desc.julian,
                        desc.node
                    );
                }
                println!();
                println!(
                    "{} files over {} days ({} duplicates, {} collisions, {} ignored)",
                    stats.files, stats.days, stats.duplicates, stats.collisions, stats.ignored
                );
            }
        }

        Commands::Import {
            files,
            dir,
            node,
            dry_run,
        } => {
            let mut by_day: BTreeMap<i32, Vec<Vec<u8>>> = BTreeMap::new();
            let mut rejected = 0;
            for path in files {
                let data = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
                let (records, bad) = split_records(&data);
                rejected += bad;
                for record in records {
                    let header = RecordHeader::parse(record)?;
                    by_day.entry(header.julian()).or_default().push(record.to_vec());
                }
            }

            println!("Import results:");
            println!("  Days: {}", by_day.len());
            println!("  Records: {}", by_day.values().map(Vec::len).sum::<usize>());
            println!("  Rejected: {}", rejected);

            if *dry_run {
                println!();
                println!("(Dry run - nothing was written)");
            } else {
                std::fs::create_dir_all(dir)?;
                for (julian, records) in by_day {
                    let mut writer = IndexFileWriter::create(dir, julian, node)?;
                    for record in &records {
                        writer.append(record)?;
                    }
                    let desc = writer.finish()?;
                    println!("  Wrote {:?} ({} records)", desc.path, records.len());
                }
            }
        }

        Commands::Ingest { files, to } => {
            let mut stream =
                TcpStream::connect(to).with_context(|| format!("connecting to {}", to))?;
            let mut sent = 0;
            for path in files {
                let data = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
                let (records, _) = split_records(&data);
                for record in records {
                    stream.write_all(record)?;
                    sent += 1;
                }
            }
            stream.flush()?;
            println!("Sent {} records to {}", sent, to);
        }

        Commands::Config { output } => {
            let config = wavestore::config::generate_default_config();

            match output {
                Some(path) => {
                    // Create parent directory if needed
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

fn mask_tokens(mask: Option<&str>) -> Vec<String> {
    mask.map(|m| vec!["-s".to_string(), m.to_string()])
        .unwrap_or_default()
}

/// `-b`/`-d`/`-ed` tokens, validated before they are sent
fn window_tokens(window: &Window) -> anyhow::Result<Vec<String>> {
    let mut tokens = Vec::new();
    if let Some(begin) = &window.begin {
        parse_time(begin)?;
        tokens.extend(["-b".to_string(), begin.clone()]);
    }
    if let Some(duration) = &window.duration {
        let secs = parse_duration(duration)?;
        tokens.extend(["-d".to_string(), secs.to_string()]);
    }
    if let Some(end) = &window.end {
        parse_time(end)?;
        tokens.extend(["-ed".to_string(), end.clone()]);
    }
    Ok(tokens)
}

/// Send one closing command and read the whole reply
fn request(server: &str, tokens: &[String]) -> anyhow::Result<Vec<u8>> {
    let mut line: String = tokens
        .iter()
        .map(|t| format!("'{}'", t))
        .collect::<Vec<_>>()
        .join(" ");
    line.push('\n');

    let mut stream =
        TcpStream::connect(server).with_context(|| format!("connecting to {}", server))?;
    stream.set_read_timeout(Some(Duration::from_secs(600)))?;
    stream.write_all(line.as_bytes())?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    Ok(reply)
}

fn check_reply(reply: &[u8]) -> anyhow::Result<()> {
    if reply.ends_with(ERR) {
        bail!("server rejected the command (see server log)");
    }
    Ok(())
}

/// Whole records in `data`, and how many trailing bytes could not be used
fn split_records(data: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset + BLOCK_SIZE <= data.len() {
        let length = match RecordHeader::parse(&data[offset..]) {
            Ok(header) => header.record_length,
            Err(e) => {
                eprintln!("Skipping block at byte {}: {}", offset, e);
                offset += BLOCK_SIZE;
                continue;
            }
        };
        if offset + length > data.len() {
            break;
        }
        records.push(&data[offset..offset + length]);
        offset += length;
    }
    (records, (data.len() - offset) / BLOCK_SIZE)
}

fn print_lines(reply: &[u8], format: &str) -> anyhow::Result<()> {
    check_reply(reply)?;
    let text = String::from_utf8_lossy(reply);
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches('\0'))
        .filter(|l| !l.is_empty() && l.as_bytes() != EOR)
        .collect();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else if lines.is_empty() {
        println!("Nothing found");
    } else {
        for line in lines {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Summarize records; `chunk` is the fixed size per record for header-only replies
fn print_records(reply: &[u8], chunk: usize, format: &str) -> anyhow::Result<()> {
    let mut rows = Vec::new();
    let mut offset = 0;
    while offset < reply.len() {
        let header = match RecordHeader::parse(&reply[offset..]) {
            Ok(header) => header,
            Err(_) => break,
        };
        let step = if chunk > 0 { chunk } else { header.record_length };
        rows.push(header);
        offset += step;
    }

    if format == "json" {
        let body: Vec<_> = rows
            .iter()
            .map(|h| {
                serde_json::json!({
                    "channel": h.seed_name.as_str(),
                    "start": h.start_micros,
                    "nsamp": h.nsamp,
                    "rate": h.rate,
                    "bytes": h.record_length,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No data for the selected time range");
        return Ok(());
    }

    println!("{:<14} {:<25} {:>7} {:>10}", "Channel", "Start", "Samples", "Rate");
    println!("{}", "-".repeat(59));
    for h in &rows {
        println!(
            "{:<14} {:<25} {:>7} {:>10.4}",
            h.seed_name.as_str(),
            format_millis(h.start_millis()),
            h.nsamp,
            h.rate
        );
    }
    Ok(())
}
