use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use market_sniffer::items::ItemCatalog;
use market_sniffer::pipeline::Pipeline;
use market_sniffer::record::{CaptureFrame, CaptureHeader, CaptureLog, DatagramRecord};
use market_sniffer::sink::{self, JsonlWriter};

#[derive(Debug, Parser)]
#[command(version, about = "Market order/history sniffer (Photon UDP feed)")]
struct Args {
    /// Address the capture collaborator forwards filtered datagrams to
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:5056")]
    bind: String,

    /// Path to an ao-bin-dumps style items.json for item-id resolution
    #[arg(long, env = "ITEMS_FILE")]
    items: Option<PathBuf>,

    /// Output records file (line-delimited JSON)
    #[arg(long, env = "OUT_FILE", default_value = "records.jsonl")]
    out: PathBuf,

    /// Market location id stamped onto history records
    #[arg(long, env = "LOCATION_ID", default_value_t = 0)]
    location: i64,

    /// Also record raw datagrams to this capture file (.bin)
    #[arg(long, env = "CAPTURE_FILE")]
    record: Option<PathBuf>,

    /// Sink queue depth
    #[arg(long, default_value_t = 8192)]
    queue: usize,
}

fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn main() -> Result<()> {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let catalog = match &args.items {
        Some(path) => {
            let catalog = ItemCatalog::load(path)?;
            info!(items = catalog.len(), "loaded item catalog");
            catalog
        }
        None => {
            warn!("no items file given; history records will carry numeric item ids");
            ItemCatalog::default()
        }
    };

    let writer = JsonlWriter::create(&args.out)
        .with_context(|| format!("open {}", args.out.display()))?;
    let (sink_handle, sink_worker) = sink::spawn(writer, args.queue);

    let mut pipeline = Pipeline::new(catalog, sink_handle);
    pipeline.set_location(args.location);

    let mut capture = match &args.record {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("create {}", path.display()))?;
            let mut log = CaptureLog::new(BufWriter::with_capacity(1 << 20, file));
            log.append(&CaptureFrame::Header(CaptureHeader {
                version: 1,
                created_unix_ns: now_unix_ns(),
                port: 5056,
            }));
            log
        }
        None => CaptureLog::disabled(),
    };

    let socket = UdpSocket::bind(&args.bind)
        .with_context(|| format!("bind {}", args.bind))?;
    socket.set_read_timeout(Some(Duration::from_millis(250)))?;
    info!(bind = %args.bind, "listening for datagrams");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .ok();
    }

    let mut buf = vec![0u8; 65_535];
    let mut seq = 0u64;
    while running.load(Ordering::SeqCst) {
        let n = match socket.recv_from(&mut buf) {
            Ok((n, _)) => n,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e).context("recv datagram"),
        };

        // A capture write error disables recording but never stops the feed.
        capture.append(&CaptureFrame::Datagram(DatagramRecord {
            seq,
            recv_unix_ns: now_unix_ns(),
            bytes: buf[..n].to_vec(),
        }));
        seq += 1;
        pipeline.handle_datagram(&buf[..n]);
    }

    info!(datagrams = seq, "shutting down, flushing sink");
    capture.finish();
    // Dropping the pipeline drops the sink handle; the worker flushes its
    // final batch and exits.
    drop(pipeline);
    if sink_worker.join().is_err() {
        warn!("sink worker panicked");
    }
    Ok(())
}
