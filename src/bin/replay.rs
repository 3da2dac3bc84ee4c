use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use market_sniffer::items::ItemCatalog;
use market_sniffer::pipeline::Pipeline;
use market_sniffer::record::{read_frame, CaptureFrame};
use market_sniffer::sink::{self, MemoryStore};

#[derive(Debug, Parser)]
#[command(about = "Replay a recorded datagram capture through the sniffer pipeline")]
struct Args {
    /// Input capture file (.bin)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Path to items.json for item-id resolution
    #[arg(long)]
    items: Option<PathBuf>,

    /// Market location id stamped onto history records
    #[arg(long, default_value_t = 0)]
    location: i64,

    /// Print every record instead of just the summary
    #[arg(long, default_value_t = false)]
    print: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let catalog = match &args.items {
        Some(path) => ItemCatalog::load(path)?,
        None => ItemCatalog::default(),
    };

    let (sink_handle, sink_worker) = sink::spawn(MemoryStore::default(), 8192);
    let mut pipeline = Pipeline::new(catalog, sink_handle);
    pipeline.set_location(args.location);

    let mut rdr = BufReader::new(
        File::open(&args.input).with_context(|| format!("open {:?}", args.input))?,
    );
    let mut datagrams = 0usize;
    while let Some(frame) = read_frame(&mut rdr)? {
        match frame {
            CaptureFrame::Header(h) => {
                eprintln!("capture v{} port={} created={}ns", h.version, h.port, h.created_unix_ns);
            }
            CaptureFrame::Datagram(d) => {
                datagrams += 1;
                pipeline.handle_datagram(&d.bytes);
            }
        }
    }

    drop(pipeline);
    let store = sink_worker
        .join()
        .map_err(|_| anyhow::anyhow!("sink worker panicked"))?;

    if args.print {
        for order in store.orders() {
            println!(
                "ORDER {} id={:?} price={} amount={} loc={:?} quality={:?}",
                order.item_key, order.order_id, order.price, order.amount,
                order.location_id, order.quality
            );
        }
        for h in store.history_records() {
            println!(
                "HISTORY {} q{} loc={} ts={} agg={} items={} silver={}",
                h.item_key, h.quality, h.location_id, h.timestamp,
                h.aggregation_type, h.item_amount, h.silver_amount
            );
        }
    }
    eprintln!(
        "Read {} datagrams. {} orders, {} history records.",
        datagrams,
        store.order_count(),
        store.history_count()
    );
    Ok(())
}
