//! Fire-and-forget record sink.
//!
//! Ingestion pushes records onto a bounded channel and never waits; a
//! background worker drains the channel, batches per record kind, and hands
//! full batches to a [`BatchWriter`]. Flushing happens on a size threshold or
//! on the poll timeout, and again when the channel disconnects, so shutdown
//! never loses a buffered batch.
use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

use crate::record::{MarketHistoryRecord, MarketOrderRecord};

const BATCH_SIZE: usize = 100;
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Call contract between the pipeline and the persistence collaborator.
/// Implementations must never block ingestion and never panic on failure.
pub trait RecordSink {
    fn push_order(&self, order: MarketOrderRecord);
    fn push_history(&self, records: Vec<MarketHistoryRecord>);
}

enum SinkItem {
    Order(MarketOrderRecord),
    History(Vec<MarketHistoryRecord>),
}

/// Cloneable producer half of the sink queue.
#[derive(Clone)]
pub struct SinkHandle {
    tx: Sender<SinkItem>,
}

impl SinkHandle {
    fn push(&self, item: SinkItem) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("sink queue full, dropping record"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl RecordSink for SinkHandle {
    fn push_order(&self, order: MarketOrderRecord) {
        self.push(SinkItem::Order(order));
    }

    fn push_history(&self, records: Vec<MarketHistoryRecord>) {
        if !records.is_empty() {
            self.push(SinkItem::History(records));
        }
    }
}

/// Consumer side: receives whole batches. A failed write loses that batch
/// only; the worker keeps draining.
pub trait BatchWriter {
    fn write_orders(&mut self, batch: &[MarketOrderRecord]) -> Result<()>;
    fn write_history(&mut self, batch: &[MarketHistoryRecord]) -> Result<()>;
}

/// Spawn the sink worker. The returned handle is the only way records enter
/// the queue; dropping every clone of it disconnects the worker, which then
/// flushes and returns the writer through the join handle.
pub fn spawn<W>(writer: W, queue_depth: usize) -> (SinkHandle, JoinHandle<W>)
where
    W: BatchWriter + Send + 'static,
{
    let (tx, rx) = bounded::<SinkItem>(queue_depth);
    let worker = std::thread::spawn(move || drain(rx, writer));
    (SinkHandle { tx }, worker)
}

fn drain<W: BatchWriter>(rx: Receiver<SinkItem>, mut writer: W) -> W {
    let mut orders: Vec<MarketOrderRecord> = Vec::new();
    let mut history: Vec<MarketHistoryRecord> = Vec::new();

    let flush_orders = |writer: &mut W, orders: &mut Vec<MarketOrderRecord>| {
        if !orders.is_empty() {
            if let Err(e) = writer.write_orders(orders) {
                warn!(error = %e, lost = orders.len(), "order batch write failed");
            }
            orders.clear();
        }
    };
    let flush_history = |writer: &mut W, history: &mut Vec<MarketHistoryRecord>| {
        if !history.is_empty() {
            if let Err(e) = writer.write_history(history) {
                warn!(error = %e, lost = history.len(), "history batch write failed");
            }
            history.clear();
        }
    };

    loop {
        match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(SinkItem::Order(o)) => {
                orders.push(o);
                if orders.len() >= BATCH_SIZE {
                    flush_orders(&mut writer, &mut orders);
                }
            }
            Ok(SinkItem::History(h)) => {
                history.extend(h);
                if history.len() >= BATCH_SIZE {
                    flush_history(&mut writer, &mut history);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                flush_orders(&mut writer, &mut orders);
                flush_history(&mut writer, &mut history);
            }
            Err(RecvTimeoutError::Disconnected) => {
                flush_orders(&mut writer, &mut orders);
                flush_history(&mut writer, &mut history);
                return writer;
            }
        }
    }
}

/// In-memory upsert store, used by the replay tool and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    orders_by_id: HashMap<i64, MarketOrderRecord>,
    /// Orders without a server id cannot be deduplicated; kept as-is.
    unkeyed_orders: Vec<MarketOrderRecord>,
    history: HashMap<(String, i64, i64, i64, i64), MarketHistoryRecord>,
}

impl MemoryStore {
    /// Insert-or-update keyed by order id; a replayed order only refreshes
    /// its mutable fields.
    pub fn upsert_order(&mut self, order: &MarketOrderRecord) {
        match order.order_id {
            Some(id) => match self.orders_by_id.entry(id) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    let row = e.get_mut();
                    row.price = order.price;
                    row.amount = order.amount;
                    row.expires = order.expires.clone();
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(order.clone());
                }
            },
            None => self.unkeyed_orders.push(order.clone()),
        }
    }

    pub fn upsert_history(&mut self, record: &MarketHistoryRecord) {
        match self.history.entry(record.identity()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let row = e.get_mut();
                row.item_amount = record.item_amount;
                row.silver_amount = record.silver_amount;
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(record.clone());
            }
        }
    }

    pub fn order(&self, id: i64) -> Option<&MarketOrderRecord> {
        self.orders_by_id.get(&id)
    }

    pub fn orders(&self) -> impl Iterator<Item = &MarketOrderRecord> {
        self.orders_by_id.values().chain(self.unkeyed_orders.iter())
    }

    pub fn order_count(&self) -> usize {
        self.orders_by_id.len() + self.unkeyed_orders.len()
    }

    pub fn history_records(&self) -> impl Iterator<Item = &MarketHistoryRecord> {
        self.history.values()
    }

    pub fn history_count(&self) -> usize {
        self.history.len()
    }
}

impl BatchWriter for MemoryStore {
    fn write_orders(&mut self, batch: &[MarketOrderRecord]) -> Result<()> {
        for order in batch {
            self.upsert_order(order);
        }
        Ok(())
    }

    fn write_history(&mut self, batch: &[MarketHistoryRecord]) -> Result<()> {
        for record in batch {
            self.upsert_history(record);
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonlRow<'a> {
    Order(&'a MarketOrderRecord),
    History(&'a MarketHistoryRecord),
}

/// Line-delimited JSON writer used by the feed binary.
pub struct JsonlWriter {
    out: BufWriter<File>,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self { out: BufWriter::with_capacity(1 << 20, file) })
    }

    fn write_rows<'a, I>(&mut self, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = JsonlRow<'a>>,
    {
        for row in rows {
            serde_json::to_writer(&mut self.out, &row)?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

impl BatchWriter for JsonlWriter {
    fn write_orders(&mut self, batch: &[MarketOrderRecord]) -> Result<()> {
        self.write_rows(batch.iter().map(JsonlRow::Order))
    }

    fn write_history(&mut self, batch: &[MarketHistoryRecord]) -> Result<()> {
        self.write_rows(batch.iter().map(JsonlRow::History))
    }
}
