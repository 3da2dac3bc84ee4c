//! Normalized market records and the raw-datagram capture file schema.
//!
//! Records are what the pipeline hands to the persistence sink. The capture
//! schema is the on-disk format written by the feed binary and replayed by
//! `replay`: length-prefixed bincode frames with a CRC32 over the payload.
use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::warn;

/// One market sell/buy order extracted from an embedded JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrderRecord {
    /// Server-side order id; the natural upsert key when present.
    pub order_id: Option<i64>,
    pub item_key: String,
    pub auction_type: Option<String>,
    pub location_id: Option<i64>,
    pub quality: Option<i64>,
    pub enchantment: Option<i64>,
    pub price: i64,
    pub amount: i64,
    pub expires: Option<String>,
    /// The JSON object as captured, for fields not modeled above.
    pub raw: serde_json::Value,
}

/// One aggregated price-history point from a correlated history response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHistoryRecord {
    pub item_key: String,
    pub quality: i64,
    pub location_id: i64,
    pub timestamp: i64,
    /// The request's timescale, recorded as the aggregation bucket.
    pub aggregation_type: i64,
    pub item_amount: i64,
    pub silver_amount: i64,
}

impl MarketHistoryRecord {
    /// Composite natural identity used for idempotent upserts.
    pub fn identity(&self) -> (String, i64, i64, i64, i64) {
        (
            self.item_key.clone(),
            self.quality,
            self.location_id,
            self.timestamp,
            self.aggregation_type,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureHeader {
    pub version: u16,
    pub created_unix_ns: u128,
    /// UDP port the capture collaborator filtered on.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramRecord {
    pub seq: u64,
    pub recv_unix_ns: u128,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CaptureFrame {
    Header(CaptureHeader),
    Datagram(DatagramRecord),
}

/// Append one frame: `len(u32 le) | crc32(u32 le) | bincode payload`.
pub fn write_frame<W: Write>(w: &mut W, frame: &CaptureFrame) -> Result<()> {
    let payload = bincode::serialize(frame)?;
    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    w.write_all(&(payload.len() as u32).to_le_bytes())?;
    w.write_all(&crc.to_le_bytes())?;
    w.write_all(&payload)?;
    Ok(())
}

/// Read the next frame, or `None` at a clean end of file.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Option<CaptureFrame>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    r.read_exact(&mut crc_buf)?;
    let crc_on_file = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;

    let mut hasher = Crc32::new();
    hasher.update(&payload);
    let crc_calc = hasher.finalize();
    if crc_calc != crc_on_file {
        bail!("CRC mismatch: file={crc_on_file:#x}, calc={crc_calc:#x}");
    }

    let frame = bincode::deserialize(&payload).context("bincode decode")?;
    Ok(Some(frame))
}

/// Capture writer that degrades instead of failing.
///
/// Recording is an aid, not the product: a write error (full disk, revoked
/// handle) logs a warning, drops the underlying writer, and lets the live
/// ingest loop keep running without a capture.
pub struct CaptureLog<W: Write> {
    out: Option<W>,
}

impl<W: Write> CaptureLog<W> {
    pub fn new(out: W) -> Self {
        Self { out: Some(out) }
    }

    pub fn disabled() -> Self {
        Self { out: None }
    }

    pub fn is_active(&self) -> bool {
        self.out.is_some()
    }

    /// Append one frame. On an IO error the log disables itself; the caller
    /// never sees the error.
    pub fn append(&mut self, frame: &CaptureFrame) {
        let Some(w) = self.out.as_mut() else { return };
        if let Err(e) = write_frame(w, frame) {
            warn!(error = %e, "capture write failed, recording disabled");
            self.out = None;
        }
    }

    /// Flush and hand back the writer, or `None` if recording was off or
    /// already disabled by an earlier error.
    pub fn finish(mut self) -> Option<W> {
        let mut w = self.out.take()?;
        if let Err(e) = w.flush() {
            warn!(error = %e, "capture flush failed");
        }
        Some(w)
    }
}
