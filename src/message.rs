//! Reliable message classification and request/response correlation.
//!
//! A reassembled reliable message starts with a one-byte signature (skipped)
//! and a message-type byte: 2 = operation request, 3/7 = operation response,
//! 4 = event. Some messages arrive gzip-compressed and are transparently
//! inflated first.
//!
//! History requests carry an item id and a client-chosen message id; the
//! correlator parks that context until the matching response shows up, then
//! routes the response's arrays through the history parser. Everything else
//! falls through to the order scan.
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::extract::{parse_history, scan_orders};
use crate::items::ItemCatalog;
use crate::record::{MarketHistoryRecord, MarketOrderRecord};
use crate::value::{decode_parameters, decode_value, ByteReader, TYPE_NIL};

const MSG_REQUEST: u8 = 2;
const MSG_RESPONSE: u8 = 3;
const MSG_EVENT: u8 = 4;
const MSG_RESPONSE_ALT: u8 = 7;

const PARAM_ITEM_ID: u8 = 1;
const PARAM_QUALITY: u8 = 2;
const PARAM_TIMESCALE: u8 = 3;
const PARAM_MESSAGE_ID: u8 = 255;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Pending entries older than this are swept before each insert.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);
const DEFAULT_CAPACITY: usize = 512;

/// Context parked between a history request and its response.
#[derive(Debug, Clone)]
pub struct PendingCorrelation {
    pub message_id: i64,
    pub item_id: i64,
    pub item_key: String,
    pub quality: i64,
    pub timescale: i64,
    created_at: Instant,
}

/// Bounded message-id → request-context cache.
///
/// An entry that expires before its response arrives is simply lost; the
/// response then routes to the order scan like any other message.
struct CorrelationCache {
    entries: HashMap<i64, PendingCorrelation>,
    max_age: Duration,
    capacity: usize,
}

impl CorrelationCache {
    fn new(capacity: usize, max_age: Duration) -> Self {
        Self { entries: HashMap::new(), max_age, capacity: capacity.max(1) }
    }

    fn insert(&mut self, pending: PendingCorrelation) {
        self.sweep_expired();
        // Capacity eviction only for genuinely new ids; re-requesting a
        // tracked id replaces its entry in place.
        if !self.entries.contains_key(&pending.message_id) {
            self.evict_to_capacity();
        }
        self.entries.insert(pending.message_id, pending);
    }

    fn take(&mut self, message_id: i64) -> Option<PendingCorrelation> {
        let pending = self.entries.remove(&message_id)?;
        if pending.created_at.elapsed() > self.max_age {
            return None;
        }
        Some(pending)
    }

    fn sweep_expired(&mut self) {
        let max_age = self.max_age;
        self.entries.retain(|_, p| p.created_at.elapsed() <= max_age);
    }

    fn evict_to_capacity(&mut self) {
        while self.entries.len() >= self.capacity {
            let Some((&oldest, _)) =
                self.entries.iter().min_by_key(|(_, p)| p.created_at)
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Records produced by one reliable message.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Extracted {
    pub orders: Vec<MarketOrderRecord>,
    pub history: Vec<MarketHistoryRecord>,
}

impl Extracted {
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.history.is_empty()
    }
}

/// Classifies reliable messages and correlates history responses.
pub struct MessageRouter {
    pending: CorrelationCache,
    /// Market location the client is currently interacting with; stamped
    /// onto history records. Delivered by the surrounding tooling, not the
    /// wire.
    location_id: i64,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::with_retention(DEFAULT_CAPACITY, DEFAULT_MAX_AGE)
    }
}

impl MessageRouter {
    pub fn with_retention(capacity: usize, max_age: Duration) -> Self {
        Self { pending: CorrelationCache::new(capacity, max_age), location_id: 0 }
    }

    pub fn set_location(&mut self, location_id: i64) {
        self.location_id = location_id;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Classify one reassembled reliable message and extract market data.
    pub fn handle_message(&mut self, payload: &[u8], catalog: &ItemCatalog) -> Extracted {
        let inflated;
        let payload = if payload.starts_with(&GZIP_MAGIC) {
            let mut buf = Vec::new();
            if GzDecoder::new(payload).read_to_end(&mut buf).is_err() {
                debug!("dropping message with bad gzip body");
                return Extracted::default();
            }
            inflated = buf;
            &inflated[..]
        } else {
            payload
        };

        let mut r = ByteReader::new(payload);
        let Ok(_signature) = r.read_u8("signature") else {
            return Extracted::default();
        };
        let Ok(msg_type) = r.read_u8("message type") else {
            return Extracted::default();
        };

        match msg_type {
            MSG_REQUEST => {
                self.handle_request(&mut r, catalog);
                Extracted::default()
            }
            MSG_RESPONSE | MSG_RESPONSE_ALT => self.handle_response(&mut r),
            MSG_EVENT => {
                let (params, err) = decode_parameters(&mut r);
                if let Some(err) = err {
                    trace!(%err, "partial event parameter decode");
                }
                Extracted { orders: scan_orders(&params), history: Vec::new() }
            }
            other => {
                trace!(msg_type = other, "ignoring message type");
                Extracted::default()
            }
        }
    }

    fn handle_request(&mut self, r: &mut ByteReader<'_>, catalog: &ItemCatalog) {
        let Ok(op_code) = r.read_u8("op code") else { return };
        let (params, _) = decode_parameters(r);

        // Only requests naming both an item and a message id are worth
        // correlating; everything else is game traffic we do not track.
        let Some(item_id) = params.get(&PARAM_ITEM_ID).and_then(|v| v.as_wrapped_i64()) else {
            return;
        };
        let Some(message_id) = params.get(&PARAM_MESSAGE_ID).and_then(|v| v.as_i64()) else {
            return;
        };

        let pending = PendingCorrelation {
            message_id,
            item_id,
            item_key: catalog.name_for(item_id),
            quality: params
                .get(&PARAM_QUALITY)
                .and_then(|v| v.as_wrapped_i64())
                .unwrap_or(1),
            timescale: params
                .get(&PARAM_TIMESCALE)
                .and_then(|v| v.as_wrapped_i64())
                .unwrap_or(0),
            created_at: Instant::now(),
        };
        debug!(op_code, message_id, item = %pending.item_key, "tracking history request");
        self.pending.insert(pending);
    }

    fn handle_response(&mut self, r: &mut ByteReader<'_>) -> Extracted {
        let Ok(_op_code) = r.read_u8("op code") else {
            return Extracted::default();
        };
        let Ok(_return_code) = r.read_i16("return code") else {
            return Extracted::default();
        };

        // Optional debug value: one tag, and unless Nil the tagged value must
        // be consumed so the cursor lands on the parameter dictionary.
        let Ok(debug_tag) = r.read_u8("debug tag") else {
            return Extracted::default();
        };
        if debug_tag != TYPE_NIL && decode_value(r, debug_tag).is_err() {
            debug!(debug_tag, "dropping response with undecodable debug value");
            return Extracted::default();
        }

        let (params, err) = decode_parameters(r);
        if let Some(err) = err {
            trace!(%err, "partial response parameter decode");
        }

        if let Some(pending) = params
            .get(&PARAM_MESSAGE_ID)
            .and_then(|v| v.as_i64())
            .and_then(|id| self.pending.take(id))
        {
            let history = parse_history(
                &params,
                &pending.item_key,
                pending.quality,
                pending.timescale,
                self.location_id,
            );
            debug!(message_id = pending.message_id, records = history.len(), "history response");
            return Extracted { orders: Vec::new(), history };
        }

        Extracted { orders: scan_orders(&params), history: Vec::new() }
    }
}
