//! Market data sniffer core for the Photon UDP protocol.
//!
//! This crate decodes the game's binary market traffic and extracts
//! normalized market-order and price-history records:
//!
//! - `value`: recursive typed-tag binary value decoder
//! - `envelope`: per-datagram command framing
//! - `fragment`: reassembly of fragmented reliable messages
//! - `message`: request/response/event classification and correlation
//! - `extract`: market-order scan and history-array parsing
//! - `sink`: fire-and-forget batching sink with idempotent upserts
//! - `record`: normalized records and the raw capture file schema
//!
//! The binaries (`src/main.rs` and `src/bin/replay.rs`) feed the
//! [`pipeline::Pipeline`] from a live datagram socket or a recorded capture
//! file.
pub mod envelope;
pub mod extract;
pub mod fragment;
pub mod items;
pub mod message;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod value;
