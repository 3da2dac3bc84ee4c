//! Datagram-to-sink wiring.
//!
//! One synchronous call per captured datagram: envelope decode, fragment
//! reassembly where needed, classification, extraction, sink push. Nothing
//! here blocks and nothing here fails the caller; a bad datagram is skipped.
use tracing::trace;

use crate::envelope::{decode_envelope, CommandType};
use crate::fragment::FragmentBuffer;
use crate::items::ItemCatalog;
use crate::message::MessageRouter;
use crate::sink::RecordSink;

pub struct Pipeline<S: RecordSink> {
    catalog: ItemCatalog,
    fragments: FragmentBuffer,
    router: MessageRouter,
    sink: S,
}

impl<S: RecordSink> Pipeline<S> {
    pub fn new(catalog: ItemCatalog, sink: S) -> Self {
        Self {
            catalog,
            fragments: FragmentBuffer::default(),
            router: MessageRouter::default(),
            sink,
        }
    }

    /// Market location stamped onto history records; supplied by the
    /// surrounding tooling.
    pub fn set_location(&mut self, location_id: i64) {
        self.router.set_location(location_id);
    }

    /// Process one raw UDP payload from the capture collaborator.
    pub fn handle_datagram(&mut self, raw: &[u8]) {
        for command in decode_envelope(raw) {
            match command.kind {
                CommandType::Reliable => self.dispatch(&command.payload),
                CommandType::Fragment => {
                    if let Some(message) = self.fragments.submit(&command.payload) {
                        self.dispatch(&message);
                    }
                }
                CommandType::Other(kind) => {
                    trace!(kind, "skipping command type");
                }
            }
        }
    }

    fn dispatch(&mut self, message: &[u8]) {
        let extracted = self.router.handle_message(message, &self.catalog);
        for order in extracted.orders {
            self.sink.push_order(order);
        }
        self.sink.push_history(extracted.history);
    }
}
