//! # Message Value Types
//!
//! The application-facing message type and its parameter store. A
//! `Message` carries typed parameters and properties, an optional text
//! body, routing tags, and request/reply metadata. It is deep-cloned on
//! enqueue and on persistence read, and is the unit of work that flows
//! through every stage of the producer pipeline.

mod parameter;

pub use parameter::{Parameter, ParameterStore};

use serde::{Deserialize, Serialize};
use tracing::error;

/// Opaque handle to a broker-side reply destination.
///
/// Value-owned and clonable so a [`Message`] can carry it across the
/// callback boundary without borrowing from the broker collaborator.
/// `None` means the message has no reply destination attached (the
/// common case outside request/reply).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyDestination(pub Option<String>);

impl ReplyDestination {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

/// Application-facing message.
///
/// ## Lifecycle
///
/// Constructed by the application, deep-cloned on enqueue and on
/// persistence read, and dropped when dequeued and sent or when the
/// owning callback frame ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Service this message is addressed to. Empty when delivered directly
    /// to a connection (e.g. a reply) rather than fanned out via a service.
    pub service_id: String,
    /// Link this message was sent (or received) through.
    pub link_id: String,
    /// Connection this message was sent (or received) through.
    pub connection_id: String,

    /// Time to live in milliseconds. `0` means no expiry.
    pub time_to_live: i64,
    /// Delivery priority. Default `0`.
    pub priority: i32,
    /// Set by the library on receive to tell the application this message
    /// expects a reply; set by the application on send to request one.
    pub request_reply: bool,
    /// Caller-chosen id correlating a request with its reply.
    pub correlation_id: String,

    /// Text body, valid only when `is_text` is set.
    pub text: String,
    /// If set, the message is sent as a broker text message; otherwise as
    /// a structured stream message.
    pub is_text: bool,

    /// Reply destination handle, present on received request/reply
    /// messages and echoed back by the application's response.
    pub reply_to: ReplyDestination,

    /// Packet descriptor: one tag byte per parameter/property, rebuilt
    /// immediately before send. Empty until the producer engine builds it.
    pub packet_desc: Vec<u8>,

    /// User-supplied, order-preserved parameters.
    pub parameters: ParameterStore,
    /// User-supplied (and link-default) order-preserved properties.
    pub properties: ParameterStore,
}

impl Message {
    /// Construct a new, empty message addressed to `service_id`.
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            link_id: String::new(),
            connection_id: String::new(),
            time_to_live: 0,
            priority: 0,
            request_reply: false,
            correlation_id: String::new(),
            text: String::new(),
            is_text: false,
            reply_to: ReplyDestination::none(),
            packet_desc: Vec::new(),
            parameters: ParameterStore::new(),
            properties: ParameterStore::new(),
        }
    }

    /// Construct a text message body in one call.
    pub fn text(service_id: impl Into<String>, text: impl Into<String>) -> Self {
        let mut msg = Self::new(service_id);
        msg.text = text.into();
        msg.is_text = true;
        msg
    }

    /// Rebuild `packet_desc` from the current parameters/properties.
    ///
    /// Bytes parameters contribute only their own tag (`3`) — unlike the
    /// original wire format, the payload length is framed by bincode's own
    /// `Vec<u8>` length prefix rather than a second descriptor byte capped
    /// at 255 (see DESIGN.md open-question 5).
    pub fn rebuild_packet_desc(&mut self) {
        let mut desc = Vec::with_capacity(self.parameters.len() + self.properties.len());
        for (_, value) in self.parameters.iter() {
            desc.push(value.parameter_tag());
        }
        for (key, value) in self.properties.iter() {
            match value.property_tag() {
                Some(tag) => desc.push(tag),
                None => error!(key, "bytes values cannot be message properties; dropped from packet descriptor"),
            }
        }
        self.packet_desc = desc;
    }

    /// Serialize this message to its persistence/wire binary encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize a message from its persistence/wire binary encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_desc_matches_tag_order() {
        let mut msg = Message::new("svc");
        msg.parameters.insert("a", Parameter::Int32(1));
        msg.parameters.insert("b", Parameter::Bytes(vec![1, 2]));
        msg.properties.insert("p", Parameter::String("x".into()));
        msg.rebuild_packet_desc();
        assert_eq!(msg.packet_desc, vec![0, 3, 12]);
    }

    #[test]
    fn bytes_property_is_dropped_from_packet_desc_without_panicking() {
        let mut msg = Message::new("svc");
        msg.properties.insert("a", Parameter::String("x".into()));
        msg.properties.insert("bad", Parameter::Bytes(vec![1, 2]));
        msg.properties.insert("c", Parameter::Int32(5));
        msg.rebuild_packet_desc();
        assert_eq!(msg.packet_desc, vec![12, 10]);
    }

    #[test]
    fn serialize_round_trip_preserves_everything() {
        let mut msg = Message::text("svc", "hello");
        msg.correlation_id = "c1".into();
        msg.parameters.insert("k", Parameter::Float32(1.5));
        msg.reply_to = ReplyDestination(Some("tmp-queue-1".into()));
        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
