//! Protocol module - wire format and message buffers.
//!
//! This module implements the binary layer shared by requests and responses:
//! - 8-byte header encoding/decoding
//! - owned header+payload message buffers

mod message;
mod wire_format;

pub use message::Message;
pub use wire_format::{
    is_response, strip_response_bit, Header, HEADER_SIZE, ID_UNASSIGNED, MESSAGE_SIZE_MAX,
    TYPE_RESPONSE,
};
