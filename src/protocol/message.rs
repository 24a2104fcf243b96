//! Owned message buffers.
//!
//! A [`Message`] is one contiguous header + payload buffer, backed by a
//! `bytes::BytesMut` obtained from the transport capability. Both requests
//! and responses use the same layout; for outgoing messages the header is
//! stamped at creation, for inbound ones the whole buffer is overwritten by
//! the arriving frame.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, HEADER_SIZE};

/// One header + payload buffer with exclusive ownership.
///
/// The buffer always holds at least a full header; constructors enforce
/// this, accessors rely on it.
#[derive(Debug)]
pub struct Message {
    data: BytesMut,
}

impl Message {
    /// Wrap a transport buffer and stamp a fresh header into it.
    ///
    /// The buffer is resized to `header.size` bytes; the payload region is
    /// zeroed and filled in later by the caller.
    pub fn new(mut data: BytesMut, header: Header) -> Self {
        data.clear();
        data.resize(header.size as usize, 0);
        header.encode_into(&mut data[..HEADER_SIZE]);
        Self { data }
    }

    /// Decode the header currently stored in the buffer.
    pub fn header(&self) -> Header {
        Header::decode(&self.data[..HEADER_SIZE]).expect("message no shorter than a header")
    }

    /// Stamp the operation id into the stored header.
    pub fn set_id(&mut self, id: u16) {
        self.data[2..4].copy_from_slice(&id.to_le_bytes());
    }

    /// The type byte of the stored header.
    #[inline]
    pub fn op_type(&self) -> u8 {
        self.data[4]
    }

    /// Total length of the buffer (header + payload).
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty (never true for a valid message).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload region, after the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    /// Mutable payload region, after the header.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[HEADER_SIZE..]
    }

    /// Overwrite the whole message (header included) with an arrived frame.
    ///
    /// The caller validates that `frame` fits before calling; the buffer
    /// shrinks to the frame length, capacity is retained.
    pub fn fill_from(&mut self, frame: &[u8]) {
        debug_assert!(frame.len() >= HEADER_SIZE);
        self.data.clear();
        self.data.extend_from_slice(frame);
    }

    /// Encoded wire view of the message, for handing to the transport.
    pub fn frame(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Surrender the underlying transport buffer.
    pub fn into_buffer(self) -> BytesMut {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire_format::MESSAGE_SIZE_MAX;

    fn make_message(op_type: u8, payload_len: usize) -> Message {
        let header = Header::for_payload(op_type, payload_len, MESSAGE_SIZE_MAX).unwrap();
        Message::new(BytesMut::with_capacity(header.size as usize), header)
    }

    #[test]
    fn test_new_stamps_header_and_zeroes_payload() {
        let msg = make_message(0x03, 16);

        let header = msg.header();
        assert_eq!(header.size, 24);
        assert_eq!(header.op_type, 0x03);
        assert_eq!(header.id, 0);
        assert_eq!(msg.len(), 24);
        assert!(msg.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_id_updates_stored_header() {
        let mut msg = make_message(0x02, 0);
        msg.set_id(0xBEEF);
        assert_eq!(msg.header().id, 0xBEEF);
    }

    #[test]
    fn test_payload_mut_roundtrip() {
        let mut msg = make_message(0x03, 4);
        msg.payload_mut().copy_from_slice(b"ping");
        assert_eq!(msg.payload(), b"ping");
        // Header untouched by payload writes
        assert_eq!(msg.header().op_type, 0x03);
    }

    #[test]
    fn test_fill_from_overwrites_header_and_payload() {
        let mut msg = make_message(0x03, 8);

        let mut frame = Header::new(12, 9, 0x83).encode().to_vec();
        frame.extend_from_slice(b"data");
        msg.fill_from(&frame);

        assert_eq!(msg.len(), 12);
        assert_eq!(msg.header().id, 9);
        assert!(msg.header().is_response());
        assert_eq!(msg.payload(), b"data");
    }

    #[test]
    fn test_frame_matches_buffer() {
        let mut msg = make_message(0x01, 2);
        msg.payload_mut().copy_from_slice(&[0xAA, 0xBB]);

        let frame = msg.frame();
        assert_eq!(frame.len(), 10);
        assert_eq!(&frame[8..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_into_buffer_returns_backing_storage() {
        let msg = make_message(0x01, 4);
        let buf = msg.into_buffer();
        assert_eq!(buf.len(), 12);
    }
}
