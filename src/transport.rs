//! The link capability consumed by the operation layer.
//!
//! The operation layer never inspects transport-internal state: it allocates
//! transfer buffers, hands encoded frames over for sending, cancels pending
//! transfers, and returns buffers when operations are destroyed. A host
//! device driver implements [`Transport`] over whatever link it drives.
//!
//! [`ChannelTransport`] is the first-party in-memory implementation, backed
//! by an unbounded channel of frames. It is what the tests and the loopback
//! demo run on.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{OpwireError, Result};

/// A frame handed to the link: the submitting operation's id plus the
/// encoded message bytes. The id doubles as the transfer token for `cancel`.
pub type LinkFrame = (u16, Bytes);

/// Capability exposed by a host transport.
///
/// `send` and `cancel` must not block; `allocate_buffer` may only block when
/// the caller says so.
pub trait Transport: Send + Sync + 'static {
    /// Allocate a transfer buffer of `size` bytes.
    ///
    /// When `blocking` is false the call is made from the receive context
    /// and must not sleep to satisfy the request.
    fn allocate_buffer(&self, size: usize, blocking: bool) -> Result<BytesMut>;

    /// Hand an encoded message to the link for transmission.
    fn send(&self, id: u16, frame: Bytes) -> Result<()>;

    /// Cancel a pending transfer so the link will not later write into a
    /// buffer whose owner has stopped waiting.
    fn cancel(&self, id: u16) -> Result<()>;

    /// Return link-side resources for a buffer from `allocate_buffer`.
    fn release_buffer(&self, buffer: BytesMut);
}

/// In-memory transport backed by an unbounded mpsc channel.
///
/// Outbound frames land on the receiver returned by [`ChannelTransport::new`];
/// a test (or the loopback demo) forwards them into the peer connection's
/// `receive`. The transport counts outstanding buffers so callers can assert
/// that every allocation is eventually released, and can be switched into an
/// allocation-failure mode for out-of-memory paths.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<LinkFrame>,
    outstanding: AtomicUsize,
    fail_allocations: AtomicBool,
    cancelled: Mutex<Vec<u16>>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its link.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            outstanding: AtomicUsize::new(0),
            fail_allocations: AtomicBool::new(false),
            cancelled: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    /// Number of allocated buffers not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Make subsequent allocations fail with `OutOfMemory`.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Ids of transfers cancelled so far, in call order.
    pub fn cancelled_ids(&self) -> Vec<u16> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl Transport for ChannelTransport {
    fn allocate_buffer(&self, size: usize, _blocking: bool) -> Result<BytesMut> {
        if self.fail_allocations.load(Ordering::Acquire) {
            return Err(OpwireError::OutOfMemory);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(BytesMut::with_capacity(size))
    }

    fn send(&self, id: u16, frame: Bytes) -> Result<()> {
        self.tx
            .send((id, frame))
            .map_err(|_| OpwireError::TransportClosed)
    }

    fn cancel(&self, id: u16) -> Result<()> {
        self.cancelled.lock().unwrap().push(id);
        Ok(())
    }

    fn release_buffer(&self, _buffer: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}
