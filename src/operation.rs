//! Operation entity: lifecycle, completion, and the public request API.
//!
//! An [`Operation`] is one correlated request/response exchange over a
//! connection, or one unpaired inbound request. It owns its request buffer
//! and, when a reply is expected, its response buffer; both are released to
//! the transport when the operation is destroyed.
//!
//! Completion is driven through a take-once slot holding exactly one of a
//! callback or a blocking waiter, so double release is structurally
//! impossible: normal completion and cancellation both funnel through
//! [`Operation::complete`].
//!
//! # Example
//!
//! ```ignore
//! let op = Operation::create_outgoing(&connection, 0x03, b"payload", 64)?;
//! op.submit().await?;
//! let echoed = op.response_payload().unwrap();
//! op.destroy();
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{OpwireError, Result};
use crate::protocol::{Header, Message, ID_UNASSIGNED, TYPE_RESPONSE};

/// Final status of an operation; `Pending` until completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    /// Not yet completed.
    Pending,
    /// The exchange finished and the response buffer (if any) is filled.
    Success,
    /// No handler was registered for the connection's protocol.
    ProtocolUnsupported,
    /// The wait was cancelled before a response arrived.
    Interrupted,
}

/// Callback invoked in worker context when an asynchronous operation
/// completes. It receives the operation carrying its final result and, for
/// successful exchanges, the filled response buffer.
pub type OperationCallback = Box<dyn FnOnce(&Operation) + Send + 'static>;

/// Exactly one completion mode is active per operation.
enum Completion {
    Callback(OperationCallback),
    Waiter(oneshot::Sender<()>),
}

/// One request/response exchange (or one unpaired inbound request).
pub struct Operation {
    /// Self-reference so `&self` methods can index the operation.
    me: Weak<Operation>,
    connection: Connection,
    /// Correlation id; 0 until assigned at submission (outgoing) or taken
    /// from the wire (inbound).
    id: AtomicU16,
    request: Mutex<Option<Message>>,
    response: Mutex<Option<Message>>,
    result: Mutex<OperationResult>,
    completion: Mutex<Option<Completion>>,
    /// True for operations we originate; inbound requests are false.
    outgoing: bool,
}

impl Operation {
    /// Create an operation to be sent over the given connection.
    ///
    /// The request buffer holds a payload of `request_size` bytes. A
    /// response buffer of `response_size` payload bytes is allocated iff
    /// `response_size > 0`, marking the operation as outgoing; its header is
    /// pre-filled with the response type. Inbound requests supply a
    /// response size of 0 and no response buffer is allocated — whatever
    /// handles the request allocates one if it needs to reply.
    ///
    /// Fails with `InvalidSize` when a payload cannot fit a legal message
    /// and `OutOfMemory` when transport allocation fails.
    pub fn create(
        connection: &Connection,
        op_type: u8,
        request_size: usize,
        response_size: usize,
    ) -> Result<Arc<Self>> {
        let response = (response_size > 0).then_some(response_size);
        Self::create_inner(connection, op_type, request_size, response)
    }

    /// Create an outgoing operation with its request payload filled in.
    ///
    /// Unlike [`Operation::create`], a response buffer is always allocated —
    /// `response_capacity` may be 0 for replies that carry only a header.
    pub fn create_outgoing(
        connection: &Connection,
        op_type: u8,
        request: &[u8],
        response_capacity: usize,
    ) -> Result<Arc<Self>> {
        let op = Self::create_inner(connection, op_type, request.len(), Some(response_capacity))?;
        op.fill_request(request);
        Ok(op)
    }

    fn create_inner(
        connection: &Connection,
        op_type: u8,
        request_size: usize,
        response_size: Option<usize>,
    ) -> Result<Arc<Self>> {
        let outgoing = response_size.is_some();
        // Outgoing creation runs in caller context and may block in the
        // transport; inbound creation runs in the receive context and must
        // not.
        let request = Self::alloc_message(connection, op_type, request_size, outgoing)?;
        let response = match response_size {
            Some(size) => {
                match Self::alloc_message(connection, op_type | TYPE_RESPONSE, size, outgoing) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        connection.transport().release_buffer(request.into_buffer());
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            connection: connection.clone(),
            id: AtomicU16::new(ID_UNASSIGNED),
            request: Mutex::new(Some(request)),
            response: Mutex::new(response),
            result: Mutex::new(OperationResult::Pending),
            completion: Mutex::new(None),
            outgoing,
        }))
    }

    fn alloc_message(
        connection: &Connection,
        op_type: u8,
        payload_len: usize,
        blocking: bool,
    ) -> Result<Message> {
        let max = connection.max_message_size();
        let header = Header::for_payload(op_type, payload_len, max).map_err(|_| {
            OpwireError::InvalidSize {
                payload: payload_len,
                max,
            }
        })?;
        let buffer = connection
            .transport()
            .allocate_buffer(header.size as usize, blocking)?;
        Ok(Message::new(buffer, header))
    }

    /// The owning connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The correlation id (0 until assigned).
    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    /// Whether this operation was originated locally.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    /// The final result code.
    pub fn result(&self) -> OperationResult {
        *self.result.lock().unwrap()
    }

    /// Record a result. Only the first transition away from `Pending`
    /// sticks; a result is never silently upgraded afterwards.
    pub fn set_result(&self, result: OperationResult) {
        let mut guard = self.result.lock().unwrap();
        if *guard == OperationResult::Pending {
            *guard = result;
        }
    }

    /// Copy a payload into the request buffer.
    ///
    /// # Panics
    ///
    /// Panics if `payload` does not match the request size the operation
    /// was created with.
    pub fn fill_request(&self, payload: &[u8]) {
        let mut guard = self.request.lock().unwrap();
        let message = guard.as_mut().expect("request buffer released");
        message.payload_mut().copy_from_slice(payload);
    }

    /// Copy of the request payload.
    pub fn request_payload(&self) -> Bytes {
        let guard = self.request.lock().unwrap();
        let message = guard.as_ref().expect("request buffer released");
        Bytes::copy_from_slice(message.payload())
    }

    /// The request opcode with the response bit stripped.
    pub fn request_type(&self) -> u8 {
        let guard = self.request.lock().unwrap();
        let message = guard.as_ref().expect("request buffer released");
        crate::protocol::strip_response_bit(message.op_type())
    }

    /// Encoded request frame for handing to the transport.
    pub fn request_frame(&self) -> Bytes {
        let guard = self.request.lock().unwrap();
        guard.as_ref().expect("request buffer released").frame()
    }

    /// Copy of the response payload, if a response buffer exists.
    pub fn response_payload(&self) -> Option<Bytes> {
        let guard = self.response.lock().unwrap();
        guard
            .as_ref()
            .map(|message| Bytes::copy_from_slice(message.payload()))
    }

    /// Stamp the assigned id into the operation and its request header.
    pub(crate) fn assign_id(&self, id: u16) {
        self.id.store(id, Ordering::Release);
        if let Some(message) = self.request.lock().unwrap().as_mut() {
            message.set_id(id);
        }
    }

    /// Adopt an arrived request frame: the buffer (header included) is
    /// overwritten and the wire id becomes the operation's id.
    pub(crate) fn adopt_wire(&self, header: Header, frame: &[u8]) {
        {
            let mut guard = self.request.lock().unwrap();
            let message = guard.as_mut().expect("request buffer released");
            message.fill_from(frame);
        }
        self.id.store(header.id, Ordering::Release);
    }

    /// Accept an arrived response frame into the pre-allocated response
    /// buffer, marking the operation successful.
    ///
    /// Fails with `ResponseBufferTooSmall` when the frame exceeds the
    /// buffer; the operation is left uncompleted in that case.
    pub(crate) fn accept_response(&self, frame: &[u8]) -> Result<()> {
        {
            let mut guard = self.response.lock().unwrap();
            let message = guard
                .as_mut()
                .ok_or(OpwireError::OperationNotFound(self.id()))?;
            if frame.len() > message.len() {
                return Err(OpwireError::ResponseBufferTooSmall {
                    got: frame.len(),
                    capacity: message.len(),
                });
            }
            message.fill_from(frame);
        }
        self.set_result(OperationResult::Success);
        Ok(())
    }

    /// Allocate the reply buffer for an inbound request.
    ///
    /// The response header carries the request opcode with the response bit
    /// set and the wire id of the request. Replaces (and releases) any
    /// previously allocated reply.
    pub fn alloc_response(&self, payload_len: usize) -> Result<()> {
        let max = self.connection.max_message_size();
        let op_type = self.request_type() | TYPE_RESPONSE;
        let mut header = Header::for_payload(op_type, payload_len, max).map_err(|_| {
            OpwireError::InvalidSize {
                payload: payload_len,
                max,
            }
        })?;
        header.id = self.id();

        let buffer = self
            .connection
            .transport()
            .allocate_buffer(header.size as usize, true)?;
        let message = Message::new(buffer, header);

        if let Some(old) = self.response.lock().unwrap().replace(message) {
            self.connection
                .transport()
                .release_buffer(old.into_buffer());
        }
        Ok(())
    }

    /// Copy a payload into the allocated response buffer.
    ///
    /// # Panics
    ///
    /// Panics if no response buffer is allocated or `payload` does not
    /// match the size passed to [`Operation::alloc_response`].
    pub fn fill_response(&self, payload: &[u8]) {
        let mut guard = self.response.lock().unwrap();
        let message = guard.as_mut().expect("response buffer not allocated");
        message.payload_mut().copy_from_slice(payload);
    }

    /// Hand the filled response to the transport.
    pub fn send_response(&self) -> Result<()> {
        let frame = {
            let guard = self.response.lock().unwrap();
            let Some(message) = guard.as_ref() else {
                debug_assert!(false, "send_response without an allocated response");
                return Err(OpwireError::InvalidSize {
                    payload: 0,
                    max: self.connection.max_message_size(),
                });
            };
            message.frame()
        };
        self.connection.transport().send(self.id(), frame)
    }

    /// Allocate, fill, and send a reply in one step.
    pub fn respond(&self, payload: &[u8]) -> Result<()> {
        self.alloc_response(payload.len())?;
        self.fill_response(payload);
        self.send_response()
    }

    /// Index the operation and hand its request to the transport.
    fn send_request(&self) -> Result<()> {
        debug_assert!(self.outgoing);
        let me = self.me.upgrade().expect("operation not held by an Arc");
        let id = self.connection.pending().insert(&me);
        let frame = self.request_frame();
        if let Err(e) = self.connection.transport().send(id, frame) {
            self.connection.pending().remove(id);
            return Err(e);
        }
        Ok(())
    }

    /// Send the request and block until the operation completes.
    ///
    /// Returns once `complete` fires, mapping the final result onto the
    /// error taxonomy. A wait interrupted by [`Operation::cancel`] returns
    /// `Interrupted` after the in-flight transfer has been cancelled.
    pub async fn submit(&self) -> Result<()> {
        let rx = {
            let (tx, rx) = oneshot::channel();
            let mut guard = self.completion.lock().unwrap();
            debug_assert!(guard.is_none(), "operation submitted twice");
            *guard = Some(Completion::Waiter(tx));
            rx
        };

        self.send_request()?;

        match rx.await {
            Ok(()) => self.final_result(),
            Err(_) => {
                // Completion slot dropped without firing: the connection
                // went away under us. Stop the in-flight transfer before
                // reporting the interruption.
                let _ = self.connection.transport().cancel(self.id());
                Err(OpwireError::Interrupted)
            }
        }
    }

    /// Send the request and return immediately; `callback` fires in worker
    /// context when the response arrives (asynchronous completion).
    pub fn submit_with_callback(&self, callback: OperationCallback) -> Result<()> {
        {
            let mut guard = self.completion.lock().unwrap();
            debug_assert!(guard.is_none(), "operation submitted twice");
            *guard = Some(Completion::Callback(callback));
        }
        self.send_request()
    }

    /// Interrupt a submitted operation.
    ///
    /// The operation leaves the pending index, the in-flight transport
    /// transfer is cancelled so the link will not later write into its
    /// buffers, and any waiter or callback observes `Interrupted`. Calling
    /// this after normal completion is a no-op.
    pub fn cancel(&self) {
        self.connection.pending().remove(self.id());
        if let Err(e) = self.connection.transport().cancel(self.id()) {
            tracing::warn!(id = self.id(), error = %e, "transfer cancel failed");
        }
        self.set_result(OperationResult::Interrupted);
        self.complete();
    }

    /// Deliver the operation's completion: invoke the registered callback
    /// or release the blocking waiter. The completion slot is taken once;
    /// later calls are no-ops.
    pub fn complete(&self) {
        let completion = self.completion.lock().unwrap().take();
        match completion {
            Some(Completion::Callback(callback)) => callback(self),
            Some(Completion::Waiter(tx)) => {
                let _ = tx.send(());
            }
            None => {}
        }
    }

    fn final_result(&self) -> Result<()> {
        match self.result() {
            OperationResult::Success => Ok(()),
            OperationResult::ProtocolUnsupported => Err(OpwireError::ProtocolUnsupported(
                self.connection.protocol(),
            )),
            OperationResult::Interrupted | OperationResult::Pending => {
                Err(OpwireError::Interrupted)
            }
        }
    }

    /// Release the operation's buffers back to the transport.
    ///
    /// The caller must have removed the operation from the pending index
    /// first; destroying a still-indexed operation is a programming error
    /// (asserted in debug builds, defensively re-removed in release
    /// builds).
    pub fn destroy(&self) {
        // Inbound operations are never indexed; their wire id may collide
        // with an unrelated local pending id.
        let id = self.id();
        if self.outgoing && id != ID_UNASSIGNED && self.connection.pending().remove(id).is_some() {
            debug_assert!(false, "destroyed operation {id} while still pending");
            tracing::error!(id, "destroyed operation still in pending index");
        }

        let transport = self.connection.transport();
        if let Some(message) = self.request.lock().unwrap().take() {
            transport.release_buffer(message.into_buffer());
        }
        if let Some(message) = self.response.lock().unwrap().take() {
            transport.release_buffer(message.into_buffer());
        }
    }
}
