//! Connection: pending-index owner, receive dispatcher, and deferred worker.
//!
//! A [`Connection`] is a logical channel to a remote endpoint, scoped to one
//! protocol. Bytes arriving on the link are handed to [`Connection::receive`]
//! in a context that must complete in bounded time and must not block: it
//! classifies the message, copies it into an operation buffer, and enqueues
//! the operation for the worker task. All protocol logic (handlers,
//! completion callbacks) runs on the worker, which may block.
//!
//! The worker is a single task consuming the queue in FIFO order, so
//! completions follow response arrival order.
//!
//! `Connection` is a cheaply cloneable handle; clones share the pending
//! index and worker queue.
//!
//! # Example
//!
//! ```ignore
//! let (transport, link_rx) = ChannelTransport::new();
//! let connection = ConnectionBuilder::new(LOOPBACK_PROTOCOL)
//!     .dispatch_table(table)
//!     .build(transport);
//!
//! let payload = connection.operation_sync(0x03, b"data", 64).await?;
//! ```

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::DispatchTable;
use crate::error::{OpwireError, Result};
use crate::operation::{Operation, OperationResult};
use crate::protocol::{Header, HEADER_SIZE, MESSAGE_SIZE_MAX};
use crate::registry::PendingMap;
use crate::transport::Transport;

/// Builder for configuring and creating a connection.
pub struct ConnectionBuilder {
    protocol: u8,
    max_message_size: usize,
    dispatch: DispatchTable,
}

impl ConnectionBuilder {
    /// Create a builder for a connection speaking the given protocol.
    pub fn new(protocol: u8) -> Self {
        Self {
            protocol,
            max_message_size: MESSAGE_SIZE_MAX,
            dispatch: DispatchTable::new(),
        }
    }

    /// Set the negotiated maximum message size. Values above the protocol
    /// limit are capped.
    pub fn max_message_size(mut self, size: usize) -> Self {
        if size > MESSAGE_SIZE_MAX {
            tracing::warn!(size, "limiting message size to {MESSAGE_SIZE_MAX}");
            self.max_message_size = MESSAGE_SIZE_MAX;
        } else {
            self.max_message_size = size;
        }
        self
    }

    /// Install the protocol dispatch table for inbound requests.
    pub fn dispatch_table(mut self, table: DispatchTable) -> Self {
        self.dispatch = table;
        self
    }

    /// Build the connection and spawn its worker task.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self, transport: Arc<dyn Transport>) -> Connection {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let dispatch = Arc::new(self.dispatch);

        let connection = Connection {
            inner: Arc::new(Inner {
                protocol: self.protocol,
                max_message_size: self.max_message_size,
                transport,
                pending: PendingMap::new(),
                work_tx,
                worker: Mutex::new(None),
            }),
        };

        let worker = tokio::spawn(recv_worker(work_rx, dispatch));
        *connection.inner.worker.lock().unwrap() = Some(worker);
        connection
    }
}

struct Inner {
    protocol: u8,
    max_message_size: usize,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    work_tx: mpsc::UnboundedSender<Arc<Operation>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A logical channel to a remote endpoint, scoped to one protocol.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// The protocol identifier this connection speaks.
    pub fn protocol(&self) -> u8 {
        self.inner.protocol
    }

    /// The negotiated maximum message size.
    pub fn max_message_size(&self) -> usize {
        self.inner.max_message_size
    }

    /// The transport capability backing this connection.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// The pending-operation index.
    pub fn pending(&self) -> &PendingMap {
        &self.inner.pending
    }

    /// Handle bytes arriving on the connection.
    ///
    /// Non-blocking: classification, one copy, and an O(1) enqueue.
    /// Message-level anomalies (oversized, malformed, unmatched, too small
    /// for their buffer) are logged and absorbed; the receive path never
    /// fails.
    pub fn receive(&self, data: &[u8]) {
        if let Err(e) = self.receive_inner(data) {
            tracing::error!(error = %e, "dropped inbound message");
        }
    }

    fn receive_inner(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.inner.max_message_size {
            return Err(OpwireError::MessageTooLarge {
                size: data.len(),
                max: self.inner.max_message_size,
            });
        }

        let header = Header::decode(data)?;

        let operation = if header.is_response() {
            let operation = self
                .inner
                .pending
                .find(header.id)
                .ok_or(OpwireError::OperationNotFound(header.id))?;
            self.inner.pending.remove(header.id);
            // A response that does not fit its buffer is a detected
            // inconsistency: the operation stays uncompleted and the waiter
            // observes it as a cancellation at a higher layer.
            operation.accept_response(data)?;
            operation
        } else {
            if header.size as usize != data.len() {
                return Err(OpwireError::HeaderSizeMismatch {
                    declared: header.size as usize,
                    received: data.len(),
                });
            }
            let operation = Operation::create(self, header.op_type, data.len() - HEADER_SIZE, 0)?;
            operation.adopt_wire(header, data);
            operation
        };

        // Exactly once per arrived message, regardless of path.
        self.inner
            .work_tx
            .send(operation)
            .map_err(|_| OpwireError::TransportClosed)
    }

    /// Create, submit, and complete one synchronous exchange, returning the
    /// response payload. The operation is destroyed before returning.
    pub async fn operation_sync(
        &self,
        op_type: u8,
        request: &[u8],
        response_capacity: usize,
    ) -> Result<Bytes> {
        let operation = Operation::create_outgoing(self, op_type, request, response_capacity)?;
        let submitted = operation.submit().await;
        let payload = operation.response_payload().unwrap_or_else(Bytes::new);
        operation.destroy();
        submitted.map(|()| payload)
    }

    /// Tear the connection down: interrupt every pending operation and stop
    /// the worker task. In-flight handlers are aborted.
    pub fn close(&self) {
        for operation in self.inner.pending.drain() {
            operation.set_result(OperationResult::Interrupted);
            operation.complete();
        }
        if let Some(worker) = self.inner.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

/// Deferred worker: protocol dispatch and completion run here, off the
/// receive path. A single consumer keeps completions in arrival order.
async fn recv_worker(
    mut work_rx: mpsc::UnboundedReceiver<Arc<Operation>>,
    dispatch: Arc<DispatchTable>,
) {
    while let Some(operation) = work_rx.recv().await {
        let incoming_request = !operation.is_outgoing();
        if incoming_request {
            dispatch.dispatch(&operation).await;
        }
        operation.complete();
        // Inbound operations end here; outgoing ones are destroyed by the
        // caller once it has read the response.
        if incoming_request {
            operation.destroy();
        }
    }
}
