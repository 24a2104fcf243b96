//! Protocol dispatch table.
//!
//! Routes an inbound request operation to the handler registered for the
//! connection's protocol. A missing entry completes the operation with
//! `ProtocolUnsupported` instead of invoking anything.
//!
//! Handlers run inside the worker context: they may block, allocate a
//! response buffer and send it via [`Operation::respond`], or defer further
//! async work before returning.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::operation::{Operation, OperationResult};

/// Boxed future returned by protocol handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for inbound request operations of one protocol.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Handle one inbound request. The request payload is decoded and
    /// available on the operation; a reply, when required, is allocated and
    /// sent by the handler.
    fn handle(&self, operation: Arc<Operation>) -> BoxFuture<'static, Result<()>>;
}

/// Wrapper turning an async closure into a [`ProtocolHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> ProtocolHandler for FnHandler<F>
where
    F: Fn(Arc<Operation>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, operation: Arc<Operation>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self.0)(operation))
    }
}

/// Build a [`ProtocolHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Operation>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// Mapping from protocol identifier to handler.
pub struct DispatchTable {
    handlers: HashMap<u8, Box<dyn ProtocolHandler>>,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a protocol. Replaces any previous entry.
    pub fn register<H: ProtocolHandler>(&mut self, protocol: u8, handler: H) {
        self.handlers.insert(protocol, Box::new(handler));
    }

    /// Get the handler registered for a protocol.
    pub fn get(&self, protocol: u8) -> Option<&dyn ProtocolHandler> {
        self.handlers.get(&protocol).map(|h| h.as_ref())
    }

    /// Route an inbound request operation to its protocol handler.
    ///
    /// The operation's result is set here; completion happens in the worker
    /// loop after this returns.
    pub async fn dispatch(&self, operation: &Arc<Operation>) {
        let protocol = operation.connection().protocol();
        match self.get(protocol) {
            Some(handler) => match handler.handle(operation.clone()).await {
                Ok(()) => operation.set_result(OperationResult::Success),
                Err(e) => {
                    tracing::error!(protocol, error = %e, "request handler failed");
                }
            },
            None => {
                tracing::error!(protocol, "unrecognized protocol");
                operation.set_result(OperationResult::ProtocolUnsupported);
            }
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionBuilder;
    use crate::transport::ChannelTransport;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_dispatch_unknown_protocol_sets_result() {
        let (transport, _rx) = ChannelTransport::new();
        let connection = ConnectionBuilder::new(0x42).build(transport);
        let op = Operation::create(&connection, 0x01, 4, 0).unwrap();

        let table = DispatchTable::new();
        table.dispatch(&op).await;

        assert_eq!(op.result(), OperationResult::ProtocolUnsupported);
    }

    #[tokio::test]
    async fn test_dispatch_invokes_registered_handler() {
        let (transport, _rx) = ChannelTransport::new();
        let connection = ConnectionBuilder::new(0x07).build(transport);
        let op = Operation::create(&connection, 0x01, 4, 0).unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let mut table = DispatchTable::new();
        table.register(
            0x07,
            handler_fn(move |_op| {
                let called = called2.clone();
                async move {
                    called.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        table.dispatch(&op).await;

        assert!(called.load(Ordering::SeqCst));
        assert_eq!(op.result(), OperationResult::Success);
    }

    #[tokio::test]
    async fn test_handler_error_leaves_result_pending() {
        let (transport, _rx) = ChannelTransport::new();
        let connection = ConnectionBuilder::new(0x07).build(transport);
        let op = Operation::create(&connection, 0x01, 4, 0).unwrap();

        let mut table = DispatchTable::new();
        table.register(
            0x07,
            handler_fn(|_op| async { Err(crate::error::OpwireError::TransportClosed) }),
        );

        table.dispatch(&op).await;
        assert_eq!(op.result(), OperationResult::Pending);
    }

    #[tokio::test]
    async fn test_register_replaces_previous_handler() {
        let (transport, _rx) = ChannelTransport::new();
        let connection = ConnectionBuilder::new(0x07).build(transport);
        let op = Operation::create(&connection, 0x01, 4, 0).unwrap();

        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        let first2 = first.clone();
        let second2 = second.clone();

        let mut table = DispatchTable::new();
        table.register(
            0x07,
            handler_fn(move |_op| {
                let flag = first2.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        table.register(
            0x07,
            handler_fn(move |_op| {
                let flag = second2.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        table.dispatch(&op).await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
