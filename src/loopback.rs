//! Loopback protocol: version, ping, and transfer exchanges.
//!
//! A pure consumer of the public operation API, useful for exercising a link
//! end to end: [`LoopbackClient`] issues the requests, [`LoopbackHandler`]
//! answers them (echoing transfer payloads back). Wire a connection per side
//! and every exchange crosses the full receive/worker split.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::dispatch::{BoxFuture, ProtocolHandler};
use crate::error::{OpwireError, Result};
use crate::operation::Operation;

/// Version of the loopback protocol we support.
pub const LOOPBACK_VERSION_MAJOR: u8 = 0x00;
/// Minor version of the loopback protocol we support.
pub const LOOPBACK_VERSION_MINOR: u8 = 0x01;

/// Loopback request types.
pub const TYPE_PROTOCOL_VERSION: u8 = 0x01;
/// Ping: request and response carry no payload.
pub const TYPE_PING: u8 = 0x02;
/// Transfer: request carries a length-prefixed payload, response echoes it.
pub const TYPE_TRANSFER: u8 = 0x03;

/// Client side of the loopback protocol.
pub struct LoopbackClient {
    connection: Connection,
}

impl LoopbackClient {
    /// Create a client speaking over the given connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Exchange protocol versions with the peer, returning theirs.
    pub async fn version(&self) -> Result<(u8, u8)> {
        let request = [LOOPBACK_VERSION_MAJOR, LOOPBACK_VERSION_MINOR];
        let response = self
            .connection
            .operation_sync(TYPE_PROTOCOL_VERSION, &request, 2)
            .await?;
        if response.len() < 2 {
            return Err(OpwireError::PayloadMismatch);
        }
        Ok((response[0], response[1]))
    }

    /// Round-trip a message with no payload.
    pub async fn ping(&self) -> Result<()> {
        self.connection
            .operation_sync(TYPE_PING, &[], 0)
            .await
            .map(|_| ())
    }

    /// Round-trip `payload` and verify the peer echoed it unchanged.
    pub async fn transfer(&self, payload: &[u8]) -> Result<Bytes> {
        let mut request = Vec::with_capacity(4 + payload.len());
        request.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        request.extend_from_slice(payload);

        let response = self
            .connection
            .operation_sync(TYPE_TRANSFER, &request, payload.len())
            .await?;
        if response.as_ref() != payload {
            return Err(OpwireError::PayloadMismatch);
        }
        Ok(response)
    }
}

/// Handler answering loopback requests: versions are reported, pings
/// acknowledged, transfers echoed.
pub struct LoopbackHandler;

impl ProtocolHandler for LoopbackHandler {
    fn handle(&self, operation: Arc<Operation>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            match operation.request_type() {
                TYPE_PROTOCOL_VERSION => {
                    operation.respond(&[LOOPBACK_VERSION_MAJOR, LOOPBACK_VERSION_MINOR])
                }
                TYPE_PING => operation.respond(&[]),
                TYPE_TRANSFER => {
                    let request = operation.request_payload();
                    if request.len() < 4 {
                        return Err(OpwireError::PayloadMismatch);
                    }
                    let declared =
                        u32::from_le_bytes([request[0], request[1], request[2], request[3]])
                            as usize;
                    let data = &request[4..];
                    if data.len() != declared {
                        return Err(OpwireError::PayloadMismatch);
                    }
                    operation.respond(data)
                }
                other => {
                    tracing::warn!(op_type = other, "unknown loopback request type");
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_request_layout() {
        // The request body is a LE u32 length followed by the data.
        let payload = b"abc";
        let mut request = Vec::new();
        request.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        request.extend_from_slice(payload);
        assert_eq!(&request[..4], &[3, 0, 0, 0]);
        assert_eq!(&request[4..], b"abc");
    }
}
