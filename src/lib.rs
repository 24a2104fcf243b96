//! # opwire
//!
//! Operation layer of a bus protocol stack: a correlated request/response
//! primitive multiplexed over a single logical connection to a remote
//! device.
//!
//! ## Architecture
//!
//! - **Wire format** (`protocol`): fixed 8-byte little-endian header, owned
//!   header+payload message buffers.
//! - **Correlation** (`registry`): per-connection index of in-flight
//!   operations keyed by a wrapping 16-bit id.
//! - **Split execution** (`connection`): message arrival runs in a
//!   non-blocking receive path; protocol handlers and completions run on a
//!   deferred worker task.
//! - **Completion** (`operation`): fire-and-forget callbacks or blocking
//!   waits with mid-wait cancellation.
//!
//! The link itself is consumed as an opaque [`Transport`] capability; an
//! in-memory [`ChannelTransport`] is provided.
//!
//! ## Example
//!
//! ```ignore
//! use opwire::{ConnectionBuilder, DispatchTable, Operation};
//! use opwire::loopback::{LoopbackClient, LoopbackHandler};
//!
//! #[tokio::main]
//! async fn main() -> opwire::Result<()> {
//!     let mut table = DispatchTable::new();
//!     table.register(LOOPBACK_PROTOCOL, LoopbackHandler);
//!     let connection = ConnectionBuilder::new(LOOPBACK_PROTOCOL)
//!         .dispatch_table(table)
//!         .build(transport);
//!
//!     let client = LoopbackClient::new(connection);
//!     client.ping().await?;
//!     let echoed = client.transfer(b"sixty-four bytes of data...").await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod loopback;
pub mod operation;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::{Connection, ConnectionBuilder};
pub use dispatch::{handler_fn, DispatchTable, ProtocolHandler};
pub use error::{OpwireError, Result};
pub use operation::{Operation, OperationCallback, OperationResult};
pub use protocol::{Header, Message, HEADER_SIZE, MESSAGE_SIZE_MAX, TYPE_RESPONSE};
pub use registry::PendingMap;
pub use transport::{ChannelTransport, LinkFrame, Transport};
