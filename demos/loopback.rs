//! Loopback demo - two connections wired back to back.
//!
//! One side runs the loopback handler, the other issues version, ping, and
//! transfer requests over the public operation API and reports round-trip
//! times.

use std::time::Instant;

use opwire::loopback::{LoopbackClient, LoopbackHandler};
use opwire::{ChannelTransport, Connection, ConnectionBuilder, DispatchTable};

const LOOPBACK_PROTOCOL: u8 = 0x11;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_transport, client_rx) = ChannelTransport::new();
    let (server_transport, server_rx) = ChannelTransport::new();

    let mut table = DispatchTable::new();
    table.register(LOOPBACK_PROTOCOL, LoopbackHandler);

    let client_conn = ConnectionBuilder::new(LOOPBACK_PROTOCOL).build(client_transport);
    let server_conn = ConnectionBuilder::new(LOOPBACK_PROTOCOL)
        .dispatch_table(table)
        .build(server_transport);

    // Frames leaving one transport arrive on the peer connection.
    pump(client_rx, server_conn.clone());
    pump(server_rx, client_conn.clone());

    let client = LoopbackClient::new(client_conn);

    let (major, minor) = client.version().await?;
    println!("peer speaks loopback {major}.{minor}");

    let start = Instant::now();
    client.ping().await?;
    println!("ping: {:?}", start.elapsed());

    let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
    let start = Instant::now();
    let echoed = client.transfer(&payload).await?;
    println!("transfer of {} bytes: {:?}", echoed.len(), start.elapsed());

    Ok(())
}

fn pump(
    mut link_rx: tokio::sync::mpsc::UnboundedReceiver<opwire::LinkFrame>,
    peer: Connection,
) {
    tokio::spawn(async move {
        while let Some((_id, frame)) = link_rx.recv().await {
            peer.receive(&frame);
        }
    });
}
