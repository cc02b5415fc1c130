//! Per-client OPC connection handler
//!
//! Reads the socket into the connection's framer and forwards every
//! completed message to the core. Protocol violations and read errors
//! close this connection only; the server keeps running.

use std::net::SocketAddr;

use protocol::Framer;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::ServerEvent;

const READ_BUFFER_SIZE: usize = 16 * 1024;

pub async fn run(
    conn: u64,
    mut socket: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<ServerEvent>,
) {
    if events
        .send(ServerEvent::Connected { conn, peer })
        .await
        .is_err()
    {
        return;
    }

    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match socket.read(&mut buf).await {
            Ok(0) => {
                debug!("client {}: end of stream", conn);
                break;
            }
            Ok(n) => match framer.push(&buf[..n]) {
                Ok(messages) => {
                    for message in messages {
                        if events
                            .send(ServerEvent::Message { conn, message })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("client {}: protocol violation, closing: {}", conn, e);
                    break;
                }
            },
            Err(e) => {
                debug!("client {}: read error: {}", conn, e);
                break;
            }
        }
    }

    let _ = events.send(ServerEvent::Disconnected { conn }).await;
}
