//! OPC TCP listener

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::connection;
use crate::core::ServerEvent;

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind the OPC listen socket. Failure here is fatal at startup.
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind OPC listener on {}", addr))?;
        info!("listening for OPC connections on {}", addr);
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept clients forever, spawning one reader task each. Individual
    /// connections are never throttled here; overload resolves at the
    /// device backpressure point.
    pub async fn run(self, events: mpsc::Sender<ServerEvent>) {
        let mut next_conn: u64 = 0;

        loop {
            match self.inner.accept().await {
                Ok((socket, peer)) => {
                    next_conn += 1;
                    let _ = socket.set_nodelay(true);
                    tokio::spawn(connection::run(next_conn, socket, peer, events.clone()));
                }
                Err(e) => {
                    // Transient accept failures (fd exhaustion and the
                    // like) must not take the server down.
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}
