//! Readiness probe endpoint
//!
//! A minimal HTTP responder for the kubelet's readiness checks. Any request
//! is answered 200 once the process is serving; the probe carries no state
//! beyond process liveness plus controller construction having succeeded.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 3\r\nconnection: close\r\n\r\nok\n";

/// Serve readiness probes on the given address until the process exits.
pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "readiness probe listening");

    loop {
        let (mut socket, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            // Drain whatever the probe sent; the answer is unconditional.
            let _ = socket.read(&mut buf).await;
            if let Err(e) = socket.write_all(RESPONSE).await {
                debug!(%peer, error = %e, "failed to answer probe");
            }
        });
    }
}
