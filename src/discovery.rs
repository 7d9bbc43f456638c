//! UDP discovery responder.
//!
//! Answers a fixed probe datagram with one reply line per currently-known
//! logger, so clients can locate the proxy as if it were the real gateway.

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use crate::registry::RegistryHandle;

const DISCOVERY_PORT: u16 = 48899;
const MAGIC: &[u8] = b"WIFIKIT-214028-READ";
/// Fixed 12-hex-char token identifying the proxy as the replying device.
const MAC_TOKEN: &str = "563570726f78";
const RECV_BUF_SIZE: usize = 4096;

/// Bind `0.0.0.0:48899`. Split out from [`run`] so the caller can treat a
/// bind failure as fatal at startup, alongside the two TCP listeners,
/// instead of discovering it only once the responder task is already
/// running in the background.
pub async fn bind() -> Result<UdpSocket> {
    UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT))
        .await
        .context("cannot bind discovery responder")
}

/// Answer discovery probes on an already-bound socket until it errors out
/// or the process shuts down.
pub async fn run(socket: UdpSocket, proxy_host: String, registry: RegistryHandle) -> Result<()> {
    log::info!("[discovery] listening on {}", socket.local_addr()?);

    let mut buf = [0u8; RECV_BUF_SIZE];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[discovery] recv error: {e}");
                continue;
            }
        };

        if n < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            continue;
        }

        log::info!("[discovery] probe from {peer}");
        let serials = registry.known_serials().await;
        for serial in serials {
            let reply = format!("{proxy_host},{MAC_TOKEN},{serial}");
            if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
                log::warn!("[discovery] reply to {peer} failed: {e}");
            }
        }
    }
}
