//! Client session: one per connected downstream client.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec;
use crate::registry::RegistryHandle;
use crate::session::LoggerSession;

/// Read deadline while the client's serial is still unknown.
const UNIDENTIFIED_READ_DEADLINE: Duration = Duration::from_secs(60);
/// Pause after identification to let the registry perform the binding.
const IDENTIFY_SETTLE: Duration = Duration::from_millis(5);
const READ_BUF_SIZE: usize = 4096;

/// A connected downstream client (e.g. a monitoring script) that wants to
/// talk to a single data logger by serial.
pub struct ClientSession {
    id: u32,
    serial: AtomicU32,
    running: AtomicBool,
    writer: Mutex<OwnedWriteHalf>,
    logger: Mutex<Option<Arc<LoggerSession>>>,
    registry: RegistryHandle,
}

impl ClientSession {
    /// Accept a new client connection, register it as `pending`, and spawn
    /// the read loop.
    pub async fn spawn(stream: TcpStream, registry: RegistryHandle) -> Arc<Self> {
        let id = registry.next_id();
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            id,
            serial: AtomicU32::new(0),
            running: AtomicBool::new(true),
            writer: Mutex::new(write_half),
            logger: Mutex::new(None),
            registry: registry.clone(),
        });
        registry.register_pending(session.clone()).await;
        tokio::spawn(Self::run(session.clone(), read_half));
        session
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn requested_serial(&self) -> u32 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind this client to a logger — a non-owning handle, cleared on
    /// re-park.
    pub async fn bind_logger(&self, logger: Arc<LoggerSession>) {
        let mut slot = self.logger.lock().await;
        *slot = Some(logger);
    }

    /// Clear the logger back-reference (this client is returning to
    /// `pending`).
    pub async fn clear_logger(&self) {
        let mut slot = self.logger.lock().await;
        *slot = None;
    }

    pub async fn bound_logger(&self) -> Option<Arc<LoggerSession>> {
        self.logger.lock().await.clone()
    }

    async fn run(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let unidentified = self.serial.load(Ordering::SeqCst) == 0;
            let read = if unidentified {
                match tokio::time::timeout(UNIDENTIFIED_READ_DEADLINE, reader.read(&mut buf)).await
                {
                    Ok(res) => res,
                    Err(_) => {
                        log::info!("[client {}] unidentified-deadline expired", self.id);
                        break;
                    }
                }
            } else {
                reader.read(&mut buf).await
            };

            match read {
                Ok(0) => {
                    log::info!("[client {}] connection closed", self.id);
                    break;
                }
                Ok(n) => {
                    if unidentified {
                        match codec::parse(&buf[..n]) {
                            Ok(frame) => {
                                self.serial.store(frame.serial(), Ordering::SeqCst);
                                log::info!(
                                    "[client {}] requested serial {}",
                                    self.id,
                                    frame.serial()
                                );
                                self.registry.client_identified(frame.serial(), self.clone());
                                tokio::time::sleep(IDENTIFY_SETTLE).await;
                                continue;
                            }
                            Err(e) => {
                                log::debug!(
                                    "[client {}] unparsable frame: {e} ({})",
                                    self.id,
                                    hex::encode(&buf[..n.min(32)])
                                );
                                continue;
                            }
                        }
                    }

                    let logger = self.bound_logger().await;
                    if let Some(logger) = logger {
                        logger.send(buf[..n].to_vec(), self.id).await;
                    } else {
                        self.registry.orphan_broadcast(buf[..n].to_vec());
                    }
                }
                Err(e) => {
                    log::error!("[client {}] read error: {e}", self.id);
                    break;
                }
            }
        }
        self.teardown().await;
    }

    /// Write bytes to this client's socket, delivered by its bound logger.
    /// Errors are returned to the caller for logging; this method never
    /// tears the session down — the read loop owns teardown.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }

    /// Close the socket.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    async fn teardown(&self) {
        self.stop().await;
    }

    #[cfg(test)]
    pub fn set_requested_serial_for_test(&self, serial: u32) {
        self.serial.store(serial, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    #[tokio::test]
    async fn identifies_requested_serial_from_first_frame() {
        let (_registry, handle) = Registry::new();
        let (server_sock, mut far_end) = loopback_pair().await;
        let client = ClientSession::spawn(server_sock, handle).await;

        let mut frame = vec![0xa5u8, 0x07, 0x00, 0x10, 0x45, 0x00, 0x00];
        frame.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        frame.push(0x01);
        let checksum = frame[1..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        frame.push(checksum);
        frame.push(0x15);
        far_end.write_all(&frame).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.requested_serial(), 0xdead_beef);
    }

    #[tokio::test]
    async fn unbound_client_stays_pending_and_keeps_socket_open() {
        let (_registry, handle) = Registry::new();
        let (server_sock, _far_end) = loopback_pair().await;
        let client = ClientSession::spawn(server_sock, handle).await;
        assert!(client.bound_logger().await.is_none());
        assert!(client.is_running());
    }
}
