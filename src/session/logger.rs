//! Logger session: one per connected data-logger TCP socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec::{self, SERIAL_PROBE};
use crate::registry::RegistryHandle;
use crate::session::ClientSession;

/// Deadline for writes to the logger socket. Heuristic; a tuning knob
/// rather than a configurable surface.
const LOGGER_WRITE_TIMEOUT: Duration = Duration::from_millis(200);
/// Grace period before close, to let an in-flight read return.
const STOP_GRACE: Duration = Duration::from_millis(5);
/// Pause after identification to let the registry commit the transition
/// before further traffic.
const IDENTIFY_SETTLE: Duration = Duration::from_millis(10);
const READ_BUF_SIZE: usize = 2048;

#[derive(Default)]
struct WriteState {
    awaiting_reply: bool,
    fifo: VecDeque<(Vec<u8>, u32)>,
}

/// A connected data-logger. Discovers its own serial by sniffing the first
/// parsable V5 frame it reads, then broadcasts every subsequent byte-run to
/// its bound clients and serialises client writes back to it.
pub struct LoggerSession {
    id: u32,
    serial: AtomicU32,
    running: AtomicBool,
    clients: Mutex<HashMap<u32, Arc<ClientSession>>>,
    writer: Mutex<OwnedWriteHalf>,
    write_state: Mutex<WriteState>,
    buffering_enabled: bool,
    registry: RegistryHandle,
}

impl LoggerSession {
    /// Accept a new logger connection: split the socket, register the
    /// session as a martian, write the startup probe, and spawn the read
    /// loop.
    pub async fn spawn(
        stream: TcpStream,
        registry: RegistryHandle,
        buffering_enabled: bool,
    ) -> Arc<Self> {
        let id = registry.next_id();
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            id,
            serial: AtomicU32::new(0),
            running: AtomicBool::new(true),
            clients: Mutex::new(HashMap::new()),
            writer: Mutex::new(write_half),
            write_state: Mutex::new(WriteState::default()),
            buffering_enabled,
            registry: registry.clone(),
        });
        registry.register_martian(session.clone()).await;
        tokio::spawn(Self::run(session.clone(), read_half));
        session
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a client as bound to this logger.
    pub async fn add_client(&self, client: Arc<ClientSession>) {
        let mut clients = self.clients.lock().await;
        log::debug!("[logger {}] client {} bound", self.id, client.id());
        clients.insert(client.id(), client);
    }

    /// Atomically clear and return the bound-clients set (used when the
    /// logger disappears and its clients must be re-parked).
    pub async fn take_clients(&self) -> Vec<Arc<ClientSession>> {
        let mut clients = self.clients.lock().await;
        clients.drain().map(|(_, c)| c).collect()
    }

    async fn run(self: Arc<Self>, mut reader: OwnedReadHalf) {
        if let Err(e) = self.write_probe().await {
            log::error!("[logger {}] serial probe failed: {e}", self.id);
            self.teardown().await;
            return;
        }

        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("[logger {}] connection closed", self.id);
                    break;
                }
                Ok(n) => {
                    if self.serial.load(Ordering::SeqCst) == 0 {
                        match codec::parse(&buf[..n]) {
                            Ok(frame) => {
                                self.serial.store(frame.serial(), Ordering::SeqCst);
                                log::info!(
                                    "[logger {}] identified serial {}",
                                    self.id,
                                    frame.serial()
                                );
                                self.registry.logger_identified(frame.serial(), self.clone());
                                tokio::time::sleep(IDENTIFY_SETTLE).await;
                            }
                            Err(e) => {
                                log::debug!(
                                    "[logger {}] unparsable frame: {e} ({})",
                                    self.id,
                                    hex::encode(&buf[..n.min(32)])
                                );
                            }
                        }
                    }

                    {
                        let mut state = self.write_state.lock().await;
                        state.awaiting_reply = false;
                    }

                    let data = buf[..n].to_vec();
                    let me = self.clone();
                    tokio::spawn(async move { me.send_to_all(data).await });
                }
                Err(e) => {
                    log::error!("[logger {}] read error: {e}", self.id);
                    break;
                }
            }
        }
        self.teardown().await;
    }

    /// Broadcast fan-out: deliver a byte-run to every bound client, in the
    /// order it was read, then service the logger-write FIFO if buffering
    /// is enabled.
    async fn send_to_all(self: Arc<Self>, data: Vec<u8>) {
        let mut clients = self.clients.lock().await;
        let mut stale = Vec::new();
        for (id, client) in clients.iter() {
            if client.is_running() {
                if let Err(e) = client.send(&data).await {
                    log::warn!("[logger {}] client {} send failed: {e}", self.id, id);
                }
            } else {
                client.stop().await;
                stale.push(*id);
            }
        }
        for id in stale {
            clients.remove(&id);
        }
        drop(clients);

        if self.buffering_enabled {
            let popped = {
                let mut state = self.write_state.lock().await;
                state.fifo.pop_front()
            };
            if let Some((bytes, from)) = popped {
                self.send(bytes, from).await;
            }
        }
    }

    /// Unicast a client's request to the logger.
    pub async fn send(self: &Arc<Self>, bytes: Vec<u8>, from: u32) {
        if !self.is_running() {
            return;
        }
        {
            let mut state = self.write_state.lock().await;
            if self.buffering_enabled && state.awaiting_reply {
                state.fifo.push_back((bytes, from));
                return;
            }
            state.awaiting_reply = true;
        }
        self.write_now(&bytes).await;
    }

    /// Best-effort direct write, used by the registry's orphan-broadcast
    /// path. Bypasses the `awaitingReply` one-at-a-time discipline: martians
    /// are not yet playing the request/response game.
    pub async fn write_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(LOGGER_WRITE_TIMEOUT, writer.write_all(bytes)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "orphan broadcast write timed out",
            )),
        }
    }

    async fn write_now(self: &Arc<Self>, bytes: &[u8]) {
        let mut writer = self.writer.lock().await;
        let result = tokio::time::timeout(LOGGER_WRITE_TIMEOUT, writer.write_all(bytes)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("[logger {}] write error: {e}", self.id);
                drop(writer);
                self.stop().await;
            }
            Err(_) => {
                log::error!("[logger {}] write deadline exceeded", self.id);
                drop(writer);
                self.stop().await;
            }
        }
    }

    async fn write_probe(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(LOGGER_WRITE_TIMEOUT, writer.write_all(&SERIAL_PROBE))
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "probe write timed out",
                ))
            })
    }

    /// Close the socket, giving a short grace period for an in-flight read
    /// to return.
    pub async fn stop(self: &Arc<Self>) {
        if self.running.swap(false, Ordering::SeqCst) {
            let mut writer = self.writer.lock().await;
            let _ = tokio::time::timeout(STOP_GRACE, writer.write_all(&[])).await;
            let _ = writer.shutdown().await;
            drop(writer);
            self.registry.logger_stopped(self.id, self.clone());
        }
    }

    async fn teardown(self: &Arc<Self>) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
            drop(writer);
        }
        self.registry.logger_stopped(self.id, self.clone());
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
    async fn identifies_serial_from_first_frame() {
        let (_registry, handle) = Registry::new();
        let (server_sock, mut client_sock) = loopback_pair().await;
        let logger = LoggerSession::spawn(server_sock, handle, false).await;

        // Drain the startup probe.
        let mut probe = [0u8; SERIAL_PROBE.len()];
        use tokio::io::AsyncReadExt as _;
        client_sock.read_exact(&mut probe).await.unwrap();

        // Reply with a frame carrying a known serial.
        let mut reply = vec![0xa5u8, 0x07, 0x00, 0x10, 0x45, 0x00, 0x00];
        reply.extend_from_slice(&0x0403_0201u32.to_le_bytes());
        reply.push(0x01);
        let checksum = reply[1..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        reply.push(checksum);
        reply.push(0x15);
        use tokio::io::AsyncWriteExt as _;
        client_sock.write_all(&reply).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(logger.serial(), 0x0403_0201);
    }

    #[tokio::test]
    async fn buffering_fifo_is_delivered_in_arrival_order() {
        let (_registry, handle) = Registry::new();
        let (server_sock, mut client_sock) = loopback_pair().await;
        let logger = LoggerSession::spawn(server_sock, handle, true).await;

        let mut probe = [0u8; SERIAL_PROBE.len()];
        use tokio::io::AsyncReadExt as _;
        client_sock.read_exact(&mut probe).await.unwrap();

        // First request goes straight to the wire and arms awaitingReply.
        logger.send(b"req1".to_vec(), 1).await;
        let mut got = [0u8; 4];
        client_sock.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"req1");

        // Second and third requests queue behind it.
        logger.send(b"req2".to_vec(), 2).await;
        logger.send(b"req3".to_vec(), 3).await;

        // Logger "replies" (any bytes clear awaitingReply and trigger a
        // FIFO pop on the next read).
        use tokio::io::AsyncWriteExt as _;
        client_sock.write_all(b"ack1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut got = [0u8; 4];
        client_sock.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"req2");

        client_sock.write_all(b"ack2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut got = [0u8; 4];
        client_sock.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"req3");
    }
}
