//! Registry / dispatcher: the single owner of the three association tables
//! (`loggers`, `martians`, `pending`) and the event-driven state machine that
//! binds clients to loggers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::session::{ClientSession, LoggerSession};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The three tables the registry owns exclusively, guarded by one mutex.
#[derive(Default)]
struct Tables {
    loggers: HashMap<u32, Arc<LoggerSession>>,
    martians: HashMap<u32, Arc<LoggerSession>>,
    pending: HashMap<u32, Arc<ClientSession>>,
}

enum Event {
    LoggerIdentified { serial: u32, session: Arc<LoggerSession> },
    ClientIdentified { serial: u32, session: Arc<ClientSession> },
    LoggerStopped { id: u32, session: Arc<LoggerSession> },
    Orphan { bytes: Vec<u8> },
}

/// Cloneable, cheap handle to the registry. Sessions and the discovery
/// responder hold one of these; the event-dispatch loop itself is driven by
/// [`Registry::run`].
#[derive(Clone)]
pub struct RegistryHandle {
    tables: Arc<Mutex<Tables>>,
    next_id: Arc<AtomicU32>,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl RegistryHandle {
    /// Allocate the next process-wide session id. Lock-free.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a freshly-accepted logger session into `martians`, keyed by
    /// its session id.
    pub async fn register_martian(&self, session: Arc<LoggerSession>) {
        let mut tables = self.tables.lock().await;
        tables.martians.insert(session.id(), session);
    }

    /// Insert a freshly-accepted client session into `pending`, keyed by
    /// its session id.
    pub async fn register_pending(&self, session: Arc<ClientSession>) {
        let mut tables = self.tables.lock().await;
        tables.pending.insert(session.id(), session);
    }

    /// Emitted by a logger session's read loop once it has parsed its first
    /// valid frame and learned its serial.
    pub fn logger_identified(&self, serial: u32, session: Arc<LoggerSession>) {
        let _ = self.events_tx.send(Event::LoggerIdentified { serial, session });
    }

    /// Emitted by a client session's read loop once it has parsed the
    /// serial of the logger it wants to talk to.
    pub fn client_identified(&self, serial: u32, session: Arc<ClientSession>) {
        let _ = self.events_tx.send(Event::ClientIdentified { serial, session });
    }

    /// Emitted by a logger session's read loop when its socket dies.
    pub fn logger_stopped(&self, id: u32, session: Arc<LoggerSession>) {
        let _ = self.events_tx.send(Event::LoggerStopped { id, session });
    }

    /// A client with no bound logger forwarded bytes; fan them out to every
    /// currently unidentified (martian) logger, best-effort.
    pub fn orphan_broadcast(&self, bytes: Vec<u8>) {
        let _ = self.events_tx.send(Event::Orphan { bytes });
    }

    /// Serial numbers of every currently-known logger, for the discovery
    /// responder.
    pub async fn known_serials(&self) -> Vec<u32> {
        let tables = self.tables.lock().await;
        tables.loggers.keys().copied().collect()
    }
}

/// Owns the receiving ends of the registry's event channels and runs the
/// single serialised dispatch loop.
pub struct Registry {
    tables: Arc<Mutex<Tables>>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Registry {
    /// Construct a fresh registry and the handle used to talk to it.
    pub fn new() -> (Registry, RegistryHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tables = Arc::new(Mutex::new(Tables::default()));
        let handle = RegistryHandle {
            tables: tables.clone(),
            next_id: Arc::new(AtomicU32::new(0)),
            events_tx,
        };
        (Registry { tables, events_rx }, handle)
    }

    /// Run the event-dispatch loop forever.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = sweep.tick() => self.sweep().await,
                else => break,
            }
        }
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::LoggerIdentified { serial, session } => {
                self.on_logger_identified(serial, session).await;
            }
            Event::ClientIdentified { serial, session } => {
                self.on_client_identified(serial, session).await;
            }
            Event::LoggerStopped { id, session } => {
                self.on_logger_stopped(id, session).await;
            }
            Event::Orphan { bytes } => {
                self.on_orphan(bytes).await;
            }
        }
    }

    /// `loggers[S] = session`; any previously-known client whose requested
    /// serial matches is bound to it.
    async fn on_logger_identified(&self, serial: u32, session: Arc<LoggerSession>) {
        let mut tables = self.tables.lock().await;
        tables.loggers.insert(serial, session.clone());

        let mut bound = Vec::new();
        for (id, client) in tables.pending.iter() {
            if client.requested_serial() == serial {
                bound.push(*id);
            }
        }
        let mut matches = Vec::with_capacity(bound.len());
        for id in &bound {
            if let Some(client) = tables.pending.remove(id) {
                matches.push(client);
            }
        }
        drop(tables);

        for client in matches {
            client.bind_logger(session.clone()).await;
            session.add_client(client).await;
        }
    }

    /// If a running logger with the requested serial already exists, bind
    /// immediately; otherwise the client stays `pending`.
    async fn on_client_identified(&self, serial: u32, session: Arc<ClientSession>) {
        let mut tables = self.tables.lock().await;
        let logger = tables.loggers.get(&serial).cloned();
        match logger {
            Some(logger) if logger.is_running() => {
                tables.pending.remove(&session.id());
                drop(tables);
                session.bind_logger(logger.clone()).await;
                logger.add_client(session).await;
            }
            _ => {
                // Stays in pending; a later LoggerIdentified or the sweep
                // will decide its fate.
                log::debug!("no running logger for serial {serial}");
            }
        }
    }

    /// A logger's socket died: dump its bound clients back to `pending`
    /// (their sockets are still alive), stop it, and forget its serial.
    async fn on_logger_stopped(&self, _id: u32, session: Arc<LoggerSession>) {
        let clients = session.take_clients().await;
        let mut tables = self.tables.lock().await;
        for client in clients {
            client.clear_logger().await;
            tables.pending.insert(client.id(), client);
        }
        let serial = session.serial();
        tables.loggers.remove(&serial);
        drop(tables);
        session.stop().await;
    }

    /// Best-effort delivery of an orphan client's bytes to every
    /// still-unidentified logger. A logger can linger in `martians` for up
    /// to one sweep interval after it has actually acquired a serial, so
    /// this only targets entries whose serial is still zero — otherwise
    /// orphan bytes would land directly on an already-identified logger's
    /// socket, bypassing the `awaitingReply`/FIFO discipline on its write
    /// path.
    async fn on_orphan(&self, bytes: Vec<u8>) {
        let tables = self.tables.lock().await;
        let martians: Vec<_> = tables.martians.values().cloned().collect();
        drop(tables);
        for martian in martians {
            if martian.serial() != 0 {
                continue;
            }
            let _ = martian.write_raw(&bytes).await;
        }
    }

    /// Safety-net sweep: reconciles state that might have been missed by
    /// event-driven transitions (e.g. a socket that silently went
    /// half-open).
    async fn sweep(&self) {
        let mut tables = self.tables.lock().await;

        let mut dead_loggers = Vec::new();
        let mut reparked = Vec::new();
        for (serial, logger) in tables.loggers.iter() {
            if !logger.is_running() {
                dead_loggers.push((*serial, logger.clone()));
            }
        }
        for (serial, logger) in &dead_loggers {
            let clients = logger.take_clients().await;
            reparked.extend(clients);
            tables.loggers.remove(serial);
        }

        let mut dead_martians = Vec::new();
        for (id, martian) in tables.martians.iter() {
            if !martian.is_running() || martian.serial() != 0 {
                dead_martians.push(*id);
            }
        }
        for id in dead_martians {
            tables.martians.remove(&id);
        }

        let mut dead_pending = Vec::new();
        for (id, client) in tables.pending.iter() {
            if !client.is_running() {
                dead_pending.push(*id);
            }
        }
        for id in dead_pending {
            tables.pending.remove(&id);
        }

        for client in &reparked {
            client.clear_logger().await;
        }
        for client in reparked {
            tables.pending.insert(client.id(), client);
        }

        log::debug!(
            "[sweep] loggers={} martians={} pending={}",
            tables.loggers.len(),
            tables.martians.len(),
            tables.pending.len(),
        );
        drop(tables);

        for (_, logger) in dead_loggers {
            logger.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientSession, LoggerSession};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    #[tokio::test]
    async fn logger_identified_binds_matching_pending_clients() {
        let (_, handle) = Registry::new();
        let (server_sock, _client_sock) = loopback_pair().await;
        let logger = LoggerSession::spawn(server_sock, handle.clone(), false).await;

        let (server_sock2, _client_sock2) = loopback_pair().await;
        let client = ClientSession::spawn(server_sock2, handle.clone()).await;
        client.set_requested_serial_for_test(42);

        // Exercise the table directly rather than through the channel to
        // keep the test synchronous and deterministic.
        let mut tables = Tables::default();
        tables.pending.insert(client.id(), client.clone());
        let tables = Arc::new(Mutex::new(tables));
        let reg = Registry {
            tables: tables.clone(),
            events_rx: mpsc::unbounded_channel().1,
        };
        reg.on_logger_identified(42, logger.clone()).await;

        let t = tables.lock().await;
        assert!(t.pending.is_empty());
        drop(t);
        assert!(client.bound_logger().await.is_some());
    }

    #[tokio::test]
    async fn logger_stopped_reparks_bound_clients() {
        let (server_sock, _client_sock) = loopback_pair().await;
        let (_, handle) = Registry::new();
        let logger = LoggerSession::spawn(server_sock, handle.clone(), false).await;

        let (server_sock2, _client_sock2) = loopback_pair().await;
        let client = ClientSession::spawn(server_sock2, handle.clone()).await;
        logger.add_client(client.clone()).await;
        client.bind_logger(logger.clone()).await;

        let tables = Arc::new(Mutex::new(Tables::default()));
        let reg = Registry {
            tables: tables.clone(),
            events_rx: mpsc::unbounded_channel().1,
        };
        reg.on_logger_stopped(logger.id(), logger.clone()).await;

        assert!(client.bound_logger().await.is_none());
        let t = tables.lock().await;
        assert!(t.pending.contains_key(&client.id()));
    }
}
