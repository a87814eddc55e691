//! Server network layer: accepts players, dials the backend for each one and
//! runs the single event loop that owns every session.

use crate::commands::Deferred;
use crate::config::RelayConfig;
use crate::hooks::HookBus;
use crate::registry::{Admission, SessionRegistry};
use crate::session::{self, Leg, LegCommand, SessionId};
use crate::storage::StorageHandle;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

pub const BANNED_MESSAGE: &str = "You are banned on this server.";

/// Time given to connection tasks to flush after every session is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    /// Ban lookup finished for an accepted connection.
    Admitted {
        stream: TcpStream,
        addr: SocketAddr,
        banned: bool,
    },
    ClientData {
        session: SessionId,
        data: Vec<u8>,
    },
    ClientClosed {
        session: SessionId,
    },
    BackendConnected {
        session: SessionId,
        leg: Leg,
    },
    BackendFailed {
        session: SessionId,
        error: String,
    },
    BackendData {
        session: SessionId,
        data: Vec<u8>,
    },
    BackendClosed {
        session: SessionId,
    },
    Deferred {
        session: SessionId,
        action: Deferred,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Backend,
}

impl Side {
    fn data(self, session: SessionId, data: Vec<u8>) -> ServerMessage {
        match self {
            Side::Client => ServerMessage::ClientData { session, data },
            Side::Backend => ServerMessage::BackendData { session, data },
        }
    }

    fn closed(self, session: SessionId) -> ServerMessage {
        match self {
            Side::Client => ServerMessage::ClientClosed { session },
            Side::Backend => ServerMessage::BackendClosed { session },
        }
    }
}

/// Pumps one TCP stream: bytes read go to the server loop, [`LegCommand`]s
/// coming from the session are written out. Reports a close only when the
/// peer or the socket ended it.
async fn run_connection(
    stream: TcpStream,
    session: SessionId,
    side: Side,
    mut commands: mpsc::UnboundedReceiver<LegCommand>,
    events: mpsc::UnboundedSender<ServerMessage>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LegCommand::Write(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!("Session {} {:?} write failed: {}", session, side, e);
                        break;
                    }
                }
                Some(LegCommand::Close) | None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break,
                Ok(len) => {
                    if events.send(side.data(session, buffer[..len].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Session {} {:?} read failed: {}", session, side, e);
                    break;
                }
            },
        }
    }

    let _ = events.send(side.closed(session));
}

/// Dials the backend for `session`. The leg is announced before its reader
/// starts so backend data can never overtake it.
fn spawn_backend_dial(
    backend_addr: String,
    session: SessionId,
    events: mpsc::UnboundedSender<ServerMessage>,
) {
    tokio::spawn(async move {
        match TcpStream::connect(&backend_addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY on backend leg: {}", e);
                }
                let (leg, commands) = Leg::channel();
                if events
                    .send(ServerMessage::BackendConnected { session, leg })
                    .is_err()
                {
                    return;
                }
                run_connection(stream, session, Side::Backend, commands, events).await;
            }
            Err(e) => {
                let _ = events.send(ServerMessage::BackendFailed {
                    session,
                    error: format!("{backend_addr}: {e}"),
                });
            }
        }
    });
}

fn spawn_reject(stream: TcpStream, addr: SocketAddr, message: String) {
    tokio::spawn(async move {
        if let Err(e) = session::reject(stream, &message).await {
            debug!("Reject session for {} ended early: {}", addr, e);
        }
    });
}

/// Asks a running [`Server`] to stop.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server already stopped");
        }
    }
}

/// Main server coordinating sessions, storage and the tick
pub struct Server {
    listener: TcpListener,
    registry: SessionRegistry,
    config: Arc<RelayConfig>,
    storage: StorageHandle,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(config: RelayConfig, storage: StorageHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self::with_listener(listener, config, storage))
    }

    pub fn with_listener(listener: TcpListener, config: RelayConfig, storage: StorageHandle) -> Self {
        let config = Arc::new(config);
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let registry = SessionRegistry::new(Arc::clone(&config), storage.clone(), server_tx.clone());

        Server {
            listener,
            registry,
            config,
            storage,
            server_tx,
            server_rx,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn hooks_mut(&mut self) -> &mut HookBus {
        self.registry.hooks_mut()
    }

    /// Admission: hooks and the per-address limit now, the ban lookup in the background.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        match self.registry.check_admission(addr) {
            Admission::Refused => drop(stream),
            Admission::Rejected(message) => spawn_reject(stream, addr, message),
            Admission::Accepted => {
                let storage = self.storage.clone();
                let server_tx = self.server_tx.clone();
                tokio::spawn(async move {
                    let banned = storage.is_banned(addr.ip()).await;
                    if let Err(e) = server_tx.send(ServerMessage::Admitted {
                        stream,
                        addr,
                        banned,
                    }) {
                        error!("Failed to hand admitted connection to main loop: {}", e);
                    }
                });
            }
        }
    }

    fn open(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (leg, commands) = Leg::channel();
        let session = self.registry.open_session(addr, leg);
        tokio::spawn(run_connection(
            stream,
            session,
            Side::Client,
            commands,
            self.server_tx.clone(),
        ));
        spawn_backend_dial(self.config.backend_addr(), session, self.server_tx.clone());
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Admitted {
                stream,
                addr,
                banned,
            } => {
                if banned {
                    info!("Banned address {} tried to connect", addr.ip());
                    self.registry.release(addr.ip());
                    spawn_reject(stream, addr, BANNED_MESSAGE.to_string());
                } else {
                    self.open(stream, addr);
                }
            }
            ServerMessage::ClientData { session, data } => {
                self.registry.on_client_data(session, &data);
            }
            ServerMessage::ClientClosed { session } => self.registry.on_client_closed(session),
            ServerMessage::BackendConnected { session, leg } => {
                self.registry.on_backend_connected(session, leg);
            }
            ServerMessage::BackendFailed { session, error } => {
                self.registry.on_backend_failed(session, &error);
            }
            ServerMessage::BackendData { session, data } => {
                self.registry.on_backend_data(session, &data);
            }
            ServerMessage::BackendClosed { session } => self.registry.on_backend_closed(session),
            ServerMessage::Deferred { session, action } => {
                self.registry.on_deferred(session, action);
            }
            ServerMessage::Shutdown => {}
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> io::Result<()> {
        let mut tick_interval = interval(self.config.tick_duration());
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Relay listening on {}, forwarding to {}",
            self.local_addr()?,
            self.config.backend_addr()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.admit(stream, addr),
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                        Some(message) => self.handle_message(message),
                    }
                },

                _ = tick_interval.tick() => self.registry.tick(),
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Closes every session and gives their connections a moment to flush.
    pub async fn shutdown(&mut self) {
        let open = self.registry.len();
        self.registry.close_all("server shutting down");
        if open > 0 {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
        info!("Closed {} sessions", open);
    }
}
