//! TCP server implementation.

use crate::config::NetworkConfig;
use crate::error::ServerError;
use crate::handler::{Outcome, RequestHandler};
use crate::relay::{Relay, Subscriber};
use crate::replication::Role;
use crate::session::{Session, SessionState};
use crate::triggers::SessionEvent;
use rippledb_protocol::greeting::SALT_SIZE;
use rippledb_protocol::reply::encode_error;
use rippledb_protocol::{ErrorCode, FrameReader, FrameWriter, Greeting, Message, DEFAULT_PORT};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl From<&NetworkConfig> for ServerConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            bind_addr: network.bind_addr,
            idle_timeout: network.idle_timeout(),
            max_connections: network.max_connections,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for rippledb.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    next_session_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: Arc<RequestHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            stats: Arc::new(ServerStats::default()),
            next_session_id: AtomicU64::new(1),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serves connections accepted from an already bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} (instance {})",
            listener.local_addr()?,
            self.handler.instance_uuid()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(metrics) = self.handler.metrics() {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let idle_timeout = self.config.idle_timeout;
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    tcp_stream,
                                    addr,
                                    session_id,
                                    &handler,
                                    idle_timeout,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(metrics) = handler.metrics() {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs one connection from greeting to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session_id: u64,
        handler: &Arc<RequestHandler>,
        idle_timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {} (session {})", addr, session_id);
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);
        let mut session = Session::new(session_id, addr);

        writer
            .send_greeting(&Greeting::new(handler.instance_uuid(), new_salt()))
            .await?;
        session.transition(SessionState::Ready)?;

        if let Err(e) = handler
            .triggers()
            .fire(SessionEvent::Connect, &session.info())
        {
            tracing::warn!("[{}] Connection rejected by connect hook: {}", addr, e);
            session.transition(SessionState::Closed)?;
            let _ = writer.shutdown().await;
            return Ok(());
        }

        let result = Self::serve(
            &mut session,
            &mut reader,
            &mut writer,
            handler,
            idle_timeout,
            shutdown,
        )
        .await;

        let _ = session.transition(SessionState::Closed);
        if let Err(e) = handler
            .triggers()
            .fire(SessionEvent::Disconnect, &session.info())
        {
            tracing::warn!("[{}] Disconnect hook failed: {}", addr, e);
        }
        tracing::debug!(
            "[{}] Session {} closed after {} requests ({:?})",
            addr,
            session.id,
            session.request_count(),
            session.age()
        );
        result
    }

    async fn serve(
        session: &mut Session,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut FrameWriter<OwnedWriteHalf>,
        handler: &Arc<RequestHandler>,
        idle_timeout: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = session.peer;

        loop {
            let frame = tokio::select! {
                result = reader.read_frame() => result?,
                _ = tokio::time::sleep(idle_timeout) => {
                    tracing::info!("[{}] Idle for {:?}, closing", addr, idle_timeout);
                    return Ok(());
                }
                _ = shutdown.recv() => {
                    return Ok(());
                }
            };

            let Some(frame) = frame else {
                tracing::debug!("[{}] Connection closed by client", addr);
                return Ok(());
            };

            let msg = match Message::decode(&frame.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("[{}] Undecodable message: {}", addr, e);
                    writer
                        .send(&encode_error(ErrorCode::InvalidMsgpack, &e.to_string(), 0))
                        .await?;
                    continue;
                }
            };

            match handler.handle(session, &msg) {
                Ok(Outcome::Reply(reply)) => writer.send(&reply).await?,
                Ok(Outcome::Join {
                    sync,
                    instance_uuid,
                    replica_id,
                    vclock,
                }) => {
                    session.transition(SessionState::Joining)?;
                    tracing::info!(
                        "[{}] Replica {} joining with vclock {}",
                        addr,
                        replica_id,
                        vclock
                    );
                    let registry = handler.replication();
                    let relay_id = registry.open(Role::Master, addr.to_string());
                    registry.set_replica(relay_id, replica_id, instance_uuid);
                    registry.set_vclock(relay_id, vclock);

                    let relay = Relay::new(handler.engine().clone(), registry.clone(), relay_id)
                        .with_metrics(handler.metrics().cloned());
                    let result = relay.join(writer, sync).await;
                    registry.remove(relay_id);
                    let rows = result?;

                    tracing::info!("[{}] Replica {} joined with {} rows", addr, replica_id, rows);
                    session.transition(SessionState::Ready)?;
                }
                Ok(Outcome::Subscribe {
                    sync,
                    instance_uuid,
                    replica_id,
                    vclock,
                }) => {
                    session.transition(SessionState::Subscribing)?;
                    let registry = handler.replication();
                    let relay_id = registry.open(Role::Master, addr.to_string());
                    registry.set_replica(relay_id, replica_id, instance_uuid);

                    let relay = Relay::new(handler.engine().clone(), registry.clone(), relay_id)
                        .with_metrics(handler.metrics().cloned());
                    let subscriber = Subscriber {
                        replica_id,
                        vclock,
                        sync,
                    };
                    let result = relay.subscribe(reader, writer, subscriber, shutdown).await;
                    registry.remove(relay_id);

                    match result {
                        Ok(()) | Err(ServerError::ShuttingDown) => {
                            tracing::info!("[{}] Relay to replica {} ended", addr, replica_id);
                            return Ok(());
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.closes_session() => return Err(e),
                Err(e) => writer.send(&handler.error_reply(&e, msg.sync())).await?,
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver notified when the server shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }
}

/// Random greeting salt.
fn new_salt() -> Vec<u8> {
    let mut salt = Vec::with_capacity(32);
    salt.extend_from_slice(Uuid::new_v4().as_bytes());
    salt.extend_from_slice(Uuid::new_v4().as_bytes());
    salt.truncate(SALT_SIZE);
    salt
}
