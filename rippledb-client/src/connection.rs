//! Connection management.

use crate::error::ClientError;
use rippledb_protocol::{FrameReader, FrameWriter, Greeting, Message, Reply, Request};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address (`host:port`).
    pub addr: String,
    /// Connection timeout, covering the greeting.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// User to authenticate as after the greeting.
    pub user: Option<String>,
    pub token: Option<String>,
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            user: None,
            token: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.token = Some(token.into());
        self
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Message>>>>;

/// A connection to a rippledb server.
///
/// Requests are tagged with increasing sync ids; a background task reads
/// replies and routes each to the request with the same sync.
pub struct Connection {
    config: ConnectionConfig,
    writer: Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    pending: Pending,
    greeting: std::sync::Mutex<Option<Greeting>>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_sync: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            greeting: std::sync::Mutex::new(None),
            reader_task: std::sync::Mutex::new(None),
            next_sync: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connects, reads the greeting and authenticates if credentials are set.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let (reader, greeting) = tokio::time::timeout(self.config.connect_timeout, async {
            let stream = TcpStream::connect(&self.config.addr).await?;
            stream.set_nodelay(true).ok();
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let greeting = reader.read_greeting().await?;
            *self.writer.lock().await = Some(FrameWriter::new(write_half));
            Ok::<_, ClientError>((reader, greeting))
        })
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })??;

        tracing::debug!(
            "Connected to {} {} (instance {})",
            self.config.addr,
            greeting.version,
            greeting.instance_uuid
        );
        if let Ok(mut slot) = self.greeting.lock() {
            *slot = Some(greeting);
        }

        self.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(read_loop(
            reader,
            self.pending.clone(),
            self.connected.clone(),
        ));
        if let Ok(mut slot) = self.reader_task.lock() {
            *slot = Some(task);
        }

        if let (Some(user), Some(token)) = (&self.config.user, &self.config.token) {
            tracing::debug!("Authenticating as '{}'", user);
            self.request(Request::Auth {
                user: user.clone(),
                token: token.clone(),
            })
            .await?;
        }
        Ok(())
    }

    /// Sends a request and waits for its reply. Error replies become
    /// [`ClientError::Server`].
    pub async fn request(&self, request: Request) -> Result<Message, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let sync = self.next_sync.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(sync, tx);

        {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
            if let Err(e) = writer.send(&request.to_message(sync)).await {
                self.pending.lock().await.remove(&sync);
                return Err(e.into());
            }
        }
        tracing::debug!("Request sync={} {} sent", sync, request.kind().name());

        let reply = match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&sync);
                return Err(ClientError::Timeout);
            }
        };

        Ok(Reply::classify(reply)?.into_result()?)
    }

    /// Greeting received on connect.
    pub fn greeting(&self) -> Option<Greeting> {
        self.greeting.lock().ok().and_then(|g| g.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection. Pending requests fail with `ConnectionClosed`.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let task = self.reader_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.abort();
        }
        self.pending.lock().await.clear();
        tracing::debug!("Connection to {} closed", self.config.addr);
        Ok(())
    }

    /// Number of requests awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reader_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn read_loop(mut reader: FrameReader<OwnedReadHalf>, pending: Pending, connected: Arc<AtomicBool>) {
    loop {
        match reader.read_message().await {
            Ok(Some(msg)) => {
                let sync = msg.sync();
                match pending.lock().await.remove(&sync) {
                    Some(tx) => {
                        let _ = tx.send(msg);
                    }
                    None => tracing::debug!("Reply for unknown sync={}", sync),
                }
            }
            Ok(None) => {
                tracing::debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Read failed: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with ConnectionClosed.
    pending.lock().await.clear();
}
