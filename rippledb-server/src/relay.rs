//! Master side of replication.
//!
//! JOIN sends a snapshot of every space followed by a marker carrying the
//! snapshot vclock and row count. SUBSCRIBE tails the WAL: rows are read in
//! log order from the start, filtered by the subscriber's vclock, and sent
//! only once the engine has published them as committed.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::replication::{ReplicationPhase, ReplicationRegistry};
use rippledb_core::Engine;
use rippledb_protocol::reply::ok;
use rippledb_protocol::request::{join_marker, reply_vclock};
use rippledb_protocol::{keys, FrameReader, FrameWriter, Message, ReplicaId, RequestType, Vclock};
use rippledb_wal::{WalEntry, WalOffset};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};

/// Bytes buffered before a flush while streaming.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// WAL entries read per batch.
const READ_BATCH: usize = 1024;

/// The subscriber as described by its SUBSCRIBE request.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub replica_id: ReplicaId,
    /// What the replica already has; rows it covers are not sent.
    pub vclock: Vclock,
    pub sync: u64,
}

/// Streams replication data over one connection.
pub struct Relay {
    engine: Arc<Engine>,
    registry: Arc<ReplicationRegistry>,
    session_id: u64,
    metrics: Option<Arc<Metrics>>,
}

impl Relay {
    /// `session_id` must have been opened in `registry`.
    pub fn new(engine: Arc<Engine>, registry: Arc<ReplicationRegistry>, session_id: u64) -> Self {
        Self {
            engine,
            registry,
            session_id,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sends a consistent snapshot and the closing marker. Returns the
    /// number of rows sent.
    pub async fn join<W>(&self, writer: &mut FrameWriter<W>, sync: u64) -> Result<u64, ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        self.registry
            .set_phase(self.session_id, ReplicationPhase::Joining);
        let snapshot = self.engine.snapshot();
        let count = snapshot.rows.len() as u64;
        tracing::info!(
            "Sending snapshot: {} rows at vclock {}",
            count,
            snapshot.vclock
        );

        for row in &snapshot.rows {
            writer.queue(&row.to_message(sync))?;
            if writer.pending() >= FLUSH_THRESHOLD {
                writer.flush().await?;
            }
        }
        writer.queue(&join_marker(sync, &snapshot.vclock, count))?;
        writer.flush().await?;

        if let Some(ref metrics) = self.metrics {
            metrics.rows_relayed_total.inc_by(count as f64);
        }
        self.registry
            .set_phase(self.session_id, ReplicationPhase::Greeting);
        Ok(count)
    }

    /// Relays committed rows until the peer disconnects, an error occurs or
    /// the server shuts down.
    pub async fn subscribe<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        subscriber: Subscriber,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut commits = self.engine.subscribe_commits();
        let mut sent = subscriber.vclock.clone();

        self.registry
            .set_phase(self.session_id, ReplicationPhase::Subscribing);
        self.registry.set_vclock(self.session_id, sent.clone());
        writer
            .send(&ok(subscriber.sync).with_body(keys::VCLOCK, self.engine.vclock().to_value()))
            .await?;
        tracing::info!(
            "Replica {} subscribed from vclock {}",
            subscriber.replica_id,
            sent
        );

        if let Some(ref metrics) = self.metrics {
            metrics.relays_active.inc();
        }
        let result = self
            .stream(reader, writer, &subscriber, &mut commits, &mut sent, shutdown)
            .await;
        if let Some(ref metrics) = self.metrics {
            metrics.relays_active.dec();
        }
        result
    }

    async fn stream<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        subscriber: &Subscriber,
        commits: &mut watch::Receiver<Vclock>,
        sent: &mut Vclock,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut cursor = WalOffset::START;
        loop {
            let published = commits.borrow_and_update().clone();
            self.drain(writer, subscriber, &published, sent, &mut cursor)
                .await?;

            tokio::select! {
                changed = commits.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                msg = reader.read_message() => {
                    match msg? {
                        Some(msg) => self.handle_ack(subscriber.replica_id, &msg)?,
                        None => {
                            tracing::info!("Replica {} disconnected", subscriber.replica_id);
                            return Ok(());
                        }
                    }
                }
                _ = shutdown.recv() => {
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
    }

    /// Sends every WAL row after `cursor` that `published` covers.
    ///
    /// Stops at the first row not yet published and leaves the cursor on it,
    /// so the next drain resumes there.
    async fn drain<W>(
        &self,
        writer: &mut FrameWriter<W>,
        subscriber: &Subscriber,
        published: &Vclock,
        sent: &mut Vclock,
        cursor: &mut WalOffset,
    ) -> Result<(), ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut relayed = 0u64;
        loop {
            let engine = Arc::clone(&self.engine);
            let from = *cursor;
            // Segment reads are blocking file I/O.
            let batch = tokio::task::spawn_blocking(move || {
                engine.wal().read_from(from, Some(READ_BATCH))
            })
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
            if batch.is_empty() {
                break;
            }
            let mut blocked = false;
            for logged in batch {
                if let WalEntry::Row(ref row) = logged.entry {
                    if !published.contains(row.replica_id, row.lsn) {
                        blocked = true;
                        break;
                    }
                    let wanted = row.replica_id != 0
                        && row.replica_id != subscriber.replica_id
                        && !sent.contains(row.replica_id, row.lsn);
                    if wanted {
                        writer.queue(&row.to_message(subscriber.sync))?;
                        sent.follow(row.replica_id, row.lsn)?;
                        relayed += 1;
                        if writer.pending() >= FLUSH_THRESHOLD {
                            writer.flush().await?;
                        }
                    }
                }
                *cursor = logged.next_offset;
            }
            if blocked {
                break;
            }
        }
        writer.flush().await?;

        if relayed > 0 {
            tracing::debug!(
                "Relayed {} rows to replica {}",
                relayed,
                subscriber.replica_id
            );
            if let Some(ref metrics) = self.metrics {
                metrics.rows_relayed_total.inc_by(relayed as f64);
            }
        }
        Ok(())
    }

    fn handle_ack(&self, replica_id: ReplicaId, msg: &Message) -> Result<(), ServerError> {
        if msg.request_type()? != RequestType::Ok {
            return Err(ServerError::InvalidRequest(format!(
                "replica {replica_id} sent a request on a subscribed connection"
            )));
        }
        let vclock = reply_vclock(msg)?;
        tracing::trace!("Replica {} acknowledged {}", replica_id, vclock);
        self.registry.set_vclock(self.session_id, vclock);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::Role;
    use rippledb_core::{EngineConfig, IndexKind};
    use rippledb_protocol::request::ack;
    use rippledb_protocol::{Dml, Reply, Row};
    use rippledb_wal::WalConfig;
    use rmpv::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::duplex;

    fn engine(dir: &TempDir) -> Arc<Engine> {
        let engine = Engine::open(EngineConfig {
            instance_id: 1,
            wal: WalConfig::new(dir.path()),
        })
        .unwrap();
        engine.bootstrap().unwrap();
        engine.create_space(512, "test", IndexKind::Hash).unwrap();
        Arc::new(engine)
    }

    fn insert(engine: &Engine, k: u64) {
        engine
            .execute(Dml::Insert {
                space_id: 512,
                tuple: vec![Value::from(k)],
            })
            .unwrap();
    }

    fn relay(engine: &Arc<Engine>) -> (Arc<ReplicationRegistry>, Relay) {
        let registry = Arc::new(ReplicationRegistry::new());
        let id = registry.open(Role::Master, "test");
        let relay = Relay::new(engine.clone(), registry.clone(), id);
        (registry, relay)
    }

    #[tokio::test]
    async fn test_join_sends_snapshot_and_marker() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        for k in 0..3 {
            insert(&engine, k);
        }
        let (_registry, relay) = relay(&engine);

        let (client, server) = duplex(1 << 20);
        let mut writer = FrameWriter::new(server);
        let sent = relay.join(&mut writer, 9).await.unwrap();
        // One system space tuple plus three data tuples.
        assert_eq!(sent, 4);
        drop(writer);

        let mut reader = FrameReader::new(client);
        let mut rows = Vec::new();
        let marker = loop {
            let msg = reader.read_message().await.unwrap().unwrap();
            assert_eq!(msg.sync(), 9);
            if msg.code().unwrap() == RequestType::Ok.as_u32() {
                break msg;
            }
            rows.push(Row::from_message(&msg).unwrap());
        };
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(Row::is_snapshot));
        assert_eq!(marker.body_u64(keys::ROW_COUNT, "row_count").unwrap(), Some(4));
        assert_eq!(reply_vclock(&marker).unwrap(), engine.vclock());
    }

    #[tokio::test]
    async fn test_subscribe_streams_new_rows() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        insert(&engine, 1);
        let covered = engine.vclock();
        let (registry, relay) = relay(&engine);

        let (client, server) = duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let subscriber = Subscriber {
            replica_id: 2,
            vclock: covered.clone(),
            sync: 3,
        };
        let task = tokio::spawn(async move {
            let mut reader = FrameReader::new(server_read);
            let mut writer = FrameWriter::new(server_write);
            relay
                .subscribe(&mut reader, &mut writer, subscriber, &mut shutdown_rx)
                .await
        });

        let mut reader = FrameReader::new(client_read);
        let mut writer = FrameWriter::new(client_write);
        let reply = reader.read_message().await.unwrap().unwrap();
        let reply = Reply::classify(reply).unwrap().into_result().unwrap();
        assert_eq!(reply_vclock(&reply).unwrap(), covered);

        insert(&engine, 2);
        insert(&engine, 3);
        for expected in [2u64, 3] {
            let msg = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let row = Row::from_message(&msg).unwrap();
            assert_eq!(row.replica_id, 1);
            match row.dml {
                Dml::Insert { tuple, .. } => assert_eq!(tuple, vec![Value::from(expected)]),
                other => panic!("unexpected {other:?}"),
            }
        }

        let acked = engine.vclock();
        writer.send(&ack(&acked)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.list()[0].vclock != acked {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(registry.list()[0].phase, ReplicationPhase::Subscribing);

        shutdown_tx.send(()).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ServerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_subscribe_skips_subscriber_rows() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        // A row that originated on the subscriber itself.
        engine
            .apply_row(&Row::new(
                2,
                1,
                Dml::Insert {
                    space_id: 512,
                    tuple: vec![Value::from(100u64)],
                },
            ))
            .unwrap();
        insert(&engine, 1);
        let (_registry, relay) = relay(&engine);

        let (client, server) = duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server);
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let mut reader = FrameReader::new(server_read);
            let mut writer = FrameWriter::new(server_write);
            relay
                .subscribe(
                    &mut reader,
                    &mut writer,
                    Subscriber {
                        replica_id: 2,
                        vclock: Vclock::new(),
                        sync: 1,
                    },
                    &mut shutdown_rx,
                )
                .await
        });

        let mut reader = FrameReader::new(client);
        reader.read_message().await.unwrap().unwrap();
        let mut origins = Vec::new();
        // create_space (lsn 1) and the insert (lsn 2) of replica 1.
        for _ in 0..2 {
            let msg = reader.read_message().await.unwrap().unwrap();
            let row = Row::from_message(&msg).unwrap();
            origins.push((row.replica_id, row.lsn));
        }
        assert_eq!(origins, vec![(1, 1), (1, 2)]);

        drop(reader);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    async fn next_lsn<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>, sync: u64) -> u64 {
        let msg = tokio::time::timeout(Duration::from_secs(5), reader.read_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.sync(), sync);
        Row::from_message(&msg).unwrap().lsn
    }

    #[tokio::test]
    async fn test_subscribe_resumes_across_read_batches() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalConfig::new(dir.path());
        wal.fsync_policy = rippledb_wal::FsyncPolicy::Never;
        let engine = Engine::open(EngineConfig {
            instance_id: 1,
            wal,
        })
        .unwrap();
        engine.bootstrap().unwrap();
        engine.create_space(512, "test", IndexKind::Hash).unwrap();
        let engine = Arc::new(engine);
        for k in 0..(READ_BATCH as u64 * 2 + 10) {
            insert(&engine, k);
        }
        let head = engine.vclock().get(1);
        let (_registry, relay) = relay(&engine);

        let (client, server) = duplex(1 << 20);
        let (server_read, server_write) = tokio::io::split(server);
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let subscriber = Subscriber {
            replica_id: 2,
            vclock: Vclock::from([(1, head - 3)]),
            sync: 5,
        };
        let task = tokio::spawn(async move {
            let mut reader = FrameReader::new(server_read);
            let mut writer = FrameWriter::new(server_write);
            relay
                .subscribe(&mut reader, &mut writer, subscriber, &mut shutdown_rx)
                .await
        });

        let mut reader = FrameReader::new(client);
        reader.read_message().await.unwrap().unwrap();
        let mut lsns = Vec::new();
        for _ in 0..3 {
            lsns.push(next_lsn(&mut reader, 5).await);
        }
        assert_eq!(lsns, vec![head - 2, head - 1, head]);

        insert(&engine, u64::MAX);
        assert_eq!(next_lsn(&mut reader, 5).await, head + 1);

        drop(reader);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
