//! Replica side of replication.
//!
//! The applier connects to the master, joins if this instance has no data
//! yet, then subscribes with its durable vclock and applies every relayed
//! row through the engine. Any connection-level failure restarts the whole
//! sequence after `reconnect_interval`; a row the engine refuses stops it.

use crate::config::ReplicationConfig;
use crate::error::ReplicationError;
use crate::metrics::Metrics;
use crate::replication::{ReplicationPhase, ReplicationRegistry, Role};
use rippledb_core::{ApplyOutcome, CoreError, Engine};
use rippledb_protocol::request::{ack, reply_vclock};
use rippledb_protocol::{
    keys, FrameReader, FrameWriter, Message, Reply, Request, RequestType, Row, Vclock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Applier settings.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Master address (`host:port`).
    pub source: String,
    /// This instance's uuid, sent in JOIN and SUBSCRIBE.
    pub instance_uuid: Uuid,
    pub user: Option<String>,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub ack_interval: Duration,
}

impl ApplierConfig {
    pub fn new(source: impl Into<String>, instance_uuid: Uuid) -> Self {
        let defaults = ReplicationConfig::default();
        Self {
            source: source.into(),
            instance_uuid,
            user: None,
            token: None,
            connect_timeout: defaults.connect_timeout(),
            reconnect_interval: defaults.reconnect_interval(),
            ack_interval: defaults.ack_interval(),
        }
    }

    /// Returns `None` when no source is configured.
    pub fn from_config(config: &ReplicationConfig, instance_uuid: Uuid) -> Option<Self> {
        let source = config.source.clone()?;
        Some(Self {
            source,
            instance_uuid,
            user: config.user.clone(),
            token: config.token.clone(),
            connect_timeout: config.connect_timeout(),
            reconnect_interval: config.reconnect_interval(),
            ack_interval: config.ack_interval(),
        })
    }

    pub fn with_credentials(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.token = Some(token.into());
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

/// Applier lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    Idle,
    Connecting,
    Joining,
    /// Subscribed and applying rows.
    Streaming,
    /// Waiting to reconnect.
    Disconnected,
    /// Stopped, either on request or after a fatal error.
    Closed,
}

impl ApplierState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplierState::Idle => "idle",
            ApplierState::Connecting => "connecting",
            ApplierState::Joining => "joining",
            ApplierState::Streaming => "streaming",
            ApplierState::Disconnected => "disconnected",
            ApplierState::Closed => "closed",
        }
    }

    /// Value exported through the `applier_state` gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            ApplierState::Idle => 0.0,
            ApplierState::Connecting => 1.0,
            ApplierState::Joining => 2.0,
            ApplierState::Streaming => 3.0,
            ApplierState::Disconnected => 4.0,
            ApplierState::Closed => 5.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplierStatus {
    pub state: ApplierState,
    pub last_error: Option<String>,
    /// Local vclock after the last applied row.
    pub vclock: Vclock,
    pub master_uuid: Option<Uuid>,
}

/// Handle to a running applier task.
pub struct ApplierHandle {
    status: watch::Receiver<ApplierStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ApplierHandle {
    pub fn status(&self) -> ApplierStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ApplierStatus> {
        self.status.clone()
    }

    /// Waits until the applier is streaming.
    ///
    /// Fails with `StartTimeout` when `timeout` elapses first, or with
    /// `Stopped` if the applier closed.
    pub async fn wait_started(&self, timeout: Duration) -> Result<(), ReplicationError> {
        let mut status = self.status.clone();
        let reached = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s.state, ApplierState::Streaming | ApplierState::Closed)),
        )
        .await;
        match reached {
            Err(_) => Err(ReplicationError::StartTimeout(timeout)),
            Ok(Err(_)) => Err(ReplicationError::Stopped("applier task ended".to_string())),
            Ok(Ok(s)) if s.state == ApplierState::Streaming => Ok(()),
            Ok(Ok(s)) => Err(ReplicationError::Stopped(
                s.last_error.clone().unwrap_or_else(|| "stopped".to_string()),
            )),
        }
    }

    /// Cancels the applier and waits for its task to finish.
    pub async fn stop(self) -> ApplierStatus {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Applier task failed: {}", e);
        }
        let status = self.status.borrow().clone();
        status
    }
}

/// Pulls rows from a master into the local engine.
pub struct Applier {
    config: ApplierConfig,
    engine: Arc<Engine>,
    registry: Arc<ReplicationRegistry>,
    metrics: Option<Arc<Metrics>>,
    status: watch::Sender<ApplierStatus>,
    session_id: u64,
}

impl Applier {
    /// Starts the applier in the background.
    pub fn spawn(
        config: ApplierConfig,
        engine: Arc<Engine>,
        registry: Arc<ReplicationRegistry>,
        metrics: Option<Arc<Metrics>>,
    ) -> ApplierHandle {
        let (status_tx, status_rx) = watch::channel(ApplierStatus {
            state: ApplierState::Idle,
            last_error: None,
            vclock: engine.vclock(),
            master_uuid: None,
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let session_id = registry.open(Role::Replica, config.source.clone());

        let applier = Self {
            config,
            engine,
            registry,
            metrics,
            status: status_tx,
            session_id,
        };
        let task = tokio::spawn(applier.run(stop_rx));

        ApplierHandle {
            status: status_rx,
            stop: stop_tx,
            task,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!("Replicating from {}", self.config.source);
        loop {
            if *stop.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.attempt() => result,
                _ = stop.changed() => break,
            };

            let error = match result {
                Ok(()) => ReplicationError::PeerUnavailable("master closed the stream".to_string()),
                Err(e) => e,
            };
            self.registry.set_error(self.session_id, error.to_string());

            if !error.is_retryable() {
                tracing::error!("Replication from {} stopped: {}", self.config.source, error);
                self.set_state(ApplierState::Closed, Some(error.to_string()));
                self.registry.remove(self.session_id);
                return;
            }

            tracing::warn!(
                "Replication from {} interrupted: {}; retrying in {:?}",
                self.config.source,
                error,
                self.config.reconnect_interval
            );
            self.set_state(ApplierState::Disconnected, Some(error.to_string()));

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = stop.changed() => break,
            }
        }

        tracing::info!("Applier for {} stopped", self.config.source);
        self.set_state(ApplierState::Closed, None);
        self.registry.remove(self.session_id);
    }

    fn set_state(&self, state: ApplierState, error: Option<String>) {
        let vclock = self.engine.vclock();
        self.status.send_modify(|s| {
            s.state = state;
            s.vclock = vclock;
            if error.is_some() {
                s.last_error = error;
            }
        });
        if let Some(ref metrics) = self.metrics {
            metrics.applier_state.set(state.as_gauge());
        }
    }

    /// One connect-join-subscribe-stream cycle. Only returns on failure or
    /// when the master closes the stream.
    async fn attempt(&self) -> Result<(), ReplicationError> {
        self.set_state(ApplierState::Connecting, None);
        self.registry
            .set_phase(self.session_id, ReplicationPhase::Greeting);

        let (mut reader, mut writer) = self.connect().await?;
        let mut sync = 0u64;

        if let (Some(user), Some(token)) = (&self.config.user, &self.config.token) {
            sync += 1;
            let auth = Request::Auth {
                user: user.clone(),
                token: token.clone(),
            };
            writer.send(&auth.to_message(sync)).await?;
            expect_reply(&mut reader).await?;
            tracing::debug!("Authenticated to {} as '{}'", self.config.source, user);
        }

        if !self.engine.is_bootstrapped() {
            sync += 1;
            self.join(&mut reader, &mut writer, sync).await?;
        }

        sync += 1;
        let vclock = self.engine.durable_vclock();
        let subscribe = Request::Subscribe {
            instance_uuid: self.config.instance_uuid,
            replica_id: self.engine.instance_id(),
            vclock: vclock.clone(),
        };
        writer.send(&subscribe.to_message(sync)).await?;
        let reply = expect_reply(&mut reader).await?;
        let master_vclock = reply_vclock(&reply)?;

        tracing::info!(
            "Subscribed to {} from vclock {} (master at {})",
            self.config.source,
            vclock,
            master_vclock
        );
        self.registry
            .set_phase(self.session_id, ReplicationPhase::Subscribing);
        self.set_state(ApplierState::Streaming, None);

        self.stream(&mut reader, &mut writer).await
    }

    async fn connect(
        &self,
    ) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>), ReplicationError> {
        let source = &self.config.source;
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(source))
            .await
            .map_err(|_| {
                ReplicationError::PeerUnavailable(format!("connect to {source} timed out"))
            })??;
        stream.set_nodelay(true)?;
        self.registry.set_peer(self.session_id, source.clone());

        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let writer = FrameWriter::new(write_half);

        let greeting = tokio::time::timeout(self.config.connect_timeout, reader.read_greeting())
            .await
            .map_err(|_| {
                ReplicationError::PeerUnavailable(format!("no greeting from {source}"))
            })??;
        tracing::debug!(
            "Connected to {} {} ({})",
            source,
            greeting.version,
            greeting.instance_uuid
        );
        self.status
            .send_modify(|s| s.master_uuid = Some(greeting.instance_uuid));

        Ok((reader, writer))
    }

    /// Receives a snapshot and commits it only once the marker validates.
    async fn join(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut FrameWriter<OwnedWriteHalf>,
        sync: u64,
    ) -> Result<(), ReplicationError> {
        self.set_state(ApplierState::Joining, None);
        self.registry
            .set_phase(self.session_id, ReplicationPhase::Joining);

        let join = Request::Join {
            instance_uuid: self.config.instance_uuid,
            replica_id: self.engine.instance_id(),
            vclock: self.engine.durable_vclock(),
        };
        writer.send(&join.to_message(sync)).await?;

        let mut staged: Vec<Row> = Vec::new();
        let marker = loop {
            let msg = next_message(reader).await?;
            let msg = Reply::classify(msg)?.into_result()?;
            if msg.code()? == RequestType::Ok.as_u32() {
                break msg;
            }
            let row = Row::from_message(&msg)?;
            if !row.is_snapshot() {
                return Err(ReplicationError::InconsistentSnapshot(format!(
                    "row {}:{} inside a snapshot",
                    row.replica_id, row.lsn
                )));
            }
            staged.push(row);
        };

        let vclock = reply_vclock(&marker)?;
        let expected = marker
            .body_u64(keys::ROW_COUNT, "row_count")?
            .ok_or(rippledb_protocol::ProtocolError::MissingField("row_count"))?;
        if expected != staged.len() as u64 {
            return Err(ReplicationError::InconsistentSnapshot(format!(
                "marker announces {} rows, received {}",
                expected,
                staged.len()
            )));
        }

        let count = staged.len();
        self.engine
            .apply_snapshot(staged, vclock.clone())
            .map_err(|e| match e {
                CoreError::Wal(_) => ReplicationError::Apply(e),
                other => ReplicationError::InconsistentSnapshot(other.to_string()),
            })?;
        tracing::info!(
            "Joined {}: {} rows at vclock {}",
            self.config.source,
            count,
            vclock
        );
        Ok(())
    }

    async fn stream(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) -> Result<(), ReplicationError> {
        let mut ticker = tokio::time::interval(self.config.ack_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = reader.read_message() => {
                    let Some(msg) = msg? else {
                        return Ok(());
                    };
                    self.apply(msg)?;
                }
                _ = ticker.tick() => {
                    let durable = self.engine.durable_vclock();
                    writer.send(&ack(&durable)).await?;
                    self.registry.set_vclock(self.session_id, durable);
                }
            }
        }
    }

    fn apply(&self, msg: Message) -> Result<(), ReplicationError> {
        let msg = Reply::classify(msg)?.into_result()?;
        if msg.code()? == RequestType::Ok.as_u32() {
            return Ok(());
        }
        let row = Row::from_message(&msg)?;
        match self.engine.apply_row(&row) {
            Ok(ApplyOutcome::Applied) => {
                if let Some(ref metrics) = self.metrics {
                    metrics.rows_applied_total.inc();
                }
                let vclock = self.engine.vclock();
                self.status.send_modify(|s| s.vclock = vclock);
                Ok(())
            }
            Ok(ApplyOutcome::Skipped) => {
                tracing::debug!("Skipped row {}:{} already applied", row.replica_id, row.lsn);
                Ok(())
            }
            Err(e) => Err(ReplicationError::Apply(e)),
        }
    }
}

async fn next_message(
    reader: &mut FrameReader<OwnedReadHalf>,
) -> Result<Message, ReplicationError> {
    reader
        .read_message()
        .await?
        .ok_or_else(|| ReplicationError::PeerUnavailable("master closed the connection".to_string()))
}

async fn expect_reply(reader: &mut FrameReader<OwnedReadHalf>) -> Result<Message, ReplicationError> {
    let msg = next_message(reader).await?;
    Ok(Reply::classify(msg)?.into_result()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rippledb_core::{EngineConfig, IndexKind, SpaceDef, SYSTEM_SPACE_ID};
    use rippledb_protocol::reply::ok;
    use rippledb_protocol::request::join_marker;
    use rippledb_protocol::{Dml, Greeting};
    use rippledb_wal::WalConfig;
    use rmpv::Value;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    const SPACE: u32 = 512;

    fn engine(dir: &TempDir, id: u32) -> Arc<Engine> {
        Arc::new(
            Engine::open(EngineConfig {
                instance_id: id,
                wal: WalConfig::new(dir.path()),
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_config_from_replication_config() {
        assert!(ApplierConfig::from_config(&ReplicationConfig::default(), Uuid::nil()).is_none());

        let config = ReplicationConfig {
            source: Some("127.0.0.1:3301".to_string()),
            user: Some("repl".to_string()),
            token: Some("secret".to_string()),
            reconnect_interval_ms: 50,
            ..Default::default()
        };
        let applier = ApplierConfig::from_config(&config, Uuid::nil()).unwrap();
        assert_eq!(applier.source, "127.0.0.1:3301");
        assert_eq!(applier.user.as_deref(), Some("repl"));
        assert_eq!(applier.reconnect_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_state_gauge_values_are_distinct() {
        let states = [
            ApplierState::Idle,
            ApplierState::Connecting,
            ApplierState::Joining,
            ApplierState::Streaming,
            ApplierState::Disconnected,
            ApplierState::Closed,
        ];
        for (i, state) in states.iter().enumerate() {
            assert_eq!(state.as_gauge(), i as f64);
        }
        assert_eq!(ApplierState::Streaming.as_str(), "streaming");
    }

    #[tokio::test]
    async fn test_unreachable_master_times_out_and_retries() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ReplicationRegistry::new());
        let config = ApplierConfig::new(addr.to_string(), Uuid::new_v4())
            .with_reconnect_interval(Duration::from_millis(20));
        let handle = Applier::spawn(config, engine(&dir, 2), registry.clone(), None);

        let err = handle
            .wait_started(Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::StartTimeout(_)));
        assert_eq!(registry.count(Role::Replica), 1);

        let status = handle.stop().await;
        assert_eq!(status.state, ApplierState::Closed);
        assert!(registry.list().is_empty());
    }

    fn snapshot_rows() -> Vec<Row> {
        let mut rows = vec![Row::snapshot(
            SYSTEM_SPACE_ID,
            SpaceDef::new(SPACE, "items", IndexKind::Tree).to_tuple(),
        )];
        rows.extend((1..=3u64).map(|k| Row::snapshot(SPACE, vec![Value::from(k), Value::from(k * 10)])));
        rows
    }

    /// Accepts a replica, sends a greeting and reads its JOIN.
    async fn accept_join(
        listener: &TcpListener,
        joins: &Mutex<Vec<Vclock>>,
    ) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>, u64) {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        writer
            .send_greeting(&Greeting::new(Uuid::new_v4(), vec![0; 20]))
            .await
            .unwrap();
        let msg = reader.read_message().await.unwrap().unwrap();
        match Request::from_message(&msg).unwrap() {
            Request::Join { vclock, .. } => joins.lock().push(vclock),
            other => panic!("expected JOIN, got {other:?}"),
        }
        (reader, writer, msg.sync())
    }

    #[tokio::test]
    async fn test_inconsistent_snapshots_are_rejected_and_join_restarts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let joins = Arc::new(Mutex::new(Vec::new()));
        let master_vclock = Vclock::from([(1, 9)]);

        let master = {
            let joins = joins.clone();
            let master_vclock = master_vclock.clone();
            tokio::spawn(async move {
                // A live row inside the snapshot.
                let (_reader, mut writer, sync) = accept_join(&listener, &joins).await;
                let live = Row::new(
                    1,
                    5,
                    Dml::Insert {
                        space_id: SPACE,
                        tuple: vec![Value::from(9u64)],
                    },
                );
                let _ = writer.send(&snapshot_rows()[0].to_message(sync)).await;
                let _ = writer.send(&live.to_message(sync)).await;

                // A marker announcing more rows than were sent.
                let (_reader, mut writer, sync) = accept_join(&listener, &joins).await;
                let rows = snapshot_rows();
                for row in &rows {
                    let _ = writer.send(&row.to_message(sync)).await;
                }
                let _ = writer
                    .send(&join_marker(sync, &master_vclock, rows.len() as u64 + 1))
                    .await;

                // A consistent snapshot, then SUBSCRIBE.
                let (mut reader, mut writer, sync) = accept_join(&listener, &joins).await;
                let rows = snapshot_rows();
                for row in &rows {
                    writer.send(&row.to_message(sync)).await.unwrap();
                }
                writer
                    .send(&join_marker(sync, &master_vclock, rows.len() as u64))
                    .await
                    .unwrap();
                let subscribe = reader.read_message().await.unwrap().unwrap();
                assert_eq!(
                    subscribe.request_type().unwrap(),
                    RequestType::Subscribe
                );
                writer
                    .send(&ok(subscribe.sync()).with_body(keys::VCLOCK, master_vclock.to_value()))
                    .await
                    .unwrap();
                while let Ok(Some(_)) = reader.read_message().await {}
            })
        };

        let dir = TempDir::new().unwrap();
        let replica = engine(&dir, 2);
        let registry = Arc::new(ReplicationRegistry::new());
        let config = ApplierConfig::new(addr.to_string(), Uuid::new_v4())
            .with_reconnect_interval(Duration::from_millis(100));
        let handle = Applier::spawn(config, replica.clone(), registry, None);

        let observer = {
            let mut status = handle.subscribe_status();
            let replica = replica.clone();
            tokio::spawn(async move {
                let mut failures: Vec<(String, bool)> = Vec::new();
                while status.changed().await.is_ok() {
                    let current = status.borrow_and_update().clone();
                    match current.state {
                        ApplierState::Disconnected => {
                            let error = current.last_error.unwrap_or_default();
                            if failures.last().map(|(e, _)| e) != Some(&error) {
                                failures.push((error, replica.is_bootstrapped()));
                            }
                        }
                        ApplierState::Streaming | ApplierState::Closed => break,
                        _ => {}
                    }
                }
                failures
            })
        };

        handle.wait_started(Duration::from_secs(10)).await.unwrap();
        let failures = observer.await.unwrap();

        assert_eq!(failures.len(), 2, "{failures:?}");
        assert!(failures[0].0.contains("inconsistent snapshot"));
        assert!(failures[0].0.contains("row 1:5 inside a snapshot"));
        assert!(failures[1].0.contains("marker announces 5 rows, received 4"));
        assert!(failures.iter().all(|(_, bootstrapped)| !bootstrapped));

        // Every attempt joined from scratch.
        assert_eq!(joins.lock().len(), 3);
        assert!(joins.lock().iter().all(Vclock::is_empty));

        assert!(replica.is_bootstrapped());
        assert_eq!(replica.vclock(), master_vclock);
        assert_eq!(replica.iterate_all_records(SPACE).unwrap().len(), 3);

        let status = handle.stop().await;
        assert_eq!(status.state, ApplierState::Closed);
        master.abort();
    }
}
