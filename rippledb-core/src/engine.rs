//! Data engine - spaces, the local vclock and the WAL.

use crate::error::CoreError;
use crate::space::{apply_ops, IndexKind, Key, Space, SpaceDef, Tuple};
use parking_lot::RwLock;
use rippledb_protocol::{Dml, ReplicaId, Row, Vclock};
use rippledb_wal::{LogStore, Wal, WalConfig, WalEntry};
use rmpv::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Id of the system space holding space definitions.
pub const SYSTEM_SPACE_ID: u32 = 280;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This instance's replica id; local writes are stamped with it.
    pub instance_id: ReplicaId,
    pub wal: WalConfig,
}

/// Result of a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub lsn: u64,
    pub tuples: Vec<Tuple>,
}

/// Outcome of applying a replicated row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The local vclock already covered the row.
    Skipped,
}

/// A consistent copy of the whole dataset.
///
/// Rows are snapshot rows (`lsn == 0`); the system space comes first so
/// that every space exists before its tuples are loaded.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub rows: Vec<Row>,
    pub vclock: Vclock,
}

#[derive(Debug, Default)]
struct State {
    spaces: BTreeMap<u32, Space>,
    vclock: Vclock,
}

/// A validated write, ready to commit.
enum Change {
    CreateSpace(SpaceDef),
    Put {
        space_id: u32,
        key: Key,
        tuple: Tuple,
        echo: bool,
    },
    Remove {
        space_id: u32,
        key: Key,
    },
    Nothing,
}

impl State {
    fn space(&self, space_id: u32) -> Result<&Space, CoreError> {
        self.spaces
            .get(&space_id)
            .ok_or(CoreError::NoSuchSpace { space_id })
    }

    fn system_tuples(&self) -> Vec<Tuple> {
        self.spaces.values().map(|s| s.def.to_tuple()).collect()
    }

    fn prepare(&self, dml: &Dml) -> Result<Change, CoreError> {
        match dml {
            Dml::Insert { space_id, tuple } if *space_id == SYSTEM_SPACE_ID => {
                let def = SpaceDef::from_tuple(tuple)?;
                let taken = def.id == SYSTEM_SPACE_ID
                    || self.spaces.contains_key(&def.id)
                    || self.spaces.values().any(|s| s.def.name == def.name);
                if taken {
                    return Err(CoreError::SpaceExists {
                        space_id: def.id,
                        name: def.name,
                    });
                }
                Ok(Change::CreateSpace(def))
            }
            Dml::Nop => Ok(Change::Nothing),
            other if other.space_id() == Some(SYSTEM_SPACE_ID) => Err(CoreError::Unsupported {
                reason: format!(
                    "{} on the system space",
                    other.request_type().name()
                ),
            }),
            Dml::Insert { space_id, tuple } => {
                let space = self.space(*space_id)?;
                let key = Key::of_tuple(tuple)?;
                if space.index.contains(&key) {
                    return Err(CoreError::DuplicateKey {
                        space_id: *space_id,
                        key: key.to_string(),
                    });
                }
                Ok(Change::Put {
                    space_id: *space_id,
                    key,
                    tuple: tuple.clone(),
                    echo: true,
                })
            }
            Dml::Replace { space_id, tuple } => {
                self.space(*space_id)?;
                Ok(Change::Put {
                    space_id: *space_id,
                    key: Key::of_tuple(tuple)?,
                    tuple: tuple.clone(),
                    echo: true,
                })
            }
            Dml::Upsert {
                space_id,
                tuple,
                ops,
            } => {
                let space = self.space(*space_id)?;
                let key = Key::of_tuple(tuple)?;
                let tuple = match space.index.get(&key) {
                    Some(existing) => apply_ops(existing, ops)?,
                    None => tuple.clone(),
                };
                Ok(Change::Put {
                    space_id: *space_id,
                    key,
                    tuple,
                    echo: false,
                })
            }
            Dml::Delete { space_id, key } => {
                let space = self.space(*space_id)?;
                let key = Key::from_parts(key)?.ok_or_else(|| CoreError::InvalidKey {
                    reason: "delete needs a key".to_string(),
                })?;
                if space.index.contains(&key) {
                    Ok(Change::Remove {
                        space_id: *space_id,
                        key,
                    })
                } else {
                    Ok(Change::Nothing)
                }
            }
        }
    }

    /// Applies a prepared change. Cannot fail.
    fn commit(&mut self, change: Change) -> Vec<Tuple> {
        match change {
            Change::CreateSpace(def) => {
                let tuple = def.to_tuple();
                self.spaces.insert(def.id, Space::new(def));
                vec![tuple]
            }
            Change::Put {
                space_id,
                key,
                tuple,
                echo,
            } => {
                let Some(space) = self.spaces.get_mut(&space_id) else {
                    return Vec::new();
                };
                let returned = echo.then(|| tuple.clone());
                space.index.insert(key, tuple);
                returned.into_iter().collect()
            }
            Change::Remove { space_id, key } => self
                .spaces
                .get_mut(&space_id)
                .and_then(|space| space.index.remove(&key))
                .into_iter()
                .collect(),
            Change::Nothing => Vec::new(),
        }
    }

    fn load(rows: &[Row]) -> Result<Self, CoreError> {
        let mut state = State::default();
        for row in rows {
            if !row.is_snapshot() {
                return Err(CoreError::InconsistentSnapshot {
                    reason: format!(
                        "row {}:{} is not a snapshot row",
                        row.replica_id, row.lsn
                    ),
                });
            }
            let change = state.prepare(&row.dml)?;
            state.commit(change);
        }
        Ok(state)
    }
}

/// The data engine.
///
/// Every write goes to the WAL before it becomes visible. After each commit
/// the new vclock is published to subscribers of [`Engine::subscribe_commits`].
pub struct Engine {
    instance_id: ReplicaId,
    state: RwLock<State>,
    wal: Arc<Wal>,
    commits: watch::Sender<Vclock>,
    bootstrapped: AtomicBool,
}

impl Engine {
    /// Opens the WAL and replays it to restore state.
    pub fn open(config: EngineConfig) -> Result<Self, CoreError> {
        let wal = Arc::new(Wal::open(config.wal)?);
        Self::with_wal(config.instance_id, wal)
    }

    /// Creates an engine over an existing WAL and replays it.
    pub fn with_wal(instance_id: ReplicaId, wal: Arc<Wal>) -> Result<Self, CoreError> {
        let (commits, _) = watch::channel(Vclock::new());
        let engine = Self {
            instance_id,
            state: RwLock::new(State::default()),
            wal,
            commits,
            bootstrapped: AtomicBool::new(false),
        };

        engine.replay_wal()?;
        engine.publish(engine.vclock());

        Ok(engine)
    }

    /// Replays all WAL entries.
    ///
    /// Snapshot rows are buffered until the checkpoint that seals them; rows
    /// not followed by a checkpoint belong to an interrupted JOIN and are
    /// dropped.
    fn replay_wal(&self) -> Result<(), CoreError> {
        let mut state = self.state.write();
        let mut staged: Vec<Row> = Vec::new();
        let mut entry_count = 0usize;

        for item in self.wal.iter() {
            let logged = item?;
            entry_count += 1;
            match logged.entry {
                WalEntry::Row(row) => {
                    if state.vclock.contains(row.replica_id, row.lsn) {
                        continue;
                    }
                    let change = state.prepare(&row.dml)?;
                    state.commit(change);
                    state.vclock.follow(row.replica_id, row.lsn)?;
                    self.bootstrapped.store(true, Ordering::Release);
                }
                WalEntry::SnapshotRow(row) => staged.push(row),
                WalEntry::Checkpoint(cp) => {
                    if cp.snapshot_rows > 0 {
                        let start = staged.len().saturating_sub(cp.snapshot_rows as usize);
                        let mut loaded = State::load(&staged[start..])?;
                        loaded.vclock = cp.vclock.clone();
                        *state = loaded;
                    }
                    state.vclock.merge(&cp.vclock);
                    staged.clear();
                    self.bootstrapped.store(true, Ordering::Release);
                }
            }
        }

        if !staged.is_empty() {
            tracing::warn!(
                "Discarding {} snapshot rows of an interrupted join",
                staged.len()
            );
        }

        if entry_count > 0 {
            tracing::info!(
                "WAL replay complete: {} entries, {} spaces, vclock {}",
                entry_count,
                state.spaces.len(),
                state.vclock
            );
        }

        Ok(())
    }

    /// Merges `vclock` into the published one. Writers release the state
    /// lock before publishing, so they may arrive out of commit order; the
    /// merge keeps the published vclock monotonic.
    fn publish(&self, vclock: Vclock) {
        self.commits.send_if_modified(|published| {
            let before = published.signature();
            published.merge(&vclock);
            published.signature() != before
        });
    }

    pub fn instance_id(&self) -> ReplicaId {
        self.instance_id
    }

    /// Returns a reference to the WAL.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Vclock of every committed row.
    pub fn vclock(&self) -> Vclock {
        self.state.read().vclock.clone()
    }

    /// Vclock of rows on stable storage.
    pub fn durable_vclock(&self) -> Vclock {
        LogStore::durable_vclock(&*self.wal)
    }

    /// Whether this instance holds data: a local write, an applied row or a
    /// completed JOIN.
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Marks a fresh instance as the origin of its own dataset.
    pub fn bootstrap(&self) -> Result<(), CoreError> {
        if self.is_bootstrapped() {
            return Ok(());
        }
        let vclock = self.vclock();
        self.wal.persist_vclock(&vclock)?;
        self.bootstrapped.store(true, Ordering::Release);
        tracing::info!("Bootstrapped instance {} as a new dataset", self.instance_id);
        Ok(())
    }

    /// Receives the vclock after every commit.
    pub fn subscribe_commits(&self) -> watch::Receiver<Vclock> {
        self.commits.subscribe()
    }

    /// Creates a space through the system space.
    pub fn create_space(
        &self,
        space_id: u32,
        name: &str,
        index: IndexKind,
    ) -> Result<ExecResult, CoreError> {
        self.execute(Dml::Insert {
            space_id: SYSTEM_SPACE_ID,
            tuple: SpaceDef::new(space_id, name, index).to_tuple(),
        })
    }

    /// Executes a local write, stamped with the next LSN of this instance.
    pub fn execute(&self, dml: Dml) -> Result<ExecResult, CoreError> {
        let mut state = self.state.write();
        let change = state.prepare(&dml)?;
        let lsn = state.vclock.get(self.instance_id) + 1;
        let row = Row::new(self.instance_id, lsn, dml);

        LogStore::append(&*self.wal, &row)?;

        let tuples = state.commit(change);
        state.vclock.follow(self.instance_id, lsn)?;
        let vclock = state.vclock.clone();
        drop(state);

        self.bootstrapped.store(true, Ordering::Release);
        self.publish(vclock);
        Ok(ExecResult { lsn, tuples })
    }

    /// Applies a row received from another instance.
    ///
    /// Rows already covered by the local vclock are skipped, so a replayed
    /// stream never applies anything twice.
    pub fn apply_row(&self, row: &Row) -> Result<ApplyOutcome, CoreError> {
        if row.is_snapshot() || row.replica_id == 0 {
            return Err(CoreError::InvalidRow {
                replica_id: row.replica_id,
                reason: "snapshot rows cannot be applied outside a join".to_string(),
            });
        }

        let mut state = self.state.write();
        if state.vclock.contains(row.replica_id, row.lsn) {
            return Ok(ApplyOutcome::Skipped);
        }

        let change = state.prepare(&row.dml)?;
        LogStore::append(&*self.wal, row)?;
        state.commit(change);
        state.vclock.follow(row.replica_id, row.lsn)?;
        let vclock = state.vclock.clone();
        drop(state);

        self.bootstrapped.store(true, Ordering::Release);
        self.publish(vclock);
        Ok(ApplyOutcome::Applied)
    }

    /// Tuples of `space_id` matching `key`; an empty key matches all.
    pub fn select(
        &self,
        space_id: u32,
        key: &[Value],
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Tuple>, CoreError> {
        let key = Key::from_parts(key)?;
        let state = self.state.read();
        if space_id == SYSTEM_SPACE_ID {
            let defs = state.system_tuples().into_iter().filter(|t| match &key {
                Some(key) => Key::of_tuple(t).map(|k| &k == key).unwrap_or(false),
                None => true,
            });
            return Ok(defs.skip(offset as usize).take(limit as usize).collect());
        }
        Ok(state
            .space(space_id)?
            .select(key.as_ref(), offset as usize, limit as usize))
    }

    /// Looks up one tuple by primary key.
    pub fn get(&self, space_id: u32, key: &Value) -> Result<Option<Tuple>, CoreError> {
        Ok(self
            .select(space_id, std::slice::from_ref(key), 0, 1)?
            .into_iter()
            .next())
    }

    /// Every tuple of a space regardless of its index kind.
    pub fn iterate_all_records(&self, space_id: u32) -> Result<Vec<Tuple>, CoreError> {
        let state = self.state.read();
        if space_id == SYSTEM_SPACE_ID {
            return Ok(state.system_tuples());
        }
        Ok(state.space(space_id)?.index.iter().cloned().collect())
    }

    /// Definitions of all user spaces.
    pub fn spaces(&self) -> Vec<SpaceDef> {
        self.state
            .read()
            .spaces
            .values()
            .map(|s| s.def.clone())
            .collect()
    }

    /// Number of tuples across all user spaces.
    pub fn tuple_count(&self) -> usize {
        self.state.read().spaces.values().map(Space::len).sum()
    }

    /// Takes a snapshot of the dataset and the vclock it corresponds to.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let mut rows: Vec<Row> = state
            .system_tuples()
            .into_iter()
            .map(|t| Row::snapshot(SYSTEM_SPACE_ID, t))
            .collect();
        for space in state.spaces.values() {
            rows.extend(
                space
                    .index
                    .iter()
                    .map(|t| Row::snapshot(space.def.id, t.clone())),
            );
        }
        Snapshot {
            rows,
            vclock: state.vclock.clone(),
        }
    }

    /// Replaces the dataset with a snapshot received during JOIN.
    ///
    /// The rows and a checkpoint for `vclock` are made durable before the
    /// new state becomes visible.
    pub fn apply_snapshot(&self, rows: Vec<Row>, vclock: Vclock) -> Result<(), CoreError> {
        let mut loaded = State::load(&rows)?;
        loaded.vclock = vclock.clone();

        let count = rows.len();
        for row in rows {
            self.wal.append(&WalEntry::SnapshotRow(row))?;
        }
        self.wal.checkpoint(&vclock, count as u64)?;

        let mut state = self.state.write();
        loaded.vclock.merge(&state.vclock);
        *state = loaded;
        let published = state.vclock.clone();
        drop(state);

        tracing::info!(
            "Loaded snapshot: {} rows, vclock {}",
            count,
            published
        );
        self.bootstrapped.store(true, Ordering::Release);
        self.publish(published);
        Ok(())
    }

    /// Waits until the vclock component of `replica_id` reaches `lsn`.
    pub async fn wait_lsn(
        &self,
        replica_id: ReplicaId,
        lsn: u64,
        timeout: Duration,
    ) -> Result<Vclock, CoreError> {
        let mut commits = self.commits.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            commits.wait_for(|vclock| vclock.get(replica_id) >= lsn),
        )
        .await;
        match reached {
            Ok(Ok(vclock)) => Ok(vclock.clone()),
            _ => Err(CoreError::Timeout {
                replica_id,
                lsn,
                reached: self.vclock().get(replica_id),
            }),
        }
    }

    /// Syncs the WAL to disk.
    pub fn sync(&self) -> Result<(), CoreError> {
        self.wal.sync()?;
        Ok(())
    }
}
