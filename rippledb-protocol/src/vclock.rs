//! Vector clocks: the last applied LSN per origin replica.

use crate::error::ProtocolError;
use crate::message::value_u64;
use rmpv::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of the instance a row originated on.
pub type ReplicaId = u32;

/// Map from origin replica id to the last LSN seen from it.
///
/// Absent entries read as LSN `0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vclock(BTreeMap<ReplicaId, u64>);

impl Vclock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, replica_id: ReplicaId) -> u64 {
        self.0.get(&replica_id).copied().unwrap_or(0)
    }

    /// Advances `replica_id` to `lsn`, which must be strictly greater than
    /// the current value.
    pub fn follow(&mut self, replica_id: ReplicaId, lsn: u64) -> Result<(), ProtocolError> {
        let current = self.get(replica_id);
        if lsn <= current {
            return Err(ProtocolError::LsnOutOfOrder {
                replica_id,
                current,
                lsn,
            });
        }
        self.0.insert(replica_id, lsn);
        Ok(())
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &Vclock) {
        for (&id, &lsn) in &other.0 {
            let entry = self.0.entry(id).or_insert(0);
            *entry = (*entry).max(lsn);
        }
    }

    /// Sum of all components; grows with every applied row.
    pub fn signature(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&lsn| lsn == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(&id, &lsn)| (id, lsn))
    }

    /// Returns true if `lsn` from `replica_id` is already covered.
    pub fn contains(&self, replica_id: ReplicaId, lsn: u64) -> bool {
        lsn <= self.get(replica_id)
    }

    /// Partial order: `None` when the clocks are concurrent.
    pub fn compare(&self, other: &Vclock) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for id in self.0.keys().chain(other.0.keys()) {
            match self.get(*id).cmp(&other.get(*id)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }

    /// Encodes as a MessagePack map `{replica_id: lsn}`.
    pub fn to_value(&self) -> Value {
        Value::Map(
            self.0
                .iter()
                .map(|(&id, &lsn)| (Value::from(id), Value::from(lsn)))
                .collect(),
        )
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let entries = value
            .as_map()
            .ok_or_else(|| ProtocolError::invalid_field("vclock", "expected map"))?;

        let mut clock = BTreeMap::new();
        for (id, lsn) in entries {
            let id = u32::try_from(value_u64(id, "vclock")?)
                .map_err(|_| ProtocolError::invalid_field("vclock", "replica id exceeds u32"))?;
            clock.insert(id, value_u64(lsn, "vclock")?);
        }
        Ok(Self(clock))
    }
}

impl From<BTreeMap<ReplicaId, u64>> for Vclock {
    fn from(map: BTreeMap<ReplicaId, u64>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(ReplicaId, u64); N]> for Vclock {
    fn from(entries: [(ReplicaId, u64); N]) -> Self {
        Self(entries.into_iter().collect())
    }
}

impl fmt::Display for Vclock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}: {lsn}")?;
        }
        f.write_str("}")
    }
}
