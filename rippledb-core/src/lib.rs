//! # rippledb-core
//!
//! Data engine for rippledb.
//!
//! This crate provides:
//! - Spaces with a TREE or HASH primary index
//! - Local writes stamped with the instance's own LSN
//! - Idempotent application of replicated rows
//! - Consistent snapshots for JOIN and their durable installation
//! - Commit notifications and `wait_lsn`

pub mod engine;
pub mod error;
pub mod space;

pub use engine::{
    ApplyOutcome, Engine, EngineConfig, ExecResult, Snapshot, SYSTEM_SPACE_ID,
};
pub use error::CoreError;
pub use space::{apply_ops, Index, IndexKind, Key, Space, SpaceDef, Tuple};
