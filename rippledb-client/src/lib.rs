//! # rippledb-client
//!
//! Client library for rippledb.
//!
//! This crate provides:
//! - Async TCP connection with greeting handling and optional auth
//! - Sync-id request/reply matching over one connection
//! - High-level API for ping, status, select and writes
//! - MessagePack/JSON value conversion for tools

pub mod client;
pub mod connection;
pub mod error;
pub mod json;

pub use client::{Client, WriteResult};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
