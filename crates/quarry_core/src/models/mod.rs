//! Data models for Quarry.
//!
//! This module contains all core data structures:
//! - `target` - DatabaseTarget, DriverKind, SshDescriptor, ResolvedEndpoint, PoolStatus
//! - `query` - QueryRequest, QueryResult
//! - `schema` - ColumnDescription
//! - `tunnel` - TunnelState, TunnelEvent

pub mod query;
pub mod schema;
pub mod target;
pub mod tunnel;

pub use query::{QueryRequest, QueryResult, Row};
pub use schema::ColumnDescription;
pub use target::{
    DatabaseTarget, DriverKind, PoolStatus, ResolvedEndpoint, SshDescriptor, TunnelEndpoint,
};
pub use tunnel::{TunnelEvent, TunnelState};
