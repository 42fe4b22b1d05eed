//! Core types and services for Quarry, a read-only database access layer.
//!
//! This crate provides the backend service layer for Quarry:
//!
//! - **error**: Error handling with driver-specific details
//! - **models**: Targets, endpoints, query results, tunnel states
//! - **services**: Configuration, SSH tunnels, pools, queries, schema
//! - **state**: The `Quarry` resource hub
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;
mod verification_tests;

pub use error::{ErrorInfo, QuarryError, QuarryResult};
pub use models::{
    ColumnDescription, DatabaseTarget, DriverKind, PoolStatus, QueryRequest, QueryResult,
    SshDescriptor,
};
pub use services::{
    ConfigResolver, ConnectionPoolRegistry, ConnectionResolver, QueryGateway, SchemaIntrospector,
    TargetCatalog, TunnelManager,
};
pub use state::{Quarry, QuarryBuilder};
