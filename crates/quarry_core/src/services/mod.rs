//! Backend services for Quarry.
//!
//! This module contains all service layer abstractions:
//! - `config` - Target catalog resolved from environment variables
//! - `ssh` - Bastion sessions over russh
//! - `tunnel` - Per-target local listeners forwarded through SSH
//! - `resolver` - Tunnel-or-direct endpoint selection with fallback marks
//! - `driver` - MySQL and PostgreSQL pools and catalog dialects
//! - `connection` - Lazy per-target pool registry
//! - `query` - Read-only query gateway
//! - `schema` - Table listing and column description

pub mod config;
pub mod connection;
pub mod driver;
pub mod query;
pub mod resolver;
pub mod schema;
pub mod ssh;
pub mod tunnel;

pub use config::{ConfigResolver, TargetCatalog};
pub use connection::ConnectionPoolRegistry;
pub use query::QueryGateway;
pub use resolver::ConnectionResolver;
pub use schema::SchemaIntrospector;
pub use tunnel::TunnelManager;
