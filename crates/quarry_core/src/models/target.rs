//! Database target configuration and pool status models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::services::driver::{self, Dialect};

/// SQL dialect spoken by a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// MySQL / MariaDB
    MySql,
    /// PostgreSQL
    Postgres,
}

impl DriverKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
        }
    }

    /// Parse from a configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Default server port for the dialect.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::Postgres => 5432,
        }
    }

    /// Catalog capabilities for the dialect.
    pub fn dialect(&self) -> &'static dyn Dialect {
        match self {
            Self::MySql => &driver::mysql::MySqlDialect,
            Self::Postgres => &driver::postgres::PostgresDialect,
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH bastion settings attached to a target.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshDescriptor {
    /// Bastion hostname
    pub host: String,
    /// Bastion port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Path to the private key
    pub key_path: PathBuf,
    /// Optional passphrase for an encrypted key
    #[serde(skip_serializing)]
    pub key_passphrase: Option<String>,
}

impl SshDescriptor {
    /// Create a new descriptor with the default SSH port.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            key_path: key_path.into(),
            key_passphrase: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Debug for SshDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// A named logical database and how to reach it.
///
/// Resolved once from the environment; immutable for the process lifetime.
#[derive(Clone, Serialize)]
pub struct DatabaseTarget {
    /// Target name (e.g. "odoo")
    pub name: String,
    /// SQL dialect
    pub driver: DriverKind,
    /// Server hostname or IP, as seen from the bastion when tunneled
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login username
    pub username: String,
    /// Login password
    #[serde(skip_serializing)]
    pub password: String,
    /// Database name
    pub database: String,
    /// Optional SSH bastion settings
    pub ssh: Option<SshDescriptor>,
}

impl DatabaseTarget {
    /// Create a target with the dialect's default port and no bastion.
    pub fn new(name: impl Into<String>, driver: DriverKind, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver,
            host: host.into(),
            port: driver.default_port(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            ssh: None,
        }
    }

    /// Attach an SSH bastion.
    pub fn with_ssh(mut self, ssh: SshDescriptor) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Whether queries should try the SSH bastion first.
    pub fn uses_ssh(&self) -> bool {
        self.ssh.is_some()
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.driver, self.username, self.host, self.port, self.database
        )
    }
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("database", &self.database)
            .field("ssh", &self.ssh)
            .finish_non_exhaustive()
    }
}

/// Where a pool for a target should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Host to connect to (127.0.0.1 when tunneled)
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// The tunnel this endpoint depends on, if any
    pub tunnel: Option<TunnelEndpoint>,
}

impl ResolvedEndpoint {
    /// Endpoint pointing straight at the target's own host and port.
    pub fn direct(target: &DatabaseTarget) -> Self {
        Self { host: target.host.clone(), port: target.port, tunnel: None }
    }

    /// Endpoint pointing at a local tunnel listener.
    pub fn tunneled(tunnel: TunnelEndpoint) -> Self {
        Self { host: "127.0.0.1".to_string(), port: tunnel.local_port, tunnel: Some(tunnel) }
    }

    /// Whether traffic goes through an SSH tunnel.
    pub fn via_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }
}

/// Local side of an active tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelEndpoint {
    /// Local listening port
    pub local_port: u16,
    /// Distinguishes successive tunnels for the same target
    pub generation: u64,
}

/// Connection pool status.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    /// Maximum pool capacity
    pub max_size: usize,
    /// Current connections (idle + active)
    pub size: usize,
    /// Idle connections
    pub available: usize,
    /// Tasks waiting for connections
    pub waiting: usize,
    /// Whether the pool connects through an SSH tunnel
    pub via_tunnel: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!(DriverKind::parse("MySQL"), Some(DriverKind::MySql));
        assert_eq!(DriverKind::parse("mariadb"), Some(DriverKind::MySql));
        assert_eq!(DriverKind::parse(" postgresql "), Some(DriverKind::Postgres));
        assert_eq!(DriverKind::parse("pg"), Some(DriverKind::Postgres));
        assert_eq!(DriverKind::parse("sqlite"), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut target = DatabaseTarget::new("odoo", DriverKind::Postgres, "db.internal");
        target.password = "hunter2".to_string();
        let mut ssh = SshDescriptor::new("bastion", "deploy", "/keys/id_rsa");
        ssh.key_passphrase = Some("open sesame".to_string());
        let target = target.with_ssh(ssh);

        let rendered = format!("{target:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("open sesame"));
        assert!(rendered.contains("bastion"));
    }

    #[test]
    fn test_resolved_endpoint_tunneled() {
        let endpoint = ResolvedEndpoint::tunneled(TunnelEndpoint { local_port: 40123, generation: 7 });
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 40123);
        assert!(endpoint.via_tunnel());

        let target = DatabaseTarget::new("laravel", DriverKind::MySql, "mysql.internal");
        let direct = ResolvedEndpoint::direct(&target);
        assert_eq!(direct.port, 3306);
        assert!(!direct.via_tunnel());
    }

    #[test]
    fn test_display_url_omits_password() {
        let mut target = DatabaseTarget::new("odoo", DriverKind::Postgres, "db");
        target.username = "reader".to_string();
        target.password = "secret".to_string();
        target.database = "prod".to_string();
        assert_eq!(target.display_url(), "postgres://reader@db:5432/prod");
    }
}
