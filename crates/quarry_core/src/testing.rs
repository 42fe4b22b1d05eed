//! In-process doubles for the SSH and driver seams.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    DatabaseTarget, DriverKind, PoolStatus, QueryResult, ResolvedEndpoint, SshDescriptor,
};
use crate::services::driver::{Backend, BackendFactory};
use crate::services::ssh::{ForwardStream, SessionEvent, SshConnector, SshLink, SshSession};

/// A target behind the test bastion; `laravel` is MySQL, anything else PostgreSQL.
pub fn ssh_target(name: &str) -> DatabaseTarget {
    let driver = if name == "laravel" { DriverKind::MySql } else { DriverKind::Postgres };
    DatabaseTarget::new(name, driver, "db.internal")
        .with_ssh(SshDescriptor::new("bastion.internal", "deploy", "/keys/id_rsa"))
}

/// Connector whose sessions echo forwarded bytes back.
#[derive(Default)]
pub struct MockConnector {
    fail: bool,
    end_at_once: bool,
    delay: Option<Duration>,
    connects: AtomicUsize,
    closes: Arc<AtomicUsize>,
    forwards: Arc<Mutex<Vec<(String, u16)>>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionEvent>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose every attempt is refused.
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    /// Sessions whose event channel already holds `Closed` when handed out.
    pub fn ending_sessions_at_once(mut self) -> Self {
        self.end_at_once = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every `(host, port)` a channel was opened to.
    pub fn forwards(&self) -> Vec<(String, u16)> {
        self.forwards.lock().clone()
    }

    /// Report every session as closed by the server.
    pub fn end_sessions(&self) {
        for events in self.sessions.lock().iter() {
            let _ = events.send(SessionEvent::Closed);
        }
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect(&self, bastion: &SshDescriptor) -> QuarryResult<SshLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(QuarryError::tunnel(format!(
                "Failed to connect to SSH bastion {}:{}",
                bastion.host, bastion.port
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.end_at_once {
            let _ = tx.send(SessionEvent::Closed);
        }
        self.sessions.lock().push(tx);
        let session = MockSession { closes: self.closes.clone(), forwards: self.forwards.clone() };
        Ok(SshLink { session: Arc::new(session), events: rx })
    }
}

struct MockSession {
    closes: Arc<AtomicUsize>,
    forwards: Arc<Mutex<Vec<(String, u16)>>>,
}

#[async_trait]
impl SshSession for MockSession {
    async fn open_forward(&self, host: &str, port: u16) -> QuarryResult<ForwardStream> {
        self.forwards.lock().push((host.to_string(), port));

        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(local))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Computes a result for `(target_name, sql)`.
type Responder = Arc<dyn Fn(&str, &str) -> QuarryResult<QueryResult> + Send + Sync>;

/// Factory whose pools answer from a scripted responder and record traffic.
pub struct MockBackendFactory {
    responder: Responder,
    created: Arc<Mutex<Vec<(String, ResolvedEndpoint)>>>,
    executed: Arc<Mutex<Vec<(String, String)>>>,
    closed: Arc<AtomicUsize>,
}

impl MockBackendFactory {
    /// Pools that return an empty result for every statement.
    pub fn new() -> Self {
        Self::with_responder(|_, _| Ok(QueryResult::default()))
    }

    pub fn with_responder(
        responder: impl Fn(&str, &str) -> QuarryResult<QueryResult> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            created: Arc::default(),
            executed: Arc::default(),
            closed: Arc::default(),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Endpoints pools were created against, in creation order.
    pub fn endpoints(&self) -> Vec<(String, ResolvedEndpoint)> {
        self.created.lock().clone()
    }

    /// Statements executed, as `(target_name, sql)`.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().clone()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl BackendFactory for MockBackendFactory {
    fn create(
        &self,
        target: &DatabaseTarget,
        endpoint: &ResolvedEndpoint,
        max_size: usize,
    ) -> QuarryResult<Arc<dyn Backend>> {
        self.created.lock().push((target.name.clone(), endpoint.clone()));
        Ok(Arc::new(MockBackend {
            target_name: target.name.clone(),
            driver: target.driver,
            max_size,
            via_tunnel: endpoint.via_tunnel(),
            responder: self.responder.clone(),
            executed: self.executed.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct MockBackend {
    target_name: String,
    driver: DriverKind,
    max_size: usize,
    via_tunnel: bool,
    responder: Responder,
    executed: Arc<Mutex<Vec<(String, String)>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Backend for MockBackend {
    fn driver(&self) -> DriverKind {
        self.driver
    }

    async fn execute(&self, sql: &str) -> QuarryResult<QueryResult> {
        self.executed.lock().push((self.target_name.clone(), sql.to_string()));
        (self.responder)(&self.target_name, sql)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus { max_size: self.max_size, size: 0, available: 0, waiting: 0, via_tunnel: self.via_tunnel }
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
