//! SSH-forwarded local listeners, one per target.
//!
//! A tunnel is a `127.0.0.1` listener on an ephemeral port. Every accepted
//! connection becomes a new direct-tcpip channel through one shared SSH
//! session, so all pooled connections of a target multiplex over a single
//! session.
//!
//! Establishment is single-flight per target: concurrent callers share one
//! spawned attempt and observe the same outcome. Once active, the listener
//! and session are owned by the tunnel task; nothing else closes them. When
//! the session ends the task removes the record and runs the teardown hooks
//! so dependent pools are discarded.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{DatabaseTarget, SshDescriptor, TunnelEndpoint, TunnelEvent, TunnelState};
use crate::services::ssh::{SessionEvent, SshConnector, SshLink, SshSession};

/// Callback invoked with the target name after a tunnel is torn down.
pub type TeardownHook = Arc<dyn Fn(&str) + Send + Sync>;

type SharedOutcome = Shared<BoxFuture<'static, Result<TunnelEndpoint, TunnelFailure>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Config,
    Tunnel,
    Shutdown,
}

/// Cloneable form of an establishment failure, shared by all waiters.
#[derive(Debug, Clone)]
struct TunnelFailure {
    kind: FailureKind,
    message: String,
}

impl TunnelFailure {
    fn from_error(err: &QuarryError) -> Self {
        let message = match err {
            QuarryError::Config { message, .. }
            | QuarryError::Tunnel { message, .. }
            | QuarryError::Shutdown { message } => message.clone(),
            other => other.to_string(),
        };
        let kind = if err.is_config() {
            FailureKind::Config
        } else if err.is_shutdown() {
            FailureKind::Shutdown
        } else {
            FailureKind::Tunnel
        };
        Self { kind, message }
    }

    fn shut_down(target_name: &str) -> Self {
        Self {
            kind: FailureKind::Shutdown,
            message: format!("Tunnel for '{target_name}' was shut down while connecting"),
        }
    }

    fn into_error(self) -> QuarryError {
        match self.kind {
            FailureKind::Config => QuarryError::config(self.message),
            FailureKind::Tunnel => QuarryError::tunnel(self.message),
            FailureKind::Shutdown => QuarryError::shutdown(self.message),
        }
    }
}

/// An active tunnel: the local port and the task owning listener and session.
struct TunnelRecord {
    local_port: u16,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelRecord {
    fn endpoint(&self) -> TunnelEndpoint {
        TunnelEndpoint { local_port: self.local_port, generation: self.generation }
    }
}

/// A connected session and bound listener, not yet serving.
struct OpenedTunnel {
    session: Arc<dyn SshSession>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    listener: TcpListener,
    local_port: u16,
}

enum TunnelSlot {
    Connecting { generation: u64, outcome: SharedOutcome, attempt: AbortHandle },
    Active(TunnelRecord),
}

struct TunnelInner {
    connector: Arc<dyn SshConnector>,
    slots: Mutex<HashMap<String, TunnelSlot>>,
    next_generation: AtomicU64,
    hooks: Mutex<Vec<TeardownHook>>,
}

/// Lazily establishes and tears down SSH tunnels per target.
pub struct TunnelManager {
    inner: Arc<TunnelInner>,
}

impl TunnelManager {
    /// Create a manager that opens sessions through `connector`.
    pub fn new(connector: Arc<dyn SshConnector>) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                connector,
                slots: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a callback run after any tunnel of any target is torn down.
    pub fn on_teardown(&self, hook: TeardownHook) {
        self.inner.hooks.lock().push(hook);
    }

    /// Get or create the tunnel for `target`, returning its local endpoint.
    ///
    /// Concurrent calls for the same target share a single attempt: one SSH
    /// session and one listener are created, and every caller sees the same
    /// success or failure.
    pub async fn establish_tunnel(&self, target: &DatabaseTarget) -> QuarryResult<TunnelEndpoint> {
        let bastion = target.ssh.clone().ok_or_else(|| {
            QuarryError::config(format!("Target '{}' has no SSH bastion configured", target.name))
        })?;

        let outcome = {
            let mut slots = self.inner.slots.lock();
            match slots.get(&target.name) {
                Some(TunnelSlot::Active(record)) => return Ok(record.endpoint()),
                Some(TunnelSlot::Connecting { outcome, .. }) => outcome.clone(),
                None => {
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let (outcome, attempt) = self.spawn_establish(target, bastion, generation);
                    slots.insert(
                        target.name.clone(),
                        TunnelSlot::Connecting { generation, outcome: outcome.clone(), attempt },
                    );
                    outcome
                }
            }
        };

        outcome.await.map_err(TunnelFailure::into_error)
    }

    /// Whether the tunnel a pool was built on is still the active one.
    pub fn is_live(&self, target_name: &str, generation: u64) -> bool {
        matches!(
            self.inner.slots.lock().get(target_name),
            Some(TunnelSlot::Active(record)) if record.generation == generation
        )
    }

    /// Lifecycle state of the target's current tunnel, if one exists.
    pub fn state(&self, target_name: &str) -> Option<TunnelState> {
        self.inner.slots.lock().get(target_name).map(|slot| match slot {
            TunnelSlot::Connecting { .. } => TunnelState::Connecting,
            TunnelSlot::Active(record) => TunnelState::Active { local_port: record.local_port },
        })
    }

    /// Number of tunnels that are connecting or active.
    pub fn tunnel_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Tear down every tunnel, closing each listener and session once.
    ///
    /// Attempts still connecting are aborted and their waiters get a
    /// [`QuarryError::Shutdown`]. Safe to call repeatedly.
    pub async fn close_all(&self) {
        let drained: Vec<(String, TunnelSlot)> = self.inner.slots.lock().drain().collect();

        for (name, slot) in drained {
            match slot {
                TunnelSlot::Connecting { attempt, .. } => {
                    attempt.abort();
                    tracing::debug!(target_name = %name, "Aborted tunnel still connecting");
                }
                TunnelSlot::Active(record) => {
                    record.cancel.cancel();
                    if let Err(e) = record.task.await {
                        tracing::warn!(target_name = %name, error = %e, "Tunnel task ended abnormally");
                    }
                }
            }
        }
    }

    fn spawn_establish(
        &self,
        target: &DatabaseTarget,
        bastion: SshDescriptor,
        generation: u64,
    ) -> (SharedOutcome, AbortHandle) {
        let inner = self.inner.clone();
        let target = target.clone();
        let name = target.name.clone();

        let task = tokio::spawn(async move { inner.establish(target, bastion, generation).await });
        let attempt = task.abort_handle();

        let outcome = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(TunnelFailure::shut_down(&name)),
                Err(e) => Err(TunnelFailure {
                    kind: FailureKind::Tunnel,
                    message: format!("Tunnel establishment for '{name}' aborted: {e}"),
                }),
            }
        }
        .boxed()
        .shared();

        (outcome, attempt)
    }
}

impl TunnelInner {
    /// Run one establishment attempt and publish its result in the slot map.
    async fn establish(
        self: Arc<Self>,
        target: DatabaseTarget,
        bastion: SshDescriptor,
        generation: u64,
    ) -> Result<TunnelEndpoint, TunnelFailure> {
        tracing::info!(
            target_name = %target.name,
            bastion = %bastion.host,
            "Establishing SSH tunnel"
        );

        match self.open(&bastion).await {
            Ok(opened) => self.publish(&target, generation, opened),
            Err(err) => {
                self.abandon(&target.name, generation);
                let state = TunnelState::Connecting.on(TunnelEvent::EstablishFailed(err.to_string()));
                tracing::warn!(
                    target_name = %target.name,
                    state = state.label(),
                    error = %err,
                    "SSH tunnel establishment failed"
                );
                Err(TunnelFailure::from_error(&err))
            }
        }
    }

    /// Connect the session and bind the local listener.
    async fn open(&self, bastion: &SshDescriptor) -> QuarryResult<OpenedTunnel> {
        let SshLink { session, events } = self.connector.connect(bastion).await?;

        let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close().await;
                return Err(QuarryError::tunnel_with_source(
                    "Failed to bind local port for SSH tunnel",
                    e,
                ));
            }
        };
        let local_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                session.close().await;
                return Err(QuarryError::tunnel_with_source("Failed to read tunnel address", e));
            }
        };

        Ok(OpenedTunnel { session, events, listener, local_port })
    }

    /// Mark the slot Active and start the accept loop, both under the slot lock.
    ///
    /// The loop can only report the tunnel down after the record exists, so
    /// a session that ends immediately still runs the teardown hooks.
    fn publish(
        self: &Arc<Self>,
        target: &DatabaseTarget,
        generation: u64,
        opened: OpenedTunnel,
    ) -> Result<TunnelEndpoint, TunnelFailure> {
        let OpenedTunnel { session, events, listener, local_port } = opened;

        let mut slots = self.slots.lock();
        if !is_connecting(&slots, &target.name, generation) {
            drop(slots);
            drop(listener);
            tokio::spawn(async move { session.close().await });
            return Err(TunnelFailure::shut_down(&target.name));
        }

        let cancel = CancellationToken::new();
        let forward = ForwardTarget {
            name: target.name.clone(),
            host: target.host.clone(),
            port: target.port,
            generation,
        };
        let task = tokio::spawn(run_tunnel(
            self.clone(),
            forward,
            listener,
            local_port,
            session,
            events,
            cancel.clone(),
        ));

        let record = TunnelRecord { local_port, generation, cancel, task };
        let endpoint = record.endpoint();
        slots.insert(target.name.clone(), TunnelSlot::Active(record));

        tracing::info!(target_name = %target.name, local_port, "SSH tunnel active");
        Ok(endpoint)
    }

    /// Clear a failed attempt's slot unless it was already replaced.
    fn abandon(&self, target_name: &str, generation: u64) {
        let mut slots = self.slots.lock();
        if is_connecting(&slots, target_name, generation) {
            slots.remove(target_name);
        }
    }

    /// Drop the record if it still belongs to `generation`, then notify hooks.
    fn on_tunnel_down(&self, target_name: &str, generation: u64) {
        let removed = {
            let mut slots = self.slots.lock();
            let current = matches!(
                slots.get(target_name),
                Some(TunnelSlot::Active(record)) if record.generation == generation
            );
            if current {
                slots.remove(target_name);
            }
            current
        };

        if removed {
            let hooks: Vec<TeardownHook> = self.hooks.lock().clone();
            for hook in hooks {
                hook(target_name);
            }
        }
    }
}

fn is_connecting(slots: &HashMap<String, TunnelSlot>, target_name: &str, generation: u64) -> bool {
    matches!(
        slots.get(target_name),
        Some(TunnelSlot::Connecting { generation: g, .. }) if *g == generation
    )
}

/// Where a tunnel forwards to, as seen from the bastion.
struct ForwardTarget {
    name: String,
    host: String,
    port: u16,
    generation: u64,
}

/// Accept loop owning the listener and the session until teardown.
async fn run_tunnel(
    inner: Arc<TunnelInner>,
    forward: ForwardTarget,
    listener: TcpListener,
    local_port: u16,
    session: Arc<dyn SshSession>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    let mut state = TunnelState::Connecting.on(TunnelEvent::Established { local_port });

    while state.is_active() {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(target_name = %forward.name, %peer, "New tunnel connection");
                    tokio::spawn(forward_connection(
                        stream,
                        session.clone(),
                        forward.host.clone(),
                        forward.port,
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!(target_name = %forward.name, error = %e, "Failed to accept tunnel connection");
                }
            },
            event = events.recv() => {
                let event = match event {
                    Some(SessionEvent::Error(reason)) => TunnelEvent::SessionError(reason),
                    Some(SessionEvent::Closed) | None => TunnelEvent::SessionClosed,
                };
                state = state.on(event);
            }
            _ = cancel.cancelled() => {
                state = state.on(TunnelEvent::Shutdown);
            }
        }
    }

    drop(listener);
    cancel.cancel();
    session.close().await;

    match &state {
        TunnelState::Failed { reason } => tracing::warn!(
            target_name = %forward.name,
            local_port,
            reason = %reason,
            "SSH tunnel failed"
        ),
        _ => tracing::info!(target_name = %forward.name, local_port, "SSH tunnel closed"),
    }

    inner.on_tunnel_down(&forward.name, forward.generation);
}

/// Pipe one local connection through a fresh forwarded channel.
async fn forward_connection(
    mut local: TcpStream,
    session: Arc<dyn SshSession>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let mut channel = match session.open_forward(&remote_host, remote_port).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(error = %e, "Tunnel forwarding error");
            return;
        }
    };

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local, &mut channel) => {
            match copied {
                Ok((up, down)) => tracing::trace!(up, down, "Tunnel connection finished"),
                Err(e) => tracing::debug!(error = %e, "Tunnel connection ended with error"),
            }
        }
        _ = cancel.cancelled() => {}
    }
}
