//! Tunnel lifecycle state machine.
//!
//! Every tunnel moves through `Connecting -> Active -> Closed`, or ends in
//! `Failed`. Transitions are driven only by [`TunnelEvent`] messages, so the
//! teardown decision lives in one place: [`TunnelState::on`].

/// Lifecycle state of one SSH tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    /// SSH handshake and listener bind in progress
    Connecting,
    /// Listener accepting connections on the local port
    Active {
        /// Local listening port
        local_port: u16,
    },
    /// Session ended or tunnel shut down
    Closed,
    /// Establishment or session failed
    Failed {
        /// Human-readable reason
        reason: String,
    },
}

/// Messages that drive [`TunnelState`] transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Session authenticated and listener bound
    Established {
        /// Local listening port
        local_port: u16,
    },
    /// Establishment failed before the tunnel became active
    EstablishFailed(String),
    /// SSH session reported an error
    SessionError(String),
    /// SSH session closed or reached end of stream
    SessionClosed,
    /// Explicit shutdown requested by the owner
    Shutdown,
}

impl TunnelState {
    /// Apply an event, returning the next state.
    ///
    /// Terminal states absorb every further event.
    pub fn on(self, event: TunnelEvent) -> TunnelState {
        match (self, event) {
            (Self::Connecting, TunnelEvent::Established { local_port }) => {
                Self::Active { local_port }
            }
            (Self::Connecting, TunnelEvent::EstablishFailed(reason))
            | (Self::Connecting, TunnelEvent::SessionError(reason)) => Self::Failed { reason },
            (Self::Connecting, TunnelEvent::SessionClosed) => {
                Self::Failed { reason: "SSH session closed during establishment".to_string() }
            }
            (Self::Connecting, TunnelEvent::Shutdown) => Self::Closed,

            (Self::Active { .. }, TunnelEvent::SessionError(reason)) => Self::Failed { reason },
            (Self::Active { .. }, TunnelEvent::SessionClosed)
            | (Self::Active { .. }, TunnelEvent::Shutdown) => Self::Closed,
            (active @ Self::Active { .. }, TunnelEvent::Established { .. })
            | (active @ Self::Active { .. }, TunnelEvent::EstablishFailed(_)) => active,

            (terminal @ (Self::Closed | Self::Failed { .. }), _) => terminal,
        }
    }

    /// Whether the tunnel can carry traffic.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active { .. } => "active",
            Self::Closed => "closed",
            Self::Failed { .. } => "failed",
        }
    }
}
