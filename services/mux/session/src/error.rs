//! Connection and dialog error types.

use crate::state::EndpointState;
use mux_wire::{ConnectionAbortCause, DialogAbortCause, WireError};
use thiserror::Error;

fn origin(from_remote: &bool) -> &'static str {
    if *from_remote {
        " (remote)"
    } else {
        ""
    }
}

/// Why a connection ended
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Transport failure
    #[error("I/O error in {phase}: {detail}")]
    Io {
        /// Endpoint state when the failure surfaced
        phase: EndpointState,
        /// Underlying error text
        detail: String,
    },

    /// Malformed, out-of-phase, or limit-violating traffic
    #[error("protocol violation{}: {detail}", origin(.from_remote))]
    ProtocolViolation {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },

    /// Versions or security settings do not match
    #[error("incompatible peer{}: {detail}", origin(.from_remote))]
    Incompatible {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },

    /// No dialog for a full idle interval
    #[error("connection idle{}: {detail}", origin(.from_remote))]
    Idle {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },

    /// Heartbeat or connect timeout
    #[error("connection timed out{}: {detail}", origin(.from_remote))]
    Timeout {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },

    /// Orderly or forced endpoint shutdown
    #[error("endpoint shutdown{}: {detail}", origin(.from_remote))]
    EndpointShutdown {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },

    /// Anything else
    #[error("connection failed{}: {detail}", origin(.from_remote))]
    Unknown {
        /// Reported by the peer through CONNECTION_ABORT
        from_remote: bool,
        /// Description
        detail: String,
    },
}

impl ConnectionError {
    /// Transport error observed in `phase`
    pub fn io(phase: EndpointState, err: &std::io::Error) -> Self {
        ConnectionError::Io {
            phase,
            detail: err.to_string(),
        }
    }

    /// Locally detected protocol violation
    pub fn violation(detail: impl Into<String>) -> Self {
        ConnectionError::ProtocolViolation {
            from_remote: false,
            detail: detail.into(),
        }
    }

    /// Locally detected incompatibility
    pub fn incompatible(detail: impl Into<String>) -> Self {
        ConnectionError::Incompatible {
            from_remote: false,
            detail: detail.into(),
        }
    }

    /// Local shutdown
    pub fn shutdown(detail: impl Into<String>) -> Self {
        ConnectionError::EndpointShutdown {
            from_remote: false,
            detail: detail.into(),
        }
    }

    /// Error reported by the peer in a CONNECTION_ABORT
    pub fn from_remote_abort(cause: ConnectionAbortCause, detail: String) -> Self {
        let from_remote = true;
        match cause {
            ConnectionAbortCause::UnknownReason => ConnectionError::Unknown { from_remote, detail },
            ConnectionAbortCause::EndpointShutdown => {
                ConnectionError::EndpointShutdown { from_remote, detail }
            }
            ConnectionAbortCause::Timeout => ConnectionError::Timeout { from_remote, detail },
            ConnectionAbortCause::IdleTimeout => ConnectionError::Idle { from_remote, detail },
            ConnectionAbortCause::Incompatible => {
                ConnectionError::Incompatible { from_remote, detail }
            }
            ConnectionAbortCause::ProtocolViolation => {
                ConnectionError::ProtocolViolation { from_remote, detail }
            }
        }
    }

    /// Map a decode failure; handshake-time surprises count as incompatibility
    pub fn from_wire(state: EndpointState, err: WireError) -> Self {
        let detail = err.to_string();
        match err {
            WireError::Incompatible(_) => ConnectionError::incompatible(detail),
            WireError::UnexpectedMessage(_) | WireError::UnknownIdentifier(_)
                if state < EndpointState::Normal =>
            {
                ConnectionError::incompatible(detail)
            }
            _ => ConnectionError::violation(detail),
        }
    }

    /// Whether the peer reported this error
    pub fn is_from_remote(&self) -> bool {
        match self {
            ConnectionError::Io { .. } => false,
            ConnectionError::ProtocolViolation { from_remote, .. }
            | ConnectionError::Incompatible { from_remote, .. }
            | ConnectionError::Idle { from_remote, .. }
            | ConnectionError::Timeout { from_remote, .. }
            | ConnectionError::EndpointShutdown { from_remote, .. }
            | ConnectionError::Unknown { from_remote, .. } => *from_remote,
        }
    }

    /// Human readable detail
    pub fn detail(&self) -> &str {
        match self {
            ConnectionError::Io { detail, .. }
            | ConnectionError::ProtocolViolation { detail, .. }
            | ConnectionError::Incompatible { detail, .. }
            | ConnectionError::Idle { detail, .. }
            | ConnectionError::Timeout { detail, .. }
            | ConnectionError::EndpointShutdown { detail, .. }
            | ConnectionError::Unknown { detail, .. } => detail,
        }
    }

    /// Cause written in the CONNECTION_ABORT for this error
    pub fn abort_cause(&self) -> ConnectionAbortCause {
        match self {
            ConnectionError::Io { .. } | ConnectionError::Unknown { .. } => {
                ConnectionAbortCause::UnknownReason
            }
            ConnectionError::ProtocolViolation { .. } => ConnectionAbortCause::ProtocolViolation,
            ConnectionError::Incompatible { .. } => ConnectionAbortCause::Incompatible,
            ConnectionError::Idle { .. } => ConnectionAbortCause::IdleTimeout,
            ConnectionError::Timeout { .. } => ConnectionAbortCause::Timeout,
            ConnectionError::EndpointShutdown { .. } => ConnectionAbortCause::EndpointShutdown,
        }
    }

    /// Whether this is an orderly end rather than a failure
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ConnectionError::EndpointShutdown { .. } | ConnectionError::Idle { .. }
        )
    }
}

/// Classification of a dialog abort
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialogErrorKind {
    /// Cancelled by either application
    #[error("dialog cancelled")]
    Cancelled,
    /// Dialog timeout elapsed
    #[error("dialog timed out")]
    TimedOut,
    /// Peer has no handler for the dialog type
    #[error("unknown dialog type")]
    UnknownType,
    /// Handler failure or unclassified remote abort
    #[error("dialog failed")]
    Unknown,
    /// The connection ended underneath the dialog
    #[error("connection lost: {0}")]
    Connection(ConnectionError),
}

/// Reason handed to `DialogHandler::on_abort`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}{}: {detail}", origin(.from_remote))]
pub struct DialogException {
    /// Classification
    pub kind: DialogErrorKind,
    /// Description
    pub detail: String,
    /// Whether the peer initiated the abort
    pub from_remote: bool,
    /// Whether the peer may already have acted on this dialog
    pub has_side_effect: bool,
}

/// Failure to start a dialog
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartDialogError {
    /// Endpoint no longer accepts new dialogs
    #[error("endpoint is shutting down")]
    ShuttingDown,
    /// Endpoint already terminated
    #[error("endpoint terminated: {0}")]
    Terminated(ConnectionError),
    /// Timeout must be positive
    #[error("dialog timeout must be positive")]
    InvalidTimeout,
}

/// Failure of `DialogContext::write`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Final message was already written
    #[error("write after fin")]
    WriteAfterFin,
    /// Message exceeds the negotiated maximum total length
    #[error("message of {len} bytes exceeds maximum of {max}")]
    MessageTooLarge {
        /// Message length
        len: usize,
        /// Negotiated maximum
        max: u32,
    },
}

impl DialogException {
    pub(crate) fn from_remote(cause: DialogAbortCause, detail: String, has_side_effect: bool) -> Self {
        let kind = match cause {
            DialogAbortCause::TimedOut => DialogErrorKind::TimedOut,
            DialogAbortCause::UnknownType => DialogErrorKind::UnknownType,
            DialogAbortCause::EndpointShuttingDown => {
                DialogErrorKind::Connection(ConnectionError::EndpointShutdown {
                    from_remote: true,
                    detail: detail.clone(),
                })
            }
            DialogAbortCause::ConnectionAbort => {
                DialogErrorKind::Connection(ConnectionError::Unknown {
                    from_remote: true,
                    detail: detail.clone(),
                })
            }
            DialogAbortCause::UnknownReason => DialogErrorKind::Unknown,
        };
        DialogException {
            kind,
            detail,
            from_remote: true,
            has_side_effect,
        }
    }
}
