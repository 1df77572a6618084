//! Endpoint and dialog state machines.
//!
//! Both machines are plain values with pure transition functions so the
//! handler code only has to hold a lock around a single assignment.

use std::fmt;
use thiserror::Error;

/// Lifecycle of one endpoint handler. Ordered, and never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointState {
    /// Constructed, no executor bound yet
    NeedExecutor,
    /// Waiting for the transport to become ready
    Connecting,
    /// Exchanging protocol versions
    HandshakingStep1,
    /// Exchanging connection limits
    HandshakingStep2,
    /// Dialogs may flow
    Normal,
    /// No new dialogs; existing ones finish
    ShuttingDown,
    /// Tearing down dialogs and the transport
    Terminating,
    /// Fully closed
    Terminated,
}

/// Outcome of a compare-and-set style state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved to the requested value
    Applied,
    /// Endpoint is already shutting down or terminating; nothing to do
    Ignored,
    /// Current state was not the expected one
    Illegal,
}

impl EndpointState {
    /// Move from `expected` to `next`.
    ///
    /// A mismatch after shutdown has started is ignored; any other mismatch
    /// (or a backwards move) is illegal and must terminate the connection.
    pub fn transition(self, expected: EndpointState, next: EndpointState) -> Transition {
        if self == expected && next > self {
            Transition::Applied
        } else if self >= EndpointState::ShuttingDown {
            Transition::Ignored
        } else {
            Transition::Illegal
        }
    }

    /// Whether the handshake is still in progress
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            EndpointState::Connecting
                | EndpointState::HandshakingStep1
                | EndpointState::HandshakingStep2
        )
    }

    /// Whether new dialogs can still be started locally
    pub fn accepts_new_dialogs(self) -> bool {
        self <= EndpointState::Normal
    }

    /// Whether termination has begun
    pub fn is_terminating(self) -> bool {
        self >= EndpointState::Terminating
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::NeedExecutor => "NEED_EXECUTOR",
            EndpointState::Connecting => "CONNECTING",
            EndpointState::HandshakingStep1 => "HANDSHAKING_STEP1",
            EndpointState::HandshakingStep2 => "HANDSHAKING_STEP2",
            EndpointState::Normal => "NORMAL",
            EndpointState::ShuttingDown => "SHUTTING_DOWN",
            EndpointState::Terminating => "TERMINATING",
            EndpointState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Progress of one direction of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More messages may follow
    Open,
    /// Final message accepted, not yet delivered or flushed
    Fin0,
    /// Direction complete
    Fin,
}

/// Lifecycle of one dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Dialog in progress
    Active {
        /// Whether a dialog ID has been assigned
        started: bool,
        /// Inbound direction
        read: Progress,
        /// Outbound direction
        write: Progress,
    },
    /// Both directions complete
    Fin,
    /// Aborted locally, remotely, or by the connection
    Aborted,
}

/// Illegal dialog transition
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogStateError {
    /// Write side already finished
    #[error("write after fin")]
    WriteAfterFin,
    /// Read side already finished
    #[error("read after fin")]
    ReadAfterFin,
    /// Dialog already reached a terminal state
    #[error("dialog already closed")]
    Closed,
}

impl DialogState {
    /// Fresh dialog; remotely started dialogs arrive with their ID
    pub fn new(started: bool) -> Self {
        DialogState::Active {
            started,
            read: Progress::Open,
            write: Progress::Open,
        }
    }

    /// Record that a dialog ID was assigned
    pub fn started(self) -> Self {
        match self {
            DialogState::Active { read, write, .. } => DialogState::Active {
                started: true,
                read,
                write,
            },
            other => other,
        }
    }

    /// Application handed over its final outbound message
    pub fn write_last(self) -> Result<Self, DialogStateError> {
        match self {
            DialogState::Active {
                started,
                read,
                write: Progress::Open,
            } => Ok(DialogState::Active {
                started,
                read,
                write: Progress::Fin0,
            }),
            DialogState::Active { .. } => Err(DialogStateError::WriteAfterFin),
            _ => Err(DialogStateError::Closed),
        }
    }

    /// The final outbound frame reached the output buffer
    pub fn write_flushed(self) -> Self {
        match self {
            DialogState::Active {
                started,
                read,
                write: Progress::Fin0,
            } => Self::collapse(started, read, Progress::Fin),
            other => other,
        }
    }

    /// Peer sent its final frame
    pub fn read_last(self) -> Result<Self, DialogStateError> {
        match self {
            DialogState::Active {
                started,
                read: Progress::Open,
                write,
            } => Ok(DialogState::Active {
                started,
                read: Progress::Fin0,
                write,
            }),
            DialogState::Active { .. } => Err(DialogStateError::ReadAfterFin),
            _ => Err(DialogStateError::Closed),
        }
    }

    /// Application consumed the final inbound message
    pub fn read_delivered(self) -> Self {
        match self {
            DialogState::Active {
                started,
                read: Progress::Fin0,
                write,
            } => Self::collapse(started, Progress::Fin, write),
            other => other,
        }
    }

    /// Abort unless already terminal
    pub fn abort(self) -> Result<Self, DialogStateError> {
        match self {
            DialogState::Active { .. } => Ok(DialogState::Aborted),
            _ => Err(DialogStateError::Closed),
        }
    }

    fn collapse(started: bool, read: Progress, write: Progress) -> Self {
        if read == Progress::Fin && write == Progress::Fin {
            DialogState::Fin
        } else {
            DialogState::Active {
                started,
                read,
                write,
            }
        }
    }

    /// Outbound progress, `None` once terminal
    pub fn write_progress(self) -> Option<Progress> {
        match self {
            DialogState::Active { write, .. } => Some(write),
            _ => None,
        }
    }

    /// Inbound progress, `None` once terminal
    pub fn read_progress(self) -> Option<Progress> {
        match self {
            DialogState::Active { read, .. } => Some(read),
            _ => None,
        }
    }

    /// Whether the dialog finished or aborted
    pub fn is_terminal(self) -> bool {
        !matches!(self, DialogState::Active { .. })
    }

    /// Whether the dialog aborted
    pub fn is_aborted(self) -> bool {
        self == DialogState::Aborted
    }

    /// Whether nothing more crosses the wire in either direction: the peer's
    /// final frame arrived and ours is staged, delivered or not
    pub fn exchange_complete(self) -> bool {
        match self {
            DialogState::Fin => true,
            DialogState::Active { read, write, .. } => {
                read != Progress::Open && write == Progress::Fin
            }
            DialogState::Aborted => false,
        }
    }
}

impl fmt::Display for DialogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogState::Active {
                started,
                read,
                write,
            } => {
                let base = if *started { "STARTED" } else { "INITED_NEED_START" };
                f.write_str(base)?;
                match read {
                    Progress::Open => {}
                    Progress::Fin0 => f.write_str("_READ_FIN0")?,
                    Progress::Fin => f.write_str("_READ_FIN")?,
                }
                match write {
                    Progress::Open => Ok(()),
                    Progress::Fin0 => f.write_str("_WRITE_FIN0"),
                    Progress::Fin => f.write_str("_WRITE_FIN"),
                }
            }
            DialogState::Fin => f.write_str("FIN"),
            DialogState::Aborted => f.write_str("ABORTED"),
        }
    }
}
