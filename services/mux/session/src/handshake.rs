//! Handshake negotiation.
//!
//! The creator sends PROTOCOL_VERSION, the responder answers with the
//! highest version both support. The creator then sends CONNECTION_CONFIG
//! with its limits and the responder answers with its own. Each side keeps
//! the smaller of the two dialog and length limits for traffic it sends and
//! the larger heartbeat interval.

use crate::state::EndpointState;
use mux_wire::{ConnectionLimits, MessageKind, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use std::time::Duration;

/// Limits in force after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedLimits {
    /// Agreed protocol version
    pub protocol_version: u64,
    /// Dialogs this side may start concurrently
    pub outbound_max_dialogs: u32,
    /// Largest frame payload this side may send
    pub outbound_max_length: u32,
    /// Largest message this side may send
    pub outbound_max_total_length: u32,
    /// Agreed heartbeat interval
    pub heartbeat_interval: Duration,
}

/// Version a responder answers with
pub fn negotiate_version(remote: u64) -> Result<u64, String> {
    if remote < MIN_PROTOCOL_VERSION {
        return Err(format!(
            "peer protocol version {} is older than minimum {}",
            remote, MIN_PROTOCOL_VERSION
        ));
    }
    Ok(remote.min(PROTOCOL_VERSION))
}

/// Validate the version a responder picked
pub fn check_version_response(version: u64) -> Result<u64, String> {
    if (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        Ok(version)
    } else {
        Err(format!(
            "peer answered protocol version {}, supported range is {}..={}",
            version, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION
        ))
    }
}

/// Combine local and remote limits
pub fn negotiate_limits(
    version: u64,
    local: &ConnectionLimits,
    remote: &ConnectionLimits,
) -> Result<NegotiatedLimits, String> {
    if remote.max_length == 0 || remote.max_total_length == 0 {
        return Err("peer advertised a zero message length".to_string());
    }
    if remote.heartbeat_interval == 0 {
        return Err("peer advertised a zero heartbeat interval".to_string());
    }
    Ok(NegotiatedLimits {
        protocol_version: version,
        outbound_max_dialogs: local.max_dialogs.min(remote.max_dialogs),
        outbound_max_length: local.max_length.min(remote.max_length),
        outbound_max_total_length: local.max_total_length.min(remote.max_total_length),
        heartbeat_interval: Duration::from_millis(u64::from(
            local.heartbeat_interval.max(remote.heartbeat_interval),
        )),
    })
}

/// Whether a message of `kind` may arrive in `state`
pub fn accepts(state: EndpointState, is_creator: bool, kind: MessageKind) -> bool {
    if kind == MessageKind::ConnectionAbort {
        return state > EndpointState::NeedExecutor && state < EndpointState::Terminating;
    }
    match state {
        EndpointState::Connecting | EndpointState::HandshakingStep1 => {
            if is_creator {
                kind == MessageKind::ProtocolVersionResponse
            } else {
                kind == MessageKind::ProtocolVersion
            }
        }
        EndpointState::HandshakingStep2 => {
            if is_creator {
                kind == MessageKind::ConnectionConfigResponse
            } else {
                kind == MessageKind::ConnectionConfig
            }
        }
        EndpointState::Normal | EndpointState::ShuttingDown => !kind.is_handshake(),
        _ => false,
    }
}
