//! Heartbeats with optional RTT measurement.
//!
//! Protocol version 2 peers exchange PING/PING_ACK carrying a cookie taken
//! from a process-wide monotonic clock; older peers only understand
//! NO_OPERATION.

use mux_wire::{ProtocolMessage, PING_PROTOCOL_VERSION};
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

static START: Lazy<Instant> = Lazy::new(Instant::now);

/// Cookie encoding the current monotonic time in nanoseconds
pub fn now_cookie() -> u64 {
    (START.elapsed().as_nanos() & 0x7FFF_FFFF_FFFF_FFFF) as u64
}

/// RTT for a cookie echoed back by the peer
pub fn rtt_from_cookie(cookie: u64) -> Option<Duration> {
    let now_ns = (START.elapsed().as_nanos() & 0x7FFF_FFFF_FFFF_FFFF) as u64;
    // Cookies from the future are bogus
    now_ns.checked_sub(cookie).map(Duration::from_nanos)
}

/// Heartbeat message for the negotiated protocol version
pub fn heartbeat(version: u64) -> ProtocolMessage {
    if version >= PING_PROTOCOL_VERSION {
        ProtocolMessage::Ping {
            cookie: now_cookie(),
        }
    } else {
        ProtocolMessage::NoOperation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_calculation() {
        let cookie = now_cookie();
        std::thread::sleep(Duration::from_millis(5));

        let rtt = rtt_from_cookie(cookie).unwrap();
        assert!(rtt >= Duration::from_millis(5));
        assert!(rtt < Duration::from_secs(5));
    }

    #[test]
    fn test_future_cookie_is_rejected() {
        let cookie = now_cookie() + Duration::from_secs(3600).as_nanos() as u64;
        assert!(rtt_from_cookie(cookie).is_none());
    }

    #[test]
    fn test_heartbeat_by_version() {
        assert_eq!(heartbeat(1), ProtocolMessage::NoOperation);
        assert!(matches!(heartbeat(2), ProtocolMessage::Ping { .. }));
        assert!(matches!(heartbeat(7), ProtocolMessage::Ping { .. }));
    }
}
