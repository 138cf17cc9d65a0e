//! Error taxonomy shared by every pipeline stage

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Trellis error types
///
/// Per-packet conditions (malformed frames, unknown protocols, session
/// rejections) are expected on a lossy or hostile network and are dropped by
/// the caller. `OutOfBounds` and `NotPlumbed` are contract violations.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame too short or carrying a bad length field
    #[error("malformed frame: needed {needed} bytes, got {got}")]
    MalformedFrame { needed: usize, got: usize },

    /// Protocol tag not accepted by the receiving stage
    #[error("invalid protocol tag: {0:#06x}")]
    InvalidProtocol(u16),

    /// A buffer operation would move the window outside the backing region
    #[error("buffer window out of bounds: {op} by {amount} (start {start}, len {len}, capacity {capacity})")]
    OutOfBounds {
        op: &'static str,
        amount: usize,
        start: usize,
        len: usize,
        capacity: usize,
    },

    /// A stage forwarded through a port that has no peer
    #[error("port not plumbed: {0}")]
    NotPlumbed(String),

    /// Data arrived for a session that is not established
    #[error("session not established")]
    NotEstablished,

    /// Nonce already seen or older than the replay window
    #[error("replayed nonce {0}")]
    Replay(u64),

    /// Cryptographic rejection during handshake or decryption
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    /// No route to the destination address
    #[error("no route to {0}")]
    NoRoute(std::net::Ipv6Addr),

    /// Link bring-up did not converge before its deadline
    #[error("link did not converge within {deadline_ms} ms")]
    ConvergenceTimeout { deadline_ms: u64 },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl Error {
    /// Whether this error signals a broken invariant rather than bad input.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::OutOfBounds { .. } | Error::NotPlumbed(_))
    }

    /// Whether the packet that produced this error should simply be dropped.
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame { .. }
                | Error::InvalidProtocol(_)
                | Error::NotEstablished
                | Error::Replay(_)
                | Error::HandshakeFailure(_)
                | Error::NoRoute(_)
                | Error::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let oob = Error::OutOfBounds {
            op: "shift",
            amount: 4,
            start: 0,
            len: 0,
            capacity: 0,
        };
        assert!(oob.is_contract_violation());
        assert!(!oob.is_drop());

        assert!(Error::Replay(7).is_drop());
        assert!(!Error::Replay(7).is_contract_violation());
        assert!(!Error::ConvergenceTimeout { deadline_ms: 5000 }.is_drop());
    }
}
