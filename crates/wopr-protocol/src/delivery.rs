//! Typed outcome of every initiator-side operation.

/// Result of a send path, doubling as a process exit classification.
///
/// The engine never throws across its boundary; every failure collapses into
/// one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered and acknowledged.
    Ok,
    /// Peer unreachable or timed out.
    Offline,
    /// Authorization refused, by the peer or locally before dialing.
    Rejected { reason: String },
    /// Malformed input, unknown peer, or missing key; failed before any
    /// transport was opened.
    Invalid { reason: String },
    /// Peer refused for a rate-limit violation.
    RateLimited,
    /// No common protocol version.
    VersionMismatch,
}

/// Reject reason the responder uses for rate-limit refusals.
pub(crate) const REASON_RATE_LIMITED: &str = "rate limited";

/// Reject reason the responder uses when version negotiation fails.
pub(crate) const REASON_VERSION_MISMATCH: &str = "no common protocol version";

impl Delivery {
    /// Numeric code, stable across the wire and usable as a process exit
    /// code.
    pub fn code(&self) -> i32 {
        match self {
            Delivery::Ok => 0,
            Delivery::Offline => 1,
            Delivery::Rejected { .. } => 2,
            Delivery::Invalid { .. } => 3,
            Delivery::RateLimited => 4,
            Delivery::VersionMismatch => 5,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Delivery::Ok)
    }

    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        Delivery::Rejected {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Delivery::Invalid {
            reason: reason.into(),
        }
    }

    /// Classify a peer's `reject` reason.
    pub(crate) fn from_reject(reason: &str) -> Self {
        match reason {
            REASON_RATE_LIMITED => Delivery::RateLimited,
            REASON_VERSION_MISMATCH => Delivery::VersionMismatch,
            other => Delivery::rejected(other),
        }
    }
}

impl std::fmt::Display for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Delivery::Ok => write!(f, "ok"),
            Delivery::Offline => write!(f, "offline"),
            Delivery::Rejected { reason } => write!(f, "rejected: {reason}"),
            Delivery::Invalid { reason } => write!(f, "invalid: {reason}"),
            Delivery::RateLimited => write!(f, "rate limited"),
            Delivery::VersionMismatch => write!(f, "version mismatch"),
        }
    }
}
