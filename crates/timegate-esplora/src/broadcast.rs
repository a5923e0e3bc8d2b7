//! Interpreting explorer responses to a transaction broadcast

use bitcoin::Txid;
use std::fmt;
use std::str::FromStr;

/// What the network made of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Accepted(Txid),
    /// Rejected because its locktime has not been reached yet
    PrematureLocktime { detail: String },
    OtherRejection(String),
}

impl BroadcastOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BroadcastOutcome::Accepted(_))
    }
}

impl fmt::Display for BroadcastOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastOutcome::Accepted(txid) => write!(f, "accepted: {}", txid),
            BroadcastOutcome::PrematureLocktime { detail } => {
                write!(f, "locktime not yet reached: {}", detail)
            }
            BroadcastOutcome::OtherRejection(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// Classify the response body of a broadcast.
///
/// Esplora answers a successful `POST /tx` with the bare txid and a failure
/// with the node's RPC error text.
pub fn classify(body: &str) -> BroadcastOutcome {
    let body = body.trim();

    if body.contains("non-final") || body.contains("non-BIP68-final") {
        return BroadcastOutcome::PrematureLocktime {
            detail: body.to_string(),
        };
    }

    if body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(txid) = Txid::from_str(body) {
            return BroadcastOutcome::Accepted(txid);
        }
    }

    BroadcastOutcome::OtherRejection(body.to_string())
}
