//! The payment rail abstraction.
//!
//! A rail turns a [`PaymentTicket`] into a [`SettlementProof`]. Rails never
//! touch checkout state; the orchestrator forwards the proof through the
//! event channel so that rail-driven and callback-driven completions share
//! one deduplication path.

use alloy_primitives::{Address, TxHash};

use crate::BoxFuture;
use crate::attempt::{PaymentMethod, PaymentTicket};
use crate::error::ErrorKind;
use crate::proof::SettlementProof;

/// Errors reported by a payment rail.
#[derive(Debug, thiserror::Error)]
pub enum RailError {
    /// The payer cannot cover the charge.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Required amount in token units.
        required: String,
        /// Available amount in token units.
        available: String,
    },
    /// The user declined to sign or closed the widget.
    #[error("rejected by user: {0}")]
    UserRejected(String),
    /// The aggregator payment failed or expired before completing.
    #[error("payment {payment_id} ended as {status}")]
    PaymentAbandoned {
        /// Aggregator payment id.
        payment_id: String,
        /// Terminal status reported by the aggregator.
        status: String,
    },
    /// The signature was not 65 bytes of hex or could not be recovered.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    /// The signature recovers to a different address than expected.
    #[error("signature signed by {recovered}, expected {expected}")]
    SignerMismatch {
        /// Expected signer.
        expected: Address,
        /// Recovered signer.
        recovered: Address,
    },
    /// The charge cannot be settled on this rail.
    #[error("{method} cannot settle a charge of {amount}")]
    UnsupportedCharge {
        /// Rail that refused the charge.
        method: PaymentMethod,
        /// Charge amount.
        amount: String,
    },
    /// The transaction was broadcast but its outcome was not observed.
    ///
    /// Funds may already have moved, so the attempt must not be paid again
    /// until the transaction is confirmed or known to have failed.
    #[error("transaction {tx_hash} submitted but not confirmed: {reason}")]
    Unconfirmed {
        /// Hash of the submitted transaction.
        tx_hash: TxHash,
        /// Why confirmation was not observed.
        reason: String,
    },
    /// Some reward tokens were claimed before a later claim failed.
    #[error("reward claims stopped after {} of them confirmed: {reason}", .claimed.len())]
    RewardsIncomplete {
        /// Claims that confirmed on-chain, as `(token, transaction)`.
        claimed: Vec<(Address, TxHash)>,
        /// The failure that stopped the run.
        reason: String,
    },
    /// RPC, HTTP or other provider failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl RailError {
    /// Classification used by the orchestrator.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientBalance { .. }
            | Self::MalformedSignature(_)
            | Self::SignerMismatch { .. }
            | Self::UnsupportedCharge { .. } => ErrorKind::Validation,
            Self::UserRejected(_) | Self::PaymentAbandoned { .. } => ErrorKind::Cancelled,
            Self::Unconfirmed { .. } | Self::RewardsIncomplete { .. } | Self::Provider(_) => {
                ErrorKind::Transient
            }
        }
    }

    /// Returns `true` if the user may retry the same rail.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SignerMismatch { .. } | Self::Unconfirmed { .. })
    }
}

/// A strategy for settling a charge.
pub trait PaymentRail: Send + Sync {
    /// Which method this rail implements.
    fn method(&self) -> PaymentMethod;

    /// Settles the ticket and returns the proof.
    fn settle<'a>(
        &'a self,
        ticket: &'a PaymentTicket,
    ) -> BoxFuture<'a, Result<SettlementProof, RailError>>;
}

impl<T: PaymentRail + ?Sized> PaymentRail for Box<T> {
    fn method(&self) -> PaymentMethod {
        (**self).method()
    }

    fn settle<'a>(
        &'a self,
        ticket: &'a PaymentTicket,
    ) -> BoxFuture<'a, Result<SettlementProof, RailError>> {
        (**self).settle(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_signer_mismatch_is_hard() {
        let hard = RailError::SignerMismatch {
            expected: Address::ZERO,
            recovered: Address::repeat_byte(1),
        };
        assert!(!hard.is_recoverable());
        assert_eq!(hard.kind(), ErrorKind::Validation);

        let soft = RailError::Provider("timeout".into());
        assert!(soft.is_recoverable());
        assert_eq!(soft.kind(), ErrorKind::Transient);
        assert_eq!(
            RailError::UserRejected("closed".into()).kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn submitted_transfer_is_never_retried() {
        let err = RailError::Unconfirmed {
            tx_hash: TxHash::repeat_byte(3),
            reason: "receipt timed out".into(),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains(&TxHash::repeat_byte(3).to_string()));
    }
}
