//! Payment attempts and the tickets handed to payment rails.

use std::fmt::{self, Display, Formatter};

use alloy_primitives::{Address, U256, hex};
use rand::RngExt;
use rand::rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::proof::SettlementProof;

/// Payment rail chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    /// On-chain ERC-20 transfer to the merchant.
    Direct,
    /// Cross-chain aggregator payment.
    Aggregator,
    /// Zero-value signed claim.
    SignatureClaim,
}

impl PaymentMethod {
    /// Returns `true` for rails that move funds.
    #[must_use]
    pub const fn is_funded(self) -> bool {
        matches!(self, Self::Direct | Self::Aggregator)
    }

    /// Wire name of the method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Aggregator => "aggregator",
            Self::SignatureClaim => "signature-claim",
        }
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-generated idempotency key of a payment attempt.
///
/// 32 lower-case hex characters drawn from 16 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Generates a fresh random order id.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rng().random();
        Self(hex::encode(bytes))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Created but not yet activated by the user.
    Idle,
    /// Activated by the user; completion events are accepted.
    Started,
    /// Settled; the proof is recorded.
    Completed,
    /// The rail reported a recoverable failure.
    Failed,
}

/// One activation of a payment rail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAttempt {
    method: PaymentMethod,
    order_id: OrderId,
    status: AttemptStatus,
    user_initiated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proof: Option<SettlementProof>,
}

impl PaymentAttempt {
    /// Creates an idle attempt with a fresh order id.
    #[must_use]
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            order_id: OrderId::generate(),
            status: AttemptStatus::Idle,
            user_initiated: false,
            proof: None,
        }
    }

    /// Restores a started attempt whose transaction was broadcast but not
    /// confirmed, so that its completion is still accepted after a reload.
    #[must_use]
    pub const fn resume(method: PaymentMethod, order_id: OrderId) -> Self {
        Self {
            method,
            order_id,
            status: AttemptStatus::Started,
            user_initiated: true,
            proof: None,
        }
    }

    /// Marks the attempt as started by the user.
    pub fn start(&mut self) {
        self.status = AttemptStatus::Started;
        self.user_initiated = true;
    }

    /// Records the settlement proof.
    ///
    /// Returns `false` and leaves the attempt untouched unless it is started.
    pub fn complete(&mut self, proof: SettlementProof) -> bool {
        if self.status != AttemptStatus::Started {
            return false;
        }
        self.status = AttemptStatus::Completed;
        self.proof = Some(proof);
        true
    }

    /// Marks the attempt failed. Completed attempts are never downgraded.
    pub fn fail(&mut self) {
        if self.status != AttemptStatus::Completed {
            self.status = AttemptStatus::Failed;
        }
    }

    /// Returns `true` if a completion event for `order_id` belongs to this
    /// attempt: same order id, started by the user, not yet completed.
    #[must_use]
    pub fn accepts(&self, order_id: &OrderId) -> bool {
        self.user_initiated && self.status == AttemptStatus::Started && &self.order_id == order_id
    }

    /// Rail of the attempt.
    #[must_use]
    pub const fn method(&self) -> PaymentMethod {
        self.method
    }

    /// Idempotency key of the attempt.
    #[must_use]
    pub const fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> AttemptStatus {
        self.status
    }

    /// Whether the user explicitly activated the rail.
    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        self.user_initiated
    }

    /// Proof of a completed attempt.
    #[must_use]
    pub const fn proof(&self) -> Option<&SettlementProof> {
        self.proof.as_ref()
    }
}

/// Everything a rail needs to settle one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTicket {
    /// Idempotency key of the attempt.
    pub order_id: OrderId,
    /// Amount to collect, in the cart currency.
    pub amount: Decimal,
    /// ISO currency code.
    pub currency: String,
    /// Numeric user identity, zero for anonymous checkouts.
    pub identity: U256,
    /// Active discount code, empty when none.
    pub discount_code: String,
    /// Total units in the cart.
    pub item_count: u64,
    /// Reward tokens to claim after a signature claim.
    #[serde(default)]
    pub reward_tokens: Vec<Address>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;

    #[test]
    fn order_ids_are_32_hex_chars_and_unique() {
        let a = OrderId::generate();
        let b = OrderId::generate();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn idle_attempt_does_not_accept_events() {
        let attempt = PaymentAttempt::new(PaymentMethod::Aggregator);
        assert!(!attempt.is_user_initiated());
        assert!(!attempt.accepts(attempt.order_id()));
    }

    #[test]
    fn attempt_lifecycle() {
        let mut attempt = PaymentAttempt::new(PaymentMethod::Direct);
        let proof = SettlementProof::Transaction {
            tx_hash: B256::repeat_byte(2),
        };
        assert!(!attempt.complete(proof.clone()));

        attempt.start();
        assert!(attempt.accepts(&attempt.order_id().clone()));
        assert!(!attempt.accepts(&OrderId::from("someone-else")));

        assert!(attempt.complete(proof.clone()));
        assert_eq!(attempt.status(), AttemptStatus::Completed);
        assert_eq!(attempt.proof(), Some(&proof));

        attempt.fail();
        assert_eq!(attempt.status(), AttemptStatus::Completed);
    }

    #[test]
    fn method_wire_names() {
        assert_eq!(
            serde_json::to_string(&PaymentMethod::SignatureClaim).unwrap(),
            "\"signature-claim\""
        );
        assert!(PaymentMethod::Aggregator.is_funded());
        assert!(!PaymentMethod::SignatureClaim.is_funded());
    }
}
