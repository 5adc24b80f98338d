//! Settlement proofs and the idempotency set that guards order creation.

use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

use alloy_primitives::{Address, B256, Bytes, U256, hex};
use serde::{Deserialize, Serialize};

/// Evidence that a payment obligation was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SettlementProof {
    /// An on-chain token transfer sent directly to the merchant.
    #[serde(rename_all = "camelCase")]
    Transaction {
        /// Transfer transaction hash.
        tx_hash: B256,
    },
    /// A payment settled by the cross-chain aggregator.
    #[serde(rename_all = "camelCase")]
    Aggregator {
        /// Settlement transaction hash on the merchant's chain.
        tx_hash: B256,
        /// Aggregator-assigned payment id.
        payment_id: String,
    },
    /// A signed zero-value claim.
    #[serde(rename_all = "camelCase")]
    Claim {
        /// 65-byte EIP-712 signature.
        signature: Bytes,
        /// Address that produced the signature.
        signer: Address,
        /// Claim nonce.
        nonce: U256,
    },
}

/// Deduplication key of a [`SettlementProof`].
///
/// Lower-case `0x`-prefixed hex of the transaction hash or signature, so the
/// same transaction reported by the watcher and by the aggregator collapses
/// to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProofKey(String);

impl ProofKey {
    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProofKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SettlementProof {
    /// Returns the deduplication key.
    #[must_use]
    pub fn key(&self) -> ProofKey {
        let bytes: &[u8] = match self {
            Self::Transaction { tx_hash } | Self::Aggregator { tx_hash, .. } => {
                tx_hash.as_slice()
            }
            Self::Claim { signature, .. } => signature.as_ref(),
        };
        ProofKey(hex::encode_prefixed(bytes))
    }

    /// Transaction hash, for proofs that move funds.
    #[must_use]
    pub const fn tx_hash(&self) -> Option<&B256> {
        match self {
            Self::Transaction { tx_hash } | Self::Aggregator { tx_hash, .. } => Some(tx_hash),
            Self::Claim { .. } => None,
        }
    }
}

impl Display for SettlementProof {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction { tx_hash } => write!(f, "tx {tx_hash}"),
            Self::Aggregator {
                tx_hash,
                payment_id,
            } => write!(f, "aggregator payment {payment_id} (tx {tx_hash})"),
            Self::Claim { signer, nonce, .. } => {
                write!(f, "claim by {signer} nonce {nonce} ({})", self.key())
            }
        }
    }
}

/// Settlement proofs already processed in this session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessedProofs(HashSet<ProofKey>);

impl ProcessedProofs {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the proof, returning `false` if it was already present.
    ///
    /// This single insert is the check-then-set that guards order creation.
    pub fn insert(&mut self, proof: &SettlementProof) -> bool {
        self.0.insert(proof.key())
    }

    /// Returns `true` if the proof has been processed.
    #[must_use]
    pub fn contains(&self, proof: &SettlementProof) -> bool {
        self.0.contains(&proof.key())
    }

    /// Number of processed proofs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no proof has been processed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_and_aggregator_proofs_share_a_key() {
        let tx_hash = B256::repeat_byte(0xab);
        let direct = SettlementProof::Transaction { tx_hash };
        let aggregated = SettlementProof::Aggregator {
            tx_hash,
            payment_id: "pay_1".into(),
        };
        assert_eq!(direct.key(), aggregated.key());
        assert_eq!(direct.key().as_str(), format!("0x{}", "ab".repeat(32)));
    }

    #[test]
    fn insert_is_check_then_set() {
        let proof = SettlementProof::Transaction {
            tx_hash: B256::repeat_byte(1),
        };
        let mut set = ProcessedProofs::new();
        assert!(set.insert(&proof));
        assert!(!set.insert(&proof));
        assert!(set.contains(&proof));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn claim_key_is_lowercase_signature_hex() {
        let proof = SettlementProof::Claim {
            signature: Bytes::from(vec![0xAB; 65]),
            signer: Address::ZERO,
            nonce: U256::from(7),
        };
        let key = proof.key();
        assert_eq!(key.as_str().len(), 2 + 130);
        assert_eq!(key.as_str(), key.as_str().to_lowercase());
        assert!(proof.tx_hash().is_none());
    }

    #[test]
    fn proof_serializes_with_kind_tag() {
        let proof = SettlementProof::Aggregator {
            tx_hash: B256::ZERO,
            payment_id: "pay_1".into(),
        };
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["kind"], "aggregator");
        assert_eq!(json["paymentId"], "pay_1");
        let back: SettlementProof = serde_json::from_value(json).unwrap();
        assert_eq!(back, proof);
    }
}
