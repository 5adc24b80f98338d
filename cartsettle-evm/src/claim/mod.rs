//! Zero-value signature claim rail.
//!
//! When the final charge is zero nothing is transferred. The customer signs
//! an EIP-712 [`CheckoutClaim`] instead, and the signature is the
//! settlement proof. Reward tokens in the cart are claimed afterwards.

pub mod rewards;
pub mod signature;
pub mod signer;

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{Eip712Domain, SolStruct, eip712_domain};
use cartsettle::BoxFuture;
use cartsettle::attempt::{PaymentMethod, PaymentTicket};
use cartsettle::proof::SettlementProof;
use cartsettle::rail::{PaymentRail, RailError};
use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};

use crate::chain::ChainId;
use crate::contract::CheckoutClaim;
use rewards::RewardClaimer;
use signature::{parse_signature, verify_signer};
use signer::ClaimSigner;

/// EIP-712 domain of checkout claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimDomain {
    /// Domain name.
    pub name: String,
    /// Domain version.
    pub version: String,
    /// EIP-155 chain id.
    pub chain_id: ChainId,
    /// Contract that verifies claims.
    pub verifying_contract: Address,
}

impl ClaimDomain {
    /// The EIP-712 domain separator input.
    #[must_use]
    pub fn eip712(&self) -> Eip712Domain {
        eip712_domain! {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_id: self.chain_id,
            verifying_contract: self.verifying_contract,
        }
    }
}

/// Builds the claim message for a ticket.
#[must_use]
pub fn claim_message(ticket: &PaymentTicket, nonce: U256) -> CheckoutClaim {
    CheckoutClaim {
        orderId: ticket.order_id.to_string(),
        identity: ticket.identity,
        discountCode: ticket.discount_code.clone(),
        itemCount: U256::from(ticket.item_count),
        nonce,
    }
}

/// Settles zero-value charges with an EIP-712 signature.
pub struct SignatureClaimRail<S> {
    domain: ClaimDomain,
    signer: S,
    rewards: Option<RewardClaimer>,
}

impl<S> std::fmt::Debug for SignatureClaimRail<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureClaimRail")
            .field("domain", &self.domain)
            .field("rewards", &self.rewards)
            .finish_non_exhaustive()
    }
}

impl<S: ClaimSigner> SignatureClaimRail<S> {
    /// Creates a rail signing with `signer` under `domain`.
    pub const fn new(domain: ClaimDomain, signer: S) -> Self {
        Self {
            domain,
            signer,
            rewards: None,
        }
    }

    /// Claims reward tokens after each successful signature.
    #[must_use]
    pub fn with_rewards(mut self, rewards: RewardClaimer) -> Self {
        self.rewards = Some(rewards);
        self
    }

    async fn claim(&self, ticket: &PaymentTicket) -> Result<SettlementProof, RailError> {
        if !ticket.amount.is_zero() {
            return Err(RailError::UnsupportedCharge {
                method: PaymentMethod::SignatureClaim,
                amount: ticket.amount.to_string(),
            });
        }
        let nonce = U256::from_be_bytes::<32>(rng().random());
        let digest = claim_message(ticket, nonce).eip712_signing_hash(&self.domain.eip712());
        let expected = self.signer.address();

        let raw = self.signer.sign_digest(&digest).await?;
        let signature = parse_signature(&raw)?;
        if let Err(err) = verify_signer(&signature, &digest, expected) {
            #[cfg(feature = "telemetry")]
            tracing::error!(order_id = %ticket.order_id, error = %err, "claim signature rejected");
            return Err(err);
        }

        if let Some(rewards) = self.rewards.as_ref().filter(|_| !ticket.reward_tokens.is_empty()) {
            rewards
                .claim_all(&ticket.reward_tokens, expected, &ticket.order_id)
                .await?;
        }

        #[cfg(feature = "telemetry")]
        tracing::info!(order_id = %ticket.order_id, signer = %expected, "checkout claim signed");
        Ok(SettlementProof::Claim {
            signature: Bytes::from(signature.as_bytes().to_vec()),
            signer: expected,
            nonce,
        })
    }
}

impl<S: ClaimSigner> PaymentRail for SignatureClaimRail<S> {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::SignatureClaim
    }

    fn settle<'a>(
        &'a self,
        ticket: &'a PaymentTicket,
    ) -> BoxFuture<'a, Result<SettlementProof, RailError>> {
        Box::pin(self.claim(ticket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::rewards::{PermitRequest, PermitSource, RewardPermit, RewardSubmitter};
    use crate::claim::signer::LocalClaimSigner;
    use alloy_primitives::{B256, Signature, TxHash, hex};
    use alloy_signer_local::PrivateKeySigner;
    use cartsettle::attempt::OrderId;
    use cartsettle::timestamp::UnixTimestamp;
    use cartsettle::BoxError;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn domain() -> ClaimDomain {
        ClaimDomain {
            name: "Checkout".into(),
            version: "1".into(),
            chain_id: 8453,
            verifying_contract: Address::repeat_byte(0x42),
        }
    }

    fn ticket(amount: Decimal) -> PaymentTicket {
        PaymentTicket {
            order_id: OrderId::from("0123456789abcdef0123456789abcdef"),
            amount,
            currency: "USD".into(),
            identity: U256::from(77),
            discount_code: "FREEALL".into(),
            item_count: 3,
            reward_tokens: Vec::new(),
        }
    }

    /// Signs correctly but without the `0x` prefix, like some wallets.
    struct BareHexSigner(PrivateKeySigner);

    impl ClaimSigner for BareHexSigner {
        fn address(&self) -> Address {
            self.0.address()
        }

        fn sign_digest<'a>(&'a self, digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>> {
            Box::pin(async move {
                let sig = alloy_signer::SignerSync::sign_hash_sync(&self.0, digest).unwrap();
                Ok(hex::encode(sig.as_bytes()))
            })
        }
    }

    /// Claims one address but signs with another key.
    struct ImpostorSigner {
        claimed: Address,
        key: PrivateKeySigner,
    }

    impl ClaimSigner for ImpostorSigner {
        fn address(&self) -> Address {
            self.claimed
        }

        fn sign_digest<'a>(&'a self, digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>> {
            Box::pin(async move {
                let sig = alloy_signer::SignerSync::sign_hash_sync(&self.key, digest).unwrap();
                Ok(hex::encode_prefixed(sig.as_bytes()))
            })
        }
    }

    struct Refusing;

    impl ClaimSigner for Refusing {
        fn address(&self) -> Address {
            Address::ZERO
        }

        fn sign_digest<'a>(&'a self, _digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>> {
            Box::pin(async { Err(RailError::UserRejected("signature request dismissed".into())) })
        }
    }

    #[tokio::test]
    async fn zero_charge_produces_verifiable_claim() {
        let key = PrivateKeySigner::random();
        let address = key.address();
        let rail = SignatureClaimRail::new(domain(), LocalClaimSigner::new(key));
        let ticket = ticket(dec!(0));

        let proof = rail.settle(&ticket).await.unwrap();
        let SettlementProof::Claim {
            signature,
            signer,
            nonce,
        } = proof
        else {
            panic!("expected a claim proof");
        };
        assert_eq!(signer, address);
        assert_eq!(signature.len(), 65);

        let digest = claim_message(&ticket, nonce).eip712_signing_hash(&domain().eip712());
        let parsed = Signature::from_raw(&signature).unwrap();
        assert_eq!(parsed.recover_address_from_prehash(&digest).unwrap(), address);
    }

    #[tokio::test]
    async fn bare_hex_signature_is_normalized() {
        let rail = SignatureClaimRail::new(domain(), BareHexSigner(PrivateKeySigner::random()));
        rail.settle(&ticket(dec!(0))).await.unwrap();
    }

    #[tokio::test]
    async fn funded_charge_is_refused() {
        let rail = SignatureClaimRail::new(
            domain(),
            LocalClaimSigner::new(PrivateKeySigner::random()),
        );
        let err = rail.settle(&ticket(dec!(0.25))).await.unwrap_err();
        assert!(matches!(err, RailError::UnsupportedCharge { .. }));
    }

    #[tokio::test]
    async fn signer_mismatch_is_a_hard_failure() {
        let rail = SignatureClaimRail::new(
            domain(),
            ImpostorSigner {
                claimed: Address::repeat_byte(9),
                key: PrivateKeySigner::random(),
            },
        );
        let err = rail.settle(&ticket(dec!(0))).await.unwrap_err();
        assert!(matches!(err, RailError::SignerMismatch { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn user_rejection_is_passed_through() {
        let rail = SignatureClaimRail::new(domain(), Refusing);
        let err = rail.settle(&ticket(dec!(0))).await.unwrap_err();
        assert!(matches!(err, RailError::UserRejected(_)));
    }

    struct CountingPermits(Arc<AtomicUsize>);

    impl PermitSource for CountingPermits {
        fn fetch_permit<'a>(
            &'a self,
            _request: &'a PermitRequest,
        ) -> BoxFuture<'a, Result<RewardPermit, BoxError>> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(RewardPermit {
                    amount: U256::from(1),
                    deadline: UnixTimestamp::from_secs(2_000_000_000),
                    signature: Bytes::new(),
                })
            })
        }
    }

    struct Accepting;

    impl RewardSubmitter for Accepting {
        fn submit<'a>(
            &'a self,
            _request: &'a PermitRequest,
            _permit: &'a RewardPermit,
        ) -> BoxFuture<'a, Result<TxHash, RailError>> {
            Box::pin(async { Ok(TxHash::repeat_byte(3)) })
        }
    }

    #[tokio::test]
    async fn reward_tokens_are_claimed_after_signing() {
        let permits = Arc::new(AtomicUsize::new(0));
        let rail = SignatureClaimRail::new(
            domain(),
            LocalClaimSigner::new(PrivateKeySigner::random()),
        )
        .with_rewards(RewardClaimer::new(
            Arc::new(CountingPermits(Arc::clone(&permits))),
            Arc::new(Accepting),
        ));

        rail.settle(&ticket(dec!(0))).await.unwrap();
        assert_eq!(permits.load(Ordering::SeqCst), 0);

        let mut with_rewards = ticket(dec!(0));
        with_rewards.reward_tokens = vec![Address::repeat_byte(1), Address::repeat_byte(2)];
        rail.settle(&with_rewards).await.unwrap();
        assert_eq!(permits.load(Ordering::SeqCst), 2);
    }
}
