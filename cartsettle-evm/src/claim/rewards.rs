//! Reward-token claims that follow a signature claim.
//!
//! Each reward token needs a permit from the commerce backend and one
//! distributor transaction. Claims run strictly one after another: permit
//! `n` is fetched, submitted and confirmed before permit `n + 1` is
//! requested.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_provider::Provider;
use cartsettle::attempt::OrderId;
use cartsettle::rail::RailError;
use cartsettle::timestamp::UnixTimestamp;
use cartsettle::{BoxError, BoxFuture};
use serde::{Deserialize, Serialize};

use crate::contract::IRewardDistributor;
use crate::direct::{DEFAULT_RECEIPT_TIMEOUT, traced};
use crate::error::EvmRailError;

/// Permit request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitRequest {
    /// Reward token.
    pub token: Address,
    /// Claiming wallet.
    pub recipient: Address,
    /// Attempt the reward belongs to.
    pub order_id: OrderId,
}

/// Server-signed permit for one reward claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardPermit {
    /// Token units released.
    pub amount: U256,
    /// Permit expiry.
    pub deadline: UnixTimestamp,
    /// Distributor signature.
    pub signature: Bytes,
}

/// Source of reward permits.
pub trait PermitSource: Send + Sync {
    /// Requests a permit for one token.
    fn fetch_permit<'a>(
        &'a self,
        request: &'a PermitRequest,
    ) -> BoxFuture<'a, Result<RewardPermit, BoxError>>;
}

/// Submits a permit and waits for its confirmation.
pub trait RewardSubmitter: Send + Sync {
    /// Sends the claim transaction and resolves once it is confirmed.
    fn submit<'a>(
        &'a self,
        request: &'a PermitRequest,
        permit: &'a RewardPermit,
    ) -> BoxFuture<'a, Result<TxHash, RailError>>;
}

/// Submits permits to an on-chain distributor contract.
#[derive(Debug, Clone)]
pub struct DistributorSubmitter<P> {
    provider: P,
    distributor: Address,
    receipt_timeout: Duration,
}

impl<P> DistributorSubmitter<P> {
    /// Creates a submitter for the distributor at `distributor`.
    pub const fn new(provider: P, distributor: Address) -> Self {
        Self {
            provider,
            distributor,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }
}

impl<P: Provider> DistributorSubmitter<P> {
    async fn send(
        &self,
        request: &PermitRequest,
        permit: &RewardPermit,
    ) -> Result<TxHash, EvmRailError> {
        let distributor = IRewardDistributor::new(self.distributor, &self.provider);
        let pending = distributor
            .claim(
                request.token,
                request.recipient,
                permit.amount,
                U256::from(permit.deadline.as_secs()),
                request.order_id.to_string(),
                permit.signature.clone(),
            )
            .from(request.recipient)
            .send()
            .await?;
        let receipt_fut = pending
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt();
        let receipt = traced!(
            receipt_fut,
            tracing::info_span!("reward_claim",
                token = %request.token,
                recipient = %request.recipient,
                amount = %permit.amount,
                otel.kind = "client",
            )
        )?;
        if receipt.status() {
            Ok(receipt.transaction_hash)
        } else {
            Err(EvmRailError::TransactionReverted(receipt.transaction_hash))
        }
    }
}

impl<P: Provider + Send + Sync> RewardSubmitter for DistributorSubmitter<P> {
    fn submit<'a>(
        &'a self,
        request: &'a PermitRequest,
        permit: &'a RewardPermit,
    ) -> BoxFuture<'a, Result<TxHash, RailError>> {
        Box::pin(async move { Ok(self.send(request, permit).await?) })
    }
}

/// Claims reward tokens one at a time.
#[derive(Clone)]
pub struct RewardClaimer {
    permits: Arc<dyn PermitSource>,
    submitter: Arc<dyn RewardSubmitter>,
}

impl Debug for RewardClaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewardClaimer").finish_non_exhaustive()
    }
}

impl RewardClaimer {
    /// Creates a claimer.
    pub fn new(permits: Arc<dyn PermitSource>, submitter: Arc<dyn RewardSubmitter>) -> Self {
        Self { permits, submitter }
    }

    /// Claims every token in order and returns the confirmed
    /// `(token, transaction)` pairs.
    ///
    /// # Errors
    ///
    /// Stops at the first failure. Claims confirmed before it stay on-chain
    /// and are reported through [`RailError::RewardsIncomplete`]; a failure
    /// on the first token is returned as is.
    pub async fn claim_all(
        &self,
        tokens: &[Address],
        recipient: Address,
        order_id: &OrderId,
    ) -> Result<Vec<(Address, TxHash)>, RailError> {
        let mut confirmed = Vec::with_capacity(tokens.len());
        for &token in tokens {
            let request = PermitRequest {
                token,
                recipient,
                order_id: order_id.clone(),
            };
            match self.claim_one(&request).await {
                Ok(tx) => {
                    #[cfg(feature = "telemetry")]
                    tracing::info!(token = %token, tx = %tx, "reward claimed");
                    confirmed.push((token, tx));
                }
                Err(err) if confirmed.is_empty() => return Err(err),
                Err(err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::error!(
                        token = %token,
                        claimed = confirmed.len(),
                        error = %err,
                        "reward claims stopped part way"
                    );
                    return Err(RailError::RewardsIncomplete {
                        claimed: confirmed,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(confirmed)
    }

    async fn claim_one(&self, request: &PermitRequest) -> Result<TxHash, RailError> {
        let permit = self.permits.fetch_permit(request).await.map_err(|e| {
            RailError::Provider(format!("reward permit for {}: {e}", request.token))
        })?;
        self.submitter.submit(request, &permit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<String>>);

    impl Journal {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }
    }

    struct Permits(Arc<Journal>);

    impl PermitSource for Permits {
        fn fetch_permit<'a>(
            &'a self,
            request: &'a PermitRequest,
        ) -> BoxFuture<'a, Result<RewardPermit, BoxError>> {
            Box::pin(async move {
                self.0.push(format!("permit {}", request.token));
                Ok(RewardPermit {
                    amount: U256::from(10),
                    deadline: UnixTimestamp::from_secs(2_000_000_000),
                    signature: Bytes::from_static(&[1, 2, 3]),
                })
            })
        }
    }

    struct Submitter {
        journal: Arc<Journal>,
        fail_on: Option<Address>,
    }

    impl RewardSubmitter for Submitter {
        fn submit<'a>(
            &'a self,
            request: &'a PermitRequest,
            _permit: &'a RewardPermit,
        ) -> BoxFuture<'a, Result<TxHash, RailError>> {
            Box::pin(async move {
                if self.fail_on == Some(request.token) {
                    return Err(RailError::Provider("reverted".into()));
                }
                tokio::task::yield_now().await;
                self.journal.push(format!("confirmed {}", request.token));
                Ok(B256::left_padding_from(request.token.as_slice()))
            })
        }
    }

    fn claimer(journal: &Arc<Journal>, fail_on: Option<Address>) -> RewardClaimer {
        RewardClaimer::new(
            Arc::new(Permits(Arc::clone(journal))),
            Arc::new(Submitter {
                journal: Arc::clone(journal),
                fail_on,
            }),
        )
    }

    #[tokio::test]
    async fn claims_are_sequential() {
        let journal = Arc::new(Journal::default());
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let txs = claimer(&journal, None)
            .claim_all(&[a, b], Address::repeat_byte(1), &OrderId::from("o"))
            .await
            .unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(
            *journal.0.lock().unwrap(),
            vec![
                format!("permit {a}"),
                format!("confirmed {a}"),
                format!("permit {b}"),
                format!("confirmed {b}"),
            ]
        );
    }

    #[tokio::test]
    async fn first_failure_stops_the_run() {
        let journal = Arc::new(Journal::default());
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let err = claimer(&journal, Some(a))
            .claim_all(&[a, b], Address::repeat_byte(1), &OrderId::from("o"))
            .await
            .unwrap_err();
        assert!(matches!(err, RailError::Provider(_)));
        assert_eq!(*journal.0.lock().unwrap(), vec![format!("permit {a}")]);
    }

    #[tokio::test]
    async fn later_failure_reports_confirmed_claims() {
        let journal = Arc::new(Journal::default());
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let err = claimer(&journal, Some(b))
            .claim_all(&[a, b], Address::repeat_byte(1), &OrderId::from("o"))
            .await
            .unwrap_err();
        let RailError::RewardsIncomplete { claimed, reason } = err else {
            panic!("expected partial claims");
        };
        assert_eq!(claimed, vec![(a, B256::left_padding_from(a.as_slice()))]);
        assert!(reason.contains("reverted"));
    }

    #[test]
    fn permit_wire_format() {
        let permit: RewardPermit = serde_json::from_str(
            r#"{"amount":"0x0a","deadline":"1700000000","signature":"0x0102"}"#,
        )
        .unwrap();
        assert_eq!(permit.amount, U256::from(10));
        assert_eq!(permit.deadline.as_secs(), 1_700_000_000);
    }
}
