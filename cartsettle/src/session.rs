//! Checkout session state and its persistence boundary.
//!
//! Everything that must survive a reload lives on [`CheckoutSession`]: the
//! cart, the active discount and gift-card codes, the processed-proof set,
//! any settlement that has not been turned into an order yet and reward
//! claims that confirmed on-chain.

use std::collections::HashMap;

use alloy_primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::BoxFuture;
use crate::attempt::{OrderId, PaymentMethod};
use crate::cart::{Cart, PostalAddress};
use crate::identity::Identity;
use crate::materializer::Order;
use crate::pricing::PriceBreakdown;
use crate::proof::{ProcessedProofs, SettlementProof};

/// Materialization state of a settled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum PendingStatus {
    /// Broadcast on-chain; its receipt has not been observed yet.
    Unconfirmed {
        /// Why confirmation was not observed.
        reason: String,
    },
    /// Order creation has not been attempted yet.
    AwaitingOrder,
    /// Order creation failed; manual recovery required.
    Failed {
        /// Failure message shown to the user and support.
        error: String,
    },
}

/// A settled payment that is not yet an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSettlement {
    /// Attempt the payment belongs to.
    pub order_id: OrderId,
    /// Rail that settled it.
    pub method: PaymentMethod,
    /// Settlement proof.
    pub proof: SettlementProof,
    /// Cart as it was priced when the attempt started.
    pub cart: Cart,
    /// Pricing at the time the attempt started.
    pub breakdown: PriceBreakdown,
    /// Materialization state.
    pub status: PendingStatus,
}

/// A reward token claimed on-chain for an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    /// Attempt the reward belongs to.
    pub order_id: OrderId,
    /// Reward token.
    pub token: Address,
    /// Confirmed claim transaction.
    pub tx_hash: TxHash,
}

/// Per-checkout state that survives reloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    /// Stable session id.
    pub id: String,
    /// The cart being checked out.
    pub cart: Cart,
    /// Active discount code.
    #[serde(default)]
    pub discount_code: Option<String>,
    /// Active gift-card code.
    #[serde(default)]
    pub gift_card_code: Option<String>,
    /// Explicit session identity.
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Whether any identity was ever resolved for this session.
    #[serde(default)]
    pub identity_seen: bool,
    /// Destination address.
    #[serde(default)]
    pub shipping_address: Option<PostalAddress>,
    /// Billing address; defaults to the shipping address.
    #[serde(default)]
    pub billing_address: Option<PostalAddress>,
    /// Settlement proofs already processed.
    #[serde(default)]
    pub processed: ProcessedProofs,
    /// Settled payments not yet materialized.
    #[serde(default)]
    pub pending: Vec<PendingSettlement>,
    /// Reward claims that confirmed, including those of failed attempts.
    #[serde(default)]
    pub reward_claims: Vec<RewardClaim>,
    /// The created order, once checkout succeeded.
    #[serde(default)]
    pub order: Option<Order>,
}

impl CheckoutSession {
    /// Creates a fresh session for a cart.
    pub fn new(id: impl Into<String>, cart: Cart) -> Self {
        Self {
            id: id.into(),
            cart,
            discount_code: None,
            gift_card_code: None,
            identity: None,
            identity_seen: false,
            shipping_address: None,
            billing_address: None,
            processed: ProcessedProofs::new(),
            pending: Vec::new(),
            reward_claims: Vec::new(),
            order: None,
        }
    }

    /// Sets the explicit session identity.
    pub fn set_identity(&mut self, identity: Option<Identity>) {
        if identity.is_some() {
            self.identity_seen = true;
        }
        self.identity = identity;
    }

    /// The pending settlement for an attempt, if any.
    #[must_use]
    pub fn pending_for(&self, order_id: &OrderId) -> Option<&PendingSettlement> {
        self.pending.iter().find(|p| &p.order_id == order_id)
    }

    /// The first settlement that has not become an order, whatever its
    /// status.
    #[must_use]
    pub fn outstanding(&self) -> Option<&PendingSettlement> {
        self.pending.first()
    }

    /// The payment whose broadcast transaction is still unconfirmed.
    #[must_use]
    pub fn unconfirmed(&self) -> Option<&PendingSettlement> {
        self.pending
            .iter()
            .find(|p| matches!(p.status, PendingStatus::Unconfirmed { .. }))
    }

    pub(crate) fn pending_mut(&mut self, order_id: &OrderId) -> Option<&mut PendingSettlement> {
        self.pending.iter_mut().find(|p| &p.order_id == order_id)
    }
}

/// Errors raised by a [`SessionStore`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session could not be encoded or decoded.
    #[error("session serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The underlying storage failed.
    #[error("session storage failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Load/persist boundary for checkout sessions.
pub trait SessionStore: Send + Sync {
    /// Loads a session by id.
    fn load<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CheckoutSession>, SessionError>>;

    /// Persists a session, replacing any previous copy.
    fn persist<'a>(
        &'a self,
        session: &'a CheckoutSession,
    ) -> BoxFuture<'a, Result<(), SessionError>>;
}

/// In-process session store.
///
/// Sessions are kept as JSON so that a load always goes through the same
/// decoding path as a persistent store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CheckoutSession>, SessionError>> {
        Box::pin(async move {
            let sessions = self.sessions.lock().await;
            sessions
                .get(id)
                .map(|json| serde_json::from_str(json))
                .transpose()
                .map_err(SessionError::from)
        })
    }

    fn persist<'a>(
        &'a self,
        session: &'a CheckoutSession,
    ) -> BoxFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let json = serde_json::to_string(session)?;
            self.sessions.lock().await.insert(session.id.clone(), json);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::LineItem;
    use alloy_primitives::B256;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn memory_store_round_trips_codes_and_proofs() {
        let store = MemorySessionStore::new();
        let cart = Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(3), 1)]).unwrap();
        let mut session = CheckoutSession::new("s1", cart);
        session.discount_code = Some("WELCOME".into());
        session.gift_card_code = Some("GIFT-1".into());
        session.processed.insert(&SettlementProof::Transaction {
            tx_hash: B256::repeat_byte(3),
        });

        store.persist(&session).await.unwrap();
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[test]
    fn pending_settlement_keeps_the_priced_cart() {
        let cart = Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(3), 2)]).unwrap();
        let mut session = CheckoutSession::new("s2", cart.clone());
        session.pending.push(PendingSettlement {
            order_id: OrderId::from("o-1"),
            method: PaymentMethod::Direct,
            proof: SettlementProof::Transaction {
                tx_hash: B256::repeat_byte(4),
            },
            cart: cart.clone(),
            breakdown: crate::pricing::price(&cart),
            status: PendingStatus::Unconfirmed {
                reason: "receipt timed out".into(),
            },
        });
        session.cart.set_quantity("a1", 5).unwrap();

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["pending"][0]["status"]["state"], "unconfirmed");
        let loaded: CheckoutSession = serde_json::from_value(json).unwrap();
        assert_eq!(loaded.pending[0].cart.subtotal(), dec!(6));
        assert!(loaded.unconfirmed().is_some());
        assert_eq!(loaded.outstanding(), loaded.unconfirmed());
    }

    #[test]
    fn set_identity_marks_identity_seen() {
        let mut session = CheckoutSession::new("s", Cart::default());
        session.set_identity(None);
        assert!(!session.identity_seen);
        session.set_identity(Some(Identity::from_u64(5)));
        session.set_identity(None);
        assert!(session.identity_seen);
    }
}
