//! Order materialization: settled payment to external order.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::attempt::{OrderId, PaymentMethod};
use crate::cart::{LineItem, PostalAddress};
use crate::discount::{DiscountKind, DiscountSource};
use crate::identity::{Identity, IdentityChain, IdentityResolution};
use crate::proof::SettlementProof;
use crate::session::{CheckoutSession, PendingSettlement};
use crate::{BoxError, BoxFuture};

/// Customer contact details sent with the order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    /// Contact e-mail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Discount information attached to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountSummary {
    /// Discount code.
    pub code: String,
    /// Percentage or fixed.
    #[serde(rename = "type")]
    pub kind: DiscountKind,
    /// Amount taken off.
    pub amount: Decimal,
    /// Whether shipping was waived.
    pub free_shipping: bool,
    /// Candidate source.
    pub source: DiscountSource,
}

/// Gift-card information attached to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftCardSummary {
    /// Gift-card code.
    pub code: String,
    /// Amount redeemed.
    pub amount: Decimal,
}

/// Order creation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Idempotency key of the settled attempt.
    pub order_id: OrderId,
    /// Cart contents.
    pub line_items: Vec<LineItem>,
    /// Destination, absent for digital-only carts.
    pub shipping_address: Option<PostalAddress>,
    /// Billing address.
    pub billing_address: Option<PostalAddress>,
    /// Customer contact details.
    pub customer: Customer,
    /// Settlement proof; the order store deduplicates on it.
    pub settlement_proof: SettlementProof,
    /// Amount actually charged.
    pub final_total: Decimal,
    /// ISO currency code.
    pub currency: String,
    /// Rail used.
    pub payment_method: PaymentMethod,
    /// Applied discount, if any.
    pub discount_summary: Option<DiscountSummary>,
    /// Redeemed gift card, if any.
    pub gift_card_summary: Option<GiftCardSummary>,
    /// Customer identity; absent for anonymous orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
}

/// An order created by the order store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Store-assigned order id.
    pub id: String,
    /// Human-readable order number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    /// Order status page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

/// Order creation response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    /// Whether the order was created.
    pub success: bool,
    /// The order, on success.
    #[serde(default)]
    pub order: Option<Order>,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
}

/// External order creation API.
pub trait OrderStore: Send + Sync {
    /// Creates an order. Called at most once per settlement by this crate.
    fn create_order<'a>(
        &'a self,
        request: &'a OrderRequest,
    ) -> BoxFuture<'a, Result<OrderResponse, BoxError>>;
}

/// Order creation failures.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// The store answered but refused the order.
    #[error("order store rejected the order: {0}")]
    Rejected(String),
    /// The store could not be reached.
    #[error("order store unavailable: {0}")]
    Unavailable(#[source] BoxError),
}

/// A successfully created order and the identity it was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    /// The created order.
    pub order: Order,
    /// Identity resolution outcome.
    pub identity: IdentityResolution,
}

/// Builds order payloads and calls the order store.
pub struct OrderMaterializer {
    orders: Arc<dyn OrderStore>,
    identities: IdentityChain,
}

impl std::fmt::Debug for OrderMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderMaterializer")
            .field("identities", &self.identities)
            .finish_non_exhaustive()
    }
}

impl OrderMaterializer {
    /// Creates a materializer over an order store and identity chain.
    pub fn new(orders: Arc<dyn OrderStore>, identities: IdentityChain) -> Self {
        Self { orders, identities }
    }

    /// The identity chain.
    #[must_use]
    pub const fn identities(&self) -> &IdentityChain {
        &self.identities
    }

    /// Assembles the order payload for a pending settlement.
    ///
    /// Items, codes and totals come from the cart the payment was priced on;
    /// addresses and contact details from the session.
    #[must_use]
    pub fn build_request(
        session: &CheckoutSession,
        pending: &PendingSettlement,
        identity: Option<Identity>,
    ) -> OrderRequest {
        let cart = &pending.cart;
        let breakdown = &pending.breakdown;
        let contact = session
            .shipping_address
            .as_ref()
            .or(session.billing_address.as_ref());
        OrderRequest {
            order_id: pending.order_id.clone(),
            line_items: cart.items().to_vec(),
            shipping_address: session.shipping_address.clone(),
            billing_address: session
                .billing_address
                .clone()
                .or_else(|| session.shipping_address.clone()),
            customer: Customer {
                email: contact.and_then(|a| a.email.clone()),
                name: contact.map(|a| a.name.clone()),
            },
            settlement_proof: pending.proof.clone(),
            final_total: breakdown.charge.amount,
            currency: cart.currency().to_owned(),
            payment_method: pending.method,
            discount_summary: cart.discount().map(|d| DiscountSummary {
                code: d.code.clone(),
                kind: d.kind,
                amount: breakdown.discount,
                free_shipping: d.grants_free_shipping(cart.items()),
                source: d.source,
            }),
            gift_card_summary: cart.gift_card().map(|g| GiftCardSummary {
                code: g.code.clone(),
                amount: breakdown.gift_card,
            }),
            identity,
            notes: cart.notes().to_owned(),
        }
    }

    /// Resolves identity and calls the order store exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError`] if the store is unreachable or refuses the
    /// order. The caller keeps the settlement proof.
    pub async fn materialize(
        &self,
        session: &mut CheckoutSession,
        pending: &PendingSettlement,
    ) -> Result<Materialized, MaterializeError> {
        let resolution = self.identities.resolve(session);
        if resolution == IdentityResolution::Lost {
            #[cfg(feature = "telemetry")]
            tracing::error!(
                session = %session.id,
                order_id = %pending.order_id,
                "identity lost before order creation; continuing as anonymous order"
            );
        }
        let request = Self::build_request(session, pending, resolution.identity());
        let response = self
            .orders
            .create_order(&request)
            .await
            .map_err(MaterializeError::Unavailable)?;
        match response {
            OrderResponse {
                success: true,
                order: Some(order),
                ..
            } => Ok(Materialized {
                order,
                identity: resolution,
            }),
            OrderResponse { error, .. } => Err(MaterializeError::Rejected(
                error.unwrap_or_else(|| "order store returned no order".to_owned()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::Cart;
    use crate::pricing::price;
    use crate::session::PendingStatus;
    use alloy_primitives::B256;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        requests: Mutex<Vec<OrderRequest>>,
        fail: bool,
    }

    impl OrderStore for RecordingStore {
        fn create_order<'a>(
            &'a self,
            request: &'a OrderRequest,
        ) -> BoxFuture<'a, Result<OrderResponse, BoxError>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                if self.fail {
                    return Ok(OrderResponse {
                        success: false,
                        order: None,
                        error: Some("inventory sync failed".into()),
                    });
                }
                Ok(OrderResponse {
                    success: true,
                    order: Some(Order {
                        id: "gid://order/1".into(),
                        number: Some("#1001".into()),
                        status_url: None,
                    }),
                    error: None,
                })
            })
        }
    }

    fn pending(session: &CheckoutSession) -> PendingSettlement {
        PendingSettlement {
            order_id: OrderId::from("abc"),
            method: PaymentMethod::Direct,
            proof: SettlementProof::Transaction {
                tx_hash: B256::repeat_byte(9),
            },
            cart: session.cart.clone(),
            breakdown: price(&session.cart),
            status: PendingStatus::AwaitingOrder,
        }
    }

    fn session() -> CheckoutSession {
        let cart = Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(12.00), 1)]).unwrap();
        CheckoutSession::new("s", cart)
    }

    #[tokio::test]
    async fn anonymous_order_is_created_once() {
        let store = Arc::new(RecordingStore::default());
        let materializer = OrderMaterializer::new(store.clone(), IdentityChain::new());
        let mut session = session();
        let pending = pending(&session);

        let done = materializer.materialize(&mut session, &pending).await.unwrap();
        assert_eq!(done.identity, IdentityResolution::Anonymous);
        assert_eq!(done.order.id, "gid://order/1");

        let requests = store.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].final_total, dec!(12.00));
        assert!(requests[0].identity.is_none());
    }

    #[tokio::test]
    async fn lost_identity_still_creates_an_anonymous_order() {
        let store = Arc::new(RecordingStore::default());
        let materializer = OrderMaterializer::new(store.clone(), IdentityChain::new());
        let mut session = session();
        session.identity_seen = true;
        let pending = pending(&session);

        let done = materializer.materialize(&mut session, &pending).await.unwrap();
        assert_eq!(done.identity, IdentityResolution::Lost);
        assert!(store.requests.lock().unwrap()[0].identity.is_none());
    }

    #[tokio::test]
    async fn rejection_is_reported() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..RecordingStore::default()
        });
        let materializer = OrderMaterializer::new(store, IdentityChain::new());
        let mut session = session();
        let pending = pending(&session);
        let err = materializer
            .materialize(&mut session, &pending)
            .await
            .unwrap_err();
        assert!(matches!(err, MaterializeError::Rejected(msg) if msg == "inventory sync failed"));
    }

    #[test]
    fn payload_comes_from_the_paid_cart() {
        let mut session = session();
        let pending = pending(&session);
        session
            .cart
            .add_item(LineItem::new("b", "b1", dec!(99.00), 1))
            .unwrap();
        let request = OrderMaterializer::build_request(&session, &pending, None);
        assert_eq!(request.line_items, pending.cart.items());
        assert_eq!(request.final_total, dec!(12.00));
    }

    #[test]
    fn payload_uses_camel_case_wire_names() {
        let mut session = session();
        session.shipping_address = Some(PostalAddress {
            name: "Ada".into(),
            email: Some("ada@example.com".into()),
            ..PostalAddress::default()
        });
        let pending = pending(&session);
        let request = OrderMaterializer::build_request(&session, &pending, None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["paymentMethod"], "direct");
        assert_eq!(json["customer"]["email"], "ada@example.com");
        assert_eq!(json["billingAddress"]["name"], "Ada");
        assert_eq!(json["settlementProof"]["kind"], "transaction");
        assert!(json.get("identity").is_none());
    }
}
