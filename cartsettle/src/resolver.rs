//! Discount and gift-card resolution.
//!
//! Codes are always validated by the commerce backend before they touch the
//! cart. A rejected code leaves the cart exactly as it was.

use std::collections::BTreeSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cart::ProductId;
use crate::discount::{AppliedDiscount, AppliedGiftCard, DiscountKind, DiscountScope, DiscountSource};
use crate::error::ErrorKind;
use crate::money::deserialize_money_opt;
use crate::pricing::price;
use crate::session::CheckoutSession;
use crate::timestamp::UnixTimestamp;
use crate::{BoxError, BoxFuture};

/// Discount validation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountValidationRequest {
    /// Code to validate.
    pub code: String,
    /// Current cart subtotal.
    pub subtotal: Decimal,
}

/// Wire form of a discount scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeKind {
    /// Applies to every item.
    CartWide,
    /// Applies to `targetProducts` only.
    ProductScoped,
}

/// Discount validation response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountValidation {
    /// Whether the code is usable.
    pub valid: bool,
    /// Percentage or fixed.
    #[serde(rename = "type", default)]
    pub kind: Option<DiscountKind>,
    /// Discount value.
    #[serde(default)]
    pub value: Option<Decimal>,
    /// Scope.
    #[serde(default)]
    pub scope: Option<ScopeKind>,
    /// Targeted products for product-scoped discounts.
    #[serde(default)]
    pub target_products: Option<Vec<ProductId>>,
    /// Whether the discount unlocks free shipping.
    #[serde(default)]
    pub free_shipping: bool,
    /// Reason for rejection.
    #[serde(default)]
    pub message: Option<String>,
}

/// Gift-card validation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftCardValidationRequest {
    /// Code to validate.
    pub code: String,
    /// Amount due before the gift card.
    pub cart_total: Decimal,
}

/// Gift-card validation response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GiftCardValidation {
    /// Whether the card is usable.
    pub valid: bool,
    /// Remaining balance.
    #[serde(default, deserialize_with = "deserialize_money_opt")]
    pub balance: Option<Decimal>,
    /// Expiry.
    #[serde(default)]
    pub expires_at: Option<UnixTimestamp>,
    /// Reason for rejection.
    #[serde(default)]
    pub message: Option<String>,
}

/// Discount Validation API.
pub trait DiscountValidator: Send + Sync {
    /// Validates a discount code against the current subtotal.
    fn validate_discount<'a>(
        &'a self,
        request: &'a DiscountValidationRequest,
    ) -> BoxFuture<'a, Result<DiscountValidation, BoxError>>;
}

/// Gift Card Validation API.
pub trait GiftCardValidator: Send + Sync {
    /// Validates a gift card against the amount due.
    fn validate_gift_card<'a>(
        &'a self,
        request: &'a GiftCardValidationRequest,
    ) -> BoxFuture<'a, Result<GiftCardValidation, BoxError>>;
}

/// Recoverable resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The backend rejected the code.
    #[error("code {code} rejected: {reason}")]
    Rejected {
        /// Offending code.
        code: String,
        /// Backend message.
        reason: String,
    },
    /// The gift card has expired.
    #[error("gift card {code} expired at {expired_at}")]
    Expired {
        /// Offending code.
        code: String,
        /// Expiry time.
        expired_at: UnixTimestamp,
    },
    /// The validation service could not be reached.
    #[error("could not validate {code}: {source}")]
    Unavailable {
        /// Code being validated.
        code: String,
        /// Transport failure.
        #[source]
        source: BoxError,
    },
}

impl ResolveError {
    /// Classification used by the orchestrator.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. } | Self::Expired { .. } => ErrorKind::Validation,
            Self::Unavailable { .. } => ErrorKind::Transient,
        }
    }

    fn rejected(code: &str, reason: Option<String>) -> Self {
        Self::Rejected {
            code: code.to_owned(),
            reason: reason.unwrap_or_else(|| "invalid code".to_owned()),
        }
    }
}

/// A discount code offered by one of the discount sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountCandidate {
    /// Code to validate.
    pub code: String,
    /// Source, used for priority.
    pub source: DiscountSource,
}

impl DiscountCandidate {
    /// Creates a candidate.
    pub fn new(code: impl Into<String>, source: DiscountSource) -> Self {
        Self {
            code: code.into(),
            source,
        }
    }

    /// Priority group: lower sorts first.
    const fn rank(&self) -> (u8, std::cmp::Reverse<u32>) {
        match self.source {
            DiscountSource::Referral => (0, std::cmp::Reverse(0)),
            DiscountSource::HoldingGated { tier } => (1, std::cmp::Reverse(tier)),
            DiscountSource::Account | DiscountSource::Manual => (2, std::cmp::Reverse(0)),
        }
    }
}

/// Validates codes and applies them to a session's cart.
#[derive(Clone)]
pub struct DiscountResolver {
    discounts: Arc<dyn DiscountValidator>,
    gift_cards: Arc<dyn GiftCardValidator>,
}

impl std::fmt::Debug for DiscountResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscountResolver").finish_non_exhaustive()
    }
}

impl DiscountResolver {
    /// Creates a resolver over the validation APIs.
    pub fn new(
        discounts: Arc<dyn DiscountValidator>,
        gift_cards: Arc<dyn GiftCardValidator>,
    ) -> Self {
        Self {
            discounts,
            gift_cards,
        }
    }

    /// Validates a code and turns the response into an applied discount.
    async fn validate(
        &self,
        session: &CheckoutSession,
        candidate: &DiscountCandidate,
    ) -> Result<AppliedDiscount, ResolveError> {
        let code = candidate.code.trim();
        let request = DiscountValidationRequest {
            code: code.to_owned(),
            subtotal: session.cart.subtotal(),
        };
        let response = self
            .discounts
            .validate_discount(&request)
            .await
            .map_err(|source| ResolveError::Unavailable {
                code: code.to_owned(),
                source,
            })?;
        if !response.valid {
            return Err(ResolveError::rejected(code, response.message));
        }
        let (Some(kind), Some(value)) = (response.kind, response.value) else {
            return Err(ResolveError::rejected(
                code,
                Some("validation response is missing type or value".to_owned()),
            ));
        };
        if value.is_sign_negative() {
            return Err(ResolveError::rejected(code, Some("negative value".to_owned())));
        }
        let scope = match response.scope.unwrap_or(ScopeKind::CartWide) {
            ScopeKind::CartWide => DiscountScope::CartWide,
            ScopeKind::ProductScoped => DiscountScope::ProductScoped {
                products: response
                    .target_products
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<BTreeSet<_>>(),
            },
        };
        Ok(AppliedDiscount {
            code: code.to_owned(),
            kind,
            value,
            scope,
            free_shipping: response.free_shipping,
            source: candidate.source,
        })
    }

    /// Validates and applies a discount code, replacing any current discount.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if the code is rejected or cannot be
    /// validated; the cart is left untouched.
    pub async fn apply(
        &self,
        session: &mut CheckoutSession,
        code: &str,
        source: DiscountSource,
    ) -> Result<AppliedDiscount, ResolveError> {
        let candidate = DiscountCandidate::new(code, source);
        let discount = self.validate(session, &candidate).await?;
        session.discount_code = Some(discount.code.clone());
        session.cart.discount = Some(discount.clone());
        Ok(discount)
    }

    /// Removes the active discount.
    pub fn remove(session: &mut CheckoutSession) -> Option<AppliedDiscount> {
        session.discount_code = None;
        session.cart.discount.take()
    }

    /// Picks the winning candidate and applies it.
    ///
    /// Referral discounts win over holding-gated ones (highest tier first),
    /// which win over account discounts. Among account discounts the one
    /// taking the most off the current cart wins. Candidates that fail
    /// validation are skipped. Returns `None` and leaves the cart untouched
    /// when no candidate is valid.
    pub async fn resolve(
        &self,
        session: &mut CheckoutSession,
        candidates: &[DiscountCandidate],
    ) -> Option<AppliedDiscount> {
        let mut ordered: Vec<&DiscountCandidate> = candidates.iter().collect();
        ordered.sort_by_key(|c| c.rank());

        let mut best_account: Option<(Decimal, AppliedDiscount)> = None;
        for candidate in ordered {
            let discount = match self.validate(session, candidate).await {
                Ok(discount) => discount,
                Err(_e) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(code = %candidate.code, source = ?candidate.source, error = %_e, "skipping discount candidate");
                    continue;
                }
            };
            if candidate.rank().0 < 2 {
                return Some(Self::install(session, discount));
            }
            let amount = discount.amount(session.cart.items());
            if best_account.as_ref().is_none_or(|(best, _)| amount > *best) {
                best_account = Some((amount, discount));
            }
        }
        best_account.map(|(_, discount)| Self::install(session, discount))
    }

    fn install(session: &mut CheckoutSession, discount: AppliedDiscount) -> AppliedDiscount {
        #[cfg(feature = "telemetry")]
        tracing::info!(code = %discount.code, source = ?discount.source, "discount resolved");
        session.discount_code = Some(discount.code.clone());
        session.cart.discount = Some(discount.clone());
        discount
    }

    /// Validates and applies a gift card.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError`] if the card is invalid, empty, expired or
    /// cannot be validated; the cart is left untouched.
    pub async fn apply_gift_card(
        &self,
        session: &mut CheckoutSession,
        code: &str,
        now: UnixTimestamp,
    ) -> Result<AppliedGiftCard, ResolveError> {
        let code = code.trim();
        let request = GiftCardValidationRequest {
            code: code.to_owned(),
            cart_total: price(&session.cart).due_before_gift_card(),
        };
        let response = self
            .gift_cards
            .validate_gift_card(&request)
            .await
            .map_err(|source| ResolveError::Unavailable {
                code: code.to_owned(),
                source,
            })?;
        if !response.valid {
            return Err(ResolveError::rejected(code, response.message));
        }
        let balance = response.balance.unwrap_or_default();
        if balance <= Decimal::ZERO {
            return Err(ResolveError::rejected(code, Some("no remaining balance".to_owned())));
        }
        let card = AppliedGiftCard {
            code: code.to_owned(),
            balance,
            expires_at: response.expires_at,
        };
        if let Some(expired_at) = card.expires_at.filter(|_| card.is_expired(now)) {
            return Err(ResolveError::Expired {
                code: code.to_owned(),
                expired_at,
            });
        }
        session.gift_card_code = Some(card.code.clone());
        session.cart.gift_card = Some(card.clone());
        Ok(card)
    }

    /// Removes the active gift card.
    pub fn remove_gift_card(session: &mut CheckoutSession) -> Option<AppliedGiftCard> {
        session.gift_card_code = None;
        session.cart.gift_card.take()
    }

    /// Re-validates the codes persisted on a reloaded session.
    ///
    /// Codes the backend rejects, or gift cards that expired, are dropped.
    /// When the backend cannot be reached the codes are kept as they are.
    /// Returns `true` if the applied discount or gift card changed.
    pub async fn restore(&self, session: &mut CheckoutSession, now: UnixTimestamp) -> bool {
        let before = (
            session.cart.discount().cloned(),
            session.cart.gift_card().cloned(),
        );
        if let Some(code) = session.discount_code.clone() {
            let source = session
                .cart
                .discount()
                .map_or(DiscountSource::Manual, |d| d.source);
            match self.apply(session, &code, source).await {
                Ok(_) => {}
                Err(ResolveError::Unavailable { source: _e, .. }) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(code = %code, error = %_e, "keeping persisted discount, validation unavailable");
                }
                Err(_e) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(code = %code, error = %_e, "dropping persisted discount");
                    Self::remove(session);
                }
            }
        }
        if let Some(code) = session.gift_card_code.clone() {
            match self.apply_gift_card(session, &code, now).await {
                Ok(_) => {}
                Err(ResolveError::Unavailable { source: _e, .. }) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(code = %code, error = %_e, "keeping persisted gift card, validation unavailable");
                }
                Err(_e) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(code = %code, error = %_e, "dropping persisted gift card");
                    Self::remove_gift_card(session);
                }
            }
        }
        before
            != (
                session.cart.discount().cloned(),
                session.cart.gift_card().cloned(),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{Cart, LineItem};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        discounts: HashMap<String, DiscountValidation>,
        gift_cards: HashMap<String, GiftCardValidation>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn with_discount(mut self, code: &str, kind: DiscountKind, value: Decimal) -> Self {
            self.discounts.insert(
                code.to_owned(),
                DiscountValidation {
                    valid: true,
                    kind: Some(kind),
                    value: Some(value),
                    scope: Some(ScopeKind::CartWide),
                    target_products: None,
                    free_shipping: false,
                    message: None,
                },
            );
            self
        }

        fn with_gift_card(mut self, code: &str, balance: Decimal, expires: Option<u64>) -> Self {
            self.gift_cards.insert(
                code.to_owned(),
                GiftCardValidation {
                    valid: true,
                    balance: Some(balance),
                    expires_at: expires.map(UnixTimestamp::from_secs),
                    message: None,
                },
            );
            self
        }
    }

    impl DiscountValidator for FakeBackend {
        fn validate_discount<'a>(
            &'a self,
            request: &'a DiscountValidationRequest,
        ) -> BoxFuture<'a, Result<DiscountValidation, BoxError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(request.code.clone());
                if request.code == "OFFLINE" {
                    return Err("connection refused".into());
                }
                Ok(self.discounts.get(&request.code).cloned().unwrap_or(
                    DiscountValidation {
                        valid: false,
                        kind: None,
                        value: None,
                        scope: None,
                        target_products: None,
                        free_shipping: false,
                        message: Some("Discount code not found".into()),
                    },
                ))
            })
        }
    }

    impl GiftCardValidator for FakeBackend {
        fn validate_gift_card<'a>(
            &'a self,
            request: &'a GiftCardValidationRequest,
        ) -> BoxFuture<'a, Result<GiftCardValidation, BoxError>> {
            Box::pin(async move {
                if request.code == "OFFLINE-CARD" {
                    return Err("connection refused".into());
                }
                Ok(self.gift_cards.get(&request.code).cloned().unwrap_or(
                    GiftCardValidation {
                        valid: false,
                        balance: None,
                        expires_at: None,
                        message: Some("Gift card not found".into()),
                    },
                ))
            })
        }
    }

    fn setup(backend: FakeBackend) -> (DiscountResolver, Arc<FakeBackend>, CheckoutSession) {
        let backend = Arc::new(backend);
        let resolver = DiscountResolver::new(backend.clone(), backend.clone());
        let cart = Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(50.00), 1)]).unwrap();
        (resolver, backend, CheckoutSession::new("s", cart))
    }

    #[tokio::test]
    async fn apply_persists_code_on_session() {
        let (resolver, _, mut session) =
            setup(FakeBackend::default().with_discount("TEN", DiscountKind::Percentage, dec!(10)));
        let applied = resolver
            .apply(&mut session, " TEN ", DiscountSource::Manual)
            .await
            .unwrap();
        assert_eq!(applied.code, "TEN");
        assert_eq!(session.discount_code.as_deref(), Some("TEN"));
        assert_eq!(session.cart.discount().unwrap().amount(session.cart.items()), dec!(5.00));

        DiscountResolver::remove(&mut session);
        assert!(session.discount_code.is_none());
        assert!(session.cart.discount().is_none());
    }

    #[tokio::test]
    async fn rejected_code_leaves_cart_untouched() {
        let (resolver, _, mut session) =
            setup(FakeBackend::default().with_discount("TEN", DiscountKind::Percentage, dec!(10)));
        resolver
            .apply(&mut session, "TEN", DiscountSource::Manual)
            .await
            .unwrap();
        let before = session.clone();

        let err = resolver
            .apply(&mut session, "BOGUS", DiscountSource::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Rejected { ref reason, .. } if reason == "Discount code not found"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(session, before);

        let err = resolver
            .apply(&mut session, "OFFLINE", DiscountSource::Manual)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(session, before);
    }

    #[tokio::test]
    async fn referral_beats_holding_gated_beats_account() {
        let backend = FakeBackend::default()
            .with_discount("ACCT", DiscountKind::Percentage, dec!(50))
            .with_discount("GOLD", DiscountKind::Percentage, dec!(20))
            .with_discount("SILVER", DiscountKind::Percentage, dec!(30))
            .with_discount("REF", DiscountKind::Fixed, dec!(1));
        let (resolver, _, mut session) = setup(backend);

        let candidates = vec![
            DiscountCandidate::new("ACCT", DiscountSource::Account),
            DiscountCandidate::new("SILVER", DiscountSource::HoldingGated { tier: 1 }),
            DiscountCandidate::new("GOLD", DiscountSource::HoldingGated { tier: 3 }),
            DiscountCandidate::new("REF", DiscountSource::Referral),
        ];
        let winner = resolver.resolve(&mut session, &candidates).await.unwrap();
        assert_eq!(winner.code, "REF");

        let winner = resolver.resolve(&mut session, &candidates[..3]).await.unwrap();
        assert_eq!(winner.code, "GOLD");
    }

    #[tokio::test]
    async fn best_account_discount_wins_and_invalid_are_skipped() {
        let backend = FakeBackend::default()
            .with_discount("PCT10", DiscountKind::Percentage, dec!(10))
            .with_discount("FIXED8", DiscountKind::Fixed, dec!(8));
        let (resolver, backend, mut session) = setup(backend);

        let candidates = vec![
            DiscountCandidate::new("EXPIRED", DiscountSource::Referral),
            DiscountCandidate::new("PCT10", DiscountSource::Account),
            DiscountCandidate::new("FIXED8", DiscountSource::Account),
        ];
        let winner = resolver.resolve(&mut session, &candidates).await.unwrap();
        assert_eq!(winner.code, "FIXED8");
        assert_eq!(backend.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn no_valid_candidate_means_no_discount() {
        let (resolver, _, mut session) = setup(FakeBackend::default());
        let candidates = vec![DiscountCandidate::new("NOPE", DiscountSource::Account)];
        assert!(resolver.resolve(&mut session, &candidates).await.is_none());
        assert!(session.cart.discount().is_none());
    }

    #[tokio::test]
    async fn gift_card_expiry_is_checked() {
        let backend = FakeBackend::default()
            .with_gift_card("OLD", dec!(10), Some(1_000))
            .with_gift_card("NEW", dec!(10), Some(5_000))
            .with_gift_card("EMPTY", dec!(0), None);
        let (resolver, _, mut session) = setup(backend);
        let now = UnixTimestamp::from_secs(2_000);

        let err = resolver
            .apply_gift_card(&mut session, "OLD", now)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Expired { .. }));
        assert!(session.cart.gift_card().is_none());

        assert!(resolver.apply_gift_card(&mut session, "EMPTY", now).await.is_err());

        let card = resolver.apply_gift_card(&mut session, "NEW", now).await.unwrap();
        assert_eq!(card.balance, dec!(10));
        assert_eq!(session.gift_card_code.as_deref(), Some("NEW"));

        DiscountResolver::remove_gift_card(&mut session);
        assert!(session.gift_card_code.is_none());
    }

    #[tokio::test]
    async fn restore_drops_codes_that_no_longer_validate() {
        let backend =
            FakeBackend::default().with_discount("TEN", DiscountKind::Percentage, dec!(10));
        let (resolver, _, mut session) = setup(backend);
        session.discount_code = Some("TEN".into());
        session.gift_card_code = Some("GONE".into());

        assert!(resolver.restore(&mut session, UnixTimestamp::from_secs(0)).await);
        assert_eq!(session.cart.discount().unwrap().code, "TEN");
        assert!(session.gift_card_code.is_none());
    }

    #[tokio::test]
    async fn restore_keeps_codes_when_validation_is_unreachable() {
        let (resolver, _, mut session) = setup(FakeBackend::default());
        session.discount_code = Some("OFFLINE".into());
        session.gift_card_code = Some("OFFLINE-CARD".into());

        assert!(!resolver.restore(&mut session, UnixTimestamp::from_secs(0)).await);
        assert_eq!(session.discount_code.as_deref(), Some("OFFLINE"));
        assert_eq!(session.gift_card_code.as_deref(), Some("OFFLINE-CARD"));
    }

    #[tokio::test]
    async fn restore_keeps_applied_discount_through_an_outage() {
        let backend =
            FakeBackend::default().with_discount("TEN", DiscountKind::Percentage, dec!(10));
        let (resolver, _, mut session) = setup(backend);
        resolver
            .apply(&mut session, "TEN", DiscountSource::Manual)
            .await
            .unwrap();
        let before = session.clone();
        session.discount_code = Some("OFFLINE".into());

        assert!(!resolver.restore(&mut session, UnixTimestamp::from_secs(0)).await);
        assert_eq!(session.cart.discount(), before.cart.discount());
        assert_eq!(session.discount_code.as_deref(), Some("OFFLINE"));
    }
}
