//! Settlement orchestrator: the checkout state machine.
//!
//! ```text
//! Idle -> Shipping -> [ShippingMethod] -> Payment -> Success
//!                                                 \-> MaterializationFailed
//! ```
//!
//! Digital-only carts skip straight from `Idle` to `Payment`. Every rail
//! reports completion through the event channel; [`Orchestrator::handle_event`]
//! is the single place where a proof becomes an order.
//!
//! While a payment on the session has not become an order, whether its
//! transaction is unconfirmed or its order creation failed, no second attempt
//! can start and the cart it was priced on cannot change.

use std::fmt::{self, Debug};
use std::sync::Arc;

use alloy_primitives::{TxHash, U256};
use serde::{Deserialize, Serialize};

use crate::attempt::{AttemptStatus, OrderId, PaymentAttempt, PaymentMethod, PaymentTicket};
use crate::cart::{Cart, CartError, CheckoutSnapshot, PostalAddress};
use crate::discount::{AppliedDiscount, AppliedGiftCard, DiscountSource};
use crate::error::CheckoutError;
use crate::event::{EventOrigin, EventReceiver, EventSender, SettlementEvent, channel};
use crate::hooks::{
    CheckoutHooks, HookSet, IdentityLostContext, MaterializationFailedContext,
    OrderCreatedContext,
};
use crate::identity::{Identity, IdentityChain, IdentityResolution};
use crate::materializer::{Materialized, Order, OrderMaterializer, OrderStore};
use crate::pricing::{PriceBreakdown, PricingCalculator};
use crate::proof::SettlementProof;
use crate::rail::{PaymentRail, RailError};
use crate::resolver::{DiscountCandidate, DiscountResolver, DiscountValidator, GiftCardValidator};
use crate::session::{
    CheckoutSession, PendingSettlement, PendingStatus, RewardClaim, SessionStore,
};
use crate::shipping::{QuoteRequest, ShippingOutcome, ShippingQuoter, ShippingSelector};
use crate::timestamp::UnixTimestamp;

/// Notice shown when the address yields no shipping rates.
pub const NO_SHIPPING_NOTICE: &str =
    "No shipping options are available for this address. Please revise it.";

/// Checkout step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum CheckoutState {
    /// Checkout has not started.
    Idle,
    /// Collecting the shipping address.
    Shipping {
        /// Shown when the last address produced no rates.
        notice: Option<String>,
    },
    /// The user has to pick a shipping rate.
    ShippingMethod {
        /// Options on offer.
        rates: Vec<crate::shipping::ShippingRate>,
    },
    /// Waiting for a settlement.
    Payment,
    /// The order exists.
    Success {
        /// The created order.
        order: Order,
    },
    /// Payment settled but the order could not be created.
    MaterializationFailed {
        /// Proof to hand to support.
        proof: SettlementProof,
        /// Failure message.
        error: String,
    },
}

impl CheckoutState {
    /// Short name used in errors and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Shipping { .. } => "shipping",
            Self::ShippingMethod { .. } => "shipping-method",
            Self::Payment => "payment",
            Self::Success { .. } => "success",
            Self::MaterializationFailed { .. } => "materialization-failed",
        }
    }

    /// Returns `true` once the checkout has reached an end state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success { .. } | Self::MaterializationFailed { .. }
        )
    }
}

/// What happened to a settlement event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The proof was new and belonged to the started attempt.
    Accepted,
    /// The proof had already been processed.
    Duplicate,
    /// No user-initiated attempt matches the event.
    Unattributed,
}

/// External collaborators of a checkout.
#[derive(Clone)]
pub struct CheckoutServices {
    /// Shipping/tax calculation.
    pub quoter: Arc<dyn ShippingQuoter>,
    /// Discount validation.
    pub discounts: Arc<dyn DiscountValidator>,
    /// Gift-card validation.
    pub gift_cards: Arc<dyn GiftCardValidator>,
    /// Order creation.
    pub orders: Arc<dyn OrderStore>,
    /// Session persistence.
    pub sessions: Arc<dyn SessionStore>,
}

impl Debug for CheckoutServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckoutServices").finish_non_exhaustive()
    }
}

impl CheckoutServices {
    /// Uses one commerce backend for every API except session storage.
    pub fn from_commerce<C>(commerce: Arc<C>, sessions: Arc<dyn SessionStore>) -> Self
    where
        C: ShippingQuoter + DiscountValidator + GiftCardValidator + OrderStore + 'static,
    {
        let quoter: Arc<dyn ShippingQuoter> = Arc::<C>::clone(&commerce);
        let discounts: Arc<dyn DiscountValidator> = Arc::<C>::clone(&commerce);
        let gift_cards: Arc<dyn GiftCardValidator> = Arc::<C>::clone(&commerce);
        Self {
            quoter,
            discounts,
            gift_cards,
            orders: commerce,
            sessions,
        }
    }
}

/// The cart and pricing an attempt was started with.
#[derive(Debug, Clone)]
struct PricedAttempt {
    order_id: OrderId,
    cart: Cart,
    breakdown: PriceBreakdown,
}

/// Drives one checkout session.
pub struct Orchestrator {
    session: CheckoutSession,
    state: CheckoutState,
    attempt: Option<PaymentAttempt>,
    priced: Option<PricedAttempt>,
    services: CheckoutServices,
    resolver: DiscountResolver,
    materializer: OrderMaterializer,
    selector: ShippingSelector,
    pricing: PricingCalculator,
    hooks: HookSet,
    sender: EventSender,
    receiver: EventReceiver,
}

impl Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.session.id)
            .field("state", &self.state)
            .field("attempt", &self.attempt)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator in the `Idle` state.
    pub fn new(session: CheckoutSession, services: CheckoutServices) -> Self {
        let (sender, receiver) = channel();
        Self {
            resolver: DiscountResolver::new(
                Arc::clone(&services.discounts),
                Arc::clone(&services.gift_cards),
            ),
            materializer: OrderMaterializer::new(
                Arc::clone(&services.orders),
                IdentityChain::new(),
            ),
            session,
            state: CheckoutState::Idle,
            attempt: None,
            priced: None,
            services,
            selector: ShippingSelector::new(),
            pricing: PricingCalculator::default(),
            hooks: HookSet::default(),
            sender,
            receiver,
        }
    }

    /// Uses the given identity fallback chain.
    #[must_use]
    pub fn with_identity_chain(mut self, identities: IdentityChain) -> Self {
        self.materializer = OrderMaterializer::new(Arc::clone(&self.services.orders), identities);
        self
    }

    /// Uses the given shipping selector.
    #[must_use]
    pub const fn with_selector(mut self, selector: ShippingSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Uses the given pricing calculator.
    #[must_use]
    pub const fn with_pricing(mut self, pricing: PricingCalculator) -> Self {
        self.pricing = pricing;
        self
    }

    /// Registers a lifecycle hook. Hooks execute in registration order.
    #[must_use]
    pub fn with_hook(mut self, hook: impl CheckoutHooks + 'static) -> Self {
        self.hooks.add(hook);
        self
    }

    /// A sender for completion sources outside the orchestrator.
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.sender.clone()
    }

    /// Current step.
    #[must_use]
    pub const fn state(&self) -> &CheckoutState {
        &self.state
    }

    /// The session.
    #[must_use]
    pub const fn session(&self) -> &CheckoutSession {
        &self.session
    }

    /// The cart.
    #[must_use]
    pub const fn cart(&self) -> &Cart {
        &self.session.cart
    }

    /// The current payment attempt.
    #[must_use]
    pub const fn attempt(&self) -> Option<&PaymentAttempt> {
        self.attempt.as_ref()
    }

    /// Prices the cart as it stands.
    #[must_use]
    pub fn breakdown(&self) -> PriceBreakdown {
        self.pricing.price(&self.session.cart)
    }

    /// Sets the explicit session identity.
    pub fn set_identity(&mut self, identity: Option<Identity>) {
        self.session.set_identity(identity);
    }

    fn invalid(&self, operation: &'static str) -> CheckoutError {
        CheckoutError::InvalidTransition {
            operation,
            state: self.state.name(),
        }
    }

    /// Refuses pricing changes once checkout ended or while a payment is
    /// outstanding.
    fn ensure_open(&self, operation: &'static str) -> Result<(), CheckoutError> {
        if self.state.is_terminal() {
            return Err(self.invalid(operation));
        }
        self.ensure_settled(operation)
    }

    fn ensure_settled(&self, operation: &'static str) -> Result<(), CheckoutError> {
        match self.session.outstanding() {
            Some(pending) => Err(CheckoutError::SettlementPending {
                operation,
                proof: Box::new(pending.proof.clone()),
            }),
            None => Ok(()),
        }
    }

    /// Cart and pricing captured when `order_id` started, falling back to the
    /// cart as it stands.
    fn priced_for(&self, order_id: &OrderId) -> (Cart, PriceBreakdown) {
        match &self.priced {
            Some(priced) if priced.order_id == *order_id => {
                (priced.cart.clone(), priced.breakdown)
            }
            _ => (self.session.cart.clone(), self.breakdown()),
        }
    }

    fn reset_attempt(&mut self) {
        if self
            .attempt
            .as_ref()
            .is_some_and(|a| a.status() != AttemptStatus::Completed)
        {
            self.attempt = None;
        }
    }

    async fn persist(&self) -> Result<(), CheckoutError> {
        self.services.sessions.persist(&self.session).await?;
        Ok(())
    }

    /// Persists after a settlement was recorded. The proof is already in
    /// memory, so a storage failure must not abort order creation.
    async fn persist_best_effort(&self) {
        if let Err(_e) = self.persist().await {
            #[cfg(feature = "telemetry")]
            tracing::warn!(session = %self.session.id, error = %_e, "failed to persist session");
        }
    }

    fn apply_shipping_outcome(&mut self) {
        self.state = match self.selector.apply(&mut self.session.cart) {
            ShippingOutcome::Selected(_) => CheckoutState::Payment,
            ShippingOutcome::Manual(rates) => CheckoutState::ShippingMethod { rates },
            ShippingOutcome::NoneAvailable => {
                #[cfg(feature = "telemetry")]
                tracing::info!(session = %self.session.id, "no shipping rates for address");
                CheckoutState::Shipping {
                    notice: Some(NO_SHIPPING_NOTICE.to_owned()),
                }
            }
        };
    }

    /// Discount or gift card changed: drop the attempt and re-run shipping
    /// selection if free-shipping eligibility flipped.
    fn pricing_changed(&mut self) {
        self.reset_attempt();
        let cart = &self.session.cart;
        let has_free = cart.shipping().is_some_and(|r| r.is_free_shipping());
        let grants_free = cart
            .discount()
            .is_some_and(|d| d.grants_free_shipping(cart.items()));
        let selecting = matches!(
            self.state,
            CheckoutState::Payment | CheckoutState::ShippingMethod { .. }
        );
        if selecting && cart.requires_shipping() && has_free != grants_free {
            self.apply_shipping_outcome();
        }
    }

    /// Starts checkout.
    ///
    /// # Errors
    ///
    /// Fails outside `Idle` or on an empty cart.
    pub async fn start(&mut self) -> Result<&CheckoutState, CheckoutError> {
        if self.state != CheckoutState::Idle {
            return Err(self.invalid("start checkout"));
        }
        self.ensure_settled("start checkout")?;
        if self.session.cart.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        self.attempt = None;
        self.materializer.identities().resolve(&mut self.session);
        if self.session.cart.requires_shipping() {
            self.state = CheckoutState::Shipping { notice: None };
        } else {
            let subtotal = self.session.cart.subtotal();
            self.session.cart.snapshot = Some(CheckoutSnapshot::digital(subtotal));
            self.session.cart.shipping = None;
            self.state = CheckoutState::Payment;
        }
        self.persist().await?;
        Ok(&self.state)
    }

    /// Submits the shipping address and selects a rate.
    ///
    /// # Errors
    ///
    /// Fails outside the shipping steps, on an incomplete address, or when
    /// the calculation service fails; the state is unchanged in each case.
    pub async fn submit_address(
        &mut self,
        address: PostalAddress,
    ) -> Result<&CheckoutState, CheckoutError> {
        if !matches!(
            self.state,
            CheckoutState::Shipping { .. } | CheckoutState::ShippingMethod { .. }
        ) {
            return Err(self.invalid("submit an address"));
        }
        let missing = address.missing_fields();
        if !missing.is_empty() {
            return Err(CheckoutError::InvalidAddress(missing));
        }
        let request = QuoteRequest {
            line_items: self.session.cart.items().to_vec(),
            shipping_address: address,
        };
        let snapshot = self
            .services
            .quoter
            .quote(&request)
            .await
            .map_err(CheckoutError::Quote)?;
        self.session.shipping_address = Some(request.shipping_address);
        self.session.cart.snapshot = Some(snapshot);
        self.reset_attempt();
        self.apply_shipping_outcome();
        self.persist().await?;
        Ok(&self.state)
    }

    /// Picks a rate by handle.
    ///
    /// # Errors
    ///
    /// Fails outside `ShippingMethod` or for an unknown handle.
    pub async fn choose_shipping(&mut self, handle: &str) -> Result<&CheckoutState, CheckoutError> {
        if !matches!(self.state, CheckoutState::ShippingMethod { .. }) {
            return Err(self.invalid("choose shipping"));
        }
        ShippingSelector::choose(&mut self.session.cart, handle)?;
        self.state = CheckoutState::Payment;
        self.persist().await?;
        Ok(&self.state)
    }

    /// Applies a discount code typed by the user.
    ///
    /// # Errors
    ///
    /// Returns a validation or transient error and leaves the cart untouched
    /// if the code cannot be applied.
    pub async fn apply_discount(&mut self, code: &str) -> Result<AppliedDiscount, CheckoutError> {
        self.ensure_open("apply a discount")?;
        let discount = self
            .resolver
            .apply(&mut self.session, code, DiscountSource::Manual)
            .await?;
        self.pricing_changed();
        self.persist().await?;
        Ok(discount)
    }

    /// Picks the best discount among candidates from the discount sources.
    ///
    /// # Errors
    ///
    /// Fails in a terminal state or if the session cannot be persisted.
    pub async fn resolve_discounts(
        &mut self,
        candidates: &[DiscountCandidate],
    ) -> Result<Option<AppliedDiscount>, CheckoutError> {
        self.ensure_open("resolve discounts")?;
        let resolved = self.resolver.resolve(&mut self.session, candidates).await;
        if resolved.is_some() {
            self.pricing_changed();
            self.persist().await?;
        }
        Ok(resolved)
    }

    /// Removes the active discount.
    ///
    /// # Errors
    ///
    /// Fails in a terminal state or if the session cannot be persisted.
    pub async fn remove_discount(&mut self) -> Result<Option<AppliedDiscount>, CheckoutError> {
        self.ensure_open("remove the discount")?;
        let removed = DiscountResolver::remove(&mut self.session);
        self.pricing_changed();
        self.persist().await?;
        Ok(removed)
    }

    /// Applies a gift card.
    ///
    /// # Errors
    ///
    /// Returns a validation or transient error and leaves the cart untouched
    /// if the card cannot be applied.
    pub async fn apply_gift_card(&mut self, code: &str) -> Result<AppliedGiftCard, CheckoutError> {
        self.ensure_open("apply a gift card")?;
        let card = self
            .resolver
            .apply_gift_card(&mut self.session, code, UnixTimestamp::now())
            .await?;
        self.pricing_changed();
        self.persist().await?;
        Ok(card)
    }

    /// Removes the active gift card.
    ///
    /// # Errors
    ///
    /// Fails in a terminal state or if the session cannot be persisted.
    pub async fn remove_gift_card(&mut self) -> Result<Option<AppliedGiftCard>, CheckoutError> {
        self.ensure_open("remove the gift card")?;
        let removed = DiscountResolver::remove_gift_card(&mut self.session);
        self.pricing_changed();
        self.persist().await?;
        Ok(removed)
    }

    /// Re-validates discount and gift-card codes persisted on the session.
    ///
    /// A change in the applied discount or gift card re-prices the checkout
    /// like a manual change would.
    ///
    /// # Errors
    ///
    /// Fails in a terminal state, while a payment is outstanding, or if the
    /// session cannot be persisted.
    pub async fn restore_codes(&mut self) -> Result<(), CheckoutError> {
        self.ensure_open("restore discount codes")?;
        let changed = self
            .resolver
            .restore(&mut self.session, UnixTimestamp::now())
            .await;
        if changed {
            self.pricing_changed();
        }
        self.persist().await
    }

    /// Edits line items. Only allowed while checkout is not in progress.
    ///
    /// # Errors
    ///
    /// Fails outside `Idle` or if the edit is invalid.
    pub async fn edit_cart<F>(&mut self, edit: F) -> Result<(), CheckoutError>
    where
        F: FnOnce(&mut Cart) -> Result<(), CartError>,
    {
        if self.state != CheckoutState::Idle {
            return Err(self.invalid("edit the cart"));
        }
        self.ensure_settled("edit the cart")?;
        edit(&mut self.session.cart)?;
        self.session.cart.clear_checkout();
        self.reset_attempt();
        self.persist().await
    }

    /// Starts a payment attempt on `method` and returns the rail ticket.
    ///
    /// Signature claims are only allowed for a zero charge and funded rails
    /// only for a non-zero charge.
    ///
    /// # Errors
    ///
    /// Fails outside `Payment`, while an earlier payment is outstanding, or
    /// if the method does not fit the charge.
    pub async fn begin_payment(
        &mut self,
        method: PaymentMethod,
    ) -> Result<PaymentTicket, CheckoutError> {
        if self.state != CheckoutState::Payment {
            return Err(self.invalid("begin payment"));
        }
        self.ensure_settled("begin payment")?;
        let breakdown = self.breakdown();
        let charge = breakdown.charge;
        let allowed = if method.is_funded() {
            !charge.is_zero()
        } else {
            charge.is_zero()
        };
        if !allowed {
            return Err(CheckoutError::MethodNotAllowed {
                method,
                amount: charge.amount,
            });
        }
        let mut attempt = PaymentAttempt::new(method);
        attempt.start();
        let identity = self
            .materializer
            .identities()
            .resolve(&mut self.session)
            .identity()
            .map_or(U256::ZERO, |i| i.0);
        let cart = &self.session.cart;
        let ticket = PaymentTicket {
            order_id: attempt.order_id().clone(),
            amount: charge.amount,
            currency: cart.currency().to_owned(),
            identity,
            discount_code: self.session.discount_code.clone().unwrap_or_default(),
            item_count: cart.item_count(),
            reward_tokens: if method == PaymentMethod::SignatureClaim {
                cart.reward_tokens()
            } else {
                Vec::new()
            },
        };
        #[cfg(feature = "telemetry")]
        tracing::info!(
            order_id = %ticket.order_id,
            method = %method,
            amount = %ticket.amount,
            "payment attempt started"
        );
        self.priced = Some(PricedAttempt {
            order_id: ticket.order_id.clone(),
            cart: self.session.cart.clone(),
            breakdown,
        });
        self.attempt = Some(attempt);
        self.persist().await?;
        Ok(ticket)
    }

    /// Marks the current attempt failed. A new attempt gets a new order id.
    pub fn fail_attempt(&mut self) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.fail();
        }
    }

    /// Runs a full payment on `rail` and processes the resulting event.
    ///
    /// # Errors
    ///
    /// Rail errors are returned after the attempt is marked failed, except
    /// for a broadcast transaction whose receipt was not observed: that one
    /// is recorded as an unconfirmed settlement and the attempt stays open
    /// for its completion. A materialization failure is returned with the
    /// proof attached.
    pub async fn pay_with(
        &mut self,
        rail: &dyn PaymentRail,
    ) -> Result<&CheckoutState, CheckoutError> {
        let ticket = self.begin_payment(rail.method()).await?;
        match rail.settle(&ticket).await {
            Ok(proof) => {
                self.sender
                    .payment_completed(ticket.order_id, proof, EventOrigin::Rail);
            }
            Err(RailError::Unconfirmed { tx_hash, reason }) => {
                #[cfg(feature = "telemetry")]
                tracing::error!(
                    order_id = %ticket.order_id,
                    tx = %tx_hash,
                    reason = %reason,
                    "transfer submitted but not confirmed"
                );
                self.record_unconfirmed(&ticket.order_id, tx_hash, reason.clone());
                self.persist_best_effort().await;
                return Err(RailError::Unconfirmed { tx_hash, reason }.into());
            }
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(order_id = %ticket.order_id, error = %err, "payment rail failed");
                if let RailError::RewardsIncomplete { claimed, .. } = &err {
                    self.session
                        .reward_claims
                        .extend(claimed.iter().map(|&(token, tx_hash)| RewardClaim {
                            order_id: ticket.order_id.clone(),
                            token,
                            tx_hash,
                        }));
                }
                self.fail_attempt();
                self.persist_best_effort().await;
                return Err(err.into());
            }
        }
        self.drain().await?;
        Ok(&self.state)
    }

    fn record_unconfirmed(&mut self, order_id: &OrderId, tx_hash: TxHash, reason: String) {
        let Some(method) = self.attempt.as_ref().map(PaymentAttempt::method) else {
            return;
        };
        let (cart, breakdown) = self.priced_for(order_id);
        self.session.pending.push(PendingSettlement {
            order_id: order_id.clone(),
            method,
            proof: SettlementProof::Transaction { tx_hash },
            cart,
            breakdown,
            status: PendingStatus::Unconfirmed { reason },
        });
    }

    /// Completes the unconfirmed payment with a proof observed on-chain.
    ///
    /// # Errors
    ///
    /// Fails if no payment is unconfirmed, or with the materialization
    /// failure if order creation fails.
    pub async fn confirm_unconfirmed(
        &mut self,
        proof: SettlementProof,
    ) -> Result<&CheckoutState, CheckoutError> {
        let Some(order_id) = self.session.unconfirmed().map(|p| p.order_id.clone()) else {
            return Err(self.invalid("confirm a submitted payment"));
        };
        self.sender
            .payment_completed(order_id, proof, EventOrigin::Watcher);
        self.drain().await
    }

    /// Drops the unconfirmed payment after its transaction was found to have
    /// failed, so a new attempt can start.
    ///
    /// # Errors
    ///
    /// Fails if no payment is unconfirmed or the session cannot be persisted.
    pub async fn abandon_unconfirmed(&mut self) -> Result<&CheckoutState, CheckoutError> {
        let Some(order_id) = self.session.unconfirmed().map(|p| p.order_id.clone()) else {
            return Err(self.invalid("abandon a submitted payment"));
        };
        #[cfg(feature = "telemetry")]
        tracing::warn!(order_id = %order_id, "abandoning unconfirmed payment");
        self.session.pending.retain(|p| p.order_id != order_id);
        if self
            .attempt
            .as_ref()
            .is_some_and(|a| *a.order_id() == order_id)
        {
            self.fail_attempt();
        }
        self.persist().await?;
        Ok(&self.state)
    }

    /// Processes every event already queued.
    ///
    /// # Errors
    ///
    /// Returns the first materialization failure.
    pub async fn drain(&mut self) -> Result<&CheckoutState, CheckoutError> {
        while let Some(event) = self.receiver.try_recv() {
            self.handle_event(event).await?;
        }
        Ok(&self.state)
    }

    /// Waits for events until checkout reaches a terminal state.
    ///
    /// The orchestrator holds a sender of its own, so this only returns once
    /// a terminal state is reached; wrap it in a timeout when waiting on
    /// external callbacks.
    ///
    /// # Errors
    ///
    /// Returns the materialization failure that ended the checkout.
    pub async fn run_until_settled(&mut self) -> Result<&CheckoutState, CheckoutError> {
        while !self.state.is_terminal() {
            let Some(event) = self.receiver.recv().await else {
                break;
            };
            self.handle_event(event).await?;
        }
        Ok(&self.state)
    }

    /// Handles one settlement event.
    ///
    /// Events whose proof was already processed, or that do not belong to the
    /// attempt the user started, are dropped without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`CheckoutError::Materialization`] if order creation fails.
    pub async fn handle_event(
        &mut self,
        event: SettlementEvent,
    ) -> Result<EventOutcome, CheckoutError> {
        let SettlementEvent::PaymentCompleted {
            order_id,
            proof,
            origin: _origin,
        } = event;

        if self.session.processed.contains(&proof) {
            #[cfg(feature = "telemetry")]
            tracing::debug!(proof = %proof.key(), origin = ?_origin, "dropping duplicate settlement");
            return Ok(EventOutcome::Duplicate);
        }
        let attributable = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.accepts(&order_id));
        if !attributable {
            #[cfg(feature = "telemetry")]
            tracing::warn!(
                order_id = %order_id,
                proof = %proof.key(),
                origin = ?_origin,
                "dropping settlement not started in this session"
            );
            return Ok(EventOutcome::Unattributed);
        }
        if !self.session.processed.insert(&proof) {
            return Ok(EventOutcome::Duplicate);
        }
        let Some(attempt) = self.attempt.as_mut() else {
            return Ok(EventOutcome::Unattributed);
        };
        attempt.complete(proof.clone());
        let method = attempt.method();

        #[cfg(feature = "telemetry")]
        tracing::info!(order_id = %order_id, proof = %proof, origin = ?_origin, "settlement accepted");

        let pending = if let Some(entry) = self.session.pending_mut(&order_id) {
            entry.proof = proof;
            entry.status = PendingStatus::AwaitingOrder;
            entry.clone()
        } else {
            let (cart, breakdown) = self.priced_for(&order_id);
            let pending = PendingSettlement {
                order_id,
                method,
                proof,
                cart,
                breakdown,
                status: PendingStatus::AwaitingOrder,
            };
            self.session.pending.push(pending.clone());
            pending
        };
        self.persist_best_effort().await;
        self.materialize(pending).await?;
        Ok(EventOutcome::Accepted)
    }

    async fn materialize(&mut self, pending: PendingSettlement) -> Result<(), CheckoutError> {
        let result = self
            .materializer
            .materialize(&mut self.session, &pending)
            .await;
        match result {
            Ok(Materialized { order, identity }) => {
                if identity == IdentityResolution::Lost {
                    self.hooks
                        .identity_lost(&IdentityLostContext {
                            session_id: self.session.id.clone(),
                            order_id: pending.order_id.clone(),
                        })
                        .await;
                }
                #[cfg(feature = "telemetry")]
                tracing::info!(order_id = %pending.order_id, order = %order.id, "order created");
                self.session.pending.retain(|p| p.order_id != pending.order_id);
                self.session.order = Some(order.clone());
                self.state = CheckoutState::Success {
                    order: order.clone(),
                };
                self.persist_best_effort().await;
                self.hooks
                    .order_created(&OrderCreatedContext {
                        session_id: self.session.id.clone(),
                        order_id: pending.order_id,
                        method: pending.method,
                        proof: pending.proof,
                        order,
                    })
                    .await;
                Ok(())
            }
            Err(source) => {
                let error = source.to_string();
                #[cfg(feature = "telemetry")]
                tracing::error!(
                    order_id = %pending.order_id,
                    proof = %pending.proof,
                    error = %error,
                    "payment settled but order creation failed"
                );
                if let Some(entry) = self.session.pending_mut(&pending.order_id) {
                    entry.status = PendingStatus::Failed {
                        error: error.clone(),
                    };
                }
                self.state = CheckoutState::MaterializationFailed {
                    proof: pending.proof.clone(),
                    error: error.clone(),
                };
                self.persist_best_effort().await;
                self.hooks
                    .materialization_failed(&MaterializationFailedContext {
                        session_id: self.session.id.clone(),
                        order_id: pending.order_id,
                        proof: pending.proof.clone(),
                        error,
                    })
                    .await;
                Err(CheckoutError::Materialization {
                    proof: Box::new(pending.proof),
                    source,
                })
            }
        }
    }

    /// Navigates back to the address step.
    ///
    /// Discards the snapshot and shipping selection and resets the attempt;
    /// cart contents and codes are kept.
    ///
    /// # Errors
    ///
    /// Fails once the order exists or while a payment is outstanding.
    pub async fn back_to_shipping(&mut self) -> Result<&CheckoutState, CheckoutError> {
        if matches!(self.state, CheckoutState::Success { .. }) {
            return Err(self.invalid("go back to shipping"));
        }
        self.ensure_settled("go back to shipping")?;
        self.session.cart.clear_checkout();
        self.attempt = None;
        self.state = CheckoutState::Shipping { notice: None };
        self.persist().await?;
        Ok(&self.state)
    }

    /// Closes the checkout. The attempt is dropped; settled proofs stay on
    /// the session and a terminal state is kept.
    ///
    /// # Errors
    ///
    /// Fails if the session cannot be persisted.
    pub async fn close(&mut self) -> Result<(), CheckoutError> {
        self.attempt = None;
        if !self.state.is_terminal() {
            self.state = CheckoutState::Idle;
        }
        self.persist().await
    }

    /// Reopens a closed or reloaded checkout.
    ///
    /// A settled payment that never reached the order store is materialized
    /// once. A settlement whose order creation already failed is surfaced as
    /// `MaterializationFailed` without retrying. An unconfirmed payment puts
    /// the checkout back in `Payment` with its attempt open, waiting for
    /// [`Orchestrator::confirm_unconfirmed`] or a watcher event.
    ///
    /// # Errors
    ///
    /// Returns the materialization failure if the single attempt fails.
    pub async fn reopen(&mut self) -> Result<&CheckoutState, CheckoutError> {
        self.attempt = None;
        if let Some(order) = self.session.order.clone() {
            self.state = CheckoutState::Success { order };
            return Ok(&self.state);
        }
        let awaiting = self
            .session
            .pending
            .iter()
            .find(|p| p.status == PendingStatus::AwaitingOrder)
            .cloned();
        if let Some(pending) = awaiting {
            #[cfg(feature = "telemetry")]
            tracing::info!(order_id = %pending.order_id, "materializing settlement found on reopen");
            self.materialize(pending).await?;
            return Ok(&self.state);
        }
        if let Some(pending) = self.session.unconfirmed().cloned() {
            #[cfg(feature = "telemetry")]
            tracing::info!(order_id = %pending.order_id, proof = %pending.proof, "waiting on unconfirmed payment");
            self.priced = Some(PricedAttempt {
                order_id: pending.order_id.clone(),
                cart: pending.cart,
                breakdown: pending.breakdown,
            });
            self.attempt = Some(PaymentAttempt::resume(pending.method, pending.order_id));
            self.state = CheckoutState::Payment;
            return Ok(&self.state);
        }
        self.state = match self.failed_settlement() {
            Some((proof, error)) => CheckoutState::MaterializationFailed { proof, error },
            None => CheckoutState::Idle,
        };
        Ok(&self.state)
    }

    fn failed_settlement(&self) -> Option<(SettlementProof, String)> {
        self.session.pending.iter().find_map(|p| match &p.status {
            PendingStatus::Failed { error } => Some((p.proof.clone(), error.clone())),
            PendingStatus::AwaitingOrder | PendingStatus::Unconfirmed { .. } => None,
        })
    }

    /// Retries order creation for a failed settlement. Only ever called on
    /// explicit operator or user request.
    ///
    /// # Errors
    ///
    /// Fails if there is no failed settlement or the retry fails again.
    pub async fn retry_materialization(&mut self) -> Result<&CheckoutState, CheckoutError> {
        let failed = self
            .session
            .pending
            .iter()
            .find(|p| matches!(p.status, PendingStatus::Failed { .. }))
            .cloned();
        let Some(pending) = failed else {
            return Err(self.invalid("retry order creation"));
        };
        self.materialize(pending).await?;
        Ok(&self.state)
    }
}
