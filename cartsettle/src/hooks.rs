//! Lifecycle hooks for checkout settlement.
//!
//! Hooks observe three points of the order lifecycle:
//!
//! - **After order created**: the settlement became an order
//! - **On identity lost**: a previously identified session reached order
//!   creation without an identity
//! - **On materialization failed**: payment settled but order creation failed
//!
//! All methods default to no-ops. Hooks run in registration order and every
//! registered hook runs; none of them can alter the outcome.

use std::fmt::{self, Debug};

use crate::BoxFuture;
use crate::attempt::{OrderId, PaymentMethod};
use crate::materializer::Order;
use crate::proof::SettlementProof;

/// Context passed to [`CheckoutHooks::after_order_created`].
#[derive(Debug, Clone)]
pub struct OrderCreatedContext {
    /// Session the order belongs to.
    pub session_id: String,
    /// Attempt that settled.
    pub order_id: OrderId,
    /// Rail used.
    pub method: PaymentMethod,
    /// Settlement proof.
    pub proof: SettlementProof,
    /// The created order.
    pub order: Order,
}

/// Context passed to [`CheckoutHooks::on_identity_lost`].
#[derive(Debug, Clone)]
pub struct IdentityLostContext {
    /// Affected session.
    pub session_id: String,
    /// Attempt being materialized.
    pub order_id: OrderId,
}

/// Context passed to [`CheckoutHooks::on_materialization_failed`].
#[derive(Debug, Clone)]
pub struct MaterializationFailedContext {
    /// Affected session.
    pub session_id: String,
    /// Attempt that settled.
    pub order_id: OrderId,
    /// Proof the user must keep.
    pub proof: SettlementProof,
    /// Failure message.
    pub error: String,
}

/// Checkout lifecycle hooks.
///
/// This trait is dyn-compatible for use in heterogeneous hook lists.
pub trait CheckoutHooks: Send + Sync {
    /// Called after the order store created the order.
    fn after_order_created<'a>(&'a self, _ctx: &'a OrderCreatedContext) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Called when a previously identified session lost its identity. The
    /// order proceeds anonymously regardless.
    fn on_identity_lost<'a>(&'a self, _ctx: &'a IdentityLostContext) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// Called when order creation failed after settlement.
    fn on_materialization_failed<'a>(
        &'a self,
        _ctx: &'a MaterializationFailedContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Ordered list of registered hooks.
#[derive(Default)]
pub struct HookSet {
    hooks: Vec<Box<dyn CheckoutHooks>>,
}

impl Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &format!("[{} hooks]", self.hooks.len()))
            .finish()
    }
}

impl HookSet {
    /// Registers a hook. Hooks execute in registration order.
    pub fn add(&mut self, hook: impl CheckoutHooks + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns `true` if no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) async fn order_created(&self, ctx: &OrderCreatedContext) {
        for hook in &self.hooks {
            hook.after_order_created(ctx).await;
        }
    }

    pub(crate) async fn identity_lost(&self, ctx: &IdentityLostContext) {
        for hook in &self.hooks {
            hook.on_identity_lost(ctx).await;
        }
    }

    pub(crate) async fn materialization_failed(&self, ctx: &MaterializationFailedContext) {
        for hook in &self.hooks {
            hook.on_materialization_failed(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    impl CheckoutHooks for Counter {
        fn on_identity_lost<'a>(&'a self, _ctx: &'a IdentityLostContext) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct Silent;
    impl CheckoutHooks for Silent {}

    #[tokio::test]
    async fn every_hook_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookSet::default();
        hooks.add(Counter(Arc::clone(&count)));
        hooks.add(Silent);
        hooks.add(Counter(Arc::clone(&count)));
        assert_eq!(hooks.len(), 3);

        hooks
            .identity_lost(&IdentityLostContext {
                session_id: "s".into(),
                order_id: OrderId::from("o"),
            })
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
