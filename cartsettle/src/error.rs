//! Checkout error taxonomy.

use rust_decimal::Decimal;

use crate::BoxError;
use crate::attempt::PaymentMethod;
use crate::cart::CartError;
use crate::materializer::MaterializeError;
use crate::proof::SettlementProof;
use crate::rail::RailError;
use crate::resolver::ResolveError;
use crate::session::SessionError;
use crate::shipping::ShippingError;

/// How an error affects the checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; shown inline, cart state untouched.
    Validation,
    /// The user backed out; only the current attempt is reset.
    Cancelled,
    /// Network or provider failure; retry is offered, no transition occurs.
    Transient,
    /// A previously identified session lost its identity.
    IdentityLost,
    /// Payment settled but the order could not be created. Terminal.
    Materialization,
    /// The operation is not valid in the current state.
    InvalidTransition,
}

/// Errors surfaced by the checkout orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    /// The operation is not allowed in the current state.
    #[error("cannot {operation} while in {state} state")]
    InvalidTransition {
        /// Operation that was attempted.
        operation: &'static str,
        /// Name of the current state.
        state: &'static str,
    },
    /// Checkout cannot start on an empty cart.
    #[error("cart is empty")]
    EmptyCart,
    /// A cart edit was rejected.
    #[error(transparent)]
    Cart(#[from] CartError),
    /// The shipping address is incomplete.
    #[error("address is missing required fields: {}", .0.join(", "))]
    InvalidAddress(Vec<&'static str>),
    /// Discount or gift-card resolution failed.
    #[error(transparent)]
    Discount(#[from] ResolveError),
    /// Shipping selection failed.
    #[error(transparent)]
    Shipping(#[from] ShippingError),
    /// The shipping/tax calculation could not be fetched.
    #[error("shipping calculation failed: {0}")]
    Quote(#[source] BoxError),
    /// The chosen rail cannot settle the current charge.
    #[error("{method} is not available for a charge of {amount}")]
    MethodNotAllowed {
        /// Requested rail.
        method: PaymentMethod,
        /// Current final charge.
        amount: Decimal,
    },
    /// The rail reported an error.
    #[error(transparent)]
    Rail(#[from] RailError),
    /// The session could not be loaded or persisted.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Identity was lost between checkout start and order creation.
    #[error("identity lost for session {session_id}")]
    IdentityLost {
        /// Affected session.
        session_id: String,
    },
    /// A payment on this session has not become an order yet, so no other
    /// attempt may start and the priced cart may not change.
    #[error("cannot {operation}: payment {proof} has not become an order yet")]
    SettlementPending {
        /// Operation that was attempted.
        operation: &'static str,
        /// Proof of the outstanding payment.
        proof: Box<SettlementProof>,
    },
    /// Payment settled but the order could not be created.
    #[error("order creation failed for settled payment ({proof}): {source}")]
    Materialization {
        /// Proof to hand to support.
        proof: Box<SettlementProof>,
        /// Underlying failure.
        #[source]
        source: MaterializeError,
    },
}

impl CheckoutError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } | Self::SettlementPending { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::EmptyCart
            | Self::Cart(_)
            | Self::InvalidAddress(_)
            | Self::Shipping(_)
            | Self::MethodNotAllowed { .. } => ErrorKind::Validation,
            Self::Discount(e) => e.kind(),
            Self::Rail(e) => e.kind(),
            Self::Quote(_) | Self::Session(_) => ErrorKind::Transient,
            Self::IdentityLost { .. } => ErrorKind::IdentityLost,
            Self::Materialization { .. } => ErrorKind::Materialization,
        }
    }

    /// The settlement proof the user must keep, if any.
    #[must_use]
    pub fn proof(&self) -> Option<&SettlementProof> {
        match self {
            Self::Materialization { proof, .. } | Self::SettlementPending { proof, .. } => {
                Some(&**proof)
            }
            _ => None,
        }
    }
}
