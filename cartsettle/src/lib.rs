#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core of the checkout settlement engine.
//!
//! This crate prices a cart, resolves discounts and gift cards, selects
//! shipping, and drives a payment attempt on one of several rails through to
//! exactly one externally created order. It is transport-agnostic: the
//! commerce backend, the payment aggregator and the chain are reached through
//! traits implemented by separate crates.
//!
//! # Overview
//!
//! A checkout moves `Idle -> Shipping -> [ShippingMethod] -> Payment -> Success`.
//! Every rail reports completion through one event channel, and the
//! [`orchestrator`] deduplicates settlements by proof before an order is
//! materialized. A settled payment whose order creation fails is surfaced
//! with its proof and never retried implicitly.
//!
//! # Modules
//!
//! - [`money`] - Cent rounding, minimum charge policy and amount parsing
//! - [`cart`] - Line items, addresses and the server-side checkout snapshot
//! - [`discount`] - Applied discounts and gift cards
//! - [`pricing`] - The pricing calculator
//! - [`shipping`] - Shipping rates and automatic selection
//! - [`resolver`] - Discount and gift-card validation against the backend
//! - [`identity`] - Customer identity fallback chain
//! - [`proof`] - Settlement proofs and the processed-proof set
//! - [`attempt`] - Payment attempts and rail tickets
//! - [`rail`] - The payment rail trait and rail errors
//! - [`aggregator`] - Hosted aggregator rail with status polling
//! - [`event`] - Completion event channel
//! - [`session`] - Persisted checkout sessions
//! - [`materializer`] - Order creation
//! - [`hooks`] - Lifecycle hooks
//! - [`orchestrator`] - The checkout state machine
//! - [`error`] - Checkout error taxonomy
//! - [`timestamp`] - Unix timestamps
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation for debugging and monitoring

use std::pin::Pin;

pub mod aggregator;
pub mod attempt;
pub mod cart;
pub mod discount;
pub mod error;
pub mod event;
pub mod hooks;
pub mod identity;
pub mod materializer;
pub mod money;
pub mod orchestrator;
pub mod pricing;
pub mod proof;
pub mod rail;
pub mod resolver;
pub mod session;
pub mod shipping;
pub mod timestamp;

/// Boxed future returned by the dyn-compatible traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased error returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
