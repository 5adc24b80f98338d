#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM payment rails for the checkout settlement engine.
//!
//! # Rails
//!
//! - [`DirectTransferRail`] - checks the payer's ERC-20 balance, sends a
//!   `transfer` to the merchant and waits for the receipt
//! - [`SignatureClaimRail`] - for zero-value checkouts, collects an EIP-712
//!   signature over the order and claims any reward tokens in the cart
//!
//! Both implement [`cartsettle::rail::PaymentRail`]; infrastructure failures
//! surface as recoverable provider errors, a signature recovering to the
//! wrong address as a hard failure.
//!
//! # Modules
//!
//! - [`chain`] - Token deployments and amount conversion
//! - [`contract`] - Solidity bindings
//! - [`direct`] - Direct transfer rail
//! - [`claim`] - Signature claim rail, signers and reward claims
//! - [`error`] - EVM rail errors
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation for debugging and monitoring

pub mod chain;
pub mod claim;
pub mod contract;
pub mod direct;
pub mod error;

pub use chain::TokenDeployment;
pub use claim::{ClaimDomain, SignatureClaimRail};
pub use direct::DirectTransferRail;
