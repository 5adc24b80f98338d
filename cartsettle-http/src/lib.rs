#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP clients for the external services of the checkout settlement engine.
//!
//! - [`CommerceClient`] implements the shipping, discount, gift-card, order
//!   and reward-permit traits against one commerce backend
//! - [`AggregatorClient`] implements [`cartsettle::aggregator::AggregatorApi`]
//!
//! Both are built on [`ApiClient`], which joins endpoints under a base URL,
//! applies headers and timeouts, and maps failures into [`ApiClientError`].
//!
//! # Feature Flags
//!
//! - `telemetry` - Wraps every request in an `info_span!` and records the
//!   outcome on it

pub mod aggregator;
pub mod client;
pub mod commerce;

pub use aggregator::AggregatorClient;
pub use client::{ApiClient, ApiClientError};
pub use commerce::CommerceClient;
