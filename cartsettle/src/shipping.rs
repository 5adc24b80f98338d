//! Shipping rate selection.
//!
//! The selector never computes carrier rates itself; it consumes the options
//! returned by a [`ShippingQuoter`] and decides which one the cart uses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{BoxError, BoxFuture};
use crate::cart::{Cart, CheckoutSnapshot, LineItem, PostalAddress};
use crate::discount::AppliedDiscount;
use crate::money::deserialize_money;

/// Handle of the synthetic zero-price rate injected for free-shipping discounts.
pub const FREE_SHIPPING_HANDLE: &str = "free-shipping";

/// One shipping option for the current address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingRate {
    /// Carrier-assigned handle.
    pub handle: String,
    /// Display title.
    pub title: String,
    /// Rate price.
    #[serde(deserialize_with = "deserialize_money")]
    pub price: Decimal,
    /// Optional delivery description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ShippingRate {
    /// The synthetic zero-price rate for free-shipping discounts.
    #[must_use]
    pub fn free() -> Self {
        Self {
            handle: FREE_SHIPPING_HANDLE.to_owned(),
            title: "Free Shipping".to_owned(),
            price: Decimal::ZERO,
            description: Some("Unlocked by your discount".to_owned()),
        }
    }

    /// Returns `true` for the synthetic free-shipping rate.
    #[must_use]
    pub fn is_free_shipping(&self) -> bool {
        self.handle == FREE_SHIPPING_HANDLE
    }
}

/// Shipping/tax calculation request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    /// Cart contents.
    pub line_items: Vec<LineItem>,
    /// Destination.
    pub shipping_address: PostalAddress,
}

/// Calculates server-side subtotal, tax and carrier rates for an address.
pub trait ShippingQuoter: Send + Sync {
    /// Requests a checkout snapshot for the given cart and destination.
    fn quote<'a>(
        &'a self,
        request: &'a QuoteRequest,
    ) -> BoxFuture<'a, Result<CheckoutSnapshot, BoxError>>;
}

/// Errors raised while selecting shipping.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// No rate with the requested handle was offered.
    #[error("unknown shipping rate: {0}")]
    UnknownRate(String),
}

/// Result of running the selector over a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShippingOutcome {
    /// A rate was selected automatically.
    Selected(ShippingRate),
    /// The user has to pick one of these rates.
    Manual(Vec<ShippingRate>),
    /// No rates were returned for the address.
    NoneAvailable,
}

/// Chooses a shipping rate for the cart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShippingSelector {
    manual: bool,
}

impl ShippingSelector {
    /// Creates a selector that auto-selects the cheapest rate.
    #[must_use]
    pub const fn new() -> Self {
        Self { manual: false }
    }

    /// Requires the user to pick a rate instead of auto-selecting.
    #[must_use]
    pub const fn with_manual_selection(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    /// Rate options as presented to the user, with the synthetic free rate
    /// prepended when the discount covers the whole cart.
    #[must_use]
    pub fn options(
        rates: &[ShippingRate],
        discount: Option<&AppliedDiscount>,
        items: &[LineItem],
    ) -> Vec<ShippingRate> {
        let mut options = Vec::with_capacity(rates.len() + 1);
        if discount.is_some_and(|d| d.grants_free_shipping(items)) {
            options.push(ShippingRate::free());
        }
        options.extend(rates.iter().filter(|r| !r.is_free_shipping()).cloned());
        options
    }

    /// Selects a rate for the cart's snapshot.
    ///
    /// Free shipping wins outright when granted. Otherwise the cheapest rate
    /// is chosen, keeping the first on ties, unless manual selection is on.
    #[must_use]
    pub fn select(&self, cart: &Cart) -> ShippingOutcome {
        let rates = cart
            .snapshot()
            .map(|s| s.shipping_rates.as_slice())
            .unwrap_or_default();
        if cart.discount().is_some_and(|d| d.grants_free_shipping(cart.items())) {
            return ShippingOutcome::Selected(ShippingRate::free());
        }
        if rates.is_empty() {
            return ShippingOutcome::NoneAvailable;
        }
        if self.manual {
            return ShippingOutcome::Manual(Self::options(rates, cart.discount(), cart.items()));
        }
        // min_by_key keeps the last minimum; fold keeps the first.
        let cheapest = rates.iter().fold(None::<&ShippingRate>, |best, rate| match best {
            Some(b) if b.price <= rate.price => Some(b),
            _ => Some(rate),
        });
        cheapest.map_or(ShippingOutcome::NoneAvailable, |rate| {
            ShippingOutcome::Selected(rate.clone())
        })
    }

    /// Applies the selector's choice to the cart.
    pub fn apply(&self, cart: &mut Cart) -> ShippingOutcome {
        let outcome = self.select(cart);
        cart.shipping = match &outcome {
            ShippingOutcome::Selected(rate) => Some(rate.clone()),
            ShippingOutcome::Manual(_) | ShippingOutcome::NoneAvailable => None,
        };
        outcome
    }

    /// Selects a rate by handle from the options offered for the cart.
    ///
    /// # Errors
    ///
    /// Returns [`ShippingError::UnknownRate`] if no offered rate has the handle.
    pub fn choose(cart: &mut Cart, handle: &str) -> Result<ShippingRate, ShippingError> {
        let rates = cart
            .snapshot()
            .map(|s| s.shipping_rates.as_slice())
            .unwrap_or_default();
        let rate = Self::options(rates, cart.discount(), cart.items())
            .into_iter()
            .find(|r| r.handle == handle)
            .ok_or_else(|| ShippingError::UnknownRate(handle.to_owned()))?;
        cart.shipping = Some(rate.clone());
        Ok(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discount::{DiscountKind, DiscountScope, DiscountSource};
    use rust_decimal_macros::dec;

    fn rate(handle: &str, price: Decimal) -> ShippingRate {
        ShippingRate {
            handle: handle.into(),
            title: handle.to_uppercase(),
            price,
            description: None,
        }
    }

    fn cart_with_rates(rates: Vec<ShippingRate>) -> Cart {
        let mut cart =
            Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(10), 1)]).unwrap();
        cart.snapshot = Some(CheckoutSnapshot {
            subtotal: dec!(10),
            tax: dec!(0),
            shipping_rates: rates,
        });
        cart
    }

    fn free_shipping_discount() -> AppliedDiscount {
        AppliedDiscount {
            code: "SHIPFREE".into(),
            kind: DiscountKind::Percentage,
            value: dec!(5),
            scope: DiscountScope::CartWide,
            free_shipping: true,
            source: DiscountSource::Manual,
        }
    }

    #[test]
    fn cheapest_rate_is_auto_selected() {
        let mut cart = cart_with_rates(vec![
            rate("express", dec!(12)),
            rate("ground", dec!(5)),
            rate("economy", dec!(7)),
        ]);
        let outcome = ShippingSelector::new().apply(&mut cart);
        assert_eq!(outcome, ShippingOutcome::Selected(rate("ground", dec!(5))));
        assert_eq!(cart.shipping().unwrap().handle, "ground");
    }

    #[test]
    fn ties_keep_first_returned_rate() {
        let cart = cart_with_rates(vec![rate("first", dec!(5)), rate("second", dec!(5))]);
        let outcome = ShippingSelector::new().select(&cart);
        assert_eq!(outcome, ShippingOutcome::Selected(rate("first", dec!(5))));
    }

    #[test]
    fn no_rates_is_a_notice_not_an_error() {
        let mut cart = cart_with_rates(vec![]);
        assert_eq!(
            ShippingSelector::new().apply(&mut cart),
            ShippingOutcome::NoneAvailable
        );
        assert!(cart.shipping().is_none());
    }

    #[test]
    fn free_shipping_discount_selects_synthetic_rate() {
        let mut cart = cart_with_rates(vec![rate("ground", dec!(5))]);
        cart.discount = Some(free_shipping_discount());
        let outcome = ShippingSelector::new().apply(&mut cart);
        assert_eq!(outcome, ShippingOutcome::Selected(ShippingRate::free()));
        assert!(cart.shipping().unwrap().is_free_shipping());
    }

    #[test]
    fn manual_selection_offers_free_rate_first() {
        let mut cart = cart_with_rates(vec![rate("ground", dec!(5)), rate("air", dec!(9))]);
        let selector = ShippingSelector::new().with_manual_selection(true);
        let ShippingOutcome::Manual(options) = selector.apply(&mut cart) else {
            panic!("expected manual selection");
        };
        assert_eq!(options.len(), 2);
        assert!(cart.shipping().is_none());

        let chosen = ShippingSelector::choose(&mut cart, "air").unwrap();
        assert_eq!(chosen.price, dec!(9));
        assert!(matches!(
            ShippingSelector::choose(&mut cart, "teleport"),
            Err(ShippingError::UnknownRate(_))
        ));

        let options = ShippingSelector::options(
            &[rate("ground", dec!(5))],
            Some(&free_shipping_discount()),
            cart.items(),
        );
        assert_eq!(options[0], ShippingRate::free());
    }
}
