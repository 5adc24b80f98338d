//! Pricing calculator: cart contents to final charge.
//!
//! Every figure is recomputed from the cart on each call. The server snapshot
//! only contributes an effective tax rate; its subtotal is never used as the
//! cart subtotal.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cart::Cart;
use crate::money::{Charge, MinimumCharge, round_cents};

/// Every intermediate figure of a priced cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBreakdown {
    /// Σ(unit price × quantity).
    pub subtotal: Decimal,
    /// Discount amount, rounded to cents.
    pub discount: Decimal,
    /// Shipping price after the free-shipping override.
    pub shipping: Decimal,
    /// Tax on the discounted subtotal, rounded to cents.
    pub tax: Decimal,
    /// Amount redeemed from the gift card.
    pub gift_card: Decimal,
    /// `max(0, subtotal − discount + shipping + tax − gift card)`.
    pub total_before_rounding: Decimal,
    /// Charge after the minimum-charge policy.
    pub charge: Charge,
}

impl PriceBreakdown {
    /// Total due before the gift card is redeemed.
    #[must_use]
    pub fn due_before_gift_card(&self) -> Decimal {
        (self.subtotal - self.discount + self.shipping + self.tax).max(Decimal::ZERO)
    }
}

/// Prices carts under a minimum-charge policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PricingCalculator {
    policy: MinimumCharge,
}

impl PricingCalculator {
    /// Creates a calculator with the given policy.
    #[must_use]
    pub const fn new(policy: MinimumCharge) -> Self {
        Self { policy }
    }

    /// The minimum-charge policy in use.
    #[must_use]
    pub const fn policy(&self) -> &MinimumCharge {
        &self.policy
    }

    /// Prices the cart.
    #[must_use]
    pub fn price(&self, cart: &Cart) -> PriceBreakdown {
        let items = cart.items();
        let subtotal = cart.subtotal();
        let discount = cart.discount().map_or(Decimal::ZERO, |d| d.amount(items));
        let discounted = subtotal - discount;

        let tax = match cart.snapshot() {
            Some(snapshot) if !snapshot.subtotal.is_zero() && discounted > Decimal::ZERO => {
                let rate = snapshot.tax / snapshot.subtotal;
                round_cents(rate * discounted).max(Decimal::ZERO)
            }
            _ => Decimal::ZERO,
        };

        let free_shipping = cart
            .discount()
            .is_some_and(|d| d.grants_free_shipping(items));
        let shipping = if free_shipping {
            Decimal::ZERO
        } else {
            cart.shipping().map_or(Decimal::ZERO, |r| r.price.max(Decimal::ZERO))
        };

        let due = (discounted + shipping + tax).max(Decimal::ZERO);
        let gift_card = cart.gift_card().map_or(Decimal::ZERO, |g| g.redeem(due));
        let total_before_rounding = (due - gift_card).max(Decimal::ZERO);

        PriceBreakdown {
            subtotal,
            discount,
            shipping,
            tax,
            gift_card,
            total_before_rounding,
            charge: self.policy.apply(total_before_rounding),
        }
    }
}

/// Prices the cart with the default policy.
#[must_use]
pub fn price(cart: &Cart) -> PriceBreakdown {
    PricingCalculator::default().price(cart)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{CheckoutSnapshot, LineItem};
    use crate::discount::{
        AppliedDiscount, AppliedGiftCard, DiscountKind, DiscountScope, DiscountSource,
    };
    use crate::money::ChargeRail;
    use crate::shipping::ShippingRate;
    use rust_decimal_macros::dec;

    fn discount(
        kind: DiscountKind,
        value: Decimal,
        scope: DiscountScope,
        free_shipping: bool,
    ) -> AppliedDiscount {
        AppliedDiscount {
            code: "CODE".into(),
            kind,
            value,
            scope,
            free_shipping,
            source: DiscountSource::Manual,
        }
    }

    fn scoped(products: &[&str]) -> DiscountScope {
        DiscountScope::ProductScoped {
            products: products.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    fn flat(price: Decimal) -> ShippingRate {
        ShippingRate {
            handle: "flat".into(),
            title: "Flat rate".into(),
            price,
            description: None,
        }
    }

    #[test]
    fn cart_wide_percentage_with_shipping_and_tax() {
        let mut cart = Cart::from_items(
            "USD",
            vec![
                LineItem::new("a", "a1", dec!(15.00), 2),
                LineItem::new("b", "b1", dec!(10.00), 1),
            ],
        )
        .unwrap();
        cart.snapshot = Some(CheckoutSnapshot {
            subtotal: dec!(40.00),
            tax: dec!(4.00),
            shipping_rates: vec![flat(dec!(5.00))],
        });
        cart.shipping = Some(flat(dec!(5.00)));
        cart.discount = Some(discount(
            DiscountKind::Percentage,
            dec!(10),
            DiscountScope::CartWide,
            false,
        ));

        let p = price(&cart);
        assert_eq!(p.discount, dec!(4.00));
        assert_eq!(p.tax, dec!(3.60));
        assert_eq!(p.total_before_rounding, dec!(44.60));
        assert_eq!(p.charge.amount, dec!(44.60));
        assert_eq!(p.charge.rail, ChargeRail::Funded);
    }

    #[test]
    fn full_coverage_scoped_discount_routes_to_signature_claim() {
        let mut cart = Cart::from_items(
            "USD",
            vec![
                LineItem::new("a", "a1", dec!(6.00), 1),
                LineItem::new("b", "b1", dec!(4.00), 1),
            ],
        )
        .unwrap();
        cart.snapshot = Some(CheckoutSnapshot {
            subtotal: dec!(10.00),
            tax: dec!(0.80),
            shipping_rates: vec![flat(dec!(5.00))],
        });
        cart.shipping = Some(flat(dec!(5.00)));
        cart.discount = Some(discount(
            DiscountKind::Percentage,
            dec!(100),
            scoped(&["a", "b"]),
            true,
        ));

        let p = price(&cart);
        assert_eq!(p.discount, dec!(10.00));
        assert_eq!(p.shipping, dec!(0));
        assert_eq!(p.tax, dec!(0));
        assert_eq!(p.charge.amount, dec!(0));
        assert_eq!(p.charge.rail, ChargeRail::SignatureClaim);
    }

    #[test]
    fn partial_coverage_does_not_grant_free_shipping() {
        let mut cart = Cart::from_items(
            "USD",
            vec![
                LineItem::new("a", "a1", dec!(4.95), 1),
                LineItem::new("b", "b1", dec!(0.05), 1),
            ],
        )
        .unwrap();
        cart.snapshot = Some(CheckoutSnapshot {
            subtotal: dec!(5.00),
            tax: dec!(4.00),
            shipping_rates: vec![flat(dec!(3.00))],
        });
        cart.shipping = Some(flat(dec!(3.00)));
        cart.discount = Some(discount(
            DiscountKind::Fixed,
            dec!(4.90),
            scoped(&["a"]),
            true,
        ));

        let p = price(&cart);
        assert_eq!(p.discount, dec!(4.90));
        assert_eq!(p.shipping, dec!(3.00));
        assert_eq!(p.tax, dec!(0.08));
        assert_eq!(p.total_before_rounding, dec!(3.18));
        assert_eq!(p.charge.amount, dec!(3.18));
    }

    #[test]
    fn gift_card_covering_everything_is_a_zero_charge() {
        let mut cart =
            Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(2.00), 1).digital()])
                .unwrap();
        cart.snapshot = Some(CheckoutSnapshot::digital(dec!(2.00)));
        cart.gift_card = Some(AppliedGiftCard {
            code: "GIFT".into(),
            balance: dec!(2.00),
            expires_at: None,
        });

        let p = price(&cart);
        assert_eq!(p.gift_card, dec!(2.00));
        assert_eq!(p.total_before_rounding, dec!(0));
        assert_eq!(p.charge.rail, ChargeRail::SignatureClaim);
    }

    #[test]
    fn small_remainder_is_raised_to_processor_minimum() {
        let mut cart =
            Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(5.00), 1)]).unwrap();
        cart.gift_card = Some(AppliedGiftCard {
            code: "GIFT".into(),
            balance: dec!(4.90),
            expires_at: None,
        });
        let p = price(&cart);
        assert_eq!(p.total_before_rounding, dec!(0.10));
        assert_eq!(p.charge.amount, dec!(0.25));
        assert_eq!(p.charge.rail, ChargeRail::Funded);
    }

    #[test]
    fn tax_is_zero_without_snapshot() {
        let cart = Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(5.00), 1)]).unwrap();
        assert_eq!(price(&cart).tax, dec!(0));
    }

    #[test]
    fn gift_card_never_exceeds_balance_or_due() {
        for balance in [dec!(0), dec!(1), dec!(19.99), dec!(20), dec!(500)] {
            let mut cart =
                Cart::from_items("USD", vec![LineItem::new("a", "a1", dec!(20.00), 1)]).unwrap();
            cart.gift_card = Some(AppliedGiftCard {
                code: "GIFT".into(),
                balance,
                expires_at: None,
            });
            let p = price(&cart);
            assert!(p.gift_card <= balance.min(p.due_before_gift_card()));
            assert!(p.charge.amount >= Decimal::ZERO);
        }
    }
}
