//! Applied discounts and gift cards, and the amounts they take off a cart.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::cart::{LineItem, ProductId};
use crate::money::{round_cents, within_cent};
use crate::timestamp::UnixTimestamp;

/// How a discount's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    /// `value` is a percentage of the discountable subtotal.
    Percentage,
    /// `value` is an absolute amount, capped at the discountable subtotal.
    Fixed,
}

/// Which line items a discount applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiscountScope {
    /// Every line item.
    CartWide,
    /// Only line items whose product is in the target set.
    ProductScoped {
        /// Products the discount targets.
        products: BTreeSet<ProductId>,
    },
}

impl DiscountScope {
    /// Returns `true` if the scope covers the given line item.
    #[must_use]
    pub fn covers(&self, item: &LineItem) -> bool {
        match self {
            Self::CartWide => true,
            Self::ProductScoped { products } => products.contains(&item.product_id),
        }
    }
}

/// Where a discount candidate came from, used to rank candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DiscountSource {
    /// Delivered explicitly through a referral or notification context.
    Referral,
    /// Unlocked by holding a token; higher tiers win.
    HoldingGated {
        /// Holder tier, higher is better.
        tier: u32,
    },
    /// A discount attached to the user's account.
    Account,
    /// Typed in by the user.
    Manual,
}

/// A validated discount attached to the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedDiscount {
    /// Discount code.
    pub code: String,
    /// Percentage or fixed amount.
    pub kind: DiscountKind,
    /// Percentage points or currency amount, depending on `kind`.
    pub value: Decimal,
    /// Line items covered.
    pub scope: DiscountScope,
    /// Whether the discount unlocks free shipping.
    #[serde(default)]
    pub free_shipping: bool,
    /// Candidate source the discount was resolved from.
    pub source: DiscountSource,
}

impl AppliedDiscount {
    /// Sum of line totals covered by this discount's scope.
    #[must_use]
    pub fn discountable_subtotal(&self, items: &[LineItem]) -> Decimal {
        items
            .iter()
            .filter(|item| self.scope.covers(item))
            .map(LineItem::line_total)
            .sum()
    }

    /// Amount this discount takes off the given items, rounded to cents and
    /// never more than the discountable subtotal.
    #[must_use]
    pub fn amount(&self, items: &[LineItem]) -> Decimal {
        let eligible = self.discountable_subtotal(items);
        let raw = match self.kind {
            DiscountKind::Percentage => {
                let rate = self.value.clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
                    / Decimal::ONE_HUNDRED;
                items
                    .iter()
                    .filter(|item| self.scope.covers(item))
                    .map(|item| item.line_total() * rate)
                    .sum()
            }
            DiscountKind::Fixed => self.value.max(Decimal::ZERO).min(eligible),
        };
        round_cents(raw).min(eligible).max(Decimal::ZERO)
    }

    /// Free-shipping coverage check.
    ///
    /// Free shipping is granted only when the flag is set and the discount
    /// spans the whole cart: either it is cart-wide, or the products it
    /// targets account for the entire subtotal within one cent.
    #[must_use]
    pub fn grants_free_shipping(&self, items: &[LineItem]) -> bool {
        if !self.free_shipping {
            return false;
        }
        match self.scope {
            DiscountScope::CartWide => true,
            DiscountScope::ProductScoped { .. } => {
                let subtotal: Decimal = items.iter().map(LineItem::line_total).sum();
                within_cent(self.discountable_subtotal(items), subtotal)
            }
        }
    }
}

/// A validated gift card attached to the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedGiftCard {
    /// Gift card code.
    pub code: String,
    /// Remaining balance as reported by the validation service.
    pub balance: Decimal,
    /// When the card stops being redeemable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UnixTimestamp>,
}

impl AppliedGiftCard {
    /// Amount redeemed against `due`: `min(balance, due)`, never negative.
    #[must_use]
    pub fn redeem(&self, due: Decimal) -> Decimal {
        self.balance.max(Decimal::ZERO).min(due.max(Decimal::ZERO))
    }

    /// Returns `true` if the card has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: UnixTimestamp) -> bool {
        self.expires_at.is_some_and(|at| at.has_passed(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn scoped(products: &[&str]) -> DiscountScope {
        DiscountScope::ProductScoped {
            products: products.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    fn discount(kind: DiscountKind, value: Decimal, scope: DiscountScope) -> AppliedDiscount {
        AppliedDiscount {
            code: "CODE".into(),
            kind,
            value,
            scope,
            free_shipping: true,
            source: DiscountSource::Manual,
        }
    }

    fn items() -> Vec<LineItem> {
        vec![
            LineItem::new("shirt", "shirt-m", dec!(20.00), 1),
            LineItem::new("hat", "hat-os", dec!(10.00), 2),
        ]
    }

    #[test]
    fn cart_wide_percentage() {
        let d = discount(DiscountKind::Percentage, dec!(10), DiscountScope::CartWide);
        assert_eq!(d.amount(&items()), dec!(4.00));
    }

    #[test]
    fn cart_wide_fixed_is_capped_at_subtotal() {
        let d = discount(DiscountKind::Fixed, dec!(100), DiscountScope::CartWide);
        assert_eq!(d.amount(&items()), dec!(40.00));
    }

    #[test]
    fn product_scoped_only_discounts_matching_items() {
        let d = discount(DiscountKind::Percentage, dec!(50), scoped(&["hat"]));
        assert_eq!(d.amount(&items()), dec!(10.00));
        let d = discount(DiscountKind::Fixed, dec!(25), scoped(&["shirt"]));
        assert_eq!(d.amount(&items()), dec!(20.00));
    }

    #[test]
    fn percentage_rounds_to_cents() {
        let items = vec![LineItem::new("a", "a", dec!(3.33), 1)];
        let d = discount(DiscountKind::Percentage, dec!(15), DiscountScope::CartWide);
        assert_eq!(d.amount(&items), dec!(0.50));
    }

    #[test]
    fn discount_never_exceeds_discountable_subtotal() {
        for value in [dec!(0), dec!(33.3), dec!(100), dec!(250)] {
            for kind in [DiscountKind::Percentage, DiscountKind::Fixed] {
                let d = discount(kind, value, scoped(&["hat"]));
                assert!(d.amount(&items()) <= d.discountable_subtotal(&items()));
            }
        }
    }

    #[test]
    fn free_shipping_requires_full_coverage_for_scoped_discounts() {
        let partial = discount(DiscountKind::Percentage, dec!(100), scoped(&["hat"]));
        assert!(!partial.grants_free_shipping(&items()));

        let full = discount(DiscountKind::Percentage, dec!(100), scoped(&["hat", "shirt"]));
        assert!(full.grants_free_shipping(&items()));

        let cart_wide = discount(DiscountKind::Fixed, dec!(1), DiscountScope::CartWide);
        assert!(cart_wide.grants_free_shipping(&items()));

        let mut no_flag = cart_wide;
        no_flag.free_shipping = false;
        assert!(!no_flag.grants_free_shipping(&items()));
    }

    #[test]
    fn free_shipping_coverage_tolerates_one_cent() {
        let items = vec![
            LineItem::new("a", "a", dec!(9.99), 1),
            LineItem::new("b", "b", dec!(0.01), 1),
        ];
        let d = discount(DiscountKind::Percentage, dec!(100), scoped(&["a"]));
        assert!(d.grants_free_shipping(&items));
    }

    #[test]
    fn gift_card_redeems_lesser_of_balance_and_due() {
        let card = AppliedGiftCard {
            code: "GC".into(),
            balance: dec!(25),
            expires_at: None,
        };
        assert_eq!(card.redeem(dec!(10)), dec!(10));
        assert_eq!(card.redeem(dec!(40)), dec!(25));
        assert_eq!(card.redeem(dec!(-3)), dec!(0));
    }

    #[test]
    fn scope_serializes_with_type_tag() {
        let json = serde_json::to_value(scoped(&["a"])).unwrap();
        assert_eq!(json["type"], "product-scoped");
        assert_eq!(json["products"][0], "a");
    }
}
