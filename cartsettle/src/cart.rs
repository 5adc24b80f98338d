//! Cart contents and the server checkout snapshot.
//!
//! Line items are only mutated outside the checkout flow. The discount,
//! gift-card, shipping and snapshot fields are crate-private so that only the
//! pricing, resolver and shipping code paths can change them.

use std::collections::BTreeSet;

use alloy_primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::discount::{AppliedDiscount, AppliedGiftCard};
use crate::money::{DEFAULT_CURRENCY, deserialize_money};
use crate::shipping::ShippingRate;

/// Catalog product identifier.
pub type ProductId = String;

/// One purchasable line in the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Catalog product identifier, matched against product-scoped discounts.
    pub product_id: ProductId,
    /// Catalog variant identifier.
    pub variant_id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Price of one unit.
    pub unit_price: Decimal,
    /// Number of units, always at least 1.
    pub quantity: u32,
    /// Whether this item ships physically.
    #[serde(default = "default_requires_shipping")]
    pub requires_shipping: bool,
    /// Reward token granted by this item on a signature claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_token: Option<Address>,
}

const fn default_requires_shipping() -> bool {
    true
}

impl LineItem {
    /// Creates a physical line item.
    pub fn new(
        product_id: impl Into<ProductId>,
        variant_id: impl Into<String>,
        unit_price: Decimal,
        quantity: u32,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            variant_id: variant_id.into(),
            title: String::new(),
            unit_price,
            quantity,
            requires_shipping: true,
            reward_token: None,
        }
    }

    /// Marks the item as digital (no shipping needed).
    #[must_use]
    pub const fn digital(mut self) -> Self {
        self.requires_shipping = false;
        self
    }

    /// Attaches a reward token claimed alongside a zero-value order.
    #[must_use]
    pub const fn with_reward_token(mut self, token: Address) -> Self {
        self.reward_token = Some(token);
        self
    }

    /// Unit price × quantity.
    #[must_use]
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Postal address used for shipping and billing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalAddress {
    /// Recipient name.
    pub name: String,
    /// Street line 1.
    pub address1: String,
    /// Street line 2.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address2: Option<String>,
    /// City.
    pub city: String,
    /// Province or state code.
    #[serde(default)]
    pub province: String,
    /// Postal code.
    pub zip: String,
    /// ISO country code.
    pub country: String,
    /// Contact e-mail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl PostalAddress {
    /// Returns the names of required fields that are blank.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("name", &self.name),
            ("address1", &self.address1),
            ("city", &self.city),
            ("zip", &self.zip),
            ("country", &self.country),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect()
    }
}

/// Server-computed checkout figures for the current address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSnapshot {
    /// Undiscounted subtotal as the server saw it.
    #[serde(deserialize_with = "deserialize_money")]
    pub subtotal: Decimal,
    /// Tax on the undiscounted subtotal.
    #[serde(deserialize_with = "deserialize_money")]
    pub tax: Decimal,
    /// Carrier rate options.
    #[serde(default)]
    pub shipping_rates: Vec<ShippingRate>,
}

impl CheckoutSnapshot {
    /// Snapshot used for carts that contain no physical items.
    #[must_use]
    pub fn digital(subtotal: Decimal) -> Self {
        Self {
            subtotal,
            tax: Decimal::ZERO,
            shipping_rates: Vec::new(),
        }
    }
}

/// Errors raised when building or editing a cart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    /// A line item had a quantity of zero.
    #[error("line item {0} must have a quantity of at least 1")]
    ZeroQuantity(ProductId),
    /// A line item had a negative unit price.
    #[error("line item {0} has a negative unit price")]
    NegativePrice(ProductId),
    /// No line item with the given variant exists.
    #[error("no line item with variant {0}")]
    UnknownVariant(String),
}

fn validate_item(item: &LineItem) -> Result<(), CartError> {
    if item.quantity == 0 {
        return Err(CartError::ZeroQuantity(item.product_id.clone()));
    }
    if item.unit_price.is_sign_negative() && !item.unit_price.is_zero() {
        return Err(CartError::NegativePrice(item.product_id.clone()));
    }
    Ok(())
}

/// Raw serialized cart shape, validated into [`Cart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartRepr {
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default)]
    items: Vec<LineItem>,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    discount: Option<AppliedDiscount>,
    #[serde(default)]
    gift_card: Option<AppliedGiftCard>,
    #[serde(default)]
    shipping: Option<ShippingRate>,
    #[serde(default)]
    snapshot: Option<CheckoutSnapshot>,
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_owned()
}

/// The session's shopping cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CartRepr", into = "CartRepr")]
pub struct Cart {
    currency: String,
    items: Vec<LineItem>,
    notes: String,
    pub(crate) discount: Option<AppliedDiscount>,
    pub(crate) gift_card: Option<AppliedGiftCard>,
    pub(crate) shipping: Option<ShippingRate>,
    pub(crate) snapshot: Option<CheckoutSnapshot>,
}

impl TryFrom<CartRepr> for Cart {
    type Error = CartError;

    fn try_from(repr: CartRepr) -> Result<Self, Self::Error> {
        repr.items.iter().try_for_each(validate_item)?;
        Ok(Self {
            currency: repr.currency,
            items: repr.items,
            notes: repr.notes,
            discount: repr.discount,
            gift_card: repr.gift_card,
            shipping: repr.shipping,
            snapshot: repr.snapshot,
        })
    }
}

impl From<Cart> for CartRepr {
    fn from(cart: Cart) -> Self {
        Self {
            currency: cart.currency,
            items: cart.items,
            notes: cart.notes,
            discount: cart.discount,
            gift_card: cart.gift_card,
            shipping: cart.shipping,
            snapshot: cart.snapshot,
        }
    }
}

impl Default for Cart {
    fn default() -> Self {
        Self::new(DEFAULT_CURRENCY)
    }
}

impl Cart {
    /// Creates an empty cart in the given currency.
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            items: Vec::new(),
            notes: String::new(),
            discount: None,
            gift_card: None,
            shipping: None,
            snapshot: None,
        }
    }

    /// Builds a cart from line items, validating each one.
    ///
    /// # Errors
    ///
    /// Returns [`CartError`] if any item has a zero quantity or negative price.
    pub fn from_items(
        currency: impl Into<String>,
        items: Vec<LineItem>,
    ) -> Result<Self, CartError> {
        items.iter().try_for_each(validate_item)?;
        let mut cart = Self::new(currency);
        cart.items = items;
        Ok(cart)
    }

    /// Adds a line item, merging quantities with an existing line of the
    /// same variant.
    ///
    /// # Errors
    ///
    /// Returns [`CartError`] if the item is invalid.
    pub fn add_item(&mut self, item: LineItem) -> Result<(), CartError> {
        validate_item(&item)?;
        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|i| i.variant_id == item.variant_id)
        {
            existing.quantity = existing.quantity.saturating_add(item.quantity);
        } else {
            self.items.push(item);
        }
        self.clear_checkout();
        Ok(())
    }

    /// Sets the quantity of a variant; a quantity of zero removes the line.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::UnknownVariant`] if the variant is not in the cart.
    pub fn set_quantity(&mut self, variant_id: &str, quantity: u32) -> Result<(), CartError> {
        let position = self
            .items
            .iter()
            .position(|i| i.variant_id == variant_id)
            .ok_or_else(|| CartError::UnknownVariant(variant_id.to_owned()))?;
        if quantity == 0 {
            self.items.remove(position);
        } else if let Some(item) = self.items.get_mut(position) {
            item.quantity = quantity;
        }
        self.clear_checkout();
        Ok(())
    }

    /// Replaces the free-text notes.
    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
    }

    /// ISO currency code.
    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Line items in insertion order.
    #[must_use]
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Free-text notes.
    #[must_use]
    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Returns `true` when the cart has no line items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Σ(unit price × quantity), always derived from the line items.
    #[must_use]
    pub fn subtotal(&self) -> Decimal {
        self.items.iter().map(LineItem::line_total).sum()
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }

    /// Returns `true` if any item ships physically.
    #[must_use]
    pub fn requires_shipping(&self) -> bool {
        self.items.iter().any(|i| i.requires_shipping)
    }

    /// Distinct reward tokens carried by the cart, in stable order.
    #[must_use]
    pub fn reward_tokens(&self) -> Vec<Address> {
        self.items
            .iter()
            .filter_map(|i| i.reward_token)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The applied discount, if any.
    #[must_use]
    pub const fn discount(&self) -> Option<&AppliedDiscount> {
        self.discount.as_ref()
    }

    /// The applied gift card, if any.
    #[must_use]
    pub const fn gift_card(&self) -> Option<&AppliedGiftCard> {
        self.gift_card.as_ref()
    }

    /// The selected shipping rate, if any.
    #[must_use]
    pub const fn shipping(&self) -> Option<&ShippingRate> {
        self.shipping.as_ref()
    }

    /// The server checkout snapshot, if one has been calculated.
    #[must_use]
    pub const fn snapshot(&self) -> Option<&CheckoutSnapshot> {
        self.snapshot.as_ref()
    }

    /// Drops the snapshot and shipping selection but keeps items and codes.
    pub(crate) fn clear_checkout(&mut self) {
        self.snapshot = None;
        self.shipping = None;
    }
}
