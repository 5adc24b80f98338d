//! EVM chain primitives.
//!
//! Token deployments and conversion between cart amounts and on-chain
//! token units.

use alloy_primitives::{Address, U256};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// An EIP-155 chain ID (e.g., 8453 for Base, 137 for Polygon).
pub type ChainId = u64;

/// Largest decimals value representable by [`Decimal`] scaling.
const MAX_DECIMALS: u8 = 28;

/// Errors converting between cart amounts and token units.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenAmountError {
    /// Negative amounts cannot be transferred.
    #[error("negative amount {0}")]
    Negative(Decimal),
    /// The scaled amount does not fit.
    #[error("amount {amount} overflows at {decimals} decimals")]
    Overflow {
        /// Requested amount.
        amount: Decimal,
        /// Token decimals.
        decimals: u8,
    },
}

/// A token deployment on an EVM network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDeployment {
    /// Contract address.
    pub address: Address,
    /// Number of decimals (e.g., 6 for USDC).
    pub decimals: u8,
}

impl TokenDeployment {
    fn scale(&self, amount: Decimal) -> Result<Decimal, TokenAmountError> {
        let overflow = || TokenAmountError::Overflow {
            amount,
            decimals: self.decimals,
        };
        if self.decimals > MAX_DECIMALS {
            return Err(overflow());
        }
        let factor = Decimal::from_i128_with_scale(10_i128.pow(u32::from(self.decimals)), 0);
        amount.checked_mul(factor).ok_or_else(overflow)
    }

    /// Converts a cart amount into token units, rounding up so the merchant
    /// is never under-paid.
    ///
    /// # Errors
    ///
    /// Returns [`TokenAmountError`] for negative or oversized amounts.
    pub fn to_units(&self, amount: Decimal) -> Result<U256, TokenAmountError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(TokenAmountError::Negative(amount));
        }
        let units = self
            .scale(amount)?
            .ceil()
            .to_u128()
            .ok_or(TokenAmountError::Overflow {
                amount,
                decimals: self.decimals,
            })?;
        Ok(U256::from(units))
    }

    /// Converts token units back into a display amount. Returns `None` if the
    /// value is too large for [`Decimal`].
    #[must_use]
    pub fn from_units(&self, units: U256) -> Option<Decimal> {
        let raw = i128::try_from(u128::try_from(units).ok()?).ok()?;
        Decimal::try_from_i128_with_scale(raw, u32::from(self.decimals)).ok()
    }
}
