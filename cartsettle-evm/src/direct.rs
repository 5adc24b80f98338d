//! Direct ERC-20 transfer rail.
//!
//! Checks the payer's token balance, sends `transfer(merchant, amount)` and
//! waits for the receipt. The transaction hash is the settlement proof. Once
//! the transfer is broadcast, a missing receipt is reported as
//! [`RailError::Unconfirmed`] with the hash, never as a retryable failure.

use std::time::Duration;

use alloy_primitives::{Address, TxHash, U256};
use alloy_provider::{PendingTransactionBuilder, Provider};
use cartsettle::BoxFuture;
use cartsettle::attempt::{PaymentMethod, PaymentTicket};
use cartsettle::proof::SettlementProof;
use cartsettle::rail::{PaymentRail, RailError};

use crate::chain::TokenDeployment;
use crate::contract::IERC20;
use crate::error::EvmRailError;

/// Awaits a future, optionally instrumenting it with a tracing span.
macro_rules! traced {
    ($fut:expr, $span:expr) => {{
        #[cfg(feature = "telemetry")]
        {
            use tracing::Instrument;
            ::std::future::IntoFuture::into_future($fut).instrument($span).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}

pub(crate) use traced;

/// Default time to wait for a transfer receipt.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pays the charge with a plain ERC-20 transfer from the payer's wallet.
///
/// The provider must be able to sign for `payer`, e.g. one built with a
/// wallet filler.
#[derive(Debug, Clone)]
pub struct DirectTransferRail<P> {
    provider: P,
    token: TokenDeployment,
    merchant: Address,
    payer: Address,
    confirmations: u64,
    receipt_timeout: Duration,
}

impl<P> DirectTransferRail<P> {
    /// Creates a rail paying `merchant` in `token` from `payer`.
    pub const fn new(provider: P, token: TokenDeployment, merchant: Address, payer: Address) -> Self {
        Self {
            provider,
            token,
            merchant,
            payer,
            confirmations: 1,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        }
    }

    /// Sets the number of confirmations to wait for.
    #[must_use]
    pub const fn with_confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Sets the receipt timeout.
    #[must_use]
    pub const fn with_receipt_timeout(mut self, timeout: Duration) -> Self {
        self.receipt_timeout = timeout;
        self
    }

    /// Token being transferred.
    #[must_use]
    pub const fn token(&self) -> &TokenDeployment {
        &self.token
    }
}

impl<P: Provider> DirectTransferRail<P> {
    /// Reads the payer's token balance.
    ///
    /// # Errors
    ///
    /// Returns [`EvmRailError`] if the call fails.
    pub async fn balance(&self) -> Result<U256, EvmRailError> {
        let token = IERC20::new(self.token.address, &self.provider);
        let balance_call = token.balanceOf(self.payer);
        let balance_fut = balance_call.call();
        let balance = traced!(
            balance_fut,
            tracing::info_span!("balanceOf",
                token = %self.token.address,
                account = %self.payer,
                otel.kind = "client",
            )
        )?;
        Ok(balance)
    }

    async fn submit(&self, amount: U256) -> Result<TxHash, EvmRailError> {
        let token = IERC20::new(self.token.address, &self.provider);
        let pending = token
            .transfer(self.merchant, amount)
            .from(self.payer)
            .send()
            .await?;
        #[cfg(feature = "telemetry")]
        tracing::info!(tx = %pending.tx_hash(), amount = %amount, "transfer submitted");
        Ok(*pending.tx_hash())
    }

    /// Receipt status of a submitted transaction. With a single required
    /// confirmation an already mined receipt is returned without watching.
    async fn receipt_status(&self, tx_hash: TxHash) -> Result<bool, EvmRailError> {
        if self.confirmations <= 1
            && let Some(receipt) = self.provider.get_transaction_receipt(tx_hash).await?
        {
            return Ok(receipt.status());
        }
        let receipt_fut = PendingTransactionBuilder::new(self.provider.root().clone(), tx_hash)
            .with_required_confirmations(self.confirmations)
            .with_timeout(Some(self.receipt_timeout))
            .get_receipt();
        let receipt = traced!(
            receipt_fut,
            tracing::info_span!("transfer",
                from = %self.payer,
                to = %self.merchant,
                tx = %tx_hash,
                token_contract = %self.token.address,
                otel.kind = "client",
            )
        )?;
        Ok(receipt.status())
    }

    /// Waits for a broadcast transfer and returns its settlement proof.
    ///
    /// # Errors
    ///
    /// Returns [`RailError::Unconfirmed`] if the receipt could not be
    /// observed, and [`RailError::Provider`] if the transfer reverted.
    pub async fn confirm(&self, tx_hash: TxHash) -> Result<SettlementProof, RailError> {
        match self.receipt_status(tx_hash).await {
            Ok(true) => {
                #[cfg(feature = "telemetry")]
                tracing::info!(status = "ok", tx = %tx_hash, "transfer confirmed");
                Ok(SettlementProof::Transaction { tx_hash })
            }
            Ok(false) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(status = "failed", tx = %tx_hash, "transfer reverted");
                Err(EvmRailError::TransactionReverted(tx_hash).into())
            }
            Err(err) => Err(RailError::Unconfirmed {
                tx_hash,
                reason: err.to_string(),
            }),
        }
    }

    async fn pay(&self, ticket: &PaymentTicket) -> Result<SettlementProof, RailError> {
        if ticket.amount.is_zero() || ticket.amount.is_sign_negative() {
            return Err(RailError::UnsupportedCharge {
                method: PaymentMethod::Direct,
                amount: ticket.amount.to_string(),
            });
        }
        let required = self.token.to_units(ticket.amount).map_err(EvmRailError::from)?;
        let available = self.balance().await?;
        if available < required {
            return Err(RailError::InsufficientBalance {
                required: ticket.amount.to_string(),
                available: self
                    .token
                    .from_units(available)
                    .map_or_else(|| available.to_string(), |d| d.to_string()),
            });
        }
        let tx_hash = self.submit(required).await?;
        self.confirm(tx_hash).await
    }
}

impl<P: Provider + Send + Sync> PaymentRail for DirectTransferRail<P> {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Direct
    }

    fn settle<'a>(
        &'a self,
        ticket: &'a PaymentTicket,
    ) -> BoxFuture<'a, Result<SettlementProof, RailError>> {
        Box::pin(self.pay(ticket))
    }
}
