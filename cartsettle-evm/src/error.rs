//! Error types for the EVM rails.

use alloy_primitives::TxHash;
use alloy_transport::TransportError;
use cartsettle::rail::RailError;

use crate::chain::TokenAmountError;

/// Infrastructure failures on the EVM rails. All of them surface to the
/// orchestrator as [`RailError::Provider`].
#[derive(Debug, thiserror::Error)]
pub enum EvmRailError {
    /// RPC transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Pending transaction error, including receipt timeouts.
    #[error(transparent)]
    PendingTransaction(#[from] alloy_provider::PendingTransactionError),
    /// On-chain transaction was reverted.
    #[error("transaction {0} reverted")]
    TransactionReverted(TxHash),
    /// Contract call failed.
    #[error("contract call failed: {0}")]
    ContractCall(String),
    /// The cart amount cannot be expressed in token units.
    #[error(transparent)]
    Amount(#[from] TokenAmountError),
}

impl From<alloy_contract::Error> for EvmRailError {
    fn from(e: alloy_contract::Error) -> Self {
        match e {
            alloy_contract::Error::TransportError(e) => Self::Transport(e),
            alloy_contract::Error::PendingTransactionError(e) => Self::PendingTransaction(e),
            other => Self::ContractCall(other.to_string()),
        }
    }
}

impl From<EvmRailError> for RailError {
    fn from(value: EvmRailError) -> Self {
        Self::Provider(value.to_string())
    }
}
