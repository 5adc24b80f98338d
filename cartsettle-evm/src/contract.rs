//! Solidity interface definitions for on-chain interactions.
//!
//! - [`IERC20`] - transfer and balance checks for the direct rail
//! - [`IRewardDistributor`] - permit-based reward token claims
//! - [`CheckoutClaim`] - the EIP-712 message of a signature claim

use alloy_sol_types::sol;

sol! {
    /// Minimal ERC-20 interface.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
        function transfer(address to, uint256 amount) external returns (bool);
    }
}

sol! {
    /// Distributor that releases reward tokens against a server-signed permit.
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IRewardDistributor {
        function claim(
            address token,
            address recipient,
            uint256 amount,
            uint256 deadline,
            string orderId,
            bytes signature
        ) external;
    }
}

sol! {
    /// Zero-value checkout claim signed by the customer.
    #[allow(missing_docs)]
    #[derive(Debug)]
    struct CheckoutClaim {
        string orderId;
        uint256 identity;
        string discountCode;
        uint256 itemCount;
        uint256 nonce;
    }
}
