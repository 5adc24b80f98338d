//! Claim signers.

use std::sync::Arc;

use alloy_primitives::{Address, B256, hex};
use alloy_signer_local::PrivateKeySigner;
use cartsettle::BoxFuture;
use cartsettle::rail::RailError;

/// Produces the customer's signature over an EIP-712 claim digest.
///
/// Implementations return the signature the way a wallet does: a hex string
/// that may or may not carry a `0x` prefix. It is validated by the rail.
pub trait ClaimSigner: Send + Sync {
    /// Address the signature is expected to recover to.
    fn address(&self) -> Address;

    /// Signs the digest. A user refusing to sign is
    /// [`RailError::UserRejected`].
    fn sign_digest<'a>(&'a self, digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>>;
}

impl<T: ClaimSigner + ?Sized> ClaimSigner for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    fn sign_digest<'a>(&'a self, digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>> {
        (**self).sign_digest(digest)
    }
}

/// Signs with a local private key.
#[derive(Debug, Clone)]
pub struct LocalClaimSigner {
    signer: PrivateKeySigner,
}

impl LocalClaimSigner {
    /// Wraps a private key signer.
    #[must_use]
    pub const fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }
}

impl From<PrivateKeySigner> for LocalClaimSigner {
    fn from(signer: PrivateKeySigner) -> Self {
        Self::new(signer)
    }
}

impl ClaimSigner for LocalClaimSigner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    fn sign_digest<'a>(&'a self, digest: &'a B256) -> BoxFuture<'a, Result<String, RailError>> {
        Box::pin(async move {
            let signature = alloy_signer::Signer::sign_hash(&self.signer, digest)
                .await
                .map_err(|e| RailError::Provider(e.to_string()))?;
            Ok(hex::encode_prefixed(signature.as_bytes()))
        })
    }
}
