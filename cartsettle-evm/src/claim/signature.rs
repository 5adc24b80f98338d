//! Signature parsing and signer verification for claims.
//!
//! Wallets return signatures as hex strings with or without a `0x` prefix.
//! Only plain 65-byte ECDSA signatures are accepted.

use alloy_primitives::{Address, B256, Signature, hex};
use cartsettle::rail::RailError;

/// Hex length of a 65-byte signature.
const SIGNATURE_HEX_LEN: usize = 130;

/// Parses a wallet-returned hex signature.
///
/// # Errors
///
/// Returns [`RailError::MalformedSignature`] unless the input is exactly 130
/// hex characters after an optional `0x` prefix and decodes to a valid
/// signature.
pub fn parse_signature(raw: &str) -> Result<Signature, RailError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if body.len() != SIGNATURE_HEX_LEN {
        return Err(RailError::MalformedSignature(format!(
            "expected {SIGNATURE_HEX_LEN} hex characters, got {}",
            body.len()
        )));
    }
    let bytes = hex::decode(body).map_err(|e| RailError::MalformedSignature(e.to_string()))?;
    Signature::from_raw(&bytes).map_err(|e| RailError::MalformedSignature(e.to_string()))
}

/// Recovers the signer of `hash` and compares it with `expected`.
///
/// # Errors
///
/// Returns [`RailError::MalformedSignature`] if no address can be recovered
/// and [`RailError::SignerMismatch`] if a different address signed.
pub fn verify_signer(signature: &Signature, hash: &B256, expected: Address) -> Result<(), RailError> {
    let recovered = signature
        .recover_address_from_prehash(hash)
        .map_err(|e| RailError::MalformedSignature(e.to_string()))?;
    if recovered == expected {
        Ok(())
    } else {
        Err(RailError::SignerMismatch {
            expected,
            recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn signed() -> (PrivateKeySigner, B256, Signature) {
        let signer = PrivateKeySigner::random();
        let hash = B256::repeat_byte(7);
        let signature = signer.sign_hash_sync(&hash).unwrap();
        (signer, hash, signature)
    }

    #[test]
    fn prefix_is_optional() {
        let (_, _, signature) = signed();
        let prefixed = hex::encode_prefixed(signature.as_bytes());
        let bare = hex::encode(signature.as_bytes());
        assert_eq!(parse_signature(&prefixed).unwrap(), signature);
        assert_eq!(parse_signature(&bare).unwrap(), signature);
        assert_eq!(parse_signature(&format!(" {prefixed}\n")).unwrap(), signature);
    }

    #[test]
    fn wrong_length_or_alphabet_is_malformed() {
        assert!(matches!(
            parse_signature("0x1234"),
            Err(RailError::MalformedSignature(_))
        ));
        let not_hex = "zz".repeat(65);
        assert!(matches!(
            parse_signature(&not_hex),
            Err(RailError::MalformedSignature(_))
        ));
    }

    #[test]
    fn recovered_signer_must_match() {
        let (signer, hash, signature) = signed();
        verify_signer(&signature, &hash, signer.address()).unwrap();

        let other = Address::repeat_byte(1);
        let err = verify_signer(&signature, &hash, other).unwrap_err();
        assert!(matches!(
            err,
            RailError::SignerMismatch { expected, recovered }
                if expected == other && recovered == signer.address()
        ));
        assert!(!err.is_recoverable());
    }
}
