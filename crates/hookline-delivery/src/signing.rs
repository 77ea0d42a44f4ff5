//! HMAC-SHA256 payload signing.
//!
//! The signature sent in `X-Webhook-Signature` is the lowercase hex encoding
//! of `HMAC-SHA256(payload, secret)` over the raw request body. Receivers
//! recompute it with [`verify_signature`].

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

fn mac_for(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("invalid signing secret"))
}

/// Computes the hex-encoded HMAC-SHA256 signature of `payload`.
///
/// # Errors
///
/// Returns a configuration error if the secret cannot key the MAC.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String> {
    let mut mac = mac_for(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature against `payload` in constant time.
///
/// Malformed hex is treated as a mismatch.
pub fn verify_signature(payload: &[u8], secret: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = mac_for(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}
