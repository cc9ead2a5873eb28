//! HMAC-SHA256 proofs issued by the payment gateway.
//!
//! The same primitive covers both confirmation shapes:
//!
//! * checkout callbacks sign `"{order_handle}|{payment_handle}"` with the key secret;
//! * webhooks sign the exact raw request body with the webhook secret.
//!
//! Verification is pure: it never touches storage and only yields a verdict.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Payload the gateway signs when it hands a checkout result back to the browser.
pub fn checkout_payload(order_handle: &str, payment_handle: &str) -> String {
    format!("{order_handle}|{payment_handle}")
}

/// Lower-case hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature over `payload`.
///
/// The gateway emits lower-case hex. Upper-case digits, whitespace or a wrong
/// length are all a mismatch.
pub fn verify(payload: &[u8], provided_signature: &str, secret: &str) -> bool {
    if !provided_signature
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return false;
    }
    let Ok(provided) = hex::decode(provided_signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&provided).is_ok()
}

/// Verify a browser-relayed checkout confirmation.
pub fn verify_checkout(
    order_handle: &str,
    payment_handle: &str,
    provided_signature: &str,
    secret: &str,
) -> bool {
    verify(
        checkout_payload(order_handle, payment_handle).as_bytes(),
        provided_signature,
        secret,
    )
}
