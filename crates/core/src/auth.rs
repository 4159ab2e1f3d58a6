use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header the licensing platform signs its webhook bodies with.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Hex HMAC-SHA256 of the raw request body.
pub fn sign_body(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(expected) = sign_body(secret, body) else {
        return false;
    };
    let signature = signature.trim().to_ascii_lowercase();
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}
