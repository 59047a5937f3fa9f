//! Key derivation for the tunnel HTTP surface
//!
//! The server holds a random secret; the API key clients present is derived
//! from it with HMAC-SHA256 over a fixed ASCII tag. The derivation is stable
//! across versions so that keys issued by older servers keep working.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed ASCII tag shared with clients for API-key derivation
pub const TUNNEL_HTTP_PASS_CHECK: &[u8] = b"CausewayHttpPassCheck";

/// Length of the server secret in bytes
pub const SERVER_SECRET_LEN: usize = 128;

/// Length of a derived key in bytes
pub const DERIVED_KEY_LEN: usize = 32;

/// Derive a key from a secret and a tag: HMAC-SHA256(secret, tag)
pub fn derive_key(secret: &[u8], tag: &[u8]) -> [u8; DERIVED_KEY_LEN] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(tag);
    mac.finalize().into_bytes().into()
}

/// Derive the API key from the server secret
pub fn derive_api_key(server_secret: &[u8]) -> [u8; DERIVED_KEY_LEN] {
    derive_key(server_secret, TUNNEL_HTTP_PASS_CHECK)
}
