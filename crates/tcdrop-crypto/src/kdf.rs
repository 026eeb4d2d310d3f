//! Key derivation: nested SHA-256 over link nonce, password, and salts
//!
//! `derive(input, context, salt) = H( H(H(input) ^ H(salt)) ^ H(context) )`
//!
//! No iterated stretching is applied. The security context carries iteration
//! counts for forward compatibility, but format version 1 requires them to be
//! zero, so password-derived keys are only as strong as the password plus the
//! link nonce and the oracle round trip.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::keys::{FileKey, LinkSecret};
use crate::KEY_SIZE;

/// Context value for link- and password-derived wrapping keys
pub const CONTEXT_KEY_WRAP: u32 = 0;

/// Context value for the metadata MAC key
pub const CONTEXT_META_MAC: u32 = 1;

/// Password bytes used when the sender set no password
const NO_PASSWORD_MARKER: [u8; 1] = [0];

fn h(data: &[u8]) -> [u8; KEY_SIZE] {
    Sha256::digest(data).into()
}

fn xor_into(acc: &mut [u8; KEY_SIZE], other: &[u8; KEY_SIZE]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

/// Derive a 256-bit key from `input`, a numeric domain `context`, and `salt`.
pub fn derive(input: &[u8], context: u32, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut inner = h(input);
    xor_into(&mut inner, &h(salt));
    let mut outer = h(&inner);
    inner.zeroize();
    xor_into(&mut outer, &h(&context.to_be_bytes()));
    let key = h(&outer);
    outer.zeroize();
    key
}

/// `lKey = derive(linkNonce, 0, lkeySalt)`
pub fn derive_link_key(link: &LinkSecret, salt: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    Zeroizing::new(derive(link.as_bytes(), CONTEXT_KEY_WRAP, salt))
}

/// `pKey = derive(linkNonce || password, 0, pkeySalt)`; a missing password
/// contributes the single marker byte `0`.
pub fn derive_password_key(
    link: &LinkSecret,
    password: Option<&SecretString>,
    salt: &[u8],
) -> Zeroizing<[u8; KEY_SIZE]> {
    let pw: &[u8] = match password {
        Some(p) => p.expose_secret().as_bytes(),
        None => &NO_PASSWORD_MARKER,
    };
    let mut input = Zeroizing::new(Vec::with_capacity(link.as_bytes().len() + pw.len()));
    input.extend_from_slice(link.as_bytes());
    input.extend_from_slice(pw);
    Zeroizing::new(derive(&input, CONTEXT_KEY_WRAP, salt))
}

/// Key for the HMAC over the metadata records inside the encrypted body.
pub fn derive_meta_mac_key(file_key: &FileKey) -> Zeroizing<[u8; KEY_SIZE]> {
    Zeroizing::new(derive(file_key.as_bytes(), CONTEXT_META_MAC, &[]))
}
