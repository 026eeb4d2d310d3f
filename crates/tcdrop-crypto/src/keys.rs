//! Key types: per-file AEAD key and the link nonce

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tcdrop_core::{TcdropError, TcdropResult};
use zeroize::Zeroize;

use crate::{KEY_SIZE, LINK_NONCE_SIZE};

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    FileKey::from_bytes(random_array())
}

/// The 128-bit secret embedded in the share link fragment.
///
/// It never reaches the storage backend; without it neither `lKey` nor `pKey`
/// can be derived. Zeroized on drop.
#[derive(Clone)]
pub struct LinkSecret {
    bytes: [u8; LINK_NONCE_SIZE],
}

impl LinkSecret {
    pub fn generate() -> Self {
        Self::from_bytes(random_array())
    }

    pub fn from_bytes(bytes: [u8; LINK_NONCE_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; LINK_NONCE_SIZE] {
        &self.bytes
    }

    /// Encode for the link fragment (unpadded base64url, 22 chars).
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.bytes)
    }

    pub fn decode(encoded: &str) -> TcdropResult<Self> {
        let mut raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| TcdropError::Format(format!("link secret is not base64url: {e}")))?;
        if raw.len() != LINK_NONCE_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(TcdropError::Format(format!(
                "link secret has wrong size: {len} bytes (expected {LINK_NONCE_SIZE})"
            )));
        }
        let mut bytes = [0u8; LINK_NONCE_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self { bytes })
    }
}

impl Drop for LinkSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for LinkSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Fill a fixed-size array from the thread-local CSPRNG.
pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_key_generation() {
        let k1 = generate_file_key();
        let k2 = generate_file_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_link_secret_encode_decode() {
        let secret = LinkSecret::generate();
        let encoded = secret.encode();
        assert_eq!(encoded.len(), 22);
        assert!(!encoded.contains('='), "link secret must not be padded");

        let decoded = LinkSecret::decode(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_link_secret_wrong_size() {
        let short = URL_SAFE_NO_PAD.encode([1u8; 8]);
        assert!(LinkSecret::decode(&short).is_err());
        assert!(LinkSecret::decode("not/base64url!").is_err());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = FileKey::from_bytes([0xAB; KEY_SIZE]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("171"));
    }
}
