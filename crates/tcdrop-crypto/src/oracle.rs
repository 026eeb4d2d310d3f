//! Key-wrapping oracle interface
//!
//! The oracle is a keyed, length-preserving transform over 48-byte blocks
//! held by a party that is neither the sender, the receiver, nor the storage
//! operator. Only the oracle can turn `e2` back into `phSalt || (lKey ^ fileKey)`,
//! which makes offline password guessing against a stolen container require
//! one oracle round trip per guess.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use tcdrop_core::{TcdropError, TcdropResult};
use zeroize::Zeroize;

use crate::keys::random_array;
use crate::keywrap::{cbc_decrypt, cbc_encrypt};
use crate::KEY_SIZE;

/// Size of a block exchanged with the oracle
pub const ORACLE_BLOCK_SIZE: usize = 48;

pub type OracleBlock = [u8; ORACLE_BLOCK_SIZE];

/// A remote key-wrapping service. Calls may fail transiently; callers wrap
/// them in a [`RetryHandler`](crate::retry::RetryHandler).
pub trait KeyWrapOracle: Send + Sync {
    fn wrap<'a>(&'a self, block: &'a OracleBlock) -> BoxFuture<'a, TcdropResult<OracleBlock>>;

    fn unwrap<'a>(&'a self, block: &'a OracleBlock) -> BoxFuture<'a, TcdropResult<OracleBlock>>;
}

/// Local oracle backed by a 256-bit secret: AES-256-CBC with a zero IV and no
/// padding over the three blocks.
///
/// Suitable when the oracle secret is held by a separate process or host that
/// the CLI talks to out of band, and for tests.
#[derive(Clone)]
pub struct SecretOracle {
    secret: [u8; KEY_SIZE],
}

impl SecretOracle {
    pub fn new(secret: [u8; KEY_SIZE]) -> Self {
        Self { secret }
    }

    pub fn generate() -> Self {
        Self::new(random_array())
    }

    /// Parse a base64-encoded secret (as written by `tcdrop oracle-keygen`).
    pub fn from_base64(encoded: &str) -> TcdropResult<Self> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TcdropError::Config(format!("oracle secret is not base64: {e}")))?;
        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(TcdropError::Config(format!(
                "oracle secret has wrong size: {len} bytes (expected {KEY_SIZE})"
            )));
        }
        let mut secret = [0u8; KEY_SIZE];
        secret.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self::new(secret))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.secret)
    }

    fn transform(&self, block: &OracleBlock, forward: bool) -> TcdropResult<OracleBlock> {
        let mut out = *block;
        let iv = [0u8; 16];
        if forward {
            cbc_encrypt(&self.secret, &iv, &mut out)?;
        } else {
            cbc_decrypt(&self.secret, &iv, &mut out)?;
        }
        Ok(out)
    }
}

impl Drop for SecretOracle {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for SecretOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretOracle")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl KeyWrapOracle for SecretOracle {
    fn wrap<'a>(&'a self, block: &'a OracleBlock) -> BoxFuture<'a, TcdropResult<OracleBlock>> {
        Box::pin(async move { self.transform(block, true) })
    }

    fn unwrap<'a>(&'a self, block: &'a OracleBlock) -> BoxFuture<'a, TcdropResult<OracleBlock>> {
        Box::pin(async move { self.transform(block, false) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_secret_oracle_roundtrip() {
        let oracle = SecretOracle::generate();
        let block: OracleBlock = std::array::from_fn(|i| i as u8);

        let wrapped = oracle.wrap(&block).await.unwrap();
        assert_ne!(wrapped, block);
        let unwrapped = oracle.unwrap(&wrapped).await.unwrap();
        assert_eq!(unwrapped, block);
    }

    #[tokio::test]
    async fn test_different_secrets_disagree() {
        let a = SecretOracle::new([1u8; KEY_SIZE]);
        let b = SecretOracle::new([2u8; KEY_SIZE]);
        let block = [7u8; ORACLE_BLOCK_SIZE];

        let wrapped = a.wrap(&block).await.unwrap();
        assert_ne!(b.unwrap(&wrapped).await.unwrap(), block);
    }

    #[test]
    fn test_base64_secret_roundtrip() {
        let oracle = SecretOracle::generate();
        let restored = SecretOracle::from_base64(&oracle.to_base64()).unwrap();
        assert_eq!(restored.secret, oracle.secret);

        assert!(SecretOracle::from_base64("c2hvcnQ=").is_err());
    }
}
