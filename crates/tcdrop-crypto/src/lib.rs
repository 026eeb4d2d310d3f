//! tcdrop-crypto: client-side encryption for tcdrop share containers
//!
//! Architecture: one streaming AES-256-GCM pass over the whole container body
//!
//! Key hierarchy:
//! ```text
//! linkNonce (128-bit, share link fragment only)
//!   ├── lKey = derive(linkNonce, 0, lkeySalt)
//!   └── pKey = derive(linkNonce || password, 0, pkeySalt)
//!
//! e2 = oracle.wrap(phSalt || (lKey ^ fileKey))    (remote key-wrapping oracle)
//! e1 = AES-256-CBC(pKey, ivForKeyWrap, e2)        (stored in the container)
//!
//! fileKey (256-bit random)
//!   ├── Body AEAD: AES-256-GCM, streaming (key=fileKey, AAD=container header)
//!   └── Metadata MAC key = derive(fileKey, 1, "")
//! ```

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod keywrap;
pub mod oracle;
pub mod retry;

pub use aead::{Direction, Finalized, StreamingGcm};
pub use kdf::{derive, derive_meta_mac_key};
pub use keys::{generate_file_key, FileKey, LinkSecret};
pub use keywrap::{seal_file_key, KeyUnwrap, SealedKey, SecurityContext};
pub use oracle::{KeyWrapOracle, OracleBlock, SecretOracle};
pub use retry::RetryHandler;

/// Size of a file key / derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the link nonce carried in the share link (128-bit)
pub const LINK_NONCE_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Size of a full GCM authentication tag
pub const TAG_SIZE: usize = 16;
