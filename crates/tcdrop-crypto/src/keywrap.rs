//! File key sealing and unwrapping through the link secret, an optional
//! password, and the key-wrapping oracle.
//!
//! Security context block (155 bytes, big-endian integers):
//! ```text
//! [1: version][1: format tag][1: password set]
//! [32: lkeySalt][32: pkeySalt][16: phSalt][16: ivForKeyWrap]
//! [4: pkey iterations][4: lkey iterations][48: e1]
//! ```

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use secrecy::SecretString;
use subtle::ConstantTimeEq;
use tcdrop_core::{TcdropError, TcdropResult};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::kdf::{derive_link_key, derive_password_key};
use crate::keys::{generate_file_key, random_array, FileKey, LinkSecret};
use crate::oracle::{KeyWrapOracle, OracleBlock, ORACLE_BLOCK_SIZE};
use crate::retry::RetryHandler;
use crate::KEY_SIZE;

pub const CONTEXT_VERSION: u8 = 1;

/// Scheme identifier: nested SHA-256 derivation, AES-256-CBC local wrap, oracle wrap
pub const FORMAT_TAG: u8 = 0x01;

pub const CONTEXT_SIZE: usize = 3 + 32 + 32 + 16 + 16 + 4 + 4 + ORACLE_BLOCK_SIZE;

const PH_SALT_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES-256-CBC over whole blocks, in place, no padding.
pub(crate) fn cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; 16], buf: &mut [u8]) -> TcdropResult<()> {
    let len = buf.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| TcdropError::Usage(format!("CBC input of {len} bytes is not block-aligned")))?;
    Ok(())
}

pub(crate) fn cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; 16], buf: &mut [u8]) -> TcdropResult<()> {
    let len = buf.len();
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| TcdropError::Usage(format!("CBC input of {len} bytes is not block-aligned")))?;
    Ok(())
}

/// The fixed-layout block stored (unencrypted, authenticated) in the
/// container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub version: u8,
    pub format_tag: u8,
    pub password_set: bool,
    pub lkey_salt: [u8; 32],
    pub pkey_salt: [u8; 32],
    pub ph_salt: [u8; PH_SALT_SIZE],
    pub iv_for_key_wrap: [u8; 16],
    pub pkey_iterations: u32,
    pub lkey_iterations: u32,
    /// `e1`: the oracle-wrapped key material, CBC-encrypted under `pKey`
    pub wrapped: OracleBlock,
}

impl SecurityContext {
    pub fn to_bytes(&self) -> [u8; CONTEXT_SIZE] {
        let mut out = [0u8; CONTEXT_SIZE];
        out[0] = self.version;
        out[1] = self.format_tag;
        out[2] = u8::from(self.password_set);
        let mut pos = 3;
        for field in [
            &self.lkey_salt[..],
            &self.pkey_salt[..],
            &self.ph_salt[..],
            &self.iv_for_key_wrap[..],
            &self.pkey_iterations.to_be_bytes()[..],
            &self.lkey_iterations.to_be_bytes()[..],
            &self.wrapped[..],
        ] {
            out[pos..pos + field.len()].copy_from_slice(field);
            pos += field.len();
        }
        out
    }

    /// Parse and validate a security context block.
    pub fn from_bytes(data: &[u8]) -> TcdropResult<Self> {
        if data.len() != CONTEXT_SIZE {
            return Err(TcdropError::Format(format!(
                "security context is {} bytes (expected {CONTEXT_SIZE})",
                data.len()
            )));
        }
        if data[0] != CONTEXT_VERSION {
            return Err(TcdropError::Format(format!(
                "unsupported security context version {}",
                data[0]
            )));
        }
        if data[1] != FORMAT_TAG {
            return Err(TcdropError::Format(format!(
                "unsupported key scheme 0x{:02x}",
                data[1]
            )));
        }
        let password_set = match data[2] {
            0 => false,
            1 => true,
            other => {
                return Err(TcdropError::Format(format!(
                    "invalid password flag {other}"
                )))
            }
        };

        let mut cursor = &data[3..];
        let lkey_salt: [u8; 32] = take_array(&mut cursor);
        let pkey_salt: [u8; 32] = take_array(&mut cursor);
        let ph_salt: [u8; PH_SALT_SIZE] = take_array(&mut cursor);
        let iv_for_key_wrap: [u8; 16] = take_array(&mut cursor);
        let pkey_iterations = u32::from_be_bytes(take_array(&mut cursor));
        let lkey_iterations = u32::from_be_bytes(take_array(&mut cursor));
        let wrapped: OracleBlock = take_array(&mut cursor);

        if pkey_iterations != 0 || lkey_iterations != 0 {
            return Err(TcdropError::Format(format!(
                "key stretching is not supported in version {CONTEXT_VERSION} \
                 (pkey iterations {pkey_iterations}, lkey iterations {lkey_iterations})"
            )));
        }

        Ok(Self {
            version: data[0],
            format_tag: data[1],
            password_set,
            lkey_salt,
            pkey_salt,
            ph_salt,
            iv_for_key_wrap,
            pkey_iterations,
            lkey_iterations,
            wrapped,
        })
    }
}

/// Split a fixed-size array off the front of `cursor`; the caller has
/// already checked the total length.
fn take_array<const N: usize>(cursor: &mut &[u8]) -> [u8; N] {
    let (head, rest) = cursor.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    *cursor = rest;
    out
}

/// Output of sealing: what goes into the link, what encrypts the body, and
/// what goes into the container header.
#[derive(Debug)]
pub struct SealedKey {
    pub link: LinkSecret,
    pub file_key: FileKey,
    pub context: SecurityContext,
}

fn xor_key(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b)) {
        *o = x ^ y;
    }
    out
}

/// Generate a fresh link secret and file key and wrap the file key.
///
/// The oracle call runs under `retry`; running out of attempts is fatal.
pub async fn seal_file_key(
    password: Option<&SecretString>,
    oracle: &dyn KeyWrapOracle,
    retry: &mut RetryHandler,
) -> TcdropResult<SealedKey> {
    let link = LinkSecret::generate();
    let file_key = generate_file_key();
    let lkey_salt: [u8; 32] = random_array();
    let pkey_salt: [u8; 32] = random_array();
    let ph_salt: [u8; PH_SALT_SIZE] = random_array();
    let iv_for_key_wrap: [u8; 16] = random_array();

    let l_key = derive_link_key(&link, &lkey_salt);
    let p_key = derive_password_key(&link, password, &pkey_salt);

    let mut plain = Zeroizing::new([0u8; ORACLE_BLOCK_SIZE]);
    plain[..PH_SALT_SIZE].copy_from_slice(&ph_salt);
    plain[PH_SALT_SIZE..].copy_from_slice(&*xor_key(&l_key, file_key.as_bytes()));

    let mut wrapped = retry
        .run(|| oracle.wrap(&plain))
        .await
        .map_err(oracle_failure)?;
    cbc_encrypt(&p_key, &iv_for_key_wrap, &mut wrapped)?;

    info!(password = password.is_some(), "file key sealed");

    Ok(SealedKey {
        link,
        file_key,
        context: SecurityContext {
            version: CONTEXT_VERSION,
            format_tag: FORMAT_TAG,
            password_set: password.is_some(),
            lkey_salt,
            pkey_salt,
            ph_salt,
            iv_for_key_wrap,
            pkey_iterations: 0,
            lkey_iterations: 0,
            wrapped,
        },
    })
}

fn oracle_failure(e: TcdropError) -> TcdropError {
    match e {
        TcdropError::Oracle(_) => e,
        other => TcdropError::Oracle(other.to_string()),
    }
}

/// Receiver-side unwrap session for one container.
///
/// Re-entrant: a wrong password leaves the session usable for another try.
#[derive(Debug)]
pub struct KeyUnwrap {
    context: SecurityContext,
    link: LinkSecret,
    password_attempts: u32,
}

impl KeyUnwrap {
    pub fn new(context: SecurityContext, link: LinkSecret) -> Self {
        Self {
            context,
            link,
            password_attempts: 0,
        }
    }

    pub fn context(&self) -> &SecurityContext {
        &self.context
    }

    pub fn needs_password(&self) -> bool {
        self.context.password_set
    }

    /// Number of password checks that came back incorrect so far.
    pub fn password_attempts(&self) -> u32 {
        self.password_attempts
    }

    /// Recover the file key.
    ///
    /// Fails with `PasswordRequired` when the container has a password and
    /// none was given, `PasswordIncorrect` when the oracle-verified check
    /// fails, and `Oracle` when the oracle could not be reached within the
    /// retry budget.
    pub async fn unwrap(
        &mut self,
        password: Option<&SecretString>,
        oracle: &dyn KeyWrapOracle,
        retry: &mut RetryHandler,
    ) -> TcdropResult<FileKey> {
        if self.context.password_set && password.is_none() {
            return Err(TcdropError::PasswordRequired);
        }
        // A password given for a container without one is ignored
        let password = if self.context.password_set { password } else { None };

        let l_key = derive_link_key(&self.link, &self.context.lkey_salt);
        let p_key = derive_password_key(&self.link, password, &self.context.pkey_salt);

        let mut e2 = Zeroizing::new(self.context.wrapped);
        cbc_decrypt(&p_key, &self.context.iv_for_key_wrap, &mut e2[..])?;

        let plain = Zeroizing::new(
            retry
                .run(|| oracle.unwrap(&e2))
                .await
                .map_err(oracle_failure)?,
        );

        if !bool::from(plain[..PH_SALT_SIZE].ct_eq(&self.context.ph_salt)) {
            self.password_attempts += 1;
            if self.context.password_set {
                warn!(attempts = self.password_attempts, "password check failed");
                return Err(TcdropError::PasswordIncorrect);
            }
            // Without a password the only inputs are the link and the oracle
            return Err(TcdropError::Format(
                "key check failed: link secret does not match this container".into(),
            ));
        }

        let mut masked = Zeroizing::new([0u8; KEY_SIZE]);
        masked.copy_from_slice(&plain[PH_SALT_SIZE..]);
        let key = xor_key(&masked, &l_key);
        debug!("file key recovered");
        Ok(FileKey::from_bytes(*key))
    }
}
