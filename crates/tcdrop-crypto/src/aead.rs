//! Streaming AES-256-GCM
//!
//! The container body is encrypted as a single GCM message that can be many
//! gigabytes long, so the engine accepts input in arbitrary-sized pushes and
//! only ever holds less than one block (plus, when decrypting, the candidate
//! tag window) in memory.
//!
//! ```text
//! H   = E(K, 0^128)
//! J0  = IV || 0^31 || 1                      (96-bit IV)
//!     = GHASH_H(IV || pad || 0^64 || [len(IV)]_64)   (any other IV length)
//! C_i = P_i ^ E(K, inc32^i(J0))
//! T   = MSB_t( GHASH_H(A || pad || C || pad || [len(A)]_64 || [len(C)]_64) ^ E(K, J0) )
//! ```
//!
//! Output from `update` is always block-aligned. When decrypting, the last
//! `tag_len` bytes seen so far might be the tag, so they are withheld from the
//! cipher until more data arrives or `finalize` is called.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use subtle::ConstantTimeEq;
use tcdrop_core::{TcdropError, TcdropResult};

use crate::{BLOCK_SIZE, KEY_SIZE, TAG_SIZE};

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

/// Shortest tag accepted (96 bits)
pub const MIN_TAG_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Result of `StreamingGcm::finalize`
#[derive(Debug)]
pub struct Finalized {
    /// Remaining output (unaligned, may be empty)
    pub output: Vec<u8>,
    /// The computed tag; when decrypting it has already been verified
    pub tag: Vec<u8>,
}

pub struct StreamingGcm {
    direction: Direction,
    keystream: Aes256Ctr32,
    /// `None` once finalized
    ghash: Option<GHash>,
    /// E(K, J0), XORed into the final GHASH value
    tag_mask: ghash::Block,
    tag_len: usize,
    aad_len: u64,
    data_len: u64,
    pending: Vec<u8>,
}

impl StreamingGcm {
    /// Start an encryption or decryption pass.
    ///
    /// `aad` is authenticated but not encrypted. `tag_len` must be 12..=16.
    pub fn new(
        key: &[u8; KEY_SIZE],
        iv: &[u8],
        aad: &[u8],
        tag_len: usize,
        direction: Direction,
    ) -> TcdropResult<Self> {
        if iv.is_empty() {
            return Err(TcdropError::Usage("GCM IV must not be empty".into()));
        }
        if !(MIN_TAG_SIZE..=TAG_SIZE).contains(&tag_len) {
            return Err(TcdropError::Usage(format!(
                "GCM tag length {tag_len} outside {MIN_TAG_SIZE}..={TAG_SIZE}"
            )));
        }

        let cipher = Aes256::new(key.into());

        let mut h = ghash::Block::default();
        cipher.encrypt_block(&mut h);

        let j0 = if iv.len() == 12 {
            let mut j0 = ghash::Block::default();
            j0[..12].copy_from_slice(iv);
            j0[15] = 1;
            j0
        } else {
            let mut g = GHash::new(&h);
            g.update_padded(iv);
            g.update(&[length_block(0, iv.len() as u64)]);
            g.finalize()
        };

        let mut tag_mask = j0;
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = j0;
        let low = u32::from_be_bytes([counter[12], counter[13], counter[14], counter[15]]);
        counter[12..].copy_from_slice(&low.wrapping_add(1).to_be_bytes());
        let keystream = <Aes256Ctr32 as KeyIvInit>::new(key.into(), &counter);

        let mut ghash = GHash::new(&h);
        ghash.update_padded(aad);

        Ok(Self {
            direction,
            keystream,
            ghash: Some(ghash),
            tag_mask,
            tag_len,
            aad_len: aad.len() as u64,
            data_len: 0,
            pending: Vec::with_capacity(BLOCK_SIZE + tag_len),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_finalized(&self) -> bool {
        self.ghash.is_none()
    }

    /// Bytes passed through the cipher so far (excludes withheld bytes).
    pub fn processed_len(&self) -> u64 {
        self.data_len
    }

    /// Bytes received but not yet released.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Push more input; returns the block-aligned output that became ready.
    pub fn update(&mut self, data: &[u8]) -> TcdropResult<Vec<u8>> {
        let Some(ghash) = self.ghash.as_mut() else {
            return Err(TcdropError::Usage("GCM update after finalize".into()));
        };

        let hold = match self.direction {
            Direction::Encrypt => 0,
            Direction::Decrypt => self.tag_len,
        };
        if self.pending.len() + data.len() < hold + BLOCK_SIZE {
            self.pending.extend_from_slice(data);
            return Ok(Vec::new());
        }

        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);
        let ready = (buf.len() - hold) / BLOCK_SIZE * BLOCK_SIZE;
        self.pending = buf.split_off(ready);

        crypt(self.direction, &mut self.keystream, ghash, &mut buf);
        self.data_len += buf.len() as u64;
        Ok(buf)
    }

    /// Process everything still buffered plus `data`, then produce the tag.
    ///
    /// When decrypting, the final `tag_len` bytes of the whole stream are the
    /// expected tag; a mismatch fails with `Authentication` and no output is
    /// returned.
    pub fn finalize(&mut self, data: &[u8]) -> TcdropResult<Finalized> {
        let Some(mut ghash) = self.ghash.take() else {
            return Err(TcdropError::Usage("GCM finalize called twice".into()));
        };

        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);

        let expected = match self.direction {
            Direction::Encrypt => None,
            Direction::Decrypt => {
                if buf.len() < self.tag_len {
                    return Err(TcdropError::Truncated(format!(
                        "ciphertext ends {} bytes short of the tag",
                        self.tag_len - buf.len()
                    )));
                }
                Some(buf.split_off(buf.len() - self.tag_len))
            }
        };

        crypt(self.direction, &mut self.keystream, &mut ghash, &mut buf);
        self.data_len += buf.len() as u64;

        ghash.update(&[length_block(self.aad_len * 8, self.data_len * 8)]);
        let mut tag = ghash.finalize();
        for (t, m) in tag.iter_mut().zip(self.tag_mask.iter()) {
            *t ^= m;
        }
        let tag = tag[..self.tag_len].to_vec();

        if let Some(expected) = expected {
            if !bool::from(tag.ct_eq(&expected)) {
                buf.clear();
                return Err(TcdropError::Authentication);
            }
        }

        Ok(Finalized { output: buf, tag })
    }
}

/// Run the keystream and authenticator over `buf` in the order the direction
/// requires: GHASH always covers ciphertext.
fn crypt(direction: Direction, keystream: &mut Aes256Ctr32, ghash: &mut GHash, buf: &mut [u8]) {
    match direction {
        Direction::Encrypt => {
            keystream.apply_keystream(buf);
            ghash.update_padded(buf);
        }
        Direction::Decrypt => {
            ghash.update_padded(buf);
            keystream.apply_keystream(buf);
        }
    }
}

fn length_block(high: u64, low: u64) -> ghash::Block {
    let mut block = ghash::Block::default();
    block[..8].copy_from_slice(&high.to_be_bytes());
    block[8..].copy_from_slice(&low.to_be_bytes());
    block
}

/// One-shot encryption: returns `ciphertext || tag`.
pub fn seal(key: &[u8; KEY_SIZE], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> TcdropResult<Vec<u8>> {
    let mut gcm = StreamingGcm::new(key, iv, aad, TAG_SIZE, Direction::Encrypt)?;
    let mut out = gcm.update(plaintext)?;
    let fin = gcm.finalize(&[])?;
    out.extend_from_slice(&fin.output);
    out.extend_from_slice(&fin.tag);
    Ok(out)
}

/// One-shot decryption of `ciphertext || tag`.
pub fn open(key: &[u8; KEY_SIZE], iv: &[u8], aad: &[u8], sealed: &[u8]) -> TcdropResult<Vec<u8>> {
    let mut gcm = StreamingGcm::new(key, iv, aad, TAG_SIZE, Direction::Decrypt)?;
    let mut out = gcm.update(sealed)?;
    let fin = gcm.finalize(&[])?;
    out.extend_from_slice(&fin.output);
    Ok(out)
}
