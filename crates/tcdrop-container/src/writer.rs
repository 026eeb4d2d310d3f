//! Container writer
//!
//! Presents a finished container as a random-access byte range of known
//! length, producing ciphertext lazily as the transport asks for it:
//!
//! ```text
//! MAGIC | SEC | PADDING | ENCWRAP( meta | PADDING | ENC payload | PADDING ) | GCMTAG | END
//! ```
//!
//! The encrypted body can only be produced front to back. Ranges that were
//! already produced stay answerable for a lookback window so a transport can
//! retry a failed request; anything behind the window or ahead of the
//! production cursor is a usage error.

use bytes::{Bytes, BytesMut};
use tcdrop_core::config::{ContainerConfig, TransferConfig};
use tcdrop_core::{FileMeta, TcdropError, TcdropResult};
use tcdrop_crypto::keywrap::CONTEXT_SIZE;
use tcdrop_crypto::{derive_meta_mac_key, Direction, SealedKey, StreamingGcm, BLOCK_SIZE, TAG_SIZE};
use tracing::{debug, info};

use crate::cache::ResumeCache;
use crate::meta::encode_metadata;
use crate::padding::{alignment, PaddingPolicy};
use crate::source::{ByteSource, DigestHandle, Digests, Fill};
use crate::tlv::{encode_header, encode_record, Tag, END_RECORD, FORMAT_VERSION, MAGIC};
use crate::STREAM_IV_SIZE;

const ALIGN: u64 = BLOCK_SIZE as u64;

/// Offset of the tag inside the trailer
const TAG_AT: u64 = 5;

/// GCMTAG header, tag, END
const TRAILER_LEN: u64 = TAG_AT + TAG_SIZE as u64 + END_RECORD.len() as u64;

/// Most plaintext one GCM stream may carry: (2^32 - 2) counter blocks
const MAX_BODY_LEN: u64 = ((1 << 32) - 2) * ALIGN;

const HEAD: usize = 0;
const BODY: usize = 1;
const TRAILER: usize = 2;

const DEFAULT_SLICE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub padding: PaddingPolicy,
    /// Bytes of produced ciphertext kept for re-requests
    pub cache_lookback: usize,
    /// Plaintext encrypted between cooperative yields
    pub crypt_slice: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            padding: PaddingPolicy::default(),
            cache_lookback: DEFAULT_SLICE,
            crypt_slice: DEFAULT_SLICE,
        }
    }
}

impl WriterOptions {
    pub fn from_config(transfer: &TransferConfig, container: &ContainerConfig) -> TcdropResult<Self> {
        Ok(Self {
            padding: container.padding.parse()?,
            cache_lookback: usize::try_from(transfer.cache_lookback).unwrap_or(usize::MAX),
            crypt_slice: transfer.crypt_slice.max(1),
        })
    }
}

pub struct ContainerWriter {
    /// MAGIC, SEC, alignment PADDING and the ENCWRAP header
    head: ByteSource,
    /// Plaintext of the encrypted wrap
    body: ByteSource,
    /// GCMTAG record and END; the tag slot is filled in once known
    trailer: ByteSource,
    /// Container offsets where head, body and trailer end
    ends: [u64; 3],
    digests: Digests,
    payload_digest: DigestHandle,
    gcm: StreamingGcm,
    /// Plaintext consumed by the cipher so far
    plain_pos: u64,
    /// Ciphertext emitted so far
    produced: u64,
    cache: ResumeCache,
    crypt_slice: usize,
    tag: Option<[u8; TAG_SIZE]>,
    content_digest: Option<blake3::Hash>,
}

impl std::fmt::Debug for ContainerWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerWriter")
            .field("len", &self.len())
            .field("body_len", &self.body_len())
            .field("produced", &self.produced)
            .field("finished", &self.tag.is_some())
            .finish_non_exhaustive()
    }
}

impl ContainerWriter {
    /// Lay out a container for `payload` described by `meta`, encrypted
    /// under the sealed file key.
    pub fn new(
        meta: &FileMeta,
        payload: ByteSource,
        sealed: &SealedKey,
        options: WriterOptions,
    ) -> TcdropResult<Self> {
        if payload.len() != meta.size {
            return Err(TcdropError::Usage(format!(
                "declared size {} does not match payload length {}",
                meta.size,
                payload.len()
            )));
        }

        let stream_iv: [u8; STREAM_IV_SIZE] = rand::random();
        let mut sec = Vec::with_capacity(STREAM_IV_SIZE + CONTEXT_SIZE);
        sec.extend_from_slice(&stream_iv);
        sec.extend_from_slice(&sealed.context.to_bytes());

        let mut head = Vec::new();
        head.extend_from_slice(MAGIC);
        head.push(FORMAT_VERSION);
        head.extend(encode_record(Tag::Sec, &sec)?);
        let aad = head.clone();

        let outer_pad = alignment(head.len() as u64, Tag::EncWrap.header_len() as u64, ALIGN);
        head.extend(encode_header(Tag::Padding, outer_pad)?);
        head.resize(head.len() + outer_pad as usize, 0);

        let mac_key = derive_meta_mac_key(&sealed.file_key);
        let meta_block = encode_metadata(meta, &mac_key)?;
        let inner_pad = alignment(
            meta_block.len() as u64,
            Tag::Payload.header_len() as u64,
            ALIGN,
        );

        let mut digests = Digests::new();
        let (hashed, payload_digest) = ByteSource::hashing(payload, &mut digests);
        let mut parts = vec![
            ByteSource::constant(meta_block),
            ByteSource::constant(encode_header(Tag::Padding, inner_pad)?),
            ByteSource::generated(inner_pad, Fill::Zero),
            ByteSource::constant(encode_header(Tag::Payload, meta.size)?),
            hashed,
        ];
        if let Some(conceal) = options.padding.concealment(meta.size) {
            parts.push(ByteSource::constant(encode_header(Tag::Padding, conceal)?));
            parts.push(ByteSource::generated(conceal, Fill::Random));
        }
        let body = ByteSource::merged(parts);
        let body_len = body.len();
        if body_len > MAX_BODY_LEN {
            return Err(TcdropError::Usage(format!(
                "encrypted body of {body_len} bytes exceeds the {MAX_BODY_LEN} byte stream limit"
            )));
        }
        head.extend(encode_header(Tag::EncWrap, body_len)?);

        let head_len = head.len() as u64;
        let ends = [head_len, head_len + body_len, head_len + body_len + TRAILER_LEN];

        let gcm = StreamingGcm::new(
            sealed.file_key.as_bytes(),
            &stream_iv,
            &aad,
            TAG_SIZE,
            Direction::Encrypt,
        )?;

        let writer = Self {
            head: ByteSource::constant(head),
            body,
            trailer: trailer(None)?,
            ends,
            digests,
            payload_digest,
            gcm,
            plain_pos: 0,
            produced: 0,
            cache: ResumeCache::new(options.cache_lookback),
            crypt_slice: options.crypt_slice.max(1),
            tag: None,
            content_digest: None,
        };
        info!(
            name = %meta.name,
            size = meta.size,
            total = writer.len(),
            padding = ?options.padding,
            "container laid out"
        );
        Ok(writer)
    }

    /// Total container length, fixed at construction.
    pub fn len(&self) -> u64 {
        self.ends[TRAILER]
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Length of the ENCWRAP value.
    pub fn body_len(&self) -> u64 {
        self.ends[BODY] - self.ends[HEAD]
    }

    /// True once the cipher has been finalized and the tag is known.
    pub fn is_finished(&self) -> bool {
        self.tag.is_some()
    }

    /// BLAKE3 digest of the payload, available once finished.
    pub fn content_digest(&self) -> Option<blake3::Hash> {
        self.content_digest
    }

    /// Produce `[start, end)` of the container.
    pub async fn read(&mut self, start: u64, end: u64) -> TcdropResult<Bytes> {
        let total = self.len();
        if start > end || end > total {
            return Err(TcdropError::Usage(format!(
                "read {start}..{end} outside container of {total} bytes"
            )));
        }
        if start == end {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity((end - start) as usize);
        let mut pos = start;
        while pos < end {
            let segment = self.ends.partition_point(|&e| e <= pos);
            let base = segment.checked_sub(1).map_or(0, |prev| self.ends[prev]);
            let stop = self.ends[segment].min(end);
            let (from, to) = (pos - base, stop - base);
            let data = match segment {
                HEAD => self.head.read(from, to, &mut self.digests).await?,
                BODY => self.read_body(from, to).await?,
                _ => self.read_trailer(from, to).await?,
            };
            out.extend_from_slice(&data);
            pos = stop;
        }
        Ok(out.freeze())
    }

    async fn read_body(&mut self, start: u64, end: u64) -> TcdropResult<Bytes> {
        if start < self.cache.start() {
            return Err(TcdropError::Usage(format!(
                "body offset {start} is behind the resume window (starts at {})",
                self.cache.start()
            )));
        }
        if start > self.produced {
            return Err(TcdropError::Usage(format!(
                "body offset {start} is ahead of the production cursor at {}",
                self.produced
            )));
        }
        if end <= self.produced {
            debug!(start, end, "serving re-request from resume cache");
        }
        self.cache.ensure_capacity((end - start) as usize + BLOCK_SIZE);
        self.produce_until(end).await?;
        self.cache.get(start, end).ok_or_else(|| {
            TcdropError::Usage(format!("body range {start}..{end} no longer cached"))
        })
    }

    async fn read_trailer(&mut self, start: u64, end: u64) -> TcdropResult<Bytes> {
        if start < TAG_AT + TAG_SIZE as u64 && end > TAG_AT {
            self.finish().await?;
        }
        self.trailer.read(start, end, &mut self.digests).await
    }

    /// Encrypt whatever remains and compute the tag.
    pub async fn finish(&mut self) -> TcdropResult<()> {
        self.produce_until(self.body_len()).await?;
        self.finalize_stream()
    }

    async fn produce_until(&mut self, target: u64) -> TcdropResult<()> {
        let body_len = self.body_len();
        while self.produced < target {
            if self.plain_pos < body_len {
                let goal = target.next_multiple_of(ALIGN).min(body_len);
                let n = (goal - self.plain_pos).min(self.crypt_slice as u64);
                let plain = self
                    .body
                    .read(self.plain_pos, self.plain_pos + n, &mut self.digests)
                    .await?;
                let ct = self.gcm.update(&plain)?;
                self.plain_pos += n;
                self.emit(&ct);
                tokio::task::yield_now().await;
            } else {
                self.finalize_stream()?;
            }
        }
        Ok(())
    }

    fn finalize_stream(&mut self) -> TcdropResult<()> {
        if self.tag.is_some() {
            return Ok(());
        }
        let fin = self.gcm.finalize(&[])?;
        self.emit(&fin.output);
        let tag: [u8; TAG_SIZE] = fin
            .tag
            .as_slice()
            .try_into()
            .map_err(|_| TcdropError::Usage(format!("unexpected tag length {}", fin.tag.len())))?;
        self.tag = Some(tag);
        self.trailer = trailer(Some(tag))?;
        let digest = self.digests.digest(self.payload_digest)?;
        self.content_digest = Some(digest);
        info!(body = self.body_len(), digest = %digest, "encryption finished");
        Ok(())
    }

    fn emit(&mut self, ct: &[u8]) {
        self.cache.append(ct);
        self.produced += ct.len() as u64;
    }
}

/// GCMTAG record followed by END. Until the tag is known its slot is zeros;
/// reads that touch it finish the stream first.
fn trailer(tag: Option<[u8; TAG_SIZE]>) -> TcdropResult<ByteSource> {
    let tag = match tag {
        Some(tag) => ByteSource::constant(tag.to_vec()),
        None => ByteSource::generated(TAG_SIZE as u64, Fill::Zero),
    };
    Ok(ByteSource::merged(vec![
        ByteSource::constant(encode_header(Tag::GcmTag, TAG_SIZE as u64)?),
        tag,
        ByteSource::constant(END_RECORD.to_vec()),
    ]))
}
