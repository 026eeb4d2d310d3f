//! Random-access byte sources
//!
//! A [`ByteSource`] has a fixed length and answers `read(start, end)` with
//! exactly `end - start` bytes. Sources compose: a [`Merged`](ByteSource::Merged)
//! source concatenates children, a [`Hashing`](ByteSource::Hashing) source
//! digests everything read through it. Digest state lives in a [`Digests`]
//! table owned by the pipeline; sources only hold a [`DigestHandle`].

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use opendal::Operator;
use rand::RngCore;
use tcdrop_core::{TcdropError, TcdropResult};
use tracing::{debug, warn};

/// Index of a digest slot in a [`Digests`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestHandle(usize);

#[derive(Debug)]
struct DigestSlot {
    hasher: blake3::Hasher,
    /// Length of the hashed source
    len: u64,
    /// End of the contiguous prefix fed to the hasher so far
    seen_end: u64,
    gaps: bool,
}

/// Running BLAKE3 digests, one per hashing source in a pipeline.
#[derive(Debug, Default)]
pub struct Digests {
    slots: Vec<DigestSlot>,
}

impl Digests {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, len: u64) -> DigestHandle {
        self.slots.push(DigestSlot {
            hasher: blake3::Hasher::new(),
            len,
            seen_end: 0,
            gaps: false,
        });
        DigestHandle(self.slots.len() - 1)
    }

    /// Feed the never-seen part of `data` (which starts at `start`).
    ///
    /// Overlapping and repeated ranges are tolerated. A range starting past
    /// the contiguous prefix leaves a hole and poisons the digest.
    fn observe(&mut self, handle: DigestHandle, start: u64, data: &[u8]) -> TcdropResult<()> {
        let slot = self.slot_mut(handle)?;
        if slot.gaps {
            return Ok(());
        }
        if start > slot.seen_end {
            warn!(start, seen_end = slot.seen_end, "hashing source read left a gap");
            slot.gaps = true;
            return Ok(());
        }
        let end = start + data.len() as u64;
        if end > slot.seen_end {
            let fresh = (slot.seen_end - start) as usize;
            slot.hasher.update(&data[fresh..]);
            slot.seen_end = end;
        }
        Ok(())
    }

    pub fn has_gaps(&self, handle: DigestHandle) -> bool {
        self.slots.get(handle.0).is_some_and(|s| s.gaps)
    }

    /// Bytes hashed so far (the contiguous prefix `[0, seen_end)`).
    pub fn seen(&self, handle: DigestHandle) -> u64 {
        self.slots.get(handle.0).map_or(0, |s| s.seen_end)
    }

    /// Digest of the whole source. Fails if a gap was observed or the source
    /// has not been read to its end.
    pub fn digest(&self, handle: DigestHandle) -> TcdropResult<blake3::Hash> {
        let slot = self
            .slots
            .get(handle.0)
            .ok_or_else(|| TcdropError::Usage(format!("unknown digest handle {}", handle.0)))?;
        if slot.gaps {
            return Err(TcdropError::Format(
                "content digest unusable: source was read with gaps".into(),
            ));
        }
        if slot.seen_end != slot.len {
            return Err(TcdropError::Format(format!(
                "content digest incomplete: {} of {} bytes hashed",
                slot.seen_end, slot.len
            )));
        }
        Ok(slot.hasher.finalize())
    }

    fn slot_mut(&mut self, handle: DigestHandle) -> TcdropResult<&mut DigestSlot> {
        self.slots
            .get_mut(handle.0)
            .ok_or_else(|| TcdropError::Usage(format!("unknown digest handle {}", handle.0)))
    }
}

/// How a [`ByteSource::Generated`] source fills its range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    Zero,
    Byte(u8),
    Random,
}

/// A byte range of an object in an OpenDAL operator.
#[derive(Clone)]
pub struct Backing {
    op: Operator,
    path: String,
    offset: u64,
    len: u64,
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backing")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[derive(Debug)]
pub struct Hashing {
    inner: Box<ByteSource>,
    handle: DigestHandle,
}

#[derive(Debug)]
pub struct Merged {
    children: Vec<ByteSource>,
    /// `ends[i]` is the offset one past child `i`
    ends: Vec<u64>,
}

#[derive(Debug)]
pub enum ByteSource {
    Constant(Bytes),
    Backing(Backing),
    Generated { len: u64, fill: Fill },
    Hashing(Hashing),
    Merged(Merged),
}

impl ByteSource {
    pub fn constant(data: impl Into<Bytes>) -> Self {
        Self::Constant(data.into())
    }

    pub fn generated(len: u64, fill: Fill) -> Self {
        Self::Generated { len, fill }
    }

    /// Whole object at `path`; its length is taken from `stat`.
    pub async fn backing(op: Operator, path: impl Into<String>) -> TcdropResult<Self> {
        let path = path.into();
        let meta = op
            .stat(&path)
            .await
            .map_err(|e| TcdropError::Transport(format!("stat {path}: {e}")))?;
        Ok(Self::backing_range(op, path, 0, meta.content_length()))
    }

    /// `len` bytes of the object at `path`, starting at `offset`.
    pub fn backing_range(op: Operator, path: impl Into<String>, offset: u64, len: u64) -> Self {
        Self::Backing(Backing {
            op,
            path: path.into(),
            offset,
            len,
        })
    }

    /// Wrap `inner` so every byte read through it is digested into a new
    /// slot of `digests`.
    pub fn hashing(inner: ByteSource, digests: &mut Digests) -> (Self, DigestHandle) {
        let handle = digests.register(inner.len());
        (
            Self::Hashing(Hashing {
                inner: Box::new(inner),
                handle,
            }),
            handle,
        )
    }

    pub fn merged(children: Vec<ByteSource>) -> Self {
        let mut ends = Vec::with_capacity(children.len());
        let mut total = 0u64;
        for child in &children {
            total += child.len();
            ends.push(total);
        }
        Self::Merged(Merged { children, ends })
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Constant(data) => data.len() as u64,
            Self::Backing(b) => b.len,
            Self::Generated { len, .. } => *len,
            Self::Hashing(h) => h.inner.len(),
            Self::Merged(m) => m.ends.last().copied().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `[start, end)`. Always yields exactly `end - start` bytes or an
    /// error.
    pub fn read<'a>(
        &'a self,
        start: u64,
        end: u64,
        digests: &'a mut Digests,
    ) -> BoxFuture<'a, TcdropResult<Bytes>> {
        async move {
            let len = self.len();
            if start > end || end > len {
                return Err(TcdropError::Usage(format!(
                    "read {start}..{end} outside source of {len} bytes"
                )));
            }
            if start == end {
                return Ok(Bytes::new());
            }
            let data = match self {
                Self::Constant(data) => data.slice(start as usize..end as usize),
                Self::Backing(b) => b.read(start, end).await?,
                Self::Generated { fill, .. } => generate(*fill, (end - start) as usize),
                Self::Hashing(h) => {
                    let data = h.inner.read(start, end, digests).await?;
                    digests.observe(h.handle, start, &data)?;
                    data
                }
                Self::Merged(m) => m.read(start, end, digests).await?,
            };
            check_len(end - start, data.len())?;
            Ok(data)
        }
        .boxed()
    }
}

fn check_len(expected: u64, got: usize) -> TcdropResult<()> {
    if got as u64 != expected {
        return Err(TcdropError::RangeMismatch {
            expected,
            got: got as u64,
        });
    }
    Ok(())
}

fn generate(fill: Fill, len: usize) -> Bytes {
    match fill {
        Fill::Zero => Bytes::from(vec![0u8; len]),
        Fill::Byte(b) => Bytes::from(vec![b; len]),
        Fill::Random => {
            let mut buf = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut buf);
            Bytes::from(buf)
        }
    }
}

impl Backing {
    async fn read(&self, start: u64, end: u64) -> TcdropResult<Bytes> {
        let range = self.offset + start..self.offset + end;
        let buf = self
            .op
            .read_with(&self.path)
            .range(range)
            .await
            .map_err(|e| TcdropError::Transport(format!("read {}: {e}", self.path)))?;
        Ok(buf.to_bytes())
    }
}

impl Merged {
    async fn read(&self, start: u64, end: u64, digests: &mut Digests) -> TcdropResult<Bytes> {
        // First child whose range extends past `start`
        let mut idx = self.ends.partition_point(|&e| e <= start);
        let mut pos = start;
        let mut parts: Vec<Bytes> = Vec::new();

        while pos < end {
            let (Some(child), Some(&child_end)) = (self.children.get(idx), self.ends.get(idx))
            else {
                return Err(TcdropError::RangeMismatch {
                    expected: end - start,
                    got: pos - start,
                });
            };
            let child_start = child_end - child.len();
            let sub_end = end.min(child_end);
            if sub_end > pos {
                let data = child
                    .read(pos - child_start, sub_end - child_start, digests)
                    .await?;
                check_len(sub_end - pos, data.len())?;
                pos = sub_end;
                parts.push(data);
            }
            idx += 1;
        }

        if parts.len() == 1 {
            return Ok(parts.swap_remove(0));
        }
        debug!(start, end, children = parts.len(), "merged read spans children");
        let mut out = BytesMut::with_capacity((end - start) as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }
}
