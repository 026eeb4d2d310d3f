//! Encrypted metadata block
//!
//! FNAME, MIME, TIME, FSIZE and an optional MSG record, followed by METAMAC:
//! HMAC-SHA256 over the encoded bytes of the preceding records, keyed by the
//! metadata MAC key derived from the file key. The whole block sits inside the
//! AEAD-encrypted wrap; the MAC lets a reader act on metadata before the GCM
//! tag at the end of the stream has been checked.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tcdrop_core::{FileMeta, TcdropError, TcdropResult};
use tracing::{debug, warn};

use crate::tlv::{encode_record, Tag, TlvItem, TlvParser};

type HmacSha256 = Hmac<Sha256>;

pub const META_MAC_SIZE: usize = 32;

fn new_mac(key: &[u8; 32]) -> TcdropResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| TcdropError::Usage(format!("metadata MAC key: {e}")))
}

/// Encode the metadata records plus METAMAC.
pub fn encode_metadata(meta: &FileMeta, mac_key: &[u8; 32]) -> TcdropResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend(encode_record(Tag::FileName, meta.name.as_bytes())?);
    out.extend(encode_record(Tag::Mime, meta.mime.as_bytes())?);
    out.extend(encode_record(Tag::Time, &meta.uploaded_at_ms.to_be_bytes())?);
    out.extend(encode_record(Tag::FileSize, &meta.size.to_be_bytes())?);
    if let Some(message) = &meta.message {
        out.extend(encode_record(Tag::Message, message.as_bytes())?);
    }

    let mut mac = new_mac(mac_key)?;
    mac.update(&out);
    let tag = mac.finalize().into_bytes();
    out.extend(encode_record(Tag::MetaMac, &tag)?);
    Ok(out)
}

/// Reader-side accumulator for metadata records.
pub struct MetaCollector {
    mac: HmacSha256,
    name: Option<String>,
    mime: Option<String>,
    uploaded_at_ms: Option<u64>,
    size: Option<u64>,
    message: Option<String>,
}

impl std::fmt::Debug for MetaCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaCollector")
            .field("name", &self.name)
            .field("mime", &self.mime)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MetaCollector {
    pub fn new(mac_key: &[u8; 32]) -> TcdropResult<Self> {
        Ok(Self {
            mac: new_mac(mac_key)?,
            name: None,
            mime: None,
            uploaded_at_ms: None,
            size: None,
            message: None,
        })
    }

    /// Whether `tag` is one of the MAC-covered metadata fields.
    pub fn is_field(tag: Tag) -> bool {
        matches!(
            tag,
            Tag::FileName | Tag::Mime | Tag::Time | Tag::FileSize | Tag::Message
        )
    }

    /// Absorb one metadata record.
    pub fn accept(&mut self, tag: Tag, value: &[u8]) -> TcdropResult<()> {
        self.mac.update(&encode_record(tag, value)?);
        match tag {
            Tag::FileName => set_once(&mut self.name, tag, utf8(tag, value)?),
            Tag::Mime => set_once(&mut self.mime, tag, utf8(tag, value)?),
            Tag::Message => set_once(&mut self.message, tag, utf8(tag, value)?),
            Tag::Time => set_once(&mut self.uploaded_at_ms, tag, be_u64(tag, value)?),
            Tag::FileSize => set_once(&mut self.size, tag, be_u64(tag, value)?),
            other => Err(TcdropError::Format(format!(
                "{other:?} is not a metadata record"
            ))),
        }
    }

    /// Check METAMAC and assemble the metadata.
    ///
    /// A MAC mismatch means the block was altered and fails with
    /// `Authentication`; missing mandatory fields fail with `Format`.
    pub fn verify(self, mac_tag: &[u8]) -> TcdropResult<FileMeta> {
        if mac_tag.len() != META_MAC_SIZE {
            return Err(TcdropError::Format(format!(
                "METAMAC is {} bytes, expected {META_MAC_SIZE}",
                mac_tag.len()
            )));
        }
        if self.mac.verify_slice(mac_tag).is_err() {
            warn!("metadata MAC mismatch");
            return Err(TcdropError::Authentication);
        }
        let meta = FileMeta {
            name: required(self.name, Tag::FileName)?,
            mime: required(self.mime, Tag::Mime)?,
            uploaded_at_ms: required(self.uploaded_at_ms, Tag::Time)?,
            size: required(self.size, Tag::FileSize)?,
            message: self.message,
        };
        debug!(name = %meta.name, size = meta.size, "metadata verified");
        Ok(meta)
    }
}

fn set_once<T>(slot: &mut Option<T>, tag: Tag, value: T) -> TcdropResult<()> {
    if slot.is_some() {
        return Err(TcdropError::Format(format!("duplicate {tag:?} record")));
    }
    *slot = Some(value);
    Ok(())
}

fn required<T>(slot: Option<T>, tag: Tag) -> TcdropResult<T> {
    slot.ok_or_else(|| TcdropError::Format(format!("metadata is missing {tag:?}")))
}

fn utf8(tag: Tag, value: &[u8]) -> TcdropResult<String> {
    String::from_utf8(value.to_vec())
        .map_err(|_| TcdropError::Format(format!("{tag:?} is not valid UTF-8")))
}

fn be_u64(tag: Tag, value: &[u8]) -> TcdropResult<u64> {
    let raw: [u8; 8] = value
        .try_into()
        .map_err(|_| TcdropError::Format(format!("{tag:?} must be 8 bytes, got {}", value.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Parse a complete metadata block as produced by [`encode_metadata`].
pub fn decode_metadata(mut bytes: &[u8], mac_key: &[u8; 32]) -> TcdropResult<FileMeta> {
    let mut parser = TlvParser::default();
    let mut collector = MetaCollector::new(mac_key)?;
    while let Some(item) = parser.next(&mut bytes)? {
        match item {
            TlvItem::Record {
                tag: Tag::MetaMac,
                value,
            } => {
                if !bytes.is_empty() {
                    return Err(TcdropError::Format("trailing bytes after METAMAC".into()));
                }
                return collector.verify(&value);
            }
            TlvItem::Record { tag, value } => collector.accept(tag, &value)?,
            other => {
                return Err(TcdropError::Format(format!(
                    "unexpected {other:?} in metadata block"
                )))
            }
        }
    }
    Err(TcdropError::Truncated("metadata block has no METAMAC".into()))
}
