//! tcdrop-container: the encrypted container format
//!
//! A container is a sequence of TLV records:
//!
//! ```text
//! MAGIC "TCDROP\0" 0x01
//! SEC      stream IV + security context (authenticated, not encrypted)
//! PADDING  aligns the encrypted body to a cipher block
//! ENCWRAP  AES-256-GCM over:
//!            FNAME MIME TIME FSIZE [MSG] METAMAC
//!            PADDING
//!            ENC payload
//!            [PADDING]  length concealment
//! GCMTAG
//! END
//! ```
//!
//! [`ContainerWriter`] serves the container as a lazily produced byte range;
//! [`ContainerReader`] consumes it from pushed chunks.

pub mod cache;
pub mod meta;
pub mod padding;
pub mod reader;
pub mod source;
pub mod tlv;
pub mod transfer;
pub mod writer;

pub use padding::PaddingPolicy;
pub use reader::{
    peek_header, ContainerHeader, ContainerReader, ReadEvent, ReadSummary, ReaderOptions,
};
pub use source::{ByteSource, DigestHandle, Digests, Fill};
pub use writer::{ContainerWriter, WriterOptions};

/// Size of the GCM IV stored at the front of the SEC record
pub const STREAM_IV_SIZE: usize = 16;
