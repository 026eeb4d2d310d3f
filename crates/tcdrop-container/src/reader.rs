//! Push-fed container reader
//!
//! The transport pushes ciphertext in chunks of any size through
//! [`ContainerReader::write`] (or [`write_at`](ContainerReader::write_at) for
//! offset-tagged, possibly overlapping chunks). The reader parses the outer
//! records, unwraps the file key, decrypts the wrap and parses the inner
//! records, reporting progress as [`ReadEvent`]s.
//!
//! Payload bytes are handed out as they are decrypted and are untrusted
//! until the final [`ReadEvent::Verified`]: callers must stage them and only
//! commit after verification.

use std::sync::Arc;

use bytes::Bytes;
use secrecy::SecretString;
use tcdrop_core::config::{ContainerConfig, TransferConfig};
use tcdrop_core::{FileMeta, TcdropError, TcdropResult};
use tcdrop_crypto::keywrap::CONTEXT_SIZE;
use tcdrop_crypto::{
    derive_meta_mac_key, Direction, FileKey, KeyUnwrap, KeyWrapOracle, LinkSecret, RetryHandler,
    SecurityContext, StreamingGcm, BLOCK_SIZE, TAG_SIZE,
};
use tracing::{debug, info, warn};

use crate::meta::MetaCollector;
use crate::tlv::{
    encode_record, Tag, TlvItem, TlvParser, DEFAULT_MAX_RECORD, FORMAT_VERSION, MAGIC, MAGIC_LEN,
};
use crate::STREAM_IV_SIZE;

/// Enough leading bytes for [`peek_header`] on a container from
/// [`ContainerWriter`](crate::ContainerWriter).
pub const HEADER_PEEK_LEN: usize =
    MAGIC_LEN + 5 + STREAM_IV_SIZE + CONTEXT_SIZE + 5 + (BLOCK_SIZE - 1) + 9;

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Suspend after authenticated metadata until [`ContainerReader::resume`]
    pub pause_after_metadata: bool,
    /// Upper bound on a buffered metadata record
    pub max_record: usize,
    /// Ciphertext decrypted between cooperative yields
    pub crypt_slice: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            pause_after_metadata: false,
            max_record: DEFAULT_MAX_RECORD,
            crypt_slice: 1024 * 1024,
        }
    }
}

impl ReaderOptions {
    pub fn from_config(transfer: &TransferConfig, container: &ContainerConfig) -> Self {
        Self {
            pause_after_metadata: container.pause_after_metadata,
            crypt_slice: transfer.crypt_slice.max(1),
            ..Self::default()
        }
    }
}

/// Outcome of a fully verified container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    pub meta: FileMeta,
    pub payload_len: u64,
    /// BLAKE3 over the payload plaintext
    pub content_digest: blake3::Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    /// The container is password protected; call `supply_password`
    PasswordRequired,
    /// Metadata whose MAC has been checked
    Metadata(FileMeta),
    /// Decrypted payload bytes, not yet authenticated
    Payload(Bytes),
    /// GCM tag checked and payload size confirmed; everything is authentic
    Verified(ReadSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Magic,
    Security,
    Header,
    Body,
    Trailer,
    End,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suspend {
    Password,
    Metadata,
}

pub struct ContainerReader {
    link: LinkSecret,
    oracle: Arc<dyn KeyWrapOracle>,
    retry: RetryHandler,
    password: Option<SecretString>,
    options: ReaderOptions,

    stage: Stage,
    suspended: Option<Suspend>,
    /// Ciphertext pushed while suspended
    backlog: Vec<u8>,
    /// Decrypted body not yet parsed when metadata paused the reader
    plain_backlog: Vec<u8>,
    /// Total bytes accepted from the transport
    consumed: u64,

    magic: Vec<u8>,
    outer: TlvParser,
    inner: TlvParser,
    aad: Vec<u8>,
    stream_iv: [u8; STREAM_IV_SIZE],
    unwrap: Option<KeyUnwrap>,
    gcm: Option<StreamingGcm>,

    collector: Option<MetaCollector>,
    meta: Option<FileMeta>,
    payload_declared: Option<u64>,
    payload_seen: u64,
    hasher: blake3::Hasher,
    summary: Option<ReadSummary>,
}

impl std::fmt::Debug for ContainerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerReader")
            .field("stage", &self.stage)
            .field("suspended", &self.suspended)
            .field("consumed", &self.consumed)
            .field("payload_seen", &self.payload_seen)
            .finish_non_exhaustive()
    }
}

impl ContainerReader {
    pub fn new(
        link: LinkSecret,
        oracle: Arc<dyn KeyWrapOracle>,
        retry: RetryHandler,
        options: ReaderOptions,
    ) -> Self {
        let inner = TlvParser::new(options.max_record);
        Self {
            link,
            oracle,
            retry,
            password: None,
            options,
            stage: Stage::Magic,
            suspended: None,
            backlog: Vec::new(),
            plain_backlog: Vec::new(),
            consumed: 0,
            magic: Vec::with_capacity(MAGIC_LEN),
            outer: TlvParser::default(),
            inner,
            aad: Vec::new(),
            stream_iv: [0u8; STREAM_IV_SIZE],
            unwrap: None,
            gcm: None,
            collector: None,
            meta: None,
            payload_declared: None,
            payload_seen: 0,
            hasher: blake3::Hasher::new(),
            summary: None,
        }
    }

    /// Password to try before asking. If it turns out wrong the reader falls
    /// back to emitting `PasswordRequired`.
    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    /// Bytes accepted so far; the offset the next `write_at` must not skip past.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn metadata(&self) -> Option<&FileMeta> {
        self.meta.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn is_waiting_for_password(&self) -> bool {
        self.suspended == Some(Suspend::Password)
    }

    pub fn is_paused(&self) -> bool {
        self.suspended == Some(Suspend::Metadata)
    }

    /// Wrong passwords tried so far.
    pub fn password_attempts(&self) -> u32 {
        self.unwrap.as_ref().map_or(0, KeyUnwrap::password_attempts)
    }

    /// Push the next chunk of the container.
    pub async fn write(&mut self, chunk: &[u8]) -> TcdropResult<Vec<ReadEvent>> {
        self.check_usable()?;
        self.consumed += chunk.len() as u64;
        let mut events = Vec::new();
        let result = self.process(chunk, &mut events).await;
        self.settle(result).map(|()| events)
    }

    /// Push a chunk that starts at `offset`. Already-consumed bytes are
    /// dropped; a chunk starting past `consumed()` is a gap and is rejected.
    pub async fn write_at(&mut self, offset: u64, chunk: &[u8]) -> TcdropResult<Vec<ReadEvent>> {
        if offset > self.consumed {
            return Err(TcdropError::Transport(format!(
                "gap in input: expected offset {}, got {offset}",
                self.consumed
            )));
        }
        let skip = self.consumed - offset;
        if skip >= chunk.len() as u64 {
            return Ok(Vec::new());
        }
        if skip > 0 {
            debug!(offset, skip, "dropping re-pushed prefix");
        }
        self.write(&chunk[skip as usize..]).await
    }

    /// Answer a `PasswordRequired` event.
    ///
    /// A wrong password returns `PasswordIncorrect` and leaves the reader
    /// waiting for another attempt.
    pub async fn supply_password(&mut self, password: SecretString) -> TcdropResult<Vec<ReadEvent>> {
        self.check_usable()?;
        if self.suspended != Some(Suspend::Password) {
            return Err(TcdropError::Usage("no password was requested".into()));
        }
        let unwrap = self
            .unwrap
            .as_mut()
            .ok_or_else(|| TcdropError::Usage("no security context yet".into()))?;
        let key = match unwrap
            .unwrap(Some(&password), self.oracle.as_ref(), &mut self.retry)
            .await
        {
            Ok(key) => key,
            Err(TcdropError::PasswordIncorrect) => return Err(TcdropError::PasswordIncorrect),
            Err(e) => return self.settle(Err(e)).map(|()| Vec::new()),
        };
        let mut events = Vec::new();
        let result = async {
            self.start_decrypt(key)?;
            self.suspended = None;
            self.drain_backlog(&mut events).await
        }
        .await;
        self.settle(result).map(|()| events)
    }

    /// Continue after a metadata pause.
    pub async fn resume(&mut self) -> TcdropResult<Vec<ReadEvent>> {
        self.check_usable()?;
        if self.suspended != Some(Suspend::Metadata) {
            return Err(TcdropError::Usage("reader is not paused".into()));
        }
        self.suspended = None;
        debug!("resuming after metadata");

        let mut events = Vec::new();
        let result = async {
            let plain = std::mem::take(&mut self.plain_backlog);
            let verified = self.gcm.as_ref().is_some_and(StreamingGcm::is_finalized);
            if verified {
                self.on_plain(&plain, &mut events)?;
                if self.summary.is_none() {
                    self.check_body()?;
                }
            } else {
                self.on_plain(&plain, &mut events).map_err(unauthenticated)?;
            }
            self.drain_backlog(&mut events).await
        }
        .await;
        self.settle(result).map(|()| events)
    }

    /// Signal end of input. Fails with `Truncated` unless the END marker was
    /// reached.
    pub fn finish(&mut self) -> TcdropResult<ReadSummary> {
        match (self.stage, self.suspended) {
            (Stage::Failed, _) => Err(TcdropError::Usage("reader already failed".into())),
            (_, Some(Suspend::Password)) => Err(TcdropError::PasswordRequired),
            (Stage::Done, _) => self
                .summary
                .clone()
                .ok_or_else(|| TcdropError::Usage("finished without a summary".into())),
            (stage, _) => {
                warn!(?stage, consumed = self.consumed, "input ended early");
                Err(TcdropError::Truncated(format!(
                    "input ended in the {stage:?} section after {} bytes",
                    self.consumed
                )))
            }
        }
    }

    fn check_usable(&self) -> TcdropResult<()> {
        if self.stage == Stage::Failed {
            return Err(TcdropError::Usage("reader already failed".into()));
        }
        Ok(())
    }

    /// Any error out of processing is fatal for this reader.
    fn settle(&mut self, result: TcdropResult<()>) -> TcdropResult<()> {
        if let Err(e) = &result {
            warn!(error = %e, stage = ?self.stage, "container rejected");
            self.stage = Stage::Failed;
            self.gcm = None;
            self.backlog.clear();
            self.plain_backlog.clear();
        }
        result
    }

    async fn drain_backlog(&mut self, events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        let backlog = std::mem::take(&mut self.backlog);
        self.process(&backlog, events).await
    }

    async fn process(&mut self, mut input: &[u8], events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        while !input.is_empty() {
            if self.suspended.is_some() {
                self.backlog.extend_from_slice(input);
                return Ok(());
            }
            match self.stage {
                Stage::Magic => self.read_magic(&mut input)?,
                Stage::Done => {
                    return Err(TcdropError::Format(format!(
                        "{} bytes of trailing data after END",
                        input.len()
                    )))
                }
                Stage::Failed => return Err(TcdropError::Usage("reader already failed".into())),
                _ => match self.outer.next(&mut input)? {
                    Some(item) => self.on_outer(item, events).await?,
                    None => break,
                },
            }
        }
        Ok(())
    }

    fn read_magic(&mut self, input: &mut &[u8]) -> TcdropResult<()> {
        let whole = *input;
        let n = (MAGIC_LEN - self.magic.len()).min(whole.len());
        self.magic.extend_from_slice(&whole[..n]);
        *input = &whole[n..];

        let check = self.magic.len().min(MAGIC.len());
        if self.magic[..check] != MAGIC[..check] {
            return Err(TcdropError::UnrecognizedFormat);
        }
        if self.magic.len() == MAGIC_LEN {
            if self.magic[MAGIC.len()] != FORMAT_VERSION {
                return Err(TcdropError::Format(format!(
                    "unsupported container version {}",
                    self.magic[MAGIC.len()]
                )));
            }
            self.stage = Stage::Security;
        }
        Ok(())
    }

    async fn on_outer(&mut self, item: TlvItem<'_>, events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        match (self.stage, item) {
            (Stage::Security, TlvItem::Record { tag: Tag::Sec, value }) => {
                self.on_security(&value, events).await
            }
            (Stage::Header, TlvItem::Start { tag: Tag::Padding, .. })
            | (Stage::Header, TlvItem::Data { tag: Tag::Padding, .. }) => Ok(()),
            (Stage::Header, TlvItem::Start { tag: Tag::EncWrap, len }) => {
                if len == 0 {
                    return Err(TcdropError::Format("encrypted body is empty".into()));
                }
                debug!(len, "entering encrypted body");
                self.stage = Stage::Body;
                Ok(())
            }
            (Stage::Body, TlvItem::Data { tag: Tag::EncWrap, data, remaining }) => {
                self.decrypt(data, events).await?;
                if remaining == 0 {
                    self.stage = Stage::Trailer;
                }
                Ok(())
            }
            (Stage::Trailer, TlvItem::Record { tag: Tag::GcmTag, value }) => {
                self.on_tag(&value, events)
            }
            (Stage::End, TlvItem::End) => {
                let summary = self
                    .summary
                    .clone()
                    .ok_or_else(|| TcdropError::Format("END before the body was verified".into()))?;
                self.stage = Stage::Done;
                info!(
                    name = %summary.meta.name,
                    bytes = summary.payload_len,
                    digest = %summary.content_digest,
                    "container verified"
                );
                events.push(ReadEvent::Verified(summary));
                Ok(())
            }
            (stage, item) => Err(TcdropError::Format(format!(
                "unexpected {} in the {stage:?} section",
                describe(&item)
            ))),
        }
    }

    async fn on_security(&mut self, value: &[u8], events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        if value.len() != STREAM_IV_SIZE + CONTEXT_SIZE {
            return Err(TcdropError::Format(format!(
                "SEC record is {} bytes, expected {}",
                value.len(),
                STREAM_IV_SIZE + CONTEXT_SIZE
            )));
        }
        let context = SecurityContext::from_bytes(&value[STREAM_IV_SIZE..])?;
        self.stream_iv.copy_from_slice(&value[..STREAM_IV_SIZE]);
        self.aad = self.magic.clone();
        self.aad.extend(encode_record(Tag::Sec, value)?);
        self.stage = Stage::Header;

        let mut unwrap = KeyUnwrap::new(context, self.link.clone());
        if unwrap.needs_password() && self.password.is_none() {
            info!("container is password protected");
            self.unwrap = Some(unwrap);
            self.suspended = Some(Suspend::Password);
            events.push(ReadEvent::PasswordRequired);
            return Ok(());
        }

        let outcome = unwrap
            .unwrap(self.password.as_ref(), self.oracle.as_ref(), &mut self.retry)
            .await;
        self.unwrap = Some(unwrap);
        match outcome {
            Ok(key) => self.start_decrypt(key),
            Err(TcdropError::PasswordIncorrect) => {
                warn!("preset password rejected, asking for another");
                self.password = None;
                self.suspended = Some(Suspend::Password);
                events.push(ReadEvent::PasswordRequired);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn start_decrypt(&mut self, key: FileKey) -> TcdropResult<()> {
        let mac_key = derive_meta_mac_key(&key);
        self.collector = Some(MetaCollector::new(&mac_key)?);
        self.gcm = Some(StreamingGcm::new(
            key.as_bytes(),
            &self.stream_iv,
            &self.aad,
            TAG_SIZE,
            Direction::Decrypt,
        )?);
        debug!("file key unwrapped");
        Ok(())
    }

    async fn decrypt(&mut self, data: &[u8], events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        let slices = data.chunks(self.options.crypt_slice.max(1));
        let count = slices.len();
        for (i, slice) in slices.enumerate() {
            let gcm = self
                .gcm
                .as_mut()
                .ok_or_else(|| TcdropError::Usage("encrypted body before the file key".into()))?;
            let plain = gcm.update(slice)?;
            self.on_plain(&plain, events).map_err(unauthenticated)?;
            if i + 1 < count {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    fn on_tag(&mut self, value: &[u8], events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        if value.len() != TAG_SIZE {
            return Err(TcdropError::Format(format!(
                "GCMTAG is {} bytes, expected {TAG_SIZE}",
                value.len()
            )));
        }
        let gcm = self
            .gcm
            .as_mut()
            .ok_or_else(|| TcdropError::Usage("tag before the file key".into()))?;
        let fin = gcm.finalize(value)?;
        debug!("GCM tag verified");
        self.stage = Stage::End;
        self.on_plain(&fin.output, events)?;
        if self.suspended.is_none() {
            self.check_body()?;
        }
        Ok(())
    }

    /// Whole-body checks once the tag has verified and all plaintext is parsed.
    fn check_body(&mut self) -> TcdropResult<()> {
        if !self.inner.at_boundary() {
            return Err(TcdropError::Format(
                "encrypted body ends inside a record".into(),
            ));
        }
        let meta = self
            .meta
            .clone()
            .ok_or_else(|| TcdropError::Format("encrypted body has no metadata".into()))?;
        let declared = self
            .payload_declared
            .ok_or_else(|| TcdropError::Format("encrypted body has no payload record".into()))?;
        if self.payload_seen != declared {
            return Err(TcdropError::Format(format!(
                "payload is {} bytes, declared {declared}",
                self.payload_seen
            )));
        }
        self.summary = Some(ReadSummary {
            meta,
            payload_len: self.payload_seen,
            content_digest: self.hasher.finalize(),
        });
        Ok(())
    }

    fn on_plain(&mut self, plain: &[u8], events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        let mut input = plain;
        while !input.is_empty() {
            if self.suspended.is_some() {
                self.plain_backlog.extend_from_slice(input);
                return Ok(());
            }
            match self.inner.next(&mut input)? {
                Some(item) => self.on_inner(item, events)?,
                None => break,
            }
        }
        Ok(())
    }

    fn on_inner(&mut self, item: TlvItem<'_>, events: &mut Vec<ReadEvent>) -> TcdropResult<()> {
        match item {
            TlvItem::Record {
                tag: Tag::MetaMac,
                value,
            } => {
                let collector = self
                    .collector
                    .take()
                    .ok_or_else(|| TcdropError::Format("second METAMAC record".into()))?;
                let meta = collector.verify(&value)?;
                events.push(ReadEvent::Metadata(meta.clone()));
                self.meta = Some(meta);
                if self.options.pause_after_metadata {
                    debug!("pausing after metadata");
                    self.suspended = Some(Suspend::Metadata);
                }
                Ok(())
            }
            TlvItem::Record { tag, value } if MetaCollector::is_field(tag) => self
                .collector
                .as_mut()
                .ok_or_else(|| TcdropError::Format(format!("{tag:?} record after METAMAC")))?
                .accept(tag, &value),
            TlvItem::Start {
                tag: Tag::Padding, ..
            }
            | TlvItem::Data {
                tag: Tag::Padding, ..
            } => Ok(()),
            TlvItem::Start {
                tag: Tag::Payload,
                len,
            } => {
                let meta = self.meta.as_ref().ok_or_else(|| {
                    TcdropError::Format("payload before authenticated metadata".into())
                })?;
                if self.payload_declared.is_some() {
                    return Err(TcdropError::Format("second payload record".into()));
                }
                if len != meta.size {
                    return Err(TcdropError::Format(format!(
                        "payload record is {len} bytes but FSIZE declares {}",
                        meta.size
                    )));
                }
                self.payload_declared = Some(len);
                Ok(())
            }
            TlvItem::Data {
                tag: Tag::Payload,
                data,
                ..
            } => {
                self.hasher.update(data);
                self.payload_seen += data.len() as u64;
                events.push(ReadEvent::Payload(Bytes::copy_from_slice(data)));
                Ok(())
            }
            other => Err(TcdropError::Format(format!(
                "unexpected {} inside the encrypted body",
                describe(&other)
            ))),
        }
    }
}

/// Plaintext that trips the inner parser before the tag is checked can only
/// come from modified ciphertext.
fn unauthenticated(e: TcdropError) -> TcdropError {
    match e {
        TcdropError::Format(reason) => {
            debug!(%reason, "malformed plaintext ahead of the tag");
            TcdropError::Authentication
        }
        other => other,
    }
}

fn describe(item: &TlvItem<'_>) -> String {
    match item {
        TlvItem::Record { tag, .. } | TlvItem::Start { tag, .. } | TlvItem::Data { tag, .. } => {
            format!("{tag:?} record")
        }
        TlvItem::End => "END marker".into(),
    }
}

/// Unauthenticated outer header of a container.
#[derive(Debug, Clone)]
pub struct ContainerHeader {
    pub version: u8,
    pub context: SecurityContext,
    /// Length of the encrypted body, if the prefix reached its header
    pub body_len: Option<u64>,
}

/// Parse the outer header from the first bytes of a container without
/// touching any key material.
pub fn peek_header(data: &[u8]) -> TcdropResult<ContainerHeader> {
    let check = data.len().min(MAGIC.len());
    if data[..check] != MAGIC[..check] {
        return Err(TcdropError::UnrecognizedFormat);
    }
    if data.len() < MAGIC_LEN {
        return Err(TcdropError::Truncated("shorter than the magic".into()));
    }
    let version = data[MAGIC.len()];

    let mut parser = TlvParser::default();
    let mut input = &data[MAGIC_LEN..];
    let context = match parser.next(&mut input)? {
        Some(TlvItem::Record {
            tag: Tag::Sec,
            value,
        }) if value.len() == STREAM_IV_SIZE + CONTEXT_SIZE => {
            SecurityContext::from_bytes(&value[STREAM_IV_SIZE..])?
        }
        Some(other) => {
            return Err(TcdropError::Format(format!(
                "expected a SEC record, found {}",
                describe(&other)
            )))
        }
        None => return Err(TcdropError::Truncated("SEC record incomplete".into())),
    };

    let mut body_len = None;
    while let Some(item) = parser.next(&mut input)? {
        match item {
            TlvItem::Start {
                tag: Tag::EncWrap,
                len,
            } => {
                body_len = Some(len);
                break;
            }
            TlvItem::Start {
                tag: Tag::Padding, ..
            }
            | TlvItem::Data {
                tag: Tag::Padding, ..
            } => {}
            other => {
                return Err(TcdropError::Format(format!(
                    "unexpected {} in the header",
                    describe(&other)
                )))
            }
        }
    }

    Ok(ContainerHeader {
        version,
        context,
        body_len,
    })
}
