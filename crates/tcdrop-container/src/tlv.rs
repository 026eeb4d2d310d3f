//! Tag-length-value records
//!
//! Each record is a one-byte tag, a big-endian length, and the value. Tags
//! with the top bit set carry an 8-byte length, the rest a 4-byte length.
//! END is special: a single zero length byte and no value.
//!
//! [`TlvParser`] is incremental: feed it arbitrarily split input and it
//! yields whole records for short, buffered tags and slices for streaming
//! tags (payload, padding, encrypted wrap) without ever holding them whole.

use tcdrop_core::{TcdropError, TcdropResult};

/// Format identifier at the start of every container.
pub const MAGIC: &[u8; 7] = b"TCDROP\0";

pub const FORMAT_VERSION: u8 = 0x01;

/// MAGIC plus version byte
pub const MAGIC_LEN: usize = MAGIC.len() + 1;

pub const END_RECORD: [u8; 2] = [Tag::End as u8, 0x00];

/// Default bound on a buffered record's value
pub const DEFAULT_MAX_RECORD: usize = 64 * 1024;

const WIDE_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Sec = 0x01,
    FileName = 0x02,
    Mime = 0x03,
    Padding = 0x06,
    Time = 0x07,
    Message = 0x08,
    FileSize = 0x09,
    MetaMac = 0x0c,
    GcmTag = 0x0d,
    End = 0x0f,
    Payload = 0x84,
    EncWrap = 0x85,
}

/// Whether a record's value is collected whole or passed through in slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Buffered,
    Streaming,
}

impl Tag {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Sec,
            0x02 => Self::FileName,
            0x03 => Self::Mime,
            0x06 => Self::Padding,
            0x07 => Self::Time,
            0x08 => Self::Message,
            0x09 => Self::FileSize,
            0x0c => Self::MetaMac,
            0x0d => Self::GcmTag,
            0x0f => Self::End,
            0x84 => Self::Payload,
            0x85 => Self::EncWrap,
            _ => return None,
        })
    }

    pub fn is_wide(self) -> bool {
        self as u8 & WIDE_BIT != 0
    }

    /// Tag byte plus length field.
    pub fn header_len(self) -> usize {
        match self {
            Self::End => 2,
            t if t.is_wide() => 9,
            _ => 5,
        }
    }

    pub fn shape(self) -> Shape {
        match self {
            Self::Padding | Self::Payload | Self::EncWrap => Shape::Streaming,
            _ => Shape::Buffered,
        }
    }
}

/// Encode a record header for a value of `len` bytes.
pub fn encode_header(tag: Tag, len: u64) -> TcdropResult<Vec<u8>> {
    let mut out = Vec::with_capacity(tag.header_len());
    out.push(tag as u8);
    match tag {
        Tag::End if len != 0 => {
            return Err(TcdropError::Usage("END record carries no value".into()));
        }
        Tag::End => out.push(0),
        t if t.is_wide() => out.extend_from_slice(&len.to_be_bytes()),
        _ => {
            let narrow = u32::try_from(len).map_err(|_| {
                TcdropError::Usage(format!("{tag:?} value of {len} bytes exceeds a 4-byte length"))
            })?;
            out.extend_from_slice(&narrow.to_be_bytes());
        }
    }
    Ok(out)
}

/// Encode a whole record.
pub fn encode_record(tag: Tag, value: &[u8]) -> TcdropResult<Vec<u8>> {
    let mut out = encode_header(tag, value.len() as u64)?;
    out.extend_from_slice(value);
    Ok(out)
}

/// An item produced by [`TlvParser::next`].
#[derive(Debug, PartialEq, Eq)]
pub enum TlvItem<'a> {
    /// A complete buffered-shape record
    Record { tag: Tag, value: Vec<u8> },
    /// Header of a streaming-shape record; slices follow unless `len` is 0
    Start { tag: Tag, len: u64 },
    /// Part of a streaming record's value; `remaining` counts what is still
    /// to come after this slice
    Data {
        tag: Tag,
        data: &'a [u8],
        remaining: u64,
    },
    End,
}

#[derive(Debug)]
enum State {
    Header { buf: [u8; 9], have: usize },
    Buffering { tag: Tag, len: usize, value: Vec<u8> },
    Streaming { tag: Tag, remaining: u64 },
}

impl State {
    fn header() -> Self {
        Self::Header {
            buf: [0u8; 9],
            have: 0,
        }
    }
}

/// Incremental TLV parser; state persists across input chunks.
#[derive(Debug)]
pub struct TlvParser {
    state: State,
    max_record: usize,
}

impl Default for TlvParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD)
    }
}

impl TlvParser {
    pub fn new(max_record: usize) -> Self {
        Self {
            state: State::header(),
            max_record,
        }
    }

    /// True between records, i.e. no partially parsed header or value.
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, State::Header { have: 0, .. })
    }

    /// Consume from `input` until an item is complete.
    ///
    /// Returns `Ok(None)` once `input` is exhausted without completing one.
    /// On return `input` points at the unconsumed remainder.
    pub fn next<'a>(&mut self, input: &mut &'a [u8]) -> TcdropResult<Option<TlvItem<'a>>> {
        loop {
            match &mut self.state {
                State::Header { buf, have } => {
                    let Some(&first) = input.first() else {
                        return Ok(None);
                    };
                    let tag_byte = if *have == 0 { first } else { buf[0] };
                    let tag = Tag::from_u8(tag_byte).ok_or_else(|| {
                        TcdropError::Format(format!("unknown record tag 0x{tag_byte:02x}"))
                    })?;
                    let need = tag.header_len();
                    let whole: &'a [u8] = *input;
                    let n = (need - *have).min(whole.len());
                    buf[*have..*have + n].copy_from_slice(&whole[..n]);
                    *have += n;
                    *input = &whole[n..];
                    if *have < need {
                        return Ok(None);
                    }
                    let len = match need {
                        2 => u64::from(buf[1]),
                        5 => u64::from(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]])),
                        _ => {
                            let mut wide = [0u8; 8];
                            wide.copy_from_slice(&buf[1..9]);
                            u64::from_be_bytes(wide)
                        }
                    };
                    if let Some(item) = self.begin(tag, len)? {
                        return Ok(Some(item));
                    }
                }
                State::Buffering { tag, len, value } => {
                    if value.len() < *len {
                        if input.is_empty() {
                            return Ok(None);
                        }
                        let whole: &'a [u8] = *input;
                        let n = (*len - value.len()).min(whole.len());
                        value.extend_from_slice(&whole[..n]);
                        *input = &whole[n..];
                    }
                    if value.len() == *len {
                        let item = TlvItem::Record {
                            tag: *tag,
                            value: std::mem::take(value),
                        };
                        self.state = State::header();
                        return Ok(Some(item));
                    }
                }
                State::Streaming { tag, remaining } => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    let whole: &'a [u8] = *input;
                    let n = (*remaining).min(whole.len() as u64) as usize;
                    let (data, rest) = whole.split_at(n);
                    *input = rest;
                    *remaining -= n as u64;
                    let item = TlvItem::Data {
                        tag: *tag,
                        data,
                        remaining: *remaining,
                    };
                    if *remaining == 0 {
                        self.state = State::header();
                    }
                    return Ok(Some(item));
                }
            }
        }
    }

    /// Transition out of a completed header.
    fn begin(&mut self, tag: Tag, len: u64) -> TcdropResult<Option<TlvItem<'static>>> {
        if tag == Tag::End {
            if len != 0 {
                return Err(TcdropError::Format(format!(
                    "END record with non-zero length {len}"
                )));
            }
            self.state = State::header();
            return Ok(Some(TlvItem::End));
        }
        match tag.shape() {
            Shape::Buffered => {
                let len = usize::try_from(len)
                    .ok()
                    .filter(|&l| l <= self.max_record)
                    .ok_or_else(|| {
                        TcdropError::Format(format!(
                            "{tag:?} record of {len} bytes exceeds the {} byte limit",
                            self.max_record
                        ))
                    })?;
                self.state = State::Buffering {
                    tag,
                    len,
                    value: Vec::with_capacity(len),
                };
                Ok(None)
            }
            Shape::Streaming => {
                self.state = if len == 0 {
                    State::header()
                } else {
                    State::Streaming {
                        tag,
                        remaining: len,
                    }
                };
                Ok(Some(TlvItem::Start { tag, len }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collect parser output into owned form for comparison.
    #[derive(Debug, PartialEq, Eq)]
    enum Owned {
        Record(Tag, Vec<u8>),
        Stream(Tag, u64, Vec<u8>),
        End,
    }

    fn parse_all(bytes: &[u8], split: usize) -> TcdropResult<(Vec<Owned>, bool)> {
        let mut parser = TlvParser::default();
        let mut out: Vec<Owned> = Vec::new();
        for chunk in bytes.chunks(split.max(1)) {
            let mut input = chunk;
            while let Some(item) = parser.next(&mut input)? {
                match item {
                    TlvItem::Record { tag, value } => out.push(Owned::Record(tag, value)),
                    TlvItem::Start { tag, len } => out.push(Owned::Stream(tag, len, Vec::new())),
                    TlvItem::Data { data, .. } => match out.last_mut() {
                        Some(Owned::Stream(_, _, buf)) => buf.extend_from_slice(data),
                        other => panic!("data without start: {other:?}"),
                    },
                    TlvItem::End => out.push(Owned::End),
                }
            }
        }
        Ok((out, parser.at_boundary()))
    }

    fn sample() -> Vec<u8> {
        let mut bytes = encode_record(Tag::FileName, b"a.txt").unwrap();
        bytes.extend(encode_record(Tag::Padding, &[0u8; 3]).unwrap());
        bytes.extend(encode_record(Tag::Payload, b"payload bytes").unwrap());
        bytes.extend(encode_record(Tag::Padding, &[]).unwrap());
        bytes.extend(encode_record(Tag::Message, &[]).unwrap());
        bytes.extend_from_slice(&END_RECORD);
        bytes
    }

    #[test]
    fn test_header_widths() {
        assert_eq!(encode_header(Tag::FileName, 5).unwrap(), vec![0x02, 0, 0, 0, 5]);
        assert_eq!(
            encode_header(Tag::Payload, 0x0102).unwrap(),
            vec![0x84, 0, 0, 0, 0, 0, 0, 0x01, 0x02]
        );
        assert_eq!(encode_header(Tag::End, 0).unwrap(), END_RECORD.to_vec());
        assert!(encode_header(Tag::End, 1).is_err());
        assert!(encode_header(Tag::Sec, u64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn test_parse_independent_of_split() {
        let bytes = sample();
        let (whole, boundary) = parse_all(&bytes, bytes.len()).unwrap();
        assert!(boundary);
        assert_eq!(
            whole,
            vec![
                Owned::Record(Tag::FileName, b"a.txt".to_vec()),
                Owned::Stream(Tag::Padding, 3, vec![0, 0, 0]),
                Owned::Stream(Tag::Payload, 13, b"payload bytes".to_vec()),
                Owned::Stream(Tag::Padding, 0, Vec::new()),
                Owned::Record(Tag::Message, Vec::new()),
                Owned::End,
            ]
        );
        for split in 1..bytes.len() {
            assert_eq!(parse_all(&bytes, split).unwrap().0, whole, "split {split}");
        }
    }

    #[test]
    fn test_streaming_slices_report_remaining() {
        let bytes = encode_record(Tag::Payload, &[7u8; 10]).unwrap();
        let mut parser = TlvParser::default();
        let mut input = &bytes[..13];
        assert_eq!(
            parser.next(&mut input).unwrap(),
            Some(TlvItem::Start {
                tag: Tag::Payload,
                len: 10
            })
        );
        match parser.next(&mut input).unwrap() {
            Some(TlvItem::Data { data, remaining, .. }) => {
                assert_eq!(data.len(), 4);
                assert_eq!(remaining, 6);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!parser.at_boundary());
        let mut rest = &bytes[13..];
        assert!(matches!(
            parser.next(&mut rest).unwrap(),
            Some(TlvItem::Data { remaining: 0, .. })
        ));
        assert!(parser.at_boundary());
    }

    #[test]
    fn test_partial_header_is_not_boundary() {
        let mut parser = TlvParser::default();
        let mut input: &[u8] = &[0x02, 0x00];
        assert_eq!(parser.next(&mut input).unwrap(), None);
        assert!(!parser.at_boundary());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut parser = TlvParser::default();
        let mut input: &[u8] = &[0x42, 0, 0, 0, 0];
        assert!(matches!(parser.next(&mut input), Err(TcdropError::Format(_))));
    }

    #[test]
    fn test_oversized_buffered_record_rejected() {
        let mut parser = TlvParser::new(16);
        let header = encode_header(Tag::FileName, 17).unwrap();
        let mut input = &header[..];
        assert!(matches!(parser.next(&mut input), Err(TcdropError::Format(_))));
    }

    #[test]
    fn test_end_with_length_rejected() {
        let mut parser = TlvParser::default();
        let mut input: &[u8] = &[0x0f, 0x01];
        assert!(matches!(parser.next(&mut input), Err(TcdropError::Format(_))));
    }
}
