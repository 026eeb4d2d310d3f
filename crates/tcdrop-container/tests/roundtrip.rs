//! End-to-end writer → reader tests over in-memory bytes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use secrecy::SecretString;
use tcdrop_container::{
    peek_header, ByteSource, ContainerReader, ContainerWriter, PaddingPolicy, ReadEvent,
    ReaderOptions, WriterOptions,
};
use tcdrop_core::{FileMeta, TcdropError};
use tcdrop_crypto::{seal_file_key, KeyWrapOracle, LinkSecret, RetryHandler, SecretOracle};

fn fast_retry() -> RetryHandler {
    RetryHandler::new(Duration::from_millis(1), Duration::from_millis(5))
        .with_max_jitter(Duration::ZERO)
        .with_max_attempts(3)
}

fn meta_for(payload: &[u8]) -> FileMeta {
    FileMeta {
        name: "hello.txt".into(),
        mime: "text/plain".into(),
        uploaded_at_ms: 1_700_000_000_000,
        size: payload.len() as u64,
        message: Some("for you".into()),
    }
}

/// A sealed container held in memory plus what a receiver needs to open it.
struct Fixture {
    bytes: Vec<u8>,
    link: LinkSecret,
    oracle: Arc<dyn KeyWrapOracle>,
    digest: blake3::Hash,
}

async fn build(payload: &[u8], password: Option<&str>, padding: PaddingPolicy) -> Fixture {
    let oracle = SecretOracle::generate();
    let password = password.map(SecretString::from);
    let sealed = seal_file_key(password.as_ref(), &oracle, &mut fast_retry())
        .await
        .unwrap();

    let options = WriterOptions {
        padding,
        cache_lookback: 4096,
        crypt_slice: 1000,
    };
    let mut writer = ContainerWriter::new(
        &meta_for(payload),
        ByteSource::constant(payload.to_vec()),
        &sealed,
        options,
    )
    .unwrap();

    let mut bytes = Vec::new();
    let mut pos = 0;
    while pos < writer.len() {
        let end = (pos + 777).min(writer.len());
        bytes.extend_from_slice(&writer.read(pos, end).await.unwrap());
        pos = end;
    }
    let digest = writer.content_digest().unwrap();
    Fixture {
        bytes,
        link: sealed.link.clone(),
        oracle: Arc::new(oracle),
        digest,
    }
}

fn reader(fx: &Fixture, options: ReaderOptions) -> ContainerReader {
    ContainerReader::new(fx.link.clone(), fx.oracle.clone(), fast_retry(), options)
}

/// Feed `bytes` in `chunk`-sized pieces, collecting every event.
async fn feed(reader: &mut ContainerReader, bytes: &[u8], chunk: usize) -> Vec<ReadEvent> {
    let mut events = Vec::new();
    for piece in bytes.chunks(chunk) {
        events.extend(reader.write(piece).await.unwrap());
    }
    events
}

fn payload_of(events: &[ReadEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ReadEvent::Payload(data) => Some(data.clone()),
            _ => None,
        })
        .collect::<Vec<Bytes>>()
        .concat()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

#[tokio::test]
async fn hello_world_in_five_byte_chunks() {
    let fx = build(b"hello world", None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());

    let events = feed(&mut reader, &fx.bytes, 5).await;

    assert!(matches!(&events[0], ReadEvent::Metadata(m) if m.name == "hello.txt"));
    assert_eq!(payload_of(&events), b"hello world");
    match events.last() {
        Some(ReadEvent::Verified(summary)) => {
            assert_eq!(summary.payload_len, 11);
            assert_eq!(summary.content_digest, blake3::hash(b"hello world"));
            assert_eq!(summary.content_digest, fx.digest);
            assert_eq!(summary.meta.message.as_deref(), Some("for you"));
        }
        other => panic!("expected Verified last, got {other:?}"),
    }
    let summary = reader.finish().unwrap();
    assert_eq!(summary.payload_len, 11);
}

#[tokio::test]
async fn output_independent_of_chunking() {
    let payload = pattern(10_000);
    let fx = build(&payload, None, PaddingPolicy::SizeClass).await;

    for chunk in [1, 13, 4096, fx.bytes.len()] {
        let mut reader = reader(&fx, ReaderOptions::default());
        let events = feed(&mut reader, &fx.bytes, chunk).await;
        assert_eq!(payload_of(&events), payload, "chunk {chunk}");
        assert!(matches!(events.last(), Some(ReadEvent::Verified(_))));
    }
}

#[tokio::test]
async fn empty_payload_roundtrip() {
    let fx = build(b"", None, PaddingPolicy::Block(64)).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    let events = feed(&mut reader, &fx.bytes, 64).await;
    assert!(payload_of(&events).is_empty());
    assert_eq!(reader.finish().unwrap().content_digest, blake3::hash(b""));
}

#[tokio::test]
async fn flipped_tag_bit_fails_authentication() {
    let mut fx = build(b"hello world", None, PaddingPolicy::None).await;
    let len = fx.bytes.len();
    // Trailer is GCMTAG header (5) + tag (16) + END (2)
    fx.bytes[len - 18] ^= 0x01;

    let mut reader = reader(&fx, ReaderOptions::default());
    let mut events = Vec::new();
    let mut failure = None;
    for piece in fx.bytes.chunks(5) {
        match reader.write(piece).await {
            Ok(more) => events.extend(more),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    assert!(matches!(failure, Some(TcdropError::Authentication)));
    assert!(!events.iter().any(|e| matches!(e, ReadEvent::Verified(_))));
    assert!(reader.finish().is_err());
}

#[tokio::test]
async fn flipped_payload_byte_fails_authentication() {
    let payload = pattern(1000);
    let mut fx = build(&payload, None, PaddingPolicy::None).await;
    let mid = fx.bytes.len() / 2;
    fx.bytes[mid] ^= 0x80;

    let mut reader = reader(&fx, ReaderOptions::default());
    let result = reader.write(&fx.bytes).await;
    assert!(matches!(result, Err(TcdropError::Authentication)));
}

/// Offset of the ENCWRAP value: everything before the body, GCMTAG and END.
fn body_start(fx: &Fixture) -> usize {
    let header = peek_header(&fx.bytes[..tcdrop_container::reader::HEADER_PEEK_LEN]).unwrap();
    fx.bytes.len() - 23 - header.body_len.unwrap() as usize
}

#[tokio::test]
async fn flipped_metadata_tag_fails_authentication() {
    let mut fx = build(b"hello world", None, PaddingPolicy::None).await;
    // First plaintext byte is the FNAME tag; 0x02 ^ 0x01 reads as MIME
    let at = body_start(&fx);
    fx.bytes[at] ^= 0x01;

    let mut reader = reader(&fx, ReaderOptions::default());
    let result = reader.write(&fx.bytes).await;
    let err = result.unwrap_err();
    assert!(matches!(err, TcdropError::Authentication), "got {err:?}");
    assert_eq!(err.reason(), tcdrop_core::ReasonCode::Corrupted);
}

#[tokio::test]
async fn flipped_metadata_length_fails_authentication() {
    let mut fx = build(b"hello world", None, PaddingPolicy::None).await;
    // Low byte of the FNAME length; 9 ^ 0x01 cuts "hello.txt" short and the
    // leftover 't' is read as a record tag
    let at = body_start(&fx) + 4;
    fx.bytes[at] ^= 0x01;

    for chunk in [1, 7, fx.bytes.len()] {
        let mut reader = reader(&fx, ReaderOptions::default());
        let mut failure = None;
        for piece in fx.bytes.chunks(chunk) {
            if let Err(e) = reader.write(piece).await {
                failure = Some(e);
                break;
            }
        }
        assert!(
            matches!(failure, Some(TcdropError::Authentication)),
            "chunk {chunk}: {failure:?}"
        );
        assert!(reader.finish().is_err());
    }
}

#[tokio::test]
async fn flipped_payload_length_fails_authentication() {
    let payload = pattern(1000);
    let mut fx = build(&payload, None, PaddingPolicy::None).await;
    // Without concealment the ENC header (1 tag + 8 length) sits right
    // before the payload at the end of the body
    let header = peek_header(&fx.bytes[..tcdrop_container::reader::HEADER_PEEK_LEN]).unwrap();
    let enc = body_start(&fx) + header.body_len.unwrap() as usize - payload.len() - 9;
    fx.bytes[enc + 8] ^= 0x01;

    let mut reader = reader(&fx, ReaderOptions::default());
    let mut events = Vec::new();
    let mut failure = None;
    for piece in fx.bytes.chunks(64) {
        match reader.write(piece).await {
            Ok(more) => events.extend(more),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    assert!(matches!(failure, Some(TcdropError::Authentication)), "{failure:?}");
    assert!(payload_of(&events).is_empty());
    assert!(!events.iter().any(|e| matches!(e, ReadEvent::Verified(_))));
}

#[tokio::test]
async fn damaged_outer_header_is_a_format_error() {
    let mut fx = build(b"hello world", None, PaddingPolicy::None).await;
    // ENCWRAP tag byte, just ahead of its 8-byte length
    let at = body_start(&fx) - 9;
    fx.bytes[at] = 0x77;

    let mut reader = reader(&fx, ReaderOptions::default());
    assert!(matches!(
        reader.write(&fx.bytes).await,
        Err(TcdropError::Format(_))
    ));
}

#[tokio::test]
async fn password_flow_is_reentrant() {
    let fx = build(b"secret stuff", Some("hunter2"), PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());

    let events = reader.write(&fx.bytes).await.unwrap();
    assert_eq!(events, vec![ReadEvent::PasswordRequired]);
    assert!(reader.is_waiting_for_password());

    let wrong = reader.supply_password(SecretString::from("hunter3")).await;
    assert!(matches!(wrong, Err(TcdropError::PasswordIncorrect)));
    assert!(reader.is_waiting_for_password());
    assert_eq!(reader.password_attempts(), 1);

    let events = reader
        .supply_password(SecretString::from("hunter2"))
        .await
        .unwrap();
    assert_eq!(payload_of(&events), b"secret stuff");
    assert!(matches!(events.last(), Some(ReadEvent::Verified(_))));
    assert!(reader.finish().is_ok());
}

#[tokio::test]
async fn preset_password_skips_prompt() {
    let fx = build(b"abc", Some("pw"), PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default()).with_password(SecretString::from("pw"));
    let events = feed(&mut reader, &fx.bytes, 100).await;
    assert!(!events.contains(&ReadEvent::PasswordRequired));
    assert_eq!(payload_of(&events), b"abc");
}

#[tokio::test]
async fn wrong_preset_password_falls_back_to_prompt() {
    let fx = build(b"abc", Some("pw"), PaddingPolicy::None).await;
    let mut reader =
        reader(&fx, ReaderOptions::default()).with_password(SecretString::from("nope"));
    let events = reader.write(&fx.bytes).await.unwrap();
    assert_eq!(events, vec![ReadEvent::PasswordRequired]);
    assert_eq!(reader.password_attempts(), 1);
}

#[tokio::test]
async fn finish_while_waiting_for_password() {
    let fx = build(b"abc", Some("pw"), PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    reader.write(&fx.bytes).await.unwrap();
    assert!(matches!(reader.finish(), Err(TcdropError::PasswordRequired)));
}

#[tokio::test]
async fn pause_after_metadata_until_resumed() {
    let payload = pattern(5000);
    let fx = build(&payload, None, PaddingPolicy::None).await;
    let options = ReaderOptions {
        pause_after_metadata: true,
        ..Default::default()
    };
    let mut reader = reader(&fx, options);

    let events = feed(&mut reader, &fx.bytes, 300).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], ReadEvent::Metadata(m) if m.size == 5000));
    assert!(reader.is_paused());
    assert!(matches!(reader.finish(), Err(TcdropError::Truncated(_))));

    let events = reader.resume().await.unwrap();
    assert_eq!(payload_of(&events), payload);
    assert!(matches!(events.last(), Some(ReadEvent::Verified(_))));
    assert!(reader.finish().is_ok());
}

#[tokio::test]
async fn pause_with_tiny_container() {
    // Small body: its last block is only released together with the tag
    let fx = build(b"", None, PaddingPolicy::None).await;
    let options = ReaderOptions {
        pause_after_metadata: true,
        ..Default::default()
    };
    let mut reader = reader(&fx, options);
    let events = reader.write(&fx.bytes).await.unwrap();
    assert!(matches!(&events[..], [ReadEvent::Metadata(_)]));

    let events = reader.resume().await.unwrap();
    assert!(matches!(events.last(), Some(ReadEvent::Verified(_))));
}

#[tokio::test]
async fn truncated_input_is_reported() {
    let fx = build(b"hello world", None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    let cut = fx.bytes.len() - 10;
    reader.write(&fx.bytes[..cut]).await.unwrap();
    assert!(matches!(reader.finish(), Err(TcdropError::Truncated(_))));
}

#[tokio::test]
async fn trailing_bytes_after_end_rejected() {
    let fx = build(b"hello world", None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    let mut bytes = fx.bytes.clone();
    bytes.push(0);
    assert!(matches!(
        reader.write(&bytes).await,
        Err(TcdropError::Format(_))
    ));
}

#[tokio::test]
async fn foreign_bytes_unrecognized() {
    let fx = build(b"x", None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    assert!(matches!(
        reader.write(b"PK\x03\x04").await,
        Err(TcdropError::UnrecognizedFormat)
    ));
    // Reader is unusable after a failure
    assert!(reader.write(&fx.bytes).await.is_err());
}

#[tokio::test]
async fn unsupported_version_rejected() {
    let mut fx = build(b"x", None, PaddingPolicy::None).await;
    fx.bytes[7] = 0x02;
    let mut reader = reader(&fx, ReaderOptions::default());
    assert!(matches!(
        reader.write(&fx.bytes).await,
        Err(TcdropError::Format(_))
    ));
}

#[tokio::test]
async fn wrong_link_secret_rejected() {
    let fx = build(b"x", None, PaddingPolicy::None).await;
    let mut reader = ContainerReader::new(
        LinkSecret::generate(),
        fx.oracle.clone(),
        fast_retry(),
        ReaderOptions::default(),
    );
    assert!(matches!(
        reader.write(&fx.bytes).await,
        Err(TcdropError::Format(_))
    ));
}

#[tokio::test]
async fn overlapping_offsets_are_deduplicated() {
    let payload = pattern(3000);
    let fx = build(&payload, None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    let len = fx.bytes.len();

    let mut events = Vec::new();
    // Each push re-sends the last 40 bytes of the previous one
    let mut offset = 0usize;
    while offset < len {
        let start = offset.saturating_sub(40);
        let end = (offset + 500).min(len);
        events.extend(
            reader
                .write_at(start as u64, &fx.bytes[start..end])
                .await
                .unwrap(),
        );
        offset = end;
    }
    // A full duplicate is a no-op
    assert!(reader.write_at(0, &fx.bytes[..100]).await.unwrap().is_empty());

    assert_eq!(payload_of(&events), payload);
    assert!(reader.is_done());
}

#[tokio::test]
async fn gap_in_offsets_rejected() {
    let fx = build(b"hello world", None, PaddingPolicy::None).await;
    let mut reader = reader(&fx, ReaderOptions::default());
    reader.write_at(0, &fx.bytes[..20]).await.unwrap();
    assert!(matches!(
        reader.write_at(30, &fx.bytes[30..40]).await,
        Err(TcdropError::Transport(_))
    ));
}

#[tokio::test]
async fn peek_header_without_keys() {
    let fx = build(b"hello world", Some("pw"), PaddingPolicy::None).await;
    let header = peek_header(&fx.bytes[..tcdrop_container::reader::HEADER_PEEK_LEN]).unwrap();
    assert_eq!(header.version, 1);
    assert!(header.context.password_set);
    assert!(header.body_len.is_some());

    assert!(matches!(
        peek_header(b"not a container at all"),
        Err(TcdropError::UnrecognizedFormat)
    ));
}
