//! Moving containers through an OpenDAL operator
//!
//! Upload pulls ranges from a [`ContainerWriter`] and streams them into an
//! object writer. Download reads ranges of the object and pushes them into a
//! [`ContainerReader`], routing its events to a [`DownloadSink`]. Transport
//! retries are left to OpenDAL's `RetryLayer`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use opendal::Operator;
use secrecy::SecretString;
use tcdrop_core::config::StorageConfig;
use tcdrop_core::{FileMeta, TcdropError, TcdropResult};
use tracing::{debug, info};

use crate::reader::{ContainerReader, ReadEvent, ReadSummary};
use crate::writer::ContainerWriter;

/// Progress callback: (bytes done, bytes total)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Build an operator for the configured backend.
pub fn build_operator(cfg: &StorageConfig) -> TcdropResult<Operator> {
    match cfg.backend.as_str() {
        "fs" => {
            let root = expand_home(&cfg.root);
            // opendal 0.55 builders consume `self`
            layered(opendal::services::Fs::default().root(&root.to_string_lossy()), "fs")
        }
        "memory" => layered(opendal::services::Memory::default(), "memory"),
        other => Err(TcdropError::Config(format!(
            "unknown storage backend {other:?} (expected fs or memory)"
        ))),
    }
}

fn layered<B: opendal::Builder>(builder: B, backend: &str) -> TcdropResult<Operator> {
    let op = Operator::new(builder)
        .map_err(|e| TcdropError::Config(format!("creating {backend} operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn transport(context: &str, e: opendal::Error) -> TcdropError {
    TcdropError::Transport(format!("{context}: {e}"))
}

/// Stream the whole container into `path`. Returns the bytes written.
pub async fn upload(
    op: &Operator,
    path: &str,
    writer: &mut ContainerWriter,
    chunk_size: u64,
    progress: Option<&ProgressFn>,
) -> TcdropResult<u64> {
    let total = writer.len();
    let chunk_size = chunk_size.max(1);
    let mut sink = op
        .writer(path)
        .await
        .map_err(|e| transport(&format!("opening {path}"), e))?;

    let mut pos = 0u64;
    while pos < total {
        let end = (pos + chunk_size).min(total);
        let bytes = writer.read(pos, end).await?;
        sink.write(bytes)
            .await
            .map_err(|e| transport(&format!("writing {path} at {pos}"), e))?;
        pos = end;
        debug!(pos, total, "uploaded chunk");
        if let Some(cb) = progress {
            cb(pos, total);
        }
    }
    sink.close()
        .await
        .map_err(|e| transport(&format!("closing {path}"), e))?;

    info!(path, bytes = total, "container uploaded");
    Ok(total)
}

/// Receiver-side callbacks for [`download`].
pub trait DownloadSink {
    /// Provide a password for attempt number `attempt` (1-based), or `None`
    /// to give up.
    fn password(&mut self, attempt: u32) -> Option<SecretString>;

    /// Authenticated metadata arrived. Return `false` to stop before any
    /// payload is fetched.
    fn metadata(&mut self, meta: &FileMeta) -> TcdropResult<bool>;

    /// Decrypted, not yet authenticated payload bytes.
    fn payload(&mut self, data: &[u8]) -> TcdropResult<()>;

    /// The container verified; staged payload may now be committed.
    fn verified(&mut self, _summary: &ReadSummary) -> TcdropResult<()> {
        Ok(())
    }
}

/// Fetch `path` and feed it through `reader`.
///
/// Returns `None` when the sink declined at the metadata stage.
pub async fn download<S: DownloadSink>(
    op: &Operator,
    path: &str,
    reader: &mut ContainerReader,
    chunk_size: u64,
    sink: &mut S,
    progress: Option<&ProgressFn>,
) -> TcdropResult<Option<ReadSummary>> {
    let total = op
        .stat(path)
        .await
        .map_err(|e| transport(&format!("stat {path}"), e))?
        .content_length();
    let chunk_size = chunk_size.max(1);
    info!(path, bytes = total, "downloading container");

    let mut pos = 0u64;
    while pos < total {
        let end = (pos + chunk_size).min(total);
        let bytes = op
            .read_with(path)
            .range(pos..end)
            .await
            .map_err(|e| transport(&format!("reading {path} at {pos}"), e))?
            .to_bytes();
        if bytes.is_empty() {
            return Err(TcdropError::Truncated(format!(
                "{path} ended at {pos} of {total} bytes"
            )));
        }
        let events = reader.write_at(pos, &bytes).await?;
        pos += bytes.len() as u64;
        if let Some(cb) = progress {
            cb(pos, total);
        }
        if !dispatch(reader, sink, events).await? {
            info!(path, "download declined after metadata");
            return Ok(None);
        }
    }

    reader.finish().map(Some)
}

/// Route reader events to the sink, answering password prompts and resuming
/// metadata pauses. Returns `false` if the sink declined.
async fn dispatch<S: DownloadSink>(
    reader: &mut ContainerReader,
    sink: &mut S,
    events: Vec<ReadEvent>,
) -> TcdropResult<bool> {
    let mut queue: VecDeque<ReadEvent> = events.into();
    while let Some(event) = queue.pop_front() {
        match event {
            ReadEvent::PasswordRequired => loop {
                let attempt = reader.password_attempts() + 1;
                let Some(password) = sink.password(attempt) else {
                    return Err(if reader.password_attempts() > 0 {
                        TcdropError::PasswordIncorrect
                    } else {
                        TcdropError::PasswordRequired
                    });
                };
                match reader.supply_password(password).await {
                    Ok(more) => {
                        queue.extend(more);
                        break;
                    }
                    Err(TcdropError::PasswordIncorrect) => continue,
                    Err(e) => return Err(e),
                }
            },
            ReadEvent::Metadata(meta) => {
                if !sink.metadata(&meta)? {
                    return Ok(false);
                }
                if reader.is_paused() {
                    queue.extend(reader.resume().await?);
                }
            }
            ReadEvent::Payload(data) => sink.payload(&data)?,
            ReadEvent::Verified(summary) => sink.verified(&summary)?,
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_memory_operator() {
        let cfg = StorageConfig {
            backend: "memory".into(),
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_fs_operator() {
        let dir = std::env::temp_dir().join("tcdrop-operator-test");
        let cfg = StorageConfig {
            backend: "fs".into(),
            root: dir,
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let cfg = StorageConfig {
            backend: "tape".into(),
            ..Default::default()
        };
        assert!(matches!(build_operator(&cfg), Err(TcdropError::Config(_))));
    }

    #[test]
    fn test_expand_home() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/objects")),
                PathBuf::from(home).join("objects")
            );
        }
        assert_eq!(expand_home(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
