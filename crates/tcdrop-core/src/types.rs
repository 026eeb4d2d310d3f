use serde::{Deserialize, Serialize};

use crate::error::{TcdropError, TcdropResult};

/// File metadata carried (encrypted) inside a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub mime: String,
    /// Upload time, milliseconds since the Unix epoch
    pub uploaded_at_ms: u64,
    /// Declared payload size in bytes
    pub size: u64,
    /// Optional free-text message from the sender
    pub message: Option<String>,
}

/// A share link: `{object}#{secret}`.
///
/// `object` is the storage path of the container. `secret` is the encoded
/// link nonce; it lives only in the fragment and is never sent to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub object: String,
    pub secret: String,
}

impl ShareLink {
    pub fn new(object: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            secret: secret.into(),
        }
    }

    pub fn parse(link: &str) -> TcdropResult<Self> {
        let (object, secret) = link
            .rsplit_once('#')
            .ok_or_else(|| TcdropError::Format("share link has no '#' secret".into()))?;
        if object.is_empty() || secret.is_empty() {
            return Err(TcdropError::Format(
                "share link object or secret is empty".into(),
            ));
        }
        Ok(Self::new(object, secret))
    }
}

impl std::fmt::Display for ShareLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.object, self.secret)
    }
}
