pub mod config;
pub mod error;
pub mod types;

pub use error::{ReasonCode, TcdropError, TcdropResult};
pub use types::{FileMeta, ShareLink};
