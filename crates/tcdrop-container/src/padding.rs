//! Length padding: alignment filler and size-concealment policies

use std::str::FromStr;

use tcdrop_core::TcdropError;

/// Header size of a PADDING record
pub const PADDING_HEADER_LEN: u64 = 5;

/// Smallest size-class bucket
const SIZE_CLASS_FLOOR: u64 = 4096;

/// Buckets per power of two above the floor
const SIZE_CLASS_STEPS: u32 = 16;

/// How much concealment padding to add after the payload.
///
/// Depends only on the declared payload length, never on content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingPolicy {
    None,
    /// Round up to a multiple of the given size
    Block(u64),
    /// Round up to one of 16 buckets per power of two, minimum 4 KiB
    #[default]
    SizeClass,
}

impl FromStr for PaddingPolicy {
    type Err = TcdropError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(Self::None),
            "size-class" => Ok(Self::SizeClass),
            other => {
                let size = other
                    .strip_prefix("block:")
                    .and_then(|n| n.parse::<u64>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(|| {
                        TcdropError::Config(format!(
                            "unknown padding policy {other:?} (expected none, block:<bytes>, size-class)"
                        ))
                    })?;
                Ok(Self::Block(size))
            }
        }
    }
}

impl PaddingPolicy {
    /// Smallest size `>= len` this policy allows.
    pub fn padded_size(&self, len: u64) -> u64 {
        match *self {
            Self::None => len,
            Self::Block(n) => round_up(len, n),
            Self::SizeClass => {
                if len <= SIZE_CLASS_FLOOR {
                    return SIZE_CLASS_FLOOR;
                }
                let exp = 63 - len.leading_zeros();
                let step = 1u64 << exp.saturating_sub(SIZE_CLASS_STEPS.trailing_zeros());
                round_up(len, step)
            }
        }
    }

    /// Value length of the concealment PADDING record for a payload of
    /// `len` bytes, or `None` when the policy adds no record.
    pub fn concealment(&self, len: u64) -> Option<u64> {
        match self {
            Self::None => None,
            _ => Some(self.padded_size(len) - len),
        }
    }
}

fn round_up(len: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return len;
    }
    len.div_ceil(multiple).saturating_mul(multiple)
}

/// Value length of a PADDING record placed at `pos` so that the record
/// following it (whose header is `next_header` bytes) starts its value on an
/// `align` boundary.
pub fn alignment(pos: u64, next_header: u64, align: u64) -> u64 {
    let unaligned = (pos + PADDING_HEADER_LEN + next_header) % align;
    (align - unaligned) % align
}
