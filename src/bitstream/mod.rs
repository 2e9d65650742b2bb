//! Annex-B NAL unit splitting, classification, and parameter-set parsing.

pub mod nal;
pub mod sps;

pub use nal::{classify, prune_sei_aud, split, Codec, NalKind};
pub use sps::{parse_sps, SpsInfo};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload shorter than minimum NAL header size")]
    ShortPayload,
    #[error("unexpected NAL type while decoding SPS: {0}")]
    WrongNalType(u8),
    #[error("bitstream truncated while reading a variable-length field")]
    TruncatedBitstream,
}
