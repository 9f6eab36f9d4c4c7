// Core blockchain data structures

mod block;
mod hash;
mod serialize;
mod transaction;

pub use block::*;
pub use hash::*;
pub use serialize::*;
pub use transaction::*;

use thiserror::Error;

/// Failure decoding a block, transaction or stored record
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("truncated input: {0}")]
    Truncated(#[from] std::io::Error),
}
