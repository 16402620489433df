use crate::crt::Offset;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("input error: {0}")]
    Io(#[from] std::io::Error),

    #[error("input error: {0}")]
    Input(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("invalid modulus {0}")]
    InvalidModulus(u64),

    #[error("cannot construct a modulus sequence covering the address space: {0}")]
    InsufficientRange(String),

    /// No reconstruction reached the required cross-modulus agreement. The
    /// best candidate is reported rather than silently returning a wrong
    /// answer.
    #[error("no confident result: best candidate {best} agreed in only {agreed}/{total} moduli")]
    Ambiguous {
        best: Offset,
        agreed: usize,
        total: usize,
    },

    #[error("correlation residual {residual} exceeds tolerance for modulus {modulus}")]
    Numerics { modulus: u64, residual: f64 },

    #[error("internal error: {0}")]
    Internal(String),
}
