//! Core results and error types

use thiserror::Error;

/// Core error type encompassing all core module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Signed division or remainder with a zero right-hand side.
    #[error("division by zero")]
    DivisionByZero,

    /// Block structure is malformed or inconsistent.
    #[error("invalid block structure: {0}")]
    InvalidBlockStructure(String),

    /// Invalid hexadecimal in seed.
    #[error("invalid hexadecimal in seed")]
    InvalidSeedHex,

    /// Invalid seed length.
    #[error("invalid seed length: expected 64 hex chars, got {0}")]
    InvalidSeedLength(usize),

    /// Out-of-bounds, unallocated or freed memory was touched.
    #[error("memory fault: {0}")]
    MemoryFault(String),

    /// A merge point lost or gained a predecessor binding it should not have.
    #[error("merge point not total: {0}")]
    StructuralInvariant(String),

    /// The interpreter exceeded its step budget.
    #[error("step limit exceeded while executing '{0}'")]
    StepLimit(String),

    /// An operand had the wrong type for the instruction consuming it.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A call referenced an external function the machine does not model.
    #[error("unknown external function '{0}'")]
    UnknownExtern(String),
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
