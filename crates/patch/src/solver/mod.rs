//! Secret-value derivation strategies.
//!
//! Two interchangeable ways to turn the runtime key into the secret value:
//! a closed-form chain of integer arithmetic whose corrective constant is
//! computed offline in the exact runtime domain, and a univariate polynomial
//! fitted through positionally encoded key symbols. Both are synthesized
//! once per site and then emitted, immutable, into the hidden block.

pub mod arithmetic;
pub mod polynomial;

pub use arithmetic::{solve as solve_arithmetic, ObfStep, ObfuscationProgram};
pub use polynomial::Polynomial;
