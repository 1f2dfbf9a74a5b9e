//! Key-triggered watermark instrumentation.
//!
//! Each patcher hooks one family of externally observable operations — a
//! parsed number, a read string, a queried time, a buffer's contents — and
//! splices a hidden, hash-gated path into the containing subroutine. For any
//! input that does not match the build-time secret key the instrumented
//! subroutine is observationally identical to the original; for the key
//! input the hidden path reconstructs the secret value and hands it to the
//! disclosure sink.

pub mod gate;
pub mod locator;
pub mod pass;
pub mod patcher;
pub mod solver;
pub mod splice;

use filigree_core::ir::ValueId;
use filigree_core::result::Error as CoreError;
use filigree_core::{Subroutine, WatermarkConfig};
use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use thiserror::Error;

/// Patch error type encompassing all instrumentation module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A divisor of zero reached a solver; prevented by construction and
    /// reported instead of dividing.
    #[error("arithmetic guard: {0}")]
    ArithmeticGuard(String),

    /// Core IR operation failed.
    #[error("core operation failed: {0}")]
    Core(#[from] CoreError),

    /// The interpolation system has no unique solution.
    #[error("degenerate interpolation system: {0}")]
    SingularSystem(String),

    /// No program point exists at which the buffer can be safely observed.
    #[error("no safe insertion point")]
    NoSafeInsertionPoint,

    /// The site does not satisfy a patcher precondition.
    #[error("unsupported site: {0}")]
    UnsupportedSite(String),
}

/// Patch result type
pub type Result<T> = std::result::Result<T, Error>;

/// Trigger kinds a candidate site can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// `atoi` / `atol` / `strtol` family.
    ParseInt,
    /// `gets` / `fgets` / `getline` / `fread` family.
    ReadStr,
    /// `time` / `gettimeofday` family.
    QueryTime,
    /// Stack array or heap allocation.
    BufferAlloc,
}

/// A location eligible for key-triggered instrumentation: the containing
/// block, the instruction's position within it, and its kind. Discovered
/// during one sweep over a subroutine and discarded once accepted or
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSite {
    pub block: NodeIndex,
    pub index: usize,
    pub kind: SiteKind,
}

/// Outcome reported back to the driver for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchResult {
    pub applied: bool,
}

impl PatchResult {
    pub fn applied() -> Self {
        Self { applied: true }
    }

    pub fn rejected() -> Self {
        Self { applied: false }
    }
}

/// One instrumentation strategy per trigger kind.
///
/// `patch` either applies the full edit transaction for the site or leaves
/// the subroutine exactly as it found it; rejection is an ordinary outcome,
/// not an error.
pub trait Patcher: Send + Sync {
    /// Patcher name for logging and identification.
    fn name(&self) -> &'static str;

    /// The trigger kind this patcher accepts.
    fn kind(&self) -> SiteKind;

    fn patch(
        &self,
        sub: &mut Subroutine,
        site: &CandidateSite,
        config: &WatermarkConfig,
        rng: &mut StdRng,
    ) -> Result<PatchResult>;
}

/// Classifies a callee name into the trigger kind that hooks it, if any.
/// The set mirrors the libc surface the patchers understand.
pub fn classify_callee(name: &str) -> Option<SiteKind> {
    match name {
        "atoi" | "atol" | "strtol" | "__isoc23_strtol" | "xstrtol" => Some(SiteKind::ParseInt),
        "gets" | "fgets" | "fread" | "getline" => Some(SiteKind::ReadStr),
        "time" | "gettimeofday" => Some(SiteKind::QueryTime),
        _ => None,
    }
}

/// The value a site is keyed on, used for processed-site marks.
pub(crate) fn site_value(sub: &Subroutine, site: &CandidateSite) -> Result<ValueId> {
    let body = sub.body(site.block)?;
    let instr = body.instrs.get(site.index).ok_or_else(|| {
        Error::UnsupportedSite(format!(
            "block {} has no instruction at index {}",
            site.block.index(),
            site.index
        ))
    })?;
    Ok(instr.id)
}
