//! Error taxonomy for aggregation-plan compilation.
//!
//! All user-facing failures are raised synchronously while a plan is being
//! classified or synthesized, never lazily at kernel-call time. There is no
//! retry and no partial success: either the whole plan compiles or the
//! enclosing compilation fails with one of these errors.
//!
//! Decomposition failure of a user-defined reduction is deliberately *not*
//! represented here. It is an internal routing signal
//! ([`crate::udf::DecomposeResult::NotDecomposable`]) that redirects the
//! function to the per-group fallback path instead of surfacing to the caller.

use thiserror::Error;

/// Result alias used throughout plan classification and synthesis.
pub type Result<T> = std::result::Result<T, AggError>;

/// Compilation-time failures of an aggregation request.
#[derive(Debug, Error)]
pub enum AggError {
    /// The requested function name (or a `transform` target) is not among the
    /// supported aggregation kinds.
    #[error("unsupported aggregation function: {0}")]
    UnsupportedAggregation(String),

    /// A per-function argument is missing, not a compile-time constant, or
    /// outside its valid domain (e.g. a negative `head` count).
    #[error("invalid argument for `{func}`: {message}")]
    InvalidArgument {
        /// The function whose argument was rejected.
        func: String,
        /// What was wrong with it.
        message: String,
    },

    /// A cumulative / order-sensitive kind was mixed with an incompatible kind
    /// in the same request.
    #[error("cannot mix `{left}` with `{right}` in one aggregation request")]
    ConflictingAggregation {
        /// The order-sensitive function.
        left: String,
        /// The function it was mixed with.
        right: String,
    },

    /// A key, value, or pivot column named by the request does not exist in
    /// the input table.
    #[error("column not found: {0}")]
    UnknownColumn(String),

    /// `min`/`max`/`shift` over a categorical column whose category set is
    /// unknown. Detected before synthesis; the kernel never sees it.
    #[error("categorical column `{0}` has no known categories")]
    MalformedCategorical(String),
}
