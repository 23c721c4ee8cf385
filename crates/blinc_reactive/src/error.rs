//! Error types surfaced by the engine's public operations.

use std::sync::Arc;

/// A type-erased error returned by a derived or effect formula.
///
/// `Arc` rather than `Box`: a derived's captured error is handed back out on
/// every repeated read until the next successful recomputation, and
/// downstream user error types aren't required to implement `Clone`.
pub type FormulaError = Arc<dyn std::error::Error + Send + Sync>;

/// Everything the graph can fail with.
///
/// There is no generic "other" variant — every failure mode the engine
/// itself can produce is named here; anything a formula returns comes
/// through [`EngineError::Formula`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// A node was re-entered while already on the evaluation stack, or the
    /// batch drain loop iterated past [`crate::CYCLE_GUARD_ITERATIONS`].
    #[error("cycle detected")]
    CycleDetected,

    /// A write was attempted against a derived value.
    #[error("cannot write to a derived value")]
    ReadonlyWrite,

    /// A derived's formula returned an error.
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

/// Alias used throughout the crate and by downstream callers.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Helper for formula authors: wrap any `std::error::Error` into the
/// engine's error type without going through an explicit `Arc::new`.
pub fn formula_error<E>(err: E) -> EngineError
where
    E: std::error::Error + Send + Sync + 'static,
{
    EngineError::Formula(Arc::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn formula_error_roundtrips_through_display() {
        let err = formula_error(Boom);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn engine_error_variants_display_distinctly() {
        assert_eq!(EngineError::CycleDetected.to_string(), "cycle detected");
        assert_eq!(
            EngineError::ReadonlyWrite.to_string(),
            "cannot write to a derived value"
        );
    }
}
