//! Node storage: the typed-erased cells that live in the graph's arenas.
//!
//! Three node kinds share one capability set (emit a version, be read, be
//! notified) but differ in what they store — see `DATA MODEL` in the crate
//! docs. Handles (`Source<T>`, `Derived<T>`) are the typed, public-facing
//! wrappers; everything in this module is keyed by raw slotmap ids and
//! erases `T` behind `Box<dyn Any>`.

use std::any::Any;

use crate::error::{EngineError, FormulaError};

slotmap::new_key_type! {
    pub(crate) struct SourceId;
    pub(crate) struct DerivedId;
    pub(crate) struct EffectId;
    pub(crate) struct EdgeId;
}

/// The upstream (readable) side of a dependency edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Upstream {
    Source(SourceId),
    Derived(DerivedId),
}

/// The downstream (formula-having) side of a dependency edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Downstream {
    Derived(DerivedId),
    Effect(EffectId),
}

/// Type-erased structural-equality check, captured at construction time so
/// the graph's generic arenas can still answer "did the value change?"
/// without knowing `T` — see DESIGN.md for why this replaces the
/// bitwise-identity comparison a non-generic host language would use.
pub(crate) type EqualsFn = Box<dyn Fn(&dyn Any, &dyn Any) -> bool>;

pub(crate) fn equals_fn<T: PartialEq + 'static>() -> EqualsFn {
    Box::new(|a: &dyn Any, b: &dyn Any| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    })
}

pub(crate) type AnyResult = std::result::Result<Box<dyn Any>, EngineError>;
pub(crate) type Formula = Box<dyn FnMut() -> AnyResult>;
pub(crate) type EffectFormula = Box<dyn FnMut() -> std::result::Result<(), EngineError>>;

/// Five boolean-ish states, packed. Kept as plain bools rather than a
/// bitset: the combinations (`stale + notified` vs `notified` alone) are
/// what matter, not the storage, and plain fields read more directly at
/// each call site than mask arithmetic would.
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct Flags {
    pub stale: bool,
    pub running: bool,
    pub notified: bool,
    pub has_error: bool,
    pub should_subscribe: bool,
}

pub(crate) struct SourceNode {
    pub value: Box<dyn Any>,
    pub version: u64,
    pub dependents_head: Option<EdgeId>,
    /// Edge currently "claiming" this source for whichever evaluator is
    /// actively tracking it — see `graph::prepare`/`graph::cleanup`.
    pub active_edge: Option<EdgeId>,
    pub equals: EqualsFn,
}

pub(crate) struct DerivedNode {
    pub formula: Option<Formula>,
    pub value: Option<Box<dyn Any>>,
    pub error: Option<FormulaError>,
    /// Bumped only when the cached value or error state actually changes.
    pub version: u64,
    pub last_global_version: u64,
    pub sources_head: Option<EdgeId>,
    pub dependents_head: Option<EdgeId>,
    pub active_edge: Option<EdgeId>,
    pub flags: Flags,
    pub equals: EqualsFn,
}

pub(crate) struct EffectNode {
    pub formula: Option<EffectFormula>,
    pub sources_head: Option<EdgeId>,
    pub flags: Flags,
    /// Singly-linked intrusive pointer for the pending-effect queue.
    pub pending_next: Option<EffectId>,
    pub disposed: bool,
}
