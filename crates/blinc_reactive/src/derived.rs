//! Derived nodes: §4.3. A lazily recomputed value whose formula reads
//! other nodes. `read`/`peek` both funnel through [`recompute`], which is
//! the single busiest path in the engine — short-circuiting as early as
//! it safely can before falling back to a full formula re-run.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{EngineError, Result};
use crate::graph::{self, Graph};
use crate::node::{DerivedId, Downstream, Upstream};

/// Handle to a lazily recomputed, read-only value.
pub struct Derived<T> {
    pub(crate) id: DerivedId,
    pub(crate) graph: Rc<RefCell<Graph>>,
    pub(crate) _marker: PhantomData<T>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Derived {
            id: self.id,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + PartialEq + 'static> Derived<T> {
    /// Tracking read: recomputes if stale, then — if called from within an
    /// active evaluation — installs/refreshes an edge from the evaluator
    /// to this derived.
    pub fn read(&self) -> Result<T> {
        recompute(&self.graph, self.id)?;
        let mut g = self.graph.borrow_mut();
        if let Some(evaluator) = g.eval_context {
            graph::track(&mut g, evaluator, Upstream::Derived(self.id));
        }
        self.extract(&g)
    }

    /// Non-tracking read: still recomputes if stale, but never attaches an
    /// edge, even when called from inside a formula.
    pub fn peek(&self) -> Result<T> {
        recompute(&self.graph, self.id)?;
        let g = self.graph.borrow();
        self.extract(&g)
    }

    /// Always fails: a derived's value is a pure function of its sources,
    /// never settable directly (§4.3 "Writes to a derived fail with
    /// readonly"). Exposed so `write` is a real, reachable operation across
    /// the node capability set named in §3 rather than something only the
    /// type system happens to prevent — a caller holding a `Derived<T>`
    /// through a trait object or generic bound that assumes writability
    /// gets a proper [`EngineError::ReadonlyWrite`] instead of a missing
    /// method.
    pub fn write(&self, _value: T) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::debug!(derived = ?self.id, "rejected write to a read-only derived value");
        Err(EngineError::ReadonlyWrite)
    }

    /// Sugar for an effect that reads this derived and calls `f` on every
    /// value, including the initial one. Returns a disposer.
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Result<crate::effect::Disposer> {
        let this = self.clone();
        crate::effect::make_effect(self.graph.clone(), move || {
            f(this.read()?);
            Ok(())
        })
    }

    fn extract(&self, g: &Graph) -> Result<T> {
        let node = &g.deriveds[self.id];
        if node.flags.has_error {
            return Err(EngineError::Formula(
                node.error.clone().expect("has_error set without a stored error"),
            ));
        }
        Ok(node
            .value
            .as_ref()
            .expect("derived value missing after a successful recompute")
            .downcast_ref::<T>()
            .expect("Derived<T> handle does not match the node's stored type")
            .clone())
    }
}

/// The recomputation algorithm (§4.3). Returns `Err(CycleDetected)` only
/// for true self-reentrancy (the node is already on the evaluation
/// stack); any error the formula itself returns is captured onto the
/// node and surfaced later by [`Derived::extract`], never from here.
///
/// Takes the shared `Rc<RefCell<Graph>>` rather than `&mut Graph`: a full
/// recompute calls the node's formula, which is user code free to call
/// back into other `Source`/`Derived` handles on the same graph. Every
/// borrow taken in this module is released before such a call is made.
pub(crate) fn recompute(graph: &Rc<RefCell<Graph>>, id: DerivedId) -> Result<()> {
    let is_cycle = {
        let mut g = graph.borrow_mut();
        g.deriveds[id].flags.notified = false;
        if g.deriveds[id].flags.running {
            true
        } else {
            g.deriveds[id].flags.running = true;
            false
        }
    };
    if is_cycle {
        return Err(EngineError::CycleDetected);
    }
    let outcome = recompute_body(graph, id);
    graph.borrow_mut().deriveds[id].flags.running = false;
    outcome
}

fn recompute_body(graph: &Rc<RefCell<Graph>>, id: DerivedId) -> Result<()> {
    {
        let g = graph.borrow();
        let has_subscribers = g.deriveds[id].dependents_head.is_some();
        if !g.deriveds[id].flags.stale && has_subscribers {
            return Ok(());
        }
        if g.deriveds[id].version > 0 && g.deriveds[id].last_global_version == g.global_version {
            return Ok(());
        }
    }

    let has_prior_value = graph.borrow().deriveds[id].version > 0;
    if has_prior_value && short_circuit_still_fresh(graph, id) {
        let mut g = graph.borrow_mut();
        let gv = g.global_version;
        g.deriveds[id].last_global_version = gv;
        return Ok(());
    }

    full_recompute(graph, id)
}

/// §4.3 step 5: walk the sources list in order; if every edge's recorded
/// version still matches its source's current version, the cached value
/// is still valid and a full recompute can be skipped.
fn short_circuit_still_fresh(graph: &Rc<RefCell<Graph>>, id: DerivedId) -> bool {
    let mut cur = graph.borrow().deriveds[id].sources_head;
    while let Some(eid) = cur {
        let (source, edge_version, next) = {
            let g = graph.borrow();
            let e = &g.edges[eid];
            (e.source, e.version, e.src_next)
        };
        graph::peek_upstream_for_version_check(graph, source);
        let still_fresh = {
            let g = graph.borrow();
            edge_version == graph::upstream_version(&g, source)
        };
        if !still_fresh {
            return false;
        }
        cur = next;
    }
    true
}

fn full_recompute(graph: &Rc<RefCell<Graph>>, id: DerivedId) -> Result<()> {
    let (prev_ctx, mut formula) = {
        let mut g = graph.borrow_mut();
        let prev_ctx = g.eval_context.replace(Downstream::Derived(id));
        graph::prepare(&mut g, Downstream::Derived(id));
        let formula = g.deriveds[id]
            .formula
            .take()
            .expect("derived formula missing — reentered full_recompute for the same node?");
        (prev_ctx, formula)
    };
    #[cfg(feature = "tracing")]
    tracing::trace!(derived = ?id, "running derived formula");
    let result = formula();

    let mut g = graph.borrow_mut();
    g.deriveds[id].formula = Some(formula);
    graph::cleanup(&mut g, Downstream::Derived(id));
    g.eval_context = prev_ctx;

    let global_version = g.global_version;
    let node = &mut g.deriveds[id];
    match result {
        Ok(new_value) => {
            let changed = node.version == 0
                || node.flags.has_error
                || !node.value.as_deref().is_some_and(|old| (node.equals)(old, new_value.as_ref()));
            node.value = Some(new_value);
            node.error = None;
            node.flags.has_error = false;
            node.flags.stale = false;
            node.last_global_version = global_version;
            if changed {
                node.version += 1;
            }
        }
        Err(EngineError::Formula(err)) => {
            let became_error = !node.flags.has_error;
            node.error = Some(err);
            node.flags.has_error = true;
            node.flags.stale = false;
            node.last_global_version = global_version;
            if became_error || node.version == 0 {
                node.version += 1;
            }
        }
        Err(other @ EngineError::CycleDetected) | Err(other @ EngineError::ReadonlyWrite) => {
            // Any error a formula returns is captured, per §7 item 3 — a
            // cycle error from a nested read, or a readonly error from a
            // formula that called `Derived::write` on some other node it
            // holds, is no exception: it becomes this node's cached error
            // just like a user error would.
            let became_error = !node.flags.has_error;
            node.flags.has_error = true;
            node.flags.stale = false;
            node.last_global_version = global_version;
            node.error = Some(std::sync::Arc::new(EngineErrorAsStd(other)));
            if became_error || node.version == 0 {
                node.version += 1;
            }
        }
    }
    Ok(())
}

/// Adapter so a structural [`EngineError`] (cycle/readonly) can be stored
/// in the same `Arc<dyn Error>` slot used for user formula errors.
#[derive(Debug)]
struct EngineErrorAsStd(EngineError);

impl std::fmt::Display for EngineErrorAsStd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for EngineErrorAsStd {}
