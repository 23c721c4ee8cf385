//! Fine-grained reactive signal system.
//!
//! A push-pull hybrid: writing a [`Source`] eagerly walks the graph and
//! marks every dependent stale (`Notify`), but a [`Derived`]'s formula
//! only actually re-runs the next time something reads it (`Read`/`Peek`).
//! [`Engine::effect`] schedules its formula onto a LIFO queue that drains
//! once the outermost [`Engine::batch`] (or a standalone [`Source::write`])
//! exits, so a burst of writes collapses into one effect run each.
//!
//! ```
//! use blinc_reactive::Engine;
//!
//! let engine = Engine::new();
//! let count = engine.source(0i32);
//! let doubled = {
//!     let count = count.clone();
//!     engine.derived(move || Ok(count.read() * 2))
//! };
//! assert_eq!(doubled.read().unwrap(), 0);
//! count.write(5).unwrap();
//! assert_eq!(doubled.read().unwrap(), 10);
//! ```
//!
//! # Data model
//!
//! Three node kinds live in arenas keyed by [`slotmap`] ids: sources
//! (writable cells), deriveds (lazily recomputed formulas), and effects
//! (formulas run for their side effects, never read). A directed edge
//! registry ([`edge`]) connects them, with every edge threaded into two
//! intrusive doubly-linked lists — a source's dependents, and a formula
//! node's sources — so subscribing, unsubscribing, and the recency-order
//! splice used by dependency tracking are all O(1).
//!
//! # Concurrency
//!
//! The graph lives behind `Rc<RefCell<_>>` and is neither `Send` nor
//! `Sync`. That's not a gap to fill in later — a single-threaded update
//! graph with glitch-free propagation has no multi-threaded analogue worth
//! retrofitting; running one engine per thread composes better than a
//! shared, locked one.
//!
//! # Errors
//!
//! A derived or effect formula returns [`EngineError`] (see [`error`]).
//! A derived's error is cached on the node exactly like a value: repeated
//! reads return the same error until a dependency change lets the formula
//! run again and possibly recover.

mod derived;
mod edge;
mod effect;
mod error;
mod graph;
mod node;
mod source;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

pub use derived::Derived;
pub use effect::Disposer;
pub use error::{formula_error, EngineError, FormulaError, Result};
pub use graph::CYCLE_GUARD_ITERATIONS;
pub use source::Source;

use graph::Graph;
use node::{DerivedNode, Flags, SourceNode};

/// A single reactive graph. Construct one per independent piece of state
/// you want to track — a UI tree, a document model, a connection's worth
/// of derived metrics — not one per signal.
#[derive(Clone)]
pub struct Engine {
    graph: Rc<RefCell<Graph>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            graph: Rc::new(RefCell::new(Graph::new())),
        }
    }

    /// Create a writable source cell holding `initial`.
    pub fn source<T: PartialEq + 'static>(&self, initial: T) -> Source<T> {
        let equals = node::equals_fn::<T>();
        let id = self.graph.borrow_mut().sources.insert(SourceNode {
            value: Box::new(initial),
            version: 1,
            dependents_head: None,
            active_edge: None,
            equals,
        });
        Source {
            id,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }

    /// Create a lazily recomputed derived value. The formula does not run
    /// until the first `read`/`peek`.
    pub fn derived<T, F>(&self, formula: F) -> Derived<T>
    where
        T: PartialEq + 'static,
        F: FnMut() -> Result<T> + 'static,
    {
        let equals = node::equals_fn::<T>();
        let mut formula = formula;
        let boxed: node::Formula = Box::new(move || formula().map(|v| Box::new(v) as Box<dyn std::any::Any>));
        let id = self.graph.borrow_mut().deriveds.insert(DerivedNode {
            formula: Some(boxed),
            value: None,
            error: None,
            version: 0,
            last_global_version: 0,
            sources_head: None,
            dependents_head: None,
            active_edge: None,
            flags: Flags::default(),
            equals,
        });
        Derived {
            id,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }

    /// Create and immediately run an effect, then re-run it after every
    /// batch in which one of its dependencies changed. Drop the returned
    /// [`Disposer`] handle or call [`Disposer::dispose`] to stop it.
    pub fn effect<F>(&self, formula: F) -> Result<Disposer>
    where
        F: FnMut() -> Result<()> + 'static,
    {
        effect::make_effect(self.graph.clone(), formula)
    }

    /// Run `f`, coalescing every source write it makes into a single round
    /// of effect re-runs at the end rather than one round per write.
    /// Batches nest: only the outermost `batch` call triggers a drain.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        graph::enter_batch(&self.graph);
        let value = f();
        graph::exit_batch(&self.graph)?;
        Ok(value)
    }

    #[cfg(test)]
    pub(crate) fn debug_graph(&self) -> Rc<RefCell<Graph>> {
        self.graph.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrelated_derived_is_untouched_by_a_write() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let b = engine.source(100i32);
        let a_calls = Rc::new(RefCell::new(0));
        let a_calls_clone = a_calls.clone();
        let a_clone = a.clone();
        let from_a = engine.derived(move || {
            *a_calls_clone.borrow_mut() += 1;
            Ok(a_clone.read())
        });
        let _keep_alive = engine.effect({
            let from_a = from_a.clone();
            move || {
                from_a.read()?;
                Ok(())
            }
        });
        assert_eq!(*a_calls.borrow(), 1);

        b.write(200).unwrap();
        assert_eq!(*a_calls.borrow(), 1, "writing an unrelated source must not recompute from_a");
    }

    #[test]
    fn derived_chain_propagates_through_two_hops() {
        let engine = Engine::new();
        let a = engine.source(2i32);
        let a1 = a.clone();
        let doubled = engine.derived(move || Ok(a1.read() * 2));
        let doubled1 = doubled.clone();
        let plus_one = engine.derived(move || Ok(doubled1.read()? + 1));

        assert_eq!(plus_one.read().unwrap(), 5);
        a.write(10).unwrap();
        assert_eq!(plus_one.read().unwrap(), 21);
    }

    #[test]
    fn effect_only_subscribes_to_the_branch_it_takes() {
        let engine = Engine::new();
        let flag = engine.source(true);
        let left = engine.source(1i32);
        let right = engine.source(2i32);

        let runs = Rc::new(RefCell::new(0));
        let runs_clone = runs.clone();
        let (flag_c, left_c, right_c) = (flag.clone(), left.clone(), right.clone());
        let _d = engine
            .effect(move || {
                *runs_clone.borrow_mut() += 1;
                if flag_c.read() {
                    left_c.read();
                } else {
                    right_c.read();
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 1);

        // Only the untaken branch's source changes; the effect must not
        // re-run because it never subscribed to `right` this time.
        right.write(99).unwrap();
        assert_eq!(*runs.borrow(), 1);

        left.write(5).unwrap();
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn batch_coalesces_a_sum_of_two_sources_into_one_effect_run() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let b = engine.source(2i32);
        let (a1, b1) = (a.clone(), b.clone());
        let c = engine.derived(move || Ok(a1.read() + b1.read()));

        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let c_clone = c.clone();
        let _d = engine
            .effect(move || {
                log_clone.borrow_mut().push(c_clone.read()?);
                Ok(())
            })
            .unwrap();
        assert_eq!(*log.borrow(), vec![3]);

        engine
            .batch(|| {
                a.write(10).unwrap();
                b.write(20).unwrap();
            })
            .unwrap();
        assert_eq!(*log.borrow(), vec![3, 30], "two writes in one batch log the sum exactly once");
    }

    #[test]
    fn branching_derived_only_recomputes_through_its_live_branch() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let b = engine.source(2i32);
        let c = engine.source(99i32);
        let (a1, b1, c1) = (a.clone(), b.clone(), c.clone());
        let m = engine.derived(move || Ok(if a1.read() > 0 { b1.read() } else { c1.read() }));

        let runs = Rc::new(RefCell::new(0));
        let runs_clone = runs.clone();
        let m_clone = m.clone();
        let _d = engine
            .effect(move || {
                m_clone.read()?;
                *runs_clone.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 1);

        // `c` is not on the live branch; writing it must not run the effect.
        c.write(50).unwrap();
        assert_eq!(*runs.borrow(), 1);

        // Flip branches and change the newly-live source in one batch: one run.
        engine
            .batch(|| {
                a.write(-1).unwrap();
                c.write(7).unwrap();
            })
            .unwrap();
        assert_eq!(*runs.borrow(), 2);
        assert_eq!(m.peek().unwrap(), 7);
    }
}
