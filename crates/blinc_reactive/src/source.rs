//! Source nodes: §4.2. The only writable cell in the graph.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{EngineError, Result};
use crate::graph::{self, Graph, CYCLE_GUARD_ITERATIONS};
use crate::node::{SourceId, Upstream};

/// Handle to a writable value cell.
pub struct Source<T> {
    pub(crate) id: SourceId,
    pub(crate) graph: Rc<RefCell<Graph>>,
    pub(crate) _marker: PhantomData<T>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source {
            id: self.id,
            graph: self.graph.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + PartialEq + 'static> Source<T> {
    /// Tracking read: if called from within an active evaluation, installs
    /// or refreshes the edge from the evaluator to this source.
    pub fn read(&self) -> T {
        let mut g = self.graph.borrow_mut();
        if let Some(evaluator) = g.eval_context {
            graph::track(&mut g, evaluator, Upstream::Source(self.id));
        }
        downcast_clone(&g.sources[self.id].value)
    }

    /// Non-tracking read: never attaches an edge, even inside a formula.
    pub fn peek(&self) -> T {
        let g = self.graph.borrow();
        downcast_clone(&g.sources[self.id].value)
    }

    /// Write a new value. A no-op (no version bump, no notification) if
    /// `value` structurally equals the currently stored value. Otherwise
    /// stores it, bumps both the local and global version counters, and
    /// notifies every dependent inside an implicit single-shot batch so
    /// effects run exactly once per coalesced write cluster.
    pub fn write(&self, value: T) -> Result<()> {
        let mut g = self.graph.borrow_mut();
        if g.batch_iteration > CYCLE_GUARD_ITERATIONS {
            return Err(EngineError::CycleDetected);
        }

        let unchanged = {
            let node = &g.sources[self.id];
            (node.equals)(node.value.as_ref(), &value as &dyn Any)
        };
        if unchanged {
            return Ok(());
        }

        g.sources[self.id].value = Box::new(value);
        g.sources[self.id].version += 1;
        g.global_version += 1;
        #[cfg(feature = "tracing")]
        tracing::trace!(
            source = ?self.id,
            version = g.sources[self.id].version,
            global_version = g.global_version,
            "source write"
        );

        // `notify` never calls into user code, so it's safe to walk the
        // whole dependents list under this one borrow. `enter_batch`/
        // `exit_batch` do end up calling effect formulas (via drain), so
        // they take the shared `Rc` and manage their own short borrows —
        // this borrow must be dropped before calling them.
        let mut cur = g.sources[self.id].dependents_head;
        while let Some(eid) = cur {
            let (target, next) = {
                let e = &g.edges[eid];
                (e.target, e.dep_next)
            };
            graph::notify(&mut g, target);
            cur = next;
        }
        drop(g);

        graph::enter_batch(&self.graph);
        graph::exit_batch(&self.graph)
    }

    /// Sugar for an effect that reads this source and calls `f` on every
    /// value, including the initial one. Returns a disposer.
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Result<crate::effect::Disposer> {
        let this = self.clone();
        crate::effect::make_effect(self.graph.clone(), move || {
            f(this.read());
            Ok(())
        })
    }
}

fn downcast_clone<T: Clone + 'static>(value: &dyn Any) -> T {
    value
        .downcast_ref::<T>()
        .expect("Source<T> handle does not match the node's stored type")
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Engine;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn write_is_idempotent_for_equal_values() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let notifications = Rc::new(StdRefCell::new(0));
        let notifications_clone = notifications.clone();
        let a_clone = a.clone();
        let _effect = engine
            .effect(move || {
                a_clone.read();
                *notifications_clone.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(*notifications.borrow(), 1);

        a.write(1).unwrap();
        assert_eq!(*notifications.borrow(), 1, "writing an equal value is a no-op");

        a.write(2).unwrap();
        assert_eq!(*notifications.borrow(), 2);
    }

    #[test]
    fn peek_does_not_establish_an_edge() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let runs = Rc::new(StdRefCell::new(0));
        let runs_clone = runs.clone();
        let a_clone = a.clone();
        let derived = engine.derived(move || {
            *runs_clone.borrow_mut() += 1;
            Ok(a_clone.peek())
        });
        derived.read().unwrap();
        assert_eq!(*runs.borrow(), 1);

        // Derived never tracked `a`, so writing it does not mark the
        // derived stale; only its own global-version fast path applies,
        // meaning a later peek-driven read still sees the new value
        // because the short-circuit scan has nothing to compare against.
        a.write(2).unwrap();
        assert_eq!(derived.read().unwrap(), 2);
    }

    #[test]
    fn lazy_subscription_skips_unobserved_effects() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let _derived = engine.derived({
            let a = a.clone();
            move || Ok(a.read() * 2)
        });
        // No effect subscribes to `_derived`, so `a` should have no
        // subscribed dependent edges at all.
        let g = engine.debug_graph();
        let g = g.borrow();
        assert!(g.sources[a.id].dependents_head.is_none());
    }

    #[test]
    fn subscribe_convenience_runs_immediately_and_on_every_write() {
        let engine = Engine::new();
        let a = engine.source(1i32);
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let log_clone = log.clone();
        let _d = a.subscribe(move |v| log_clone.borrow_mut().push(v)).unwrap();
        assert_eq!(*log.borrow(), vec![1]);

        a.write(2).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);

        // Writing an equal value is a no-op, so the subscriber is not
        // called again.
        a.write(2).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }
}
