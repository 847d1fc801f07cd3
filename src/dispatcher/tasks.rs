//! Deferred callback delivery.
//!
//! Engine state is never borrowed while user code runs. State transitions
//! push callbacks here; the outermost entry point drains them in FIFO order
//! before returning to its caller. Entry points nested inside a callback
//! (a handler calling `dispatch`, an observer calling `destroy`) only
//! enqueue, so delivery order stays global.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

type Task = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Resets the active flag even if a callback panics.
struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(false));
    }
}

/// Queue a callback for delivery by the current scope.
pub(crate) fn defer(task: impl FnOnce() + 'static) {
    QUEUE.with(|q| q.borrow_mut().push_back(Box::new(task)));
}

/// Run `f` as an engine entry point.
///
/// If no scope is active, `f` runs and then every queued callback is
/// delivered, including callbacks queued by those callbacks.
pub(crate) fn enter<R>(f: impl FnOnce() -> R) -> R {
    if ACTIVE.with(|a| a.get()) {
        return f();
    }
    ACTIVE.with(|a| a.set(true));
    let _guard = ScopeGuard;
    let result = f();
    drain();
    result
}

/// Run `f` from the delivery queue, as its own entry point.
///
/// Used for notifications that may arrive while engine state is borrowed
/// (socket events, timer expiry, abort listeners).
pub(crate) fn post(f: impl FnOnce() + 'static) {
    enter(|| defer(f));
}

fn drain() {
    loop {
        let task = QUEUE.with(|q| q.borrow_mut().pop_front());
        match task {
            Some(task) => task(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_nested_entries_deliver_in_fifo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        enter(|| {
            let inner = l.clone();
            defer(move || {
                inner.borrow_mut().push(1);
                let nested = inner.clone();
                enter(|| defer(move || nested.borrow_mut().push(3)));
                inner.borrow_mut().push(2);
            });
        });
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_outermost_entry_drains_before_returning() {
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        enter(|| defer(move || h.set(true)));
        assert!(hit.get());
    }
}
