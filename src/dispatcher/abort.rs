//! Request cancellation tokens.

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

type Listener = Rc<dyn Fn()>;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    listeners: Slab<Listener>,
}

/// Owner side of a cancellation token.
#[derive(Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal to attach to requests.
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Cancel every request carrying this signal.
    ///
    /// Listeners run synchronously, in registration order. Aborting twice is
    /// a no-op.
    pub fn abort(&self) {
        let listeners: Vec<Listener> = {
            let mut state = self.signal.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.listeners.drain().collect()
        };
        for listener in listeners {
            listener();
        }
    }
}

/// Observer side of a cancellation token.
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Rc<RefCell<SignalState>>,
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.borrow().aborted
    }

    /// Register a listener that fires once on abort.
    ///
    /// Returns `None` if the signal already fired; the caller handles that
    /// case inline.
    pub fn on_abort(&self, listener: impl Fn() + 'static) -> Option<AbortRegistration> {
        let mut state = self.state.borrow_mut();
        if state.aborted {
            return None;
        }
        let key = state.listeners.insert(Rc::new(listener));
        Some(AbortRegistration {
            state: Rc::downgrade(&self.state),
            key,
        })
    }
}

/// Removes its listener when dropped.
pub struct AbortRegistration {
    state: std::rc::Weak<RefCell<SignalState>>,
    key: usize,
}

impl Drop for AbortRegistration {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            if let Ok(mut state) = state.try_borrow_mut() {
                if state.listeners.contains(self.key) {
                    state.listeners.remove(self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_listeners_fire_once() {
        let controller = AbortController::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let _reg = controller.signal().on_abort(move || h.set(h.get() + 1));
        controller.abort();
        controller.abort();
        assert_eq!(hits.get(), 1);
        assert!(controller.signal().is_aborted());
    }

    #[test]
    fn test_dropped_registration_is_silent() {
        let controller = AbortController::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        drop(controller.signal().on_abort(move || h.set(h.get() + 1)));
        controller.abort();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_late_registration_reports_aborted() {
        let controller = AbortController::new();
        controller.abort();
        assert!(controller.signal().on_abort(|| {}).is_none());
    }
}
