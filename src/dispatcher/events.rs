//! Lifecycle notifications for observers.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slab::Slab;

use crate::dispatcher::request::Origin;
use crate::dispatcher::tasks;
use crate::dispatcher::DispatcherId;
use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A socket connected.
    Connect,
    /// A connected socket went away.
    Disconnect,
    /// A connect attempt failed.
    ConnectionError,
    /// A dispatcher that reported backpressure can accept requests again.
    Drain,
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherEvent {
    pub kind: EventKind,
    pub origin: Option<Origin>,
    /// The affected dispatchers, outermost first.
    pub targets: Vec<DispatcherId>,
    pub error: Option<DispatchError>,
}

impl DispatcherEvent {
    pub fn new(kind: EventKind, origin: Option<Origin>, target: DispatcherId) -> Self {
        Self {
            kind,
            origin,
            targets: vec![target],
            error: None,
        }
    }

    pub fn with_error(mut self, error: DispatchError) -> Self {
        self.error = Some(error);
        self
    }

    /// The same event as seen through a parent dispatcher.
    pub fn through(&self, parent: DispatcherId) -> Self {
        let mut event = self.clone();
        event.targets.insert(0, parent);
        event
    }
}

pub type Observer = Box<dyn FnMut(&DispatcherEvent)>;

type ObserverSlot = Rc<RefCell<Observer>>;

/// Registry of observers for one dispatcher.
#[derive(Clone, Default)]
pub(crate) struct Observers {
    slots: Rc<RefCell<Slab<ObserverSlot>>>,
}

impl Observers {
    pub(crate) fn subscribe(&self, observer: Observer) -> Subscription {
        let key = self.slots.borrow_mut().insert(Rc::new(RefCell::new(observer)));
        Subscription {
            slots: Rc::downgrade(&self.slots),
            key,
        }
    }

    /// Queue `event` for every current observer.
    pub(crate) fn emit(&self, event: DispatcherEvent) {
        let snapshot: Vec<ObserverSlot> = self.slots.borrow().iter().map(|(_, o)| o.clone()).collect();
        if snapshot.is_empty() {
            return;
        }
        tasks::defer(move || {
            for observer in snapshot {
                (observer.borrow_mut())(&event);
            }
        });
    }
}

/// Unsubscribes its observer when dropped.
pub struct Subscription {
    slots: Weak<RefCell<Slab<ObserverSlot>>>,
    key: usize,
}

impl Subscription {
    /// A subscription that never held an observer.
    pub fn empty() -> Self {
        Self {
            slots: Weak::new(),
            key: 0,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            if let Ok(mut slots) = slots.try_borrow_mut() {
                if slots.contains(self.key) {
                    slots.remove(self.key);
                }
            }
        }
    }
}
