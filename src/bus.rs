//! Synchronous publish/subscribe for store snapshots.
//!
//! Every `notify` hands each registered observer its own clone of the
//! snapshot, in registration order. A pass works on the observer list as it
//! was when the pass began, so observers added or removed from inside a
//! callback take effect on the next pass. An observer that triggers a nested
//! pass is not re-entered.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

type Observer<T> = Rc<RefCell<dyn FnMut(T)>>;

struct Registry<T> {
    next_id: u64,
    observers: Vec<(u64, Observer<T>)>,
}

pub struct Bus<T> {
    registry: Rc<RefCell<Registry<T>>>,
}

impl<T: Clone + 'static> Bus<T> {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: FnMut(T) + 'static,
    {
        let observer: Observer<T> = Rc::new(RefCell::new(observer));
        let id = {
            let mut registry = self.registry.borrow_mut();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.observers.push((id, observer));
            id
        };

        let registry: Weak<RefCell<Registry<T>>> = Rc::downgrade(&self.registry);
        Subscription {
            cancel: Cell::new(Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.borrow_mut().observers.retain(|(oid, _)| *oid != id);
                }
            }))),
        }
    }

    pub fn notify(&self, snapshot: &T) {
        let observers: Vec<Observer<T>> = self
            .registry
            .borrow()
            .observers
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect();

        for observer in observers {
            // Busy means we are inside this observer's own callback.
            if let Ok(mut callback) = observer.try_borrow_mut() {
                (&mut *callback)(snapshot.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.registry.borrow().observers.len()
    }
}

impl<T: Clone + 'static> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`Bus::subscribe`]. Dropping it leaves the observer
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    cancel: Cell<Option<Box<dyn FnOnce()>>>,
}

impl Subscription {
    /// Removes the observer. Safe to call more than once, and after the bus
    /// itself is gone.
    pub fn unsubscribe(&self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
