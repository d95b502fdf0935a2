//! Callback lists shared by the main-loop services.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handle returned by [`Callbacks::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback<T> = Rc<dyn Fn(&T)>;

pub struct Callbacks<T> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(CallbackId, Callback<T>)>>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&T) + 'static,
    {
        let id = CallbackId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, Rc::new(callback)));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);
        entries.len() != before
    }

    /// Invoke every callback. Callbacks may register or unregister others
    /// while running; those changes apply from the next notify.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = self
            .entries
            .borrow()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(value);
        }
    }

    pub fn notify_single(&self, id: CallbackId, value: &T) {
        let callback = self
            .entries
            .borrow()
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, cb)| cb.clone());
        if let Some(cb) = callback {
            cb(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}
