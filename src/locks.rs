use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::form::FormId;

/// One writer lock per form id. Writers on different forms never contend
/// beyond the short map lookup.
#[derive(Debug, Default)]
pub(crate) struct FormLocks {
    slots: Mutex<HashMap<FormId, Arc<Mutex<()>>>>,
}

impl FormLocks {
    /// The lock slot for `id`. Callers hold `slot.lock()` for the duration
    /// of their read-modify-write.
    pub fn slot(&self, id: FormId) -> Arc<Mutex<()>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(id).or_default().clone()
    }
}

/// Acquire a slot, ignoring poisoning: the guarded data is `()`, the store
/// itself is transactional.
pub(crate) fn hold(slot: &Mutex<()>) -> MutexGuard<'_, ()> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
