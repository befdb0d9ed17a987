//! Registry of threads that have seen a context

use super::{ThreadInfo, ThreadKey};
use crate::context::{Interrupter, LocalValue};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Monitor-guarded bookkeeping for one thread
pub(crate) struct ThreadRecord {
    pub(crate) info: Arc<ThreadInfo>,
    /// Entered depth recorded at each explicit enter
    pub(crate) explicit_stack: Vec<usize>,
    /// Languages whose `initialize_thread` ran for this thread
    pub(crate) initialized_languages: Vec<bool>,
    /// Context-thread locals
    pub(crate) locals: Vec<Option<LocalValue>>,
    /// Installed while the thread waits inside `leave_and_enter`
    pub(crate) interrupter: Option<Arc<dyn Interrupter>>,
}

impl ThreadRecord {
    pub(crate) fn new(info: Arc<ThreadInfo>, language_count: usize) -> Self {
        Self {
            info,
            explicit_stack: Vec::new(),
            initialized_languages: vec![false; language_count],
            locals: Vec::new(),
            interrupter: None,
        }
    }

    /// Send the platform interrupt, through the interrupter if one is installed
    pub(crate) fn interrupt(&self) {
        self.info.interrupt();
        if let Some(interrupter) = &self.interrupter {
            interrupter.interrupt(self.info.key());
        }
    }
}

/// Live threads of one context
///
/// Starts in single-threaded mode; flips to multi-threaded the first time
/// two threads are active at once and never flips back.
pub(crate) struct ThreadRegistry {
    threads: FxHashMap<ThreadKey, ThreadRecord>,
    single_threaded: bool,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self {
            threads: FxHashMap::default(),
            single_threaded: true,
        }
    }

    pub(crate) fn is_single_threaded(&self) -> bool {
        self.single_threaded
    }

    pub(crate) fn set_multi_threaded(&mut self) {
        self.single_threaded = false;
    }

    pub(crate) fn get(&self, key: ThreadKey) -> Option<&ThreadRecord> {
        self.threads.get(&key)
    }

    pub(crate) fn get_mut(&mut self, key: ThreadKey) -> Option<&mut ThreadRecord> {
        self.threads.get_mut(&key)
    }

    pub(crate) fn insert(&mut self, record: ThreadRecord) {
        self.threads.insert(record.info.key(), record);
    }

    pub(crate) fn remove(&mut self, key: ThreadKey) -> Option<ThreadRecord> {
        self.threads.remove(&key)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.threads.values()
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut ThreadRecord> {
        self.threads.values_mut()
    }

    /// Drain every record, leaving the registry empty
    pub(crate) fn drain(&mut self) -> Vec<ThreadRecord> {
        self.threads.drain().map(|(_, record)| record).collect()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.threads.values().any(|r| r.info.is_active())
    }

    /// First active thread other than `current`
    pub(crate) fn first_active_other(&self, current: ThreadKey) -> Option<&ThreadRecord> {
        self.threads
            .values()
            .find(|r| r.info.key() != current && r.info.is_active())
    }

    pub(crate) fn has_active_other(&self, current: ThreadKey) -> bool {
        self.first_active_other(current).is_some()
    }

    /// Keys of all currently active threads
    pub(crate) fn active_keys(&self) -> Vec<ThreadKey> {
        self.threads
            .values()
            .filter(|r| r.info.is_active())
            .map(|r| r.info.key())
            .collect()
    }

    /// Grow every thread's local array to at least `len` slots
    pub(crate) fn grow_locals(&mut self, len: usize) {
        for record in self.threads.values_mut() {
            if record.locals.len() < len {
                record.locals.resize(len, None);
            }
        }
    }
}
