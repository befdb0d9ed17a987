//! Context locals and context-thread locals
//!
//! Slots are allocated on the engine, so a key is valid for every context
//! of that engine. Storage arrays grow lazily under the context monitor
//! and are cleared when the context closes.

use super::{Context, LocalValue};
use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle of a context local slot
#[derive(Debug)]
pub struct LocalKey<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

/// Typed handle of a context-thread local slot
#[derive(Debug)]
pub struct ThreadLocalKey<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

macro_rules! key_impls {
    ($key:ident) => {
        impl<T> $key<T> {
            pub(crate) fn new(index: usize) -> Self {
                Self {
                    index,
                    _marker: PhantomData,
                }
            }

            /// Slot index
            pub fn index(&self) -> usize {
                self.index
            }
        }

        impl<T> Clone for $key<T> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T> Copy for $key<T> {}
    };
}

key_impls!(LocalKey);
key_impls!(ThreadLocalKey);

fn downcast<T: Send + Sync + 'static>(value: Option<&Option<LocalValue>>) -> Option<Arc<T>> {
    value
        .and_then(Option::as_ref)
        .and_then(|value| value.clone().downcast::<T>().ok())
}

impl Context {
    /// Read a context local
    pub fn get_local<T: Send + Sync + 'static>(&self, key: LocalKey<T>) -> Option<Arc<T>> {
        let core = self.inner.core.lock();
        downcast(core.locals.get(key.index))
    }

    /// Write a context local, returning the previous value
    pub fn set_local<T: Send + Sync + 'static>(
        &self,
        key: LocalKey<T>,
        value: T,
    ) -> PolyglotResult<Option<Arc<T>>> {
        let mut core = self.inner.core.lock();
        if core.machine.state().is_closed() {
            return Err(PolyglotError::illegal_state("The Context is already closed."));
        }
        let len = (key.index + 1).max(self.inner.engine.context_local_count());
        if core.locals.len() < len {
            core.locals.resize(len, None);
        }
        let previous = core.locals[key.index].replace(Arc::new(value));
        Ok(previous.and_then(|value| value.downcast::<T>().ok()))
    }

    /// Read a context-thread local of the calling thread
    pub fn get_thread_local<T: Send + Sync + 'static>(
        &self,
        key: ThreadLocalKey<T>,
    ) -> Option<Arc<T>> {
        let core = self.inner.core.lock();
        let record = core.threads.get(ThreadKey::current())?;
        downcast(record.locals.get(key.index))
    }

    /// Write a context-thread local of the calling thread
    ///
    /// The thread must have entered the context before.
    pub fn set_thread_local<T: Send + Sync + 'static>(
        &self,
        key: ThreadLocalKey<T>,
        value: T,
    ) -> PolyglotResult<Option<Arc<T>>> {
        let mut core = self.inner.core.lock();
        let len = (key.index + 1).max(self.inner.engine.thread_local_count());
        core.threads.grow_locals(len);
        let record = core.threads.get_mut(ThreadKey::current()).ok_or_else(|| {
            PolyglotError::illegal_state("The context was never entered on the current thread.")
        })?;
        let previous = record.locals[key.index].replace(Arc::new(value));
        Ok(previous.and_then(|value| value.downcast::<T>().ok()))
    }
}
