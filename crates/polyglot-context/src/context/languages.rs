//! Language context initialization and thread access checks

use super::{Context, ContextCore};
use crate::language::{ExitMode, LanguageData, LanguageEnv, LanguageSlot};
use crate::thread::ThreadKey;
use crate::{PolyglotError, PolyglotResult};

fn current_thread_name(key: ThreadKey) -> String {
    std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("thread-{}", key.as_u64()))
}

fn denied_access(thread: &str, single_threaded: bool, denied: &[&LanguageSlot]) -> PolyglotError {
    let languages = denied
        .iter()
        .map(|slot| slot.id())
        .collect::<Vec<_>>()
        .join(", ");
    PolyglotError::illegal_state(format!(
        "{} threaded access requested by thread {} but is not allowed for language(s) {}.",
        if single_threaded { "Single" } else { "Multi" },
        thread,
        languages
    ))
}

impl Context {
    /// Initialize a language by id
    ///
    /// Enters the context for the duration of the initialization.
    pub fn initialize_language(&self, id: &str) -> PolyglotResult<bool> {
        let ordinal = self.language_ordinal(id)?;
        let guard = self.enter_if_needed()?;
        let result = self.ensure_initialized(ordinal);
        self.leave_if_needed(guard)?;
        result
    }

    /// Data a language created for this context
    pub fn language_data(&self, id: &str) -> Option<LanguageData> {
        let ordinal = self.inner.engine.language_ordinal(id)?;
        self.inner.languages[ordinal].data().cloned()
    }

    fn language_ordinal(&self, id: &str) -> PolyglotResult<usize> {
        self.inner.engine.language_ordinal(id).ok_or_else(|| {
            PolyglotError::illegal_state(format!(
                "No language for id {} found. Supported languages are: {}.",
                id,
                self.inner.engine.language_ids().join(", ")
            ))
        })
    }

    pub(crate) fn initialize_eager_languages(&self) -> PolyglotResult<()> {
        let guard = self.enter_if_needed()?;
        let result = (|| {
            self.ensure_initialized(0)?;
            for id in &self.inner.options.eager_languages {
                let ordinal = self.language_ordinal(id)?;
                self.ensure_initialized(ordinal)?;
            }
            Ok(())
        })();
        let left = self.leave_if_needed(guard);
        result.and(left)
    }

    /// Create and initialize a language context once
    ///
    /// Returns false if the language was already initialized or its
    /// initialization is running further up the calling thread's stack.
    pub(crate) fn ensure_initialized(&self, ordinal: usize) -> PolyglotResult<bool> {
        let inner = &self.inner;
        let slot = &inner.languages[ordinal];
        let Some(guard) = slot.begin_initialize() else {
            return Ok(false);
        };
        {
            let core = inner.core.lock();
            self.check_usable(&core)?;
            let single = core.threads.is_single_threaded();
            let denied = core
                .threads
                .records()
                .map(|record| record.info.key())
                .any(|thread| !slot.language().is_thread_access_allowed(thread, single));
            if denied {
                return Err(denied_access(
                    &current_thread_name(ThreadKey::current()),
                    single,
                    &[slot],
                ));
            }
        }

        slot.ensure_created(self)?;
        guard.set(true);
        let result = slot.language().initialize_context(&LanguageEnv::new(self, slot));
        guard.set(false);
        result?;

        let (multi_threaded, threads) = {
            let mut core = inner.core.lock();
            slot.mark_initialized();
            core.init_order.push(ordinal);
            let threads: Vec<ThreadKey> = core
                .threads
                .records_mut()
                .filter(|record| !record.initialized_languages[ordinal])
                .map(|record| {
                    record.initialized_languages[ordinal] = true;
                    record.info.key()
                })
                .collect();
            (!core.threads.is_single_threaded(), threads)
        };
        drop(guard);

        let env = LanguageEnv::new(self, slot);
        if multi_threaded {
            slot.language().initialize_multi_threading(&env)?;
        }
        for thread in threads {
            slot.language().initialize_thread(&env, thread)?;
        }
        if let Some(listener) = inner.engine.listener() {
            listener.on_language_initialized(self, slot.id());
        }
        tracing::debug!(context = self.id().as_u64(), language = slot.id(), "initialized language");
        Ok(true)
    }

    /// Closed contexts reject initialization; invalid ones raise their signal
    fn check_usable(&self, core: &ContextCore) -> PolyglotResult<()> {
        let state = core.machine.state();
        if state.is_closed() || core.disposing {
            return Err(PolyglotError::illegal_state("The Context is already closed."));
        }
        if core.machine.closing_thread == Some(ThreadKey::current()) {
            return Ok(());
        }
        if state.is_invalid() {
            return Err(self.inner.invalid_error(core));
        }
        Ok(())
    }

    /// Ask every initialized language whether a new thread may enter
    pub(crate) fn check_thread_access(
        &self,
        key: ThreadKey,
        single_threaded: bool,
    ) -> PolyglotResult<()> {
        let denied: Vec<&LanguageSlot> = self
            .inner
            .languages
            .iter()
            .filter(|slot| slot.is_initialized())
            .filter(|slot| !slot.language().is_thread_access_allowed(key, single_threaded))
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(denied_access(&current_thread_name(key), single_threaded, &denied))
        }
    }

    /// Before switching to multi-threaded mode every initialized language
    /// must allow every seen thread
    pub(crate) fn check_all_thread_accesses(
        &self,
        core: &ContextCore,
        key: ThreadKey,
    ) -> PolyglotResult<()> {
        let denied: Vec<&LanguageSlot> = self
            .inner
            .languages
            .iter()
            .filter(|slot| slot.is_initialized())
            .filter(|slot| {
                let language = slot.language();
                !language.is_thread_access_allowed(key, false)
                    || core
                        .threads
                        .records()
                        .any(|record| !language.is_thread_access_allowed(record.info.key(), false))
            })
            .collect();
        if denied.is_empty() {
            Ok(())
        } else {
            Err(denied_access(&current_thread_name(key), false, &denied))
        }
    }

    pub(crate) fn initialize_multi_threading(&self) -> PolyglotResult<()> {
        for slot in self.inner.languages.iter().filter(|slot| slot.is_initialized()) {
            slot.language()
                .initialize_multi_threading(&LanguageEnv::new(self, slot))?;
        }
        Ok(())
    }

    /// Run `initialize_thread` for languages the thread has not seen yet
    pub(crate) fn initialize_thread_languages(&self, key: ThreadKey) -> PolyglotResult<()> {
        let ordinals: Vec<usize> = {
            let mut core = self.inner.core.lock();
            let order = core.init_order.clone();
            let mut claimed = Vec::new();
            if let Some(record) = core.threads.get_mut(key) {
                for ordinal in order {
                    if !record.initialized_languages[ordinal] {
                        record.initialized_languages[ordinal] = true;
                        claimed.push(ordinal);
                    }
                }
            }
            claimed
        };
        for ordinal in ordinals {
            let slot = &self.inner.languages[ordinal];
            slot.language()
                .initialize_thread(&LanguageEnv::new(self, slot), key)?;
        }
        Ok(())
    }

    /// Run `dispose_thread` in reverse initialization order
    pub(crate) fn dispose_thread_languages(
        &self,
        initialized: &[bool],
        key: ThreadKey,
    ) -> Vec<PolyglotError> {
        let order = self.inner.core.lock().init_order.clone();
        order
            .into_iter()
            .rev()
            .filter(|&ordinal| initialized[ordinal])
            .filter_map(|ordinal| self.inner.languages[ordinal].dispose_thread(self, key).err())
            .collect()
    }

    /// Run `exit_context` for every initialized language, newest first
    pub(crate) fn notify_exit(&self, mode: ExitMode, code: i32) -> PolyglotResult<()> {
        let order = self.inner.core.lock().init_order.clone();
        for ordinal in order.into_iter().rev() {
            let slot = &self.inner.languages[ordinal];
            slot.language()
                .exit_context(&LanguageEnv::new(self, slot), mode, code)?;
        }
        Ok(())
    }

    /// Run `finalize_context` until no language is left to finalize
    ///
    /// Finalization may initialize further languages, which are finalized
    /// in the next pass.
    pub(crate) fn finalize_languages(
        &self,
        on_error: &mut dyn FnMut(PolyglotError) -> PolyglotResult<()>,
    ) -> PolyglotResult<()> {
        loop {
            let order = self.inner.core.lock().init_order.clone();
            let mut performed = false;
            for ordinal in order.into_iter().rev() {
                match self.inner.languages[ordinal].finalize(self) {
                    Ok(ran) => performed |= ran,
                    Err(e) => {
                        performed = true;
                        on_error(e)?;
                    }
                }
            }
            if !performed {
                return Ok(());
            }
        }
    }

    /// Dispose every created language context, newest first
    pub(crate) fn dispose_languages(
        &self,
        on_error: &mut dyn FnMut(PolyglotError) -> PolyglotResult<()>,
    ) -> PolyglotResult<()> {
        let order = self.inner.core.lock().init_order.clone();
        let uninitialized = (0..self.inner.languages.len())
            .rev()
            .filter(|ordinal| !order.contains(ordinal));
        for ordinal in order.iter().rev().copied().chain(uninitialized) {
            if let Err(e) = self.inner.languages[ordinal].dispose(self) {
                on_error(e)?;
            }
        }
        Ok(())
    }
}
