//! Process-wide network activity indicator.
//!
//! Every dispatched request leg increments the counter and every completion
//! decrements it. The `enabled` flag turns on only after the counter has
//! stayed above zero for the activation delay, and turns off once it has
//! stayed at zero for the completion delay, so very short requests never
//! flash an indicator. Watch the flag through [`ActivityIndicator::subscribe`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{DEFAULT_ACTIVATION_DELAY, DEFAULT_COMPLETION_DELAY};

struct State {
    activation_delay: Duration,
    completion_delay: Duration,
    /// Bumped whenever a timer is started or cancelled; a timer only acts
    /// while it still carries the current value.
    generation: u64,
    activation_timer: Option<JoinHandle<()>>,
    completion_timer: Option<JoinHandle<()>>,
}

struct Inner {
    count: AtomicUsize,
    state: Mutex<State>,
    enabled: watch::Sender<bool>,
}

/// Cheap clonable handle; clones share the counter.
#[derive(Clone)]
pub struct ActivityIndicator {
    inner: Arc<Inner>,
}

impl Default for ActivityIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVATION_DELAY, DEFAULT_COMPLETION_DELAY)
    }
}

impl ActivityIndicator {
    pub fn new(activation_delay: Duration, completion_delay: Duration) -> Self {
        let (enabled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                count: AtomicUsize::new(0),
                state: Mutex::new(State {
                    activation_delay,
                    completion_delay,
                    generation: 0,
                    activation_timer: None,
                    completion_timer: None,
                }),
                enabled,
            }),
        }
    }

    /// Number of requests currently in flight.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    pub fn enabled(&self) -> bool {
        *self.inner.enabled.borrow()
    }

    /// Receives every change of the `enabled` flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.enabled.subscribe()
    }

    pub fn set_activation_delay(&self, delay: Duration) {
        self.lock().activation_delay = delay;
    }

    pub fn set_completion_delay(&self, delay: Duration) {
        self.lock().completion_delay = delay;
    }

    pub fn increment(&self) {
        let mut state = self.lock();
        self.inner.count.fetch_add(1, Ordering::SeqCst);

        if let Some(timer) = state.completion_timer.take() {
            timer.abort();
            state.generation += 1;
        }
        if state.activation_timer.is_none() && !self.enabled() {
            let delay = state.activation_delay;
            let timer = self.start_timer(&mut state, delay, true);
            state.activation_timer = timer;
        }
    }

    pub fn decrement(&self) {
        let mut state = self.lock();
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.unwrap_or(0) > 1 {
            return;
        }

        if let Some(timer) = state.activation_timer.take() {
            timer.abort();
            state.generation += 1;
        }
        if state.completion_timer.is_none() && self.enabled() {
            let delay = state.completion_delay;
            let timer = self.start_timer(&mut state, delay, false);
            state.completion_timer = timer;
        }
    }

    fn start_timer(&self, state: &mut State, delay: Duration, enable: bool) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::trace!("No tokio runtime, activity indicator stays {}", self.enabled());
            return None;
        };

        state.generation += 1;
        let generation = state.generation;
        let indicator = self.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            indicator.fire(enable, generation);
        }))
    }

    fn fire(&self, enable: bool, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            log::trace!("Ignoring stale activity timer");
            return;
        }

        let count = self.count();
        if enable {
            state.activation_timer = None;
            if count == 0 {
                return;
            }
        } else {
            state.completion_timer = None;
            if count > 0 {
                return;
            }
        }
        drop(state);

        self.inner.enabled.send_if_modified(|current| {
            let changed = *current != enable;
            *current = enable;
            changed
        });
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
