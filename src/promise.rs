//! A minimal thenable.
//!
//! [`Promise`] implements the fulfil/reject/chain/adopt protocol: `then`
//! returns a new promise, handlers run synchronously when the source is
//! already settled and are queued otherwise, and queued reactions drain in
//! registration order exactly once on settlement.
//!
//! Handlers return a [`Reaction`] instead of a bare value. `Reaction::Reject`
//! is the equivalent of throwing from a handler, `Reaction::Adopt` resolves
//! the next promise with another promise's eventual state.
//!
//! ```
//! use duperagent::promise::{Promise, Reaction};
//! use duperagent::errors::PromiseError;
//!
//! #[derive(Clone, Debug)]
//! struct Failure(String);
//! impl From<PromiseError> for Failure {
//!     fn from(e: PromiseError) -> Self { Failure(e.to_string()) }
//! }
//!
//! let p: Promise<i32, Failure> = Promise::pending();
//! let doubled = p.on_fulfilled(|v| Reaction::Fulfill(v * 2));
//! p.fulfill(21);
//! assert_eq!(doubled.value().unwrap().unwrap(), 42);
//! ```

mod multi;

pub use multi::MultiPromiseExecutor;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::errors::PromiseError;

/// Observable state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Final outcome of a settled promise.
#[derive(Debug, Clone)]
pub(crate) enum Settlement<T, E> {
    Fulfilled(T),
    Rejected(E),
}

/// What a `then` handler wants to happen to the next promise.
pub enum Reaction<T, E> {
    /// Fulfil the next promise with this value.
    Fulfill(T),
    /// Reject the next promise with this reason.
    Reject(E),
    /// Follow the state of another promise.
    Adopt(Promise<T, E>),
}

type Subscriber<T, E> = Box<dyn FnOnce(Settlement<T, E>) + Send>;

struct Inner<T, E> {
    settled: Option<Settlement<T, E>>,
    reactions: Vec<Subscriber<T, E>>,
}

/// Shared handle to a promise. Clones refer to the same promise.
pub struct Promise<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let state = match guard.settled {
            None => PromiseState::Pending,
            Some(Settlement::Fulfilled(_)) => PromiseState::Fulfilled,
            Some(Settlement::Rejected(_)) => PromiseState::Rejected,
        };
        f.debug_struct("Promise")
            .field("state", &state)
            .field("queued", &guard.reactions.len())
            .finish()
    }
}

/// The fulfil/reject pair handed to a promise executor.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<PromiseError> + 'static,
{
    pub fn fulfill(&self, value: T) {
        self.promise.fulfill(value);
    }

    pub fn reject(&self, reason: E) {
        self.promise.reject(reason);
    }

    /// Settles from a `Result`, the shape completion callbacks use.
    pub fn settle(&self, result: Result<T, E>) {
        match result {
            Ok(value) => self.fulfill(value),
            Err(reason) => self.reject(reason),
        }
    }

    pub fn adopt(&self, other: Promise<T, E>) {
        self.promise.adopt(other);
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<PromiseError> + 'static,
{
    /// Creates an unsettled promise.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                settled: None,
                reactions: Vec::new(),
            })),
        }
    }

    /// Creates a promise and runs `executor` with its resolver right away.
    pub fn new(executor: impl FnOnce(Resolver<T, E>)) -> Self {
        let promise = Self::pending();
        executor(promise.resolver());
        promise
    }

    pub fn resolved(value: T) -> Self {
        let promise = Self::pending();
        promise.fulfill(value);
        promise
    }

    pub fn rejected(reason: E) -> Self {
        let promise = Self::pending();
        promise.reject(reason);
        promise
    }

    pub fn resolver(&self) -> Resolver<T, E> {
        Resolver {
            promise: self.clone(),
        }
    }

    /// Fulfils the promise. Ignored once settled.
    pub fn fulfill(&self, value: T) {
        self.settle(Settlement::Fulfilled(value));
    }

    /// Rejects the promise. Ignored once settled.
    pub fn reject(&self, reason: E) {
        self.settle(Settlement::Rejected(reason));
    }

    pub fn state(&self) -> PromiseState {
        match self.lock().settled {
            None => PromiseState::Pending,
            Some(Settlement::Fulfilled(_)) => PromiseState::Fulfilled,
            Some(Settlement::Rejected(_)) => PromiseState::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    /// The settled value, or `None` while pending.
    pub fn value(&self) -> Option<Result<T, E>> {
        match &self.lock().settled {
            None => None,
            Some(Settlement::Fulfilled(v)) => Some(Ok(v.clone())),
            Some(Settlement::Rejected(e)) => Some(Err(e.clone())),
        }
    }

    /// Returns true when both handles point at the same promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Chains handlers and returns the promise they resolve.
    ///
    /// A missing handler forwards the value or reason unchanged.
    pub fn then<F, R>(&self, on_fulfilled: Option<F>, on_rejected: Option<R>) -> Promise<T, E>
    where
        F: FnOnce(T) -> Reaction<T, E> + Send + 'static,
        R: FnOnce(E) -> Reaction<T, E> + Send + 'static,
    {
        let next = Promise::pending();
        let target = next.clone();

        self.subscribe(Box::new(move |settlement| match settlement {
            Settlement::Fulfilled(value) => match on_fulfilled {
                Some(handler) => invoke(handler, value, &target),
                None => target.fulfill(value),
            },
            Settlement::Rejected(reason) => match on_rejected {
                Some(handler) => invoke(handler, reason, &target),
                None => target.reject(reason),
            },
        }));

        next
    }

    /// `then` whose handlers produce another value type. A missing
    /// rejection handler forwards the reason unchanged.
    pub fn then_map<U, F, R>(&self, on_fulfilled: F, on_rejected: Option<R>) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Reaction<U, E> + Send + 'static,
        R: FnOnce(E) -> Reaction<U, E> + Send + 'static,
    {
        let next = Promise::pending();
        let target = next.clone();

        self.subscribe(Box::new(move |settlement| match settlement {
            Settlement::Fulfilled(value) => invoke(on_fulfilled, value, &target),
            Settlement::Rejected(reason) => match on_rejected {
                Some(handler) => invoke(handler, reason, &target),
                None => target.reject(reason),
            },
        }));

        next
    }

    /// `then` with only a fulfilment handler.
    pub fn on_fulfilled<F>(&self, handler: F) -> Promise<T, E>
    where
        F: FnOnce(T) -> Reaction<T, E> + Send + 'static,
    {
        self.then(Some(handler), None::<fn(E) -> Reaction<T, E>>)
    }

    /// `then` with only a rejection handler.
    pub fn catch<R>(&self, handler: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Reaction<T, E> + Send + 'static,
    {
        self.then(None::<fn(T) -> Reaction<T, E>>, Some(handler))
    }

    /// Waits for settlement from async code.
    pub async fn wait(&self) -> Result<T, E> {
        let (tx, rx) = oneshot::channel();
        self.subscribe(Box::new(move |settlement| {
            let _ = tx.send(settlement);
        }));

        match rx.await {
            Ok(Settlement::Fulfilled(value)) => Ok(value),
            Ok(Settlement::Rejected(reason)) => Err(reason),
            Err(_) => Err(E::from(PromiseError::Abandoned)),
        }
    }

    /// Resolves this promise with the eventual state of `other`.
    pub(crate) fn adopt(&self, other: Promise<T, E>) {
        if self.ptr_eq(&other) {
            self.reject(E::from(PromiseError::Cycle));
            return;
        }

        let me = self.clone();
        other.subscribe(Box::new(move |settlement| me.settle(settlement)));
    }

    /// Runs `subscriber` on settlement, or right away if already settled.
    pub(crate) fn subscribe(&self, subscriber: Subscriber<T, E>) {
        let settled = {
            let mut guard = self.lock();
            match &guard.settled {
                Some(settlement) => settlement.clone(),
                None => {
                    guard.reactions.push(subscriber);
                    return;
                }
            }
        };
        subscriber(settled);
    }

    fn settle(&self, settlement: Settlement<T, E>) {
        let reactions = {
            let mut guard = self.lock();
            if guard.settled.is_some() {
                return;
            }
            guard.settled = Some(settlement.clone());
            std::mem::take(&mut guard.reactions)
        };

        for reaction in reactions {
            reaction(settlement.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn invoke<A, H, T, E>(handler: H, arg: A, next: &Promise<T, E>)
where
    H: FnOnce(A) -> Reaction<T, E>,
    T: Clone + Send + 'static,
    E: Clone + Send + From<PromiseError> + 'static,
{
    match panic::catch_unwind(AssertUnwindSafe(move || handler(arg))) {
        Ok(Reaction::Fulfill(value)) => next.fulfill(value),
        Ok(Reaction::Reject(reason)) => next.reject(reason),
        Ok(Reaction::Adopt(other)) => next.adopt(other),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("Promise handler panicked: {}", message);
            next.reject(E::from(PromiseError::HandlerPanicked(message)));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
