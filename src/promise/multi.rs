use std::sync::{Arc, Mutex, PoisonError};

use super::{Promise, Settlement};
use crate::errors::PromiseError;

struct AllState<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

/// Combinators over several promises.
pub struct MultiPromiseExecutor;

impl MultiPromiseExecutor {
    /// Fulfils with every value, in input order, once all inputs fulfil.
    /// Rejects with the first rejection. Plain values can be passed in
    /// through [`Promise::resolved`].
    pub fn all<T, E, I>(promises: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Promise<T, E>>,
        T: Clone + Send + 'static,
        E: Clone + Send + From<PromiseError> + 'static,
    {
        let promises: Vec<_> = promises.into_iter().collect();
        let result = Promise::pending();

        if promises.is_empty() {
            result.fulfill(Vec::new());
            return result;
        }

        let state = Arc::new(Mutex::new(AllState {
            values: vec![None; promises.len()],
            remaining: promises.len(),
        }));

        for (index, promise) in promises.into_iter().enumerate() {
            let state = state.clone();
            let result = result.clone();
            promise.subscribe(Box::new(move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    let done = {
                        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.values[index] = Some(value);
                        guard.remaining -= 1;
                        if guard.remaining == 0 {
                            Some(guard.values.drain(..).flatten().collect::<Vec<_>>())
                        } else {
                            None
                        }
                    };
                    if let Some(values) = done {
                        result.fulfill(values);
                    }
                }
                Settlement::Rejected(reason) => result.reject(reason),
            }));
        }

        result
    }

    /// Settles like whichever input settles first.
    pub fn race<T, E, I>(promises: I) -> Promise<T, E>
    where
        I: IntoIterator<Item = Promise<T, E>>,
        T: Clone + Send + 'static,
        E: Clone + Send + From<PromiseError> + 'static,
    {
        let result = Promise::pending();
        for promise in promises {
            let result = result.clone();
            promise.subscribe(Box::new(move |settlement| result.settle(settlement)));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::tests::{boom, Reason};
    use crate::promise::PromiseState;

    #[test]
    fn all_keeps_input_order() {
        let a: Promise<i32, Reason> = Promise::pending();
        let b: Promise<i32, Reason> = Promise::pending();
        let c = Promise::resolved(3);
        let all = MultiPromiseExecutor::all([a.clone(), b.clone(), c]);

        b.fulfill(2);
        assert!(all.is_pending());
        a.fulfill(1);
        assert_eq!(all.value().unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn all_rejects_on_first_rejection() {
        let a: Promise<i32, Reason> = Promise::pending();
        let b: Promise<i32, Reason> = Promise::pending();
        let all = MultiPromiseExecutor::all([a.clone(), b.clone()]);

        b.reject(boom());
        a.fulfill(1);
        assert_eq!(all.value().unwrap().unwrap_err(), boom());
    }

    #[test]
    fn all_of_nothing_is_empty() {
        let all = MultiPromiseExecutor::all(Vec::<Promise<i32, Reason>>::new());
        assert_eq!(all.value().unwrap().unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn race_takes_first_settlement() {
        let a: Promise<i32, Reason> = Promise::pending();
        let b: Promise<i32, Reason> = Promise::pending();
        let race = MultiPromiseExecutor::race([a.clone(), b.clone()]);

        b.reject(boom());
        a.fulfill(1);
        assert_eq!(race.state(), PromiseState::Rejected);
        assert_eq!(race.value().unwrap().unwrap_err(), boom());
    }

    #[test]
    fn race_with_settled_input() {
        let race = MultiPromiseExecutor::race([
            Promise::<i32, Reason>::resolved(9),
            Promise::pending(),
        ]);
        assert_eq!(race.value().unwrap().unwrap(), 9);
    }
}
