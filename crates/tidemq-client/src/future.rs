//! Completion futures for in-flight operations.
//!
//! Every operation expecting a broker reply hands back an [`OpFuture`]
//! that resolves when the matching acknowledgement arrives. Futures are
//! tracked in a [`FutureStore`] keyed by packet identifier. A timed-out
//! `wait` resolves with `Timeout` but leaves the future (and the
//! session's in-flight record) in place; a late acknowledgement is still
//! handled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::ClientError;

/// What an acknowledgement resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureOutcome {
    /// CONNACK accepted the connection.
    Connected { session_present: bool },
    /// SUBACK granted qos codes (0-2, or 0x80 per failed filter).
    Granted { return_codes: Vec<u8> },
    /// Plain acknowledgement (PUBACK, PUBCOMP, UNSUBACK, qos 0 send).
    Completed,
}

#[derive(Debug)]
enum State {
    Pending,
    Done(FutureOutcome),
    Failed(ClientError),
}

/// A one-shot completion signal with payload.
#[derive(Debug)]
pub struct OpFuture {
    state: Mutex<State>,
    done: Condvar,
}

impl OpFuture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending),
            done: Condvar::new(),
        })
    }

    /// An already-resolved future, for operations that complete at send.
    pub fn completed(outcome: FutureOutcome) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Done(outcome)),
            done: Condvar::new(),
        })
    }

    /// Resolve the future. The first resolution wins.
    pub fn complete(&self, outcome: FutureOutcome) {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Done(outcome);
            self.done.notify_all();
        }
    }

    /// Fail the future. The first resolution wins.
    pub fn fail(&self, err: ClientError) {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Failed(err);
            self.done.notify_all();
        }
    }

    /// Block until the future resolves. `None` waits forever; an
    /// elapsed deadline returns `Timeout` without resolving the future.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<FutureOutcome, ClientError> {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while matches!(*state, State::Pending) {
                    self.done.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while matches!(*state, State::Pending) {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        return Err(ClientError::Timeout);
                    }
                }
            }
        }

        match &*state {
            State::Done(outcome) => Ok(outcome.clone()),
            State::Failed(err) => Err(err.clone()),
            State::Pending => Err(ClientError::Timeout),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), State::Pending)
    }
}

/// Active futures keyed by packet identifier.
#[derive(Default)]
pub struct FutureStore {
    store: Mutex<AHashMap<u16, Arc<OpFuture>>>,
}

impl FutureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: u16, future: Arc<OpFuture>) {
        self.store.lock().insert(id, future);
    }

    pub fn get(&self, id: u16) -> Option<Arc<OpFuture>> {
        self.store.lock().get(&id).cloned()
    }

    /// Remove and return the future for an id.
    pub fn remove(&self, id: u16) -> Option<Arc<OpFuture>> {
        self.store.lock().remove(&id)
    }

    pub fn all(&self) -> Vec<Arc<OpFuture>> {
        self.store.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Fail every stored future and clear the store.
    pub fn fail_all(&self, err: &ClientError) {
        let futures: Vec<_> = self.store.lock().drain().map(|(_, f)| f).collect();
        for future in futures {
            future.fail(err.clone());
        }
    }

    /// Wait until every stored future has resolved or the timeout
    /// elapses.
    pub fn await_all(&self, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<_> = self.all().into_iter().filter(|f| f.is_pending()).collect();
            let Some(first) = pending.first() else {
                return Ok(());
            };
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ClientError::Timeout)?;
            first.wait(Some(remaining))?;
        }
    }
}
