//! Tracking asynchronous acknowledgements of proxy configuration changes

use crate::{Error, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A single pending acknowledgement handed out by a [`WaitGroup`]
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<()>>,
}

impl Completion {
    /// Acknowledge the change, optionally with the error it failed with
    pub fn complete(self, result: Result<()>) {
        // The wait group may already have given up waiting.
        let _ = self.tx.send(result);
    }
}

/// A group of completions that can be waited on together.
///
/// Waiting stops early when the group's cancellation token fires.
#[derive(Debug)]
pub struct WaitGroup {
    cancel: CancellationToken,
    pending: Mutex<Vec<oneshot::Receiver<Result<()>>>>,
}

impl WaitGroup {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The token bounding how long [`WaitGroup::wait`] may block
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Register a new completion that must be acknowledged before `wait` returns
    pub fn add_completion(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push(rx);
        Completion { tx }
    }

    /// Number of completions not yet collected by `wait`
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for every completion added so far.
    ///
    /// Returns the first completion error, or [`Error::Cancelled`] if the
    /// token fires first. A completion dropped without being acknowledged
    /// counts as failed.
    pub async fn wait(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut first_err = None;

        for rx in pending {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = rx => result,
            };
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(_) => Error::Completion("completion dropped before acknowledgement".to_string()),
            };
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
