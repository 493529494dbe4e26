//! Build status tokens
//!
//! A status token is a single-assignment, thread-safe completion signal:
//! it ends exactly once in one of three outcomes, optionally carrying a
//! result value, and separately records the most recent error observed
//! while the stage it tracks was being retried. Tokens are the only
//! cancellation primitive in the sync subsystem; long-running operations
//! are raced against [`StatusToken::wait`].

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::Error;

/// Terminal outcome of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The tracked operation finished
    Successful,
    /// Externally cancelled
    Canceled,
    /// User diverted to reconfiguration instead of waiting
    Settings,
}

struct TokenState<T> {
    outcome: Option<Outcome>,
    result: Option<T>,
    error: Option<Arc<Error>>,
}

struct Inner<T> {
    state: Mutex<TokenState<T>>,
    done: Notify,
}

/// Cancellable completion signal. Cloning shares the same state.
pub struct StatusToken<T = ()> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for StatusToken<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for StatusToken<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StatusToken<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TokenState {
                    outcome: None,
                    result: None,
                    error: None,
                }),
                done: Notify::new(),
            }),
        }
    }

    /// End the token without a result. Idempotent: only the first call
    /// takes effect and fires the completion notification.
    pub fn end(&self, outcome: Outcome) -> bool {
        self.end_inner(outcome, None)
    }

    /// End the token with a result value.
    pub fn end_with(&self, outcome: Outcome, result: T) -> bool {
        self.end_inner(outcome, Some(result))
    }

    fn end_inner(&self, outcome: Outcome, result: Option<T>) -> bool {
        {
            let mut state = self.inner.state.lock().expect("token state poisoned");
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.result = result;
        }
        self.inner.done.notify_waiters();
        true
    }

    /// Record the latest error without ending the token. The build loop
    /// keeps retrying while the last failure stays inspectable here.
    pub fn set_error(&self, error: Error) {
        let mut state = self.inner.state.lock().expect("token state poisoned");
        state.error = Some(Arc::new(error));
    }

    pub fn error(&self) -> Option<Arc<Error>> {
        self.inner
            .state
            .lock()
            .expect("token state poisoned")
            .error
            .clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner
            .state
            .lock()
            .expect("token state poisoned")
            .outcome
    }

    pub fn is_ended(&self) -> bool {
        self.outcome().is_some()
    }

    /// Take the result value out of the token (single consumer).
    pub fn take_result(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .expect("token state poisoned")
            .result
            .take()
    }

    /// Wait for the token to end.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.inner.done.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Race an operation against the token. Returns `Err(outcome)` when
    /// the token ended first; the caller is responsible for cleanup.
    pub async fn race<F>(&self, operation: F) -> std::result::Result<F::Output, Outcome>
    where
        F: std::future::Future,
    {
        tokio::select! {
            outcome = self.wait() => Err(outcome),
            output = operation => Ok(output),
        }
    }
}

impl<T> std::fmt::Debug for StatusToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusToken")
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_second_end_is_a_noop() {
        let token: StatusToken<u32> = StatusToken::new();
        assert!(token.end_with(Outcome::Successful, 7));
        assert!(!token.end(Outcome::Canceled));
        assert_eq!(token.outcome(), Some(Outcome::Successful));
        assert_eq!(token.take_result(), Some(7));
        // Result is single-consumer.
        assert_eq!(token.take_result(), None);
    }

    #[tokio::test]
    async fn test_wait_resolves_for_late_and_early_waiters() {
        let token: StatusToken = StatusToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.end(Outcome::Canceled);
        assert_eq!(handle.await.unwrap(), Outcome::Canceled);

        // Waiting after completion resolves immediately.
        assert_eq!(token.wait().await, Outcome::Canceled);
    }

    #[tokio::test]
    async fn test_race_returns_outcome_when_token_ends_first() {
        let token: StatusToken = StatusToken::new();
        token.end(Outcome::Settings);
        let raced = token.race(std::future::pending::<()>()).await;
        assert_eq!(raced.unwrap_err(), Outcome::Settings);
    }

    #[tokio::test]
    async fn test_race_returns_operation_output_when_it_wins() {
        let token: StatusToken = StatusToken::new();
        let raced = token.race(async { 41 + 1 }).await;
        assert_eq!(raced.unwrap(), 42);
    }

    #[test]
    fn test_error_is_recorded_without_ending() {
        let token: StatusToken = StatusToken::new();
        token.set_error(Error::Transport("connection refused".into()));
        assert!(!token.is_ended());
        assert!(token.error().is_some());
    }
}
