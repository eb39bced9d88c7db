//! Pipe window — the per-stream byte budget that backs pressure on
//! remote pipe writers.
//!
//! A writer takes budget with [`get`]/[`decrease`] before sending a
//! `Chunk`; the consumer returns budget via `Ack`, which lands in
//! [`increase`]. [`dead`] poisons the window when the consumer is gone
//! so blocked writers fail instead of hanging.
//!
//! [`get`]: PipeWindow::get
//! [`increase`]: PipeWindow::increase
//! [`decrease`]: PipeWindow::decrease
//! [`dead`]: PipeWindow::dead

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::TetherError;

/// Default in-flight byte budget per pipe.
pub const DEFAULT_WINDOW_MAX: usize = 1024 * 1024;

struct WindowState {
    available: i64,
    dead: Option<Arc<TetherError>>,
}

/// Counted byte budget with poisoning.
pub struct PipeWindow {
    max: usize,
    throttled: bool,
    state: Mutex<WindowState>,
    notify: Notify,
}

impl PipeWindow {
    /// A bounded window of `max` in-flight bytes.
    pub fn bounded(max: usize) -> Self {
        Self {
            max,
            throttled: true,
            state: Mutex::new(WindowState {
                available: max as i64,
                dead: None,
            }),
            notify: Notify::new(),
        }
    }

    /// An unthrottled window: budget never runs out and acks are not
    /// expected. Used when `PIPE_THROTTLING` is not jointly supported.
    pub fn unthrottled(max: usize) -> Self {
        Self {
            max,
            throttled: false,
            state: Mutex::new(WindowState {
                available: i64::MAX / 2,
                dead: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Configured maximum in-flight bytes.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Whether this window participates in `Ack` flow control.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Currently available budget. Diagnostic only.
    pub fn available(&self) -> i64 {
        self.state.lock().unwrap().available
    }

    /// Block until at least `at_least` bytes of budget are available
    /// (or the window dies); returns the full current availability.
    pub async fn get(&self, at_least: usize) -> Result<usize, TetherError> {
        let at_least = at_least.max(1) as i64;
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().unwrap();
                if let Some(cause) = &state.dead {
                    return Err(TetherError::PipeBroken(cause.to_string()));
                }
                if state.available >= at_least {
                    return Ok(state.available as usize);
                }
            }
            notified.await;
        }
    }

    /// Take `n` bytes of budget after sending a chunk.
    pub fn decrease(&self, n: usize) {
        if !self.throttled {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.available -= n as i64;
    }

    /// Return `n` bytes of budget (an `Ack` arrived).
    pub fn increase(&self, n: usize) {
        if !self.throttled {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.available += n as i64;
        }
        self.notify.notify_waiters();
    }

    /// Poison the window: all current and future `get`s fail.
    pub fn dead(&self, cause: Arc<TetherError>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.dead.is_none() {
                state.dead = Some(cause);
            }
        }
        self.notify.notify_waiters();
    }

    /// Whether the window has been poisoned.
    pub fn is_dead(&self) -> bool {
        self.state.lock().unwrap().dead.is_some()
    }
}

impl std::fmt::Debug for PipeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("PipeWindow")
            .field("max", &self.max)
            .field("throttled", &self.throttled)
            .field("available", &state.available)
            .field("dead", &state.dead.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn get_returns_full_availability() {
        let window = PipeWindow::bounded(1000);
        assert_eq!(window.get(100).await.unwrap(), 1000);
        window.decrease(600);
        assert_eq!(window.get(100).await.unwrap(), 400);
    }

    #[tokio::test]
    async fn get_blocks_until_increase() {
        let window = Arc::new(PipeWindow::bounded(100));
        window.decrease(100);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.get(50).await })
        };

        // The waiter cannot make progress yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.increase(60);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, 60);
    }

    #[tokio::test]
    async fn dead_fails_blocked_getters() {
        let window = Arc::new(PipeWindow::bounded(10));
        window.decrease(10);

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.get(1).await })
        };

        window.dead(Arc::new(TetherError::OrderlyShutdown));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TetherError::PipeBroken(_)));
        assert!(window.is_dead());

        // Future gets fail immediately too.
        assert!(window.get(1).await.is_err());
    }

    #[tokio::test]
    async fn unthrottled_never_blocks() {
        let window = PipeWindow::unthrottled(DEFAULT_WINDOW_MAX);
        for _ in 0..1000 {
            let got = window.get(DEFAULT_WINDOW_MAX).await.unwrap();
            assert!(got >= DEFAULT_WINDOW_MAX);
            window.decrease(DEFAULT_WINDOW_MAX);
        }
        assert!(!window.is_throttled());
    }
}
