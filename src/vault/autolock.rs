//! Sliding auto-lock deadline
//!
//! A single tokio task sleeps until the current deadline. Touching the
//! timer only moves the deadline; the task notices on wake-up and goes back
//! to sleep, so activity never spawns new tasks.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Auto-lock timer owned by a vault session
pub struct AutoLockTimer {
    timeout: Option<Duration>,
    deadline: Arc<Mutex<Option<Instant>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoLockTimer {
    /// `None` or a zero timeout disables auto-lock
    pub fn new(timeout: Option<Duration>) -> Self {
        AutoLockTimer {
            timeout: timeout.filter(|t| !t.is_zero()),
            deadline: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Configured timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Start the countdown.
    ///
    /// `on_expire` is called once the deadline passes. It returns `true`
    /// when the timer's job is done and `false` when the deadline moved in
    /// the meantime, in which case the task keeps waiting.
    pub fn arm<F>(&self, on_expire: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return,
        };

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, auto-lock disabled for this session");
                return;
            }
        };

        *self.deadline.lock() = Some(Instant::now() + timeout);

        let mut task = self.task.lock();
        if let Some(existing) = task.take() {
            existing.abort();
        }

        let deadline = Arc::clone(&self.deadline);
        *task = Some(handle.spawn(async move {
            loop {
                let due = match *deadline.lock() {
                    Some(due) => due,
                    None => return,
                };
                if Instant::now() < due {
                    sleep_until(due).await;
                    continue;
                }
                if on_expire() {
                    debug!("Auto-lock timer finished");
                    return;
                }
            }
        }));
    }

    /// Push the deadline back by the full timeout
    pub fn touch(&self) {
        if let Some(timeout) = self.timeout {
            let mut deadline = self.deadline.lock();
            if deadline.is_some() {
                *deadline = Some(Instant::now() + timeout);
            }
        }
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        matches!(*self.deadline.lock(), Some(due) if Instant::now() >= due)
    }

    /// Whether a countdown is running
    pub fn is_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    /// Stop the countdown
    pub fn cancel(&self) {
        *self.deadline.lock() = None;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for AutoLockTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_disabled_timer() {
        let timer = AutoLockTimer::new(None);
        timer.arm(|| true);
        assert!(!timer.is_armed());

        let timer = AutoLockTimer::new(Some(Duration::ZERO));
        assert!(timer.timeout().is_none());
    }

    #[tokio::test]
    async fn test_fires_after_timeout() {
        let timer = AutoLockTimer::new(Some(Duration::from_millis(50)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        assert!(timer.is_armed());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_expired());
    }

    #[tokio::test]
    async fn test_touch_slides_deadline() {
        let timer = AutoLockTimer::new(Some(Duration::from_millis(150)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            timer.touch();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let timer = AutoLockTimer::new(Some(Duration::from_millis(50)));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        timer.cancel();
        assert!(!timer.is_armed());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
