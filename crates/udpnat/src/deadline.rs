//! Resettable one-shot read deadline.
//!
//! A waiter subscribes to the current deadline and re-arms itself whenever
//! it changes, so a read that is already blocked picks up a new deadline
//! without being re-issued.

use tokio::sync::watch;
use tokio::time::Instant;

pub struct Deadline {
    at: watch::Sender<Option<Instant>>,
}

impl Deadline {
    /// A deadline that is not set and never fires.
    pub fn new() -> Self {
        let (at, _) = watch::channel(None);
        Self { at }
    }

    /// Replace the deadline. A time in the past fires immediately,
    /// `None` disarms it.
    pub fn set(&self, at: Option<Instant>) {
        self.at.send_replace(at);
    }

    pub fn get(&self) -> Option<Instant> {
        *self.at.borrow()
    }

    pub fn is_elapsed(&self) -> bool {
        matches!(self.get(), Some(at) if at <= Instant::now())
    }

    /// Resolves once the current deadline, as of any point while waiting,
    /// has passed.
    pub async fn wait(&self) {
        let mut rx = self.at.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return std::future::pending().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Deadline").field(&self.get()).finish()
    }
}
