//! Named, replaceable one-shot timers keyed by session ID.
//!
//! Used to bound the launching/connecting phases: a timer is armed when a
//! session is provisioned and cleared when its agent arrives. Expiry runs the
//! caller's handler (which fails the session) and forgets the timer.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::debug;
use tokio::task::JoinHandle;

/// A set of pending one-shot timers.
#[derive(Default)]
pub struct ConnectionTimeouts {
    timers: Arc<DashMap<String, ArmedTimer>>,
    generation: AtomicU64,
}

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl ConnectionTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for a session, cancelling and replacing any existing one.
    pub fn set<F, Fut>(&self, session_id: &str, duration: Duration, on_expire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let key = session_id.to_string();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // A replacement may have been armed since; only the entry this
            // task created gets removed.
            timers.remove_if(&task_key, |_, timer| timer.generation == generation);
            debug!("Connection timeout fired for session {}", task_key);
            on_expire().await;
        });
        if let Some(previous) = self.timers.insert(key, ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel a session's timer, if armed.
    pub fn clear(&self, session_id: &str) {
        if let Some((_, timer)) = self.timers.remove(session_id) {
            timer.handle.abort();
            debug!("Cleared connection timeout for session {}", session_id);
        }
    }

    /// Whether a timer is currently armed for the session.
    pub fn has(&self, session_id: &str) -> bool {
        self.timers.contains_key(session_id)
    }

    /// Cancel every pending timer (process exit).
    pub fn clear_all(&self) {
        let keys: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.clear(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let timeouts = ConnectionTimeouts::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        timeouts.set("s1", Duration::from_secs(5), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timeouts.has("s1"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timeouts.has("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels() {
        let timeouts = ConnectionTimeouts::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        timeouts.set("s1", Duration::from_secs(5), move || async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        timeouts.clear("s1");
        assert!(!timeouts.has("s1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_replaces_previous() {
        let timeouts = ConnectionTimeouts::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_clone = Arc::clone(&first);
        timeouts.set("s1", Duration::from_secs(5), move || async move {
            first_clone.fetch_add(1, Ordering::SeqCst);
        });
        let second_clone = Arc::clone(&second);
        timeouts.set("s1", Duration::from_secs(8), move || async move {
            second_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
