// Copyright 2025 The Tenama Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One-shot expiration timers, at most one per namespace.
//!
//! Each scheduled entry spawns a task that races its deadline against a
//! per-entry cancellation token. The entry is removed from the index only
//! after its callback has finished, so `active_count` never undercounts
//! work still in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct TimerEntry {
    id: u64,
    fires_at: Instant,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<String, TimerEntry>>,
    next_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TimerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules a single expiration callback per namespace.
///
/// Cloning yields another handle to the same timer index.
#[derive(Clone, Default)]
pub struct ExpirationScheduler {
    inner: Arc<Inner>,
}

impl ExpirationScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run once at `fires_at`, replacing any timer
    /// already installed for `name`.
    ///
    /// A deadline at or before now runs the callback immediately on a fresh
    /// task without recording an entry. The callback runs without any
    /// scheduler lock held; its entry is removed after it returns.
    pub fn schedule<F, Fut>(&self, name: &str, fires_at: Instant, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if fires_at <= Instant::now() {
            if let Some(previous) = self.inner.lock().remove(name) {
                previous.token.cancel();
            }
            debug!(namespace = %name, "deadline already passed, running callback now");
            tokio::spawn(callback());
            return;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            let mut entries = self.inner.lock();
            if let Some(previous) = entries.insert(
                name.to_string(),
                TimerEntry {
                    id,
                    fires_at,
                    token: token.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(fires_at) => {
                    callback().await;
                    // Remove only our own entry; a replacement scheduled
                    // while the callback ran must survive.
                    let mut entries = inner.lock();
                    if entries.get(&name).map(|e| e.id) == Some(id) {
                        entries.remove(&name);
                    }
                }
            }
        });
    }

    /// Cancels the timer for `name`, if one exists. Idempotent.
    pub fn cancel(&self, name: &str) {
        if let Some(entry) = self.inner.lock().remove(name) {
            entry.token.cancel();
            debug!(namespace = %name, "cancelled expiration timer");
        }
    }

    /// Cancels every timer and clears the index.
    pub fn stop_all(&self) {
        let mut entries = self.inner.lock();
        for (_, entry) in entries.drain() {
            entry.token.cancel();
        }
    }

    /// Number of pending timers.
    pub fn active_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Deadline of the timer for `name`, if one is pending.
    pub fn deadline(&self, name: &str) -> Option<Instant> {
        self.inner.lock().get(name).map(|e| e.fires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        (fired, move || Arc::clone(&handle))
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_and_clears_entry() {
        let scheduler = ExpirationScheduler::new();
        let (fired, clone_fired) = counter();

        let hit = clone_fired();
        scheduler.schedule("ns", Instant::now() + Duration::from_secs(5), move || async move {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_count(), 0);

        // Nothing left to fire.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_runs_immediately_without_entry() {
        let scheduler = ExpirationScheduler::new();
        let (fired, clone_fired) = counter();

        let hit = clone_fired();
        scheduler.schedule("ns", Instant::now(), move || async move {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_previous_timer() {
        let scheduler = ExpirationScheduler::new();
        let (first_fired, clone_first) = counter();
        let (second_fired, clone_second) = counter();

        let hit = clone_first();
        scheduler.schedule("ns", Instant::now() + Duration::from_secs(5), move || async move {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        let hit = clone_second();
        scheduler.schedule("ns", Instant::now() + Duration::from_secs(10), move || async move {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first_fired.load(Ordering::SeqCst), 0);
        assert_eq!(second_fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_stops_callback() {
        let scheduler = ExpirationScheduler::new();
        let (fired, clone_fired) = counter();

        let hit = clone_fired();
        scheduler.schedule("ns", Instant::now() + Duration::from_secs(5), move || async move {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel("ns");
        scheduler.cancel("ns");
        assert_eq!(scheduler.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_leaves_no_timers_and_no_late_callbacks() {
        let scheduler = ExpirationScheduler::new();
        let (fired, clone_fired) = counter();

        for name in ["a", "b", "c"] {
            let hit = clone_fired();
            scheduler.schedule(name, Instant::now() + Duration::from_secs(5), move || async move {
                hit.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.active_count(), 3);

        scheduler.stop_all();
        assert_eq!(scheduler.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_reports_pending_timer() {
        let scheduler = ExpirationScheduler::new();
        let fires_at = Instant::now() + Duration::from_secs(30);
        scheduler.schedule("ns", fires_at, || async {});
        assert_eq!(scheduler.deadline("ns"), Some(fires_at));
        assert_eq!(scheduler.deadline("other"), None);
    }
}
