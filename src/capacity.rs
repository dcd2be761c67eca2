//! Soft capacity warning for the live queue.
//!
//! Only growth is reacted to, so draining a nearly full queue stays quiet.
//! A warning for a given number of remaining slots is repeated at most once
//! per cooldown window; a different remaining count warns immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::events::{EventKind, EventSource, Subscription};
use crate::notify::{Notifier, Severity};
use crate::queue::QueueReader;
use crate::settings::SettingsHandle;

pub const WARN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Default)]
struct WarnState {
    /// Queue length the last check reacted to
    last_reported_size: Option<usize>,
    /// Remaining slots of the last warning, and when it was shown
    last_warning: Option<(usize, Instant)>,
}

struct CapacityInner {
    settings: SettingsHandle,
    queue: Arc<dyn QueueReader>,
    notifier: Arc<dyn Notifier>,
    state: AsyncMutex<WarnState>,
}

pub struct CapacityWatcher {
    inner: Arc<CapacityInner>,
    events: Arc<dyn EventSource>,
    subscription: Mutex<Option<Subscription>>,
}

impl CapacityWatcher {
    pub fn new(
        settings: SettingsHandle,
        queue: Arc<dyn QueueReader>,
        events: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(CapacityInner {
                settings,
                queue,
                notifier,
                state: AsyncMutex::new(WarnState::default()),
            }),
            events,
            subscription: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.subscription
            .lock()
            .map(|s| s.as_ref().is_some_and(Subscription::is_active))
            .unwrap_or(false)
    }

    /// Subscribe to queue changes and check once right away.
    pub async fn start(&self) {
        self.stop().await;
        let inner = self.inner.clone();
        let result = Subscription::spawn(self.events.as_ref(), EventKind::QueueChanged, move |_| {
            let inner = inner.clone();
            async move {
                inner.check_and_warn_once().await;
            }
        });
        match result {
            Ok(sub) => self.set_subscription(Some(sub)),
            Err(e) => {
                tracing::error!("Failed to start capacity watcher: {}", e);
                self.inner
                    .notifier
                    .notify("Failed to start queue capacity watcher", Severity::Error);
                return;
            }
        }
        self.inner.check_and_warn_once().await;
    }

    /// Unsubscribe and forget the last reacted length.
    pub async fn stop(&self) {
        self.set_subscription(None);
        self.inner.state.lock().await.last_reported_size = None;
    }

    /// Returns true if a warning was emitted.
    pub async fn check_and_warn_once(&self) -> bool {
        self.inner.check_and_warn_once().await
    }

    fn set_subscription(&self, next: Option<Subscription>) {
        let old = match self.subscription.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(e) => std::mem::replace(&mut *e.into_inner(), next),
        };
        if let Some(mut sub) = old {
            sub.unsubscribe();
        }
    }
}

impl Drop for CapacityWatcher {
    fn drop(&mut self) {
        self.set_subscription(None);
    }
}

impl CapacityInner {
    async fn check_and_warn_once(&self) -> bool {
        let settings = self.settings.get();
        if !settings.queue_warn_enabled || settings.queue_max_size <= 1 {
            return false;
        }
        let max = settings.queue_max_size as usize;
        let threshold = settings.queue_warn_threshold as usize;

        let size = match self.queue.read_queue().await {
            Ok(items) => items.len(),
            Err(e) => {
                tracing::warn!("Queue capacity check failed: {:#}", e);
                return false;
            }
        };

        let mut state = self.state.lock().await;
        if state.last_reported_size.is_some_and(|last| size <= last) {
            return false;
        }
        state.last_reported_size = Some(size);
        if size == 0 {
            return false;
        }

        let remaining = max.saturating_sub(size);
        if remaining > threshold {
            return false;
        }
        let now = Instant::now();
        let suppressed = matches!(
            state.last_warning,
            Some((last_remaining, at)) if last_remaining == remaining && now.duration_since(at) < WARN_COOLDOWN
        );
        if suppressed {
            tracing::debug!(remaining, "Capacity warning suppressed by cooldown");
            return false;
        }

        let used = max - remaining;
        tracing::info!(used, max, remaining, "Queue nearly full");
        self.notifier.notify(
            &format!("Queue is nearly full ({used}/{max})"),
            Severity::Warning,
        );
        state.last_warning = Some((remaining, now));
        true
    }
}
