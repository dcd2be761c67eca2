//! Liveness sources: player notifications and the capture timer.
//!
//! Both hand work to a background task that runs one handler invocation
//! at a time. Cancelling either is idempotent, and once it returns the
//! handler is never invoked again. An invocation already in progress is
//! allowed to finish.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{EngineError, EngineResult};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications the core relies on. Anything else the player reports is
/// dropped at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Something about the live queue changed; re-read it.
    QueueChanged,
    /// Elapsed milliseconds into the current item.
    PlaybackProgress(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    QueueChanged,
    PlaybackProgress,
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::QueueChanged => EventKind::QueueChanged,
            Self::PlaybackProgress(_) => EventKind::PlaybackProgress,
        }
    }
}

/// Player-side notification source.
pub trait EventSource: Send + Sync {
    /// A fresh receiver for all notifications.
    fn subscribe(&self) -> EngineResult<broadcast::Receiver<QueueEvent>>;
}

/// Broadcast-channel event source. Hosts push player notifications into
/// it; every coordinator gets its own receiver.
pub struct BroadcastEvents {
    tx: broadcast::Sender<QueueEvent>,
    available: AtomicBool,
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            available: AtomicBool::new(true),
        }
    }

    /// Mark the player's notification API as (un)available.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn publish(&self, event: QueueEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.tx.send(event);
    }

    pub fn queue_changed(&self) {
        self.publish(QueueEvent::QueueChanged);
    }

    pub fn progress(&self, ms: u64) {
        self.publish(QueueEvent::PlaybackProgress(ms));
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSource for BroadcastEvents {
    fn subscribe(&self) -> EngineResult<broadcast::Receiver<QueueEvent>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineError::EventsUnavailable);
        }
        Ok(self.tx.subscribe())
    }
}

/// Shared stop signal for a background task.
struct Cancel {
    alive: AtomicBool,
    notify: Notify,
}

impl Cancel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            notify: Notify::new(),
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            // notify_one stores a permit, so a task not yet waiting still wakes
            self.notify.notify_one();
        }
    }
}

/// A live handler registration for one kind of [`QueueEvent`].
pub struct Subscription {
    cancel: Arc<Cancel>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Subscribe `handler` to events of `kind`.
    ///
    /// Missed queue-change notifications (receiver lag) are coalesced into
    /// a single invocation; missed progress values are skipped.
    pub fn spawn<F, Fut>(
        source: &dyn EventSource,
        kind: EventKind,
        handler: F,
    ) -> EngineResult<Self>
    where
        F: Fn(QueueEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = source.subscribe()?;
        let cancel = Cancel::new();
        let flag = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = flag.notify.notified() => break,
                    r = rx.recv() => r,
                };
                let event = match received {
                    Ok(event) if event.kind() == kind => event,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, ?kind, "Event receiver lagged");
                        if kind != EventKind::QueueChanged {
                            continue;
                        }
                        QueueEvent::QueueChanged
                    }
                    Err(RecvError::Closed) => break,
                };
                if !flag.is_alive() {
                    break;
                }
                handler(event).await;
            }
        });
        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_alive()
    }

    /// Stop delivering events. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Runs a callback every `period`, first firing one period after start.
pub struct PeriodicTimer {
    period: Duration,
    cancel: Arc<Cancel>,
    task: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn start<F, Fut>(period: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = Cancel::new();
        let flag = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = flag.notify.notified() => break,
                    _ = ticker.tick() => {}
                }
                // A tick that raced with stop() must not fire.
                if !flag.is_alive() {
                    break;
                }
                callback().await;
            }
        });
        Self {
            period,
            cancel,
            task: Some(task),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_alive()
    }

    /// Safe to call any number of times.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
