//! User-facing notifications. Fire-and-forget: a notifier must never block
//! or fail the caller.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Notifier for hosts without a UI: every message goes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => tracing::info!(target: "qsnap::user", "{}", message),
            Severity::Warning => tracing::warn!(target: "qsnap::user", "{}", message),
            Severity::Error => tracing::error!(target: "qsnap::user", "{}", message),
        }
    }
}

/// Keeps every message in memory, for hosts that render notifications
/// later and for tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages().iter().filter(|(s, _)| *s == severity).count()
    }

    pub fn take(&self) -> Vec<(Severity, String)> {
        self.messages
            .lock()
            .map(|mut m| std::mem::take(&mut *m))
            .unwrap_or_default()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((severity, message.to_string()));
        }
    }
}
