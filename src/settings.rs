use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::storage::{KeyValueStore, SETTINGS_KEY};

/// Which liveness source drives automatic capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoMode {
    /// Capture every `auto_interval_ms`
    Timer,
    /// Capture whenever the player reports a queue change
    OnChange,
}

impl AutoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::OnChange => "on-change",
        }
    }
}

/// Process-wide settings. Treated as an immutable value: every change
/// produces a new `Settings` that is published through [`SettingsHandle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auto_enabled: bool,
    pub auto_mode: AutoMode,
    /// Timer period in milliseconds (> 0)
    pub auto_interval_ms: u64,
    /// Skip auto capture unless the queue gained an item not seen last time
    pub only_new_items: bool,
    /// Upper bound on retained auto snapshots (> 0)
    pub max_autosnapshots: usize,
    pub queue_warn_enabled: bool,
    /// Soft capacity of the live queue (> 1)
    pub queue_max_size: u32,
    /// Warn once this many or fewer slots remain
    pub queue_warn_threshold: u32,
    /// Hosts ask whether to save the current queue before a restore
    pub prompt_manual_before_replace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Snapshot currently mirroring the live queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_snapshot_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_enabled: false,
            auto_mode: AutoMode::Timer,
            auto_interval_ms: 300_000,
            only_new_items: true,
            max_autosnapshots: 15,
            queue_warn_enabled: true,
            queue_max_size: 80,
            queue_warn_threshold: 5,
            prompt_manual_before_replace: true,
            language: None,
            synced_snapshot_id: None,
        }
    }
}

impl Settings {
    /// Replace out-of-range values with their defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Settings::default();
        if self.auto_interval_ms == 0 {
            self.auto_interval_ms = defaults.auto_interval_ms;
        }
        if self.max_autosnapshots == 0 {
            self.max_autosnapshots = defaults.max_autosnapshots;
        }
        if self.queue_max_size <= 1 {
            self.queue_max_size = defaults.queue_max_size;
        }
        self.synced_snapshot_id = self.synced_snapshot_id.filter(|id| !id.is_empty());
        self
    }

    /// Parse a persisted settings record field by field.
    ///
    /// A field with the wrong type or an out-of-range value falls back to
    /// its default without affecting the others. Text that is not TOML at
    /// all yields the defaults.
    pub fn from_toml_lenient(text: &str) -> Self {
        let table: toml::Table = match toml::from_str(text) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Settings record corrupt, using defaults: {}", e);
                return Settings::default();
            }
        };
        let d = Settings::default();

        let auto_mode = match table.get("auto_mode").and_then(|v| v.as_str()) {
            Some("timer") => AutoMode::Timer,
            Some(_) => AutoMode::OnChange,
            None => d.auto_mode,
        };

        Settings {
            auto_enabled: get_bool(&table, "auto_enabled").unwrap_or(d.auto_enabled),
            auto_mode,
            auto_interval_ms: get_int(&table, "auto_interval_ms")
                .filter(|v| *v > 0)
                .map_or(d.auto_interval_ms, |v| v as u64),
            only_new_items: get_bool(&table, "only_new_items").unwrap_or(d.only_new_items),
            max_autosnapshots: get_int(&table, "max_autosnapshots")
                .filter(|v| *v > 0)
                .map_or(d.max_autosnapshots, |v| v as usize),
            queue_warn_enabled: get_bool(&table, "queue_warn_enabled")
                .unwrap_or(d.queue_warn_enabled),
            queue_max_size: get_int(&table, "queue_max_size")
                .filter(|v| *v > 1 && *v <= i64::from(u32::MAX))
                .map_or(d.queue_max_size, |v| v as u32),
            queue_warn_threshold: get_int(&table, "queue_warn_threshold")
                .filter(|v| *v >= 0 && *v <= i64::from(u32::MAX))
                .map_or(d.queue_warn_threshold, |v| v as u32),
            prompt_manual_before_replace: get_bool(&table, "prompt_manual_before_replace")
                .unwrap_or(d.prompt_manual_before_replace),
            language: table
                .get("language")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            synced_snapshot_id: table
                .get("synced_snapshot_id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }

    /// Generate example settings content for documentation
    pub fn example_settings() -> String {
        Settings::default().to_toml().unwrap_or_default()
    }
}

fn get_bool(table: &toml::Table, key: &str) -> Option<bool> {
    table.get(key).and_then(|v| v.as_bool())
}

fn get_int(table: &toml::Table, key: &str) -> Option<i64> {
    let value = table.get(key)?;
    value
        .as_integer()
        .or_else(|| value.as_float().filter(|f| f.is_finite()).map(|f| f.round() as i64))
}

/// Load settings from storage. Missing or unreadable records give defaults.
pub async fn load_settings(store: &dyn KeyValueStore) -> Settings {
    match store.load(SETTINGS_KEY).await {
        Ok(Some(bytes)) => Settings::from_toml_lenient(&String::from_utf8_lossy(&bytes)),
        Ok(None) => Settings::default(),
        Err(e) => {
            tracing::warn!("Could not read settings: {}", e);
            Settings::default()
        }
    }
}

pub async fn save_settings(store: &dyn KeyValueStore, settings: &Settings) -> Result<()> {
    let text = settings.to_toml()?;
    store
        .save(SETTINGS_KEY, text.as_bytes())
        .await
        .context("Failed to write settings")
}

/// Shared accessor for the current settings value.
///
/// Readers take a cheap clone of the latest value; writers publish a new
/// value and persist it.
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Settings>>,
    store: Option<Arc<dyn KeyValueStore>>,
}

impl SettingsHandle {
    /// In-memory handle, nothing is persisted.
    pub fn new(settings: Settings) -> Self {
        let (tx, _) = watch::channel(settings.sanitized());
        Self {
            tx: Arc::new(tx),
            store: None,
        }
    }

    /// Load from `store` and persist every later change back to it.
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let settings = load_settings(store.as_ref()).await;
        let (tx, _) = watch::channel(settings);
        Self {
            tx: Arc::new(tx),
            store: Some(store),
        }
    }

    pub fn get(&self) -> Settings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }

    /// Publish `settings` and persist it. The new value is visible to
    /// readers even if persisting fails. Returns the previous value.
    pub async fn set(&self, settings: Settings) -> Result<Settings> {
        let settings = settings.sanitized();
        let previous = self.tx.send_replace(settings.clone());
        if let Some(store) = &self.store {
            save_settings(store.as_ref(), &settings).await?;
        }
        Ok(previous)
    }

    /// Apply `f` to a copy of the current settings and [`set`](Self::set) it.
    pub async fn update<F>(&self, f: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.get();
        f(&mut next);
        self.set(next.clone()).await?;
        Ok(next)
    }
}
