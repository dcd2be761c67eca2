use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

const SYNCED_DEFAULT_NAME: &str = "My Jam";

/// Retention category of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    /// Captured without user action; subject to bounded retention.
    Auto,
    Manual,
    /// Live mirror target for the current queue.
    Synced,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Synced => "synced",
        }
    }
}

impl std::fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, timestamped, ordered list of queue item URIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    /// Capture time, epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: SnapshotType,
    #[serde(default)]
    pub items: Vec<String>,
    /// Elapsed milliseconds into the first item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_position: Option<u64>,
}

impl Snapshot {
    /// New unnamed snapshot stamped with the current time.
    pub fn new(kind: SnapshotType, items: Vec<String>) -> Self {
        Self {
            id: crate::queue::generate_id(),
            created_at: chrono::Utc::now().timestamp_millis(),
            name: None,
            kind,
            items,
            playback_position: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = normalize_name(Some(name.into()));
        self
    }

    pub fn is_auto(&self) -> bool {
        self.kind == SnapshotType::Auto
    }

    /// Name derived from the category and capture time.
    pub fn generated_name(&self) -> String {
        match self.kind {
            SnapshotType::Synced => SYNCED_DEFAULT_NAME.to_string(),
            SnapshotType::Auto => format!("Auto {}", format_timestamp(self.created_at)),
            SnapshotType::Manual => format!("Manual {}", format_timestamp(self.created_at)),
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.generated_name())
    }
}

/// Trimmed user label, `None` if nothing is left.
pub fn normalize_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

fn format_timestamp(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_json_field_names() {
        let snap = Snapshot {
            id: "1-abc".to_string(),
            created_at: 1_700_000_000_000,
            name: None,
            kind: SnapshotType::Auto,
            items: vec!["spotify:track:1".to_string()],
            playback_position: Some(1500),
        };
        let json = serde_json::to_string(&snap).unwrap();

        assert!(json.contains("\"createdAt\":1700000000000"));
        assert!(json.contains("\"type\":\"auto\""));
        assert!(json.contains("\"playbackPosition\":1500"));
        assert!(!json.contains("\"name\""));
    }

    #[test]
    fn test_snapshot_missing_optional_fields() {
        let json = r#"{"id":"x","createdAt":5,"type":"manual"}"#;
        let snap: Snapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snap.kind, SnapshotType::Manual);
        assert!(snap.items.is_empty());
        assert!(snap.name.is_none());
        assert!(snap.playback_position.is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"id":"x","createdAt":5,"type":"weird","items":[]}"#;
        assert!(serde_json::from_str::<Snapshot>(json).is_err());
    }

    #[test]
    fn test_generated_names() {
        let mut snap = Snapshot::new(SnapshotType::Synced, vec![]);
        assert_eq!(snap.generated_name(), "My Jam");

        snap.kind = SnapshotType::Auto;
        assert!(snap.generated_name().starts_with("Auto "));

        snap.kind = SnapshotType::Manual;
        assert!(snap.generated_name().starts_with("Manual "));
    }

    #[test]
    fn test_display_name_prefers_label() {
        let snap = Snapshot::new(SnapshotType::Manual, vec![]).with_name("  Road trip ");
        assert_eq!(snap.display_name(), "Road trip");

        let blank = Snapshot::new(SnapshotType::Manual, vec![]).with_name("   ");
        assert!(blank.name.is_none());
        assert!(blank.display_name().starts_with("Manual "));
    }
}
