//! Live queue access and the sequence helpers every coordinator shares.
//!
//! The live queue is owned by the player host. The core only ever sees it
//! as an ordered list of track/episode URIs, current track first.

use anyhow::Result;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;

const ID_SUFFIX_LEN: usize = 6;

/// Read access to the player's live queue.
#[async_trait]
pub trait QueueReader: Send + Sync {
    /// Current track (if any) followed by the items queued next.
    ///
    /// Implementations must drop immediately-repeated identical entries;
    /// [`dedupe_consecutive`] does this.
    async fn read_queue(&self) -> Result<Vec<String>>;

    /// Elapsed playback time of the current item in milliseconds.
    async fn progress_ms(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Mutations used when a snapshot is pushed back into the player.
#[async_trait]
pub trait QueueWriter: Send + Sync {
    async fn clear_queue(&self) -> Result<()>;

    /// Start playback of a single item, replacing the current track.
    async fn play(&self, uri: &str) -> Result<()>;

    /// Append items behind whatever is already queued.
    async fn enqueue(&self, uris: &[String]) -> Result<()>;
}

/// Order-sensitive equality of two queues.
pub fn queues_equal(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}

/// Remove empty entries and immediately-repeated identical entries. An
/// empty entry still separates two equal neighbours.
pub fn dedupe_consecutive<I, S>(uris: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    let mut prev: Option<String> = None;
    for uri in uris {
        let uri = uri.into();
        let repeated = prev.as_deref() == Some(uri.as_str());
        prev = Some(uri.clone());
        if !uri.is_empty() && !repeated {
            out.push(uri);
        }
    }
    out
}

/// New opaque snapshot id: `<epoch-ms>-<random suffix>`.
pub fn generate_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_queues_equal_is_order_sensitive() {
        assert!(!queues_equal(&q(&["a", "b"]), &q(&["b", "a"])));
        assert!(queues_equal(&q(&["a", "b"]), &q(&["a", "b"])));
    }

    #[test]
    fn test_queues_equal_length_mismatch() {
        assert!(!queues_equal(&q(&["a"]), &q(&["a", "a"])));
        assert!(queues_equal(&[], &[]));
    }

    #[test]
    fn test_dedupe_consecutive() {
        let out = dedupe_consecutive(["a", "a", "b", "b", "", "a"]);
        assert_eq!(out, q(&["a", "b", "a"]));
    }

    #[test]
    fn test_dedupe_empty_entry_breaks_a_run() {
        let out = dedupe_consecutive(["a", "", "a", "", "", "b"]);
        assert_eq!(out, q(&["a", "a", "b"]));
    }

    #[test]
    fn test_dedupe_keeps_non_adjacent_repeats() {
        let out = dedupe_consecutive(["x", "y", "x", "y"]);
        assert_eq!(out, q(&["x", "y", "x", "y"]));
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        let (ts, suffix) = id.split_once('-').unwrap();
        assert!(ts.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_generate_id_unique() {
        let ids: std::collections::HashSet<String> = (0..200).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 200);
    }
}
