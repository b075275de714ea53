use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::types::{FeedError, StoreError, StoreState, Subscription};

// ============================================================================
// Store
// ============================================================================

/// Durable custodian of subscriptions and per-feed error records.
///
/// Reads take a shared lock; every mutation takes the exclusive lock, applies
/// the change to a copy of the state, writes that copy to disk and only then
/// commits it. Readers therefore never see a state that is not yet on disk,
/// and a failed write leaves both memory and disk untouched.
///
/// Cloning a `Store` is cheap and yields a handle to the same state.
#[derive(Clone)]
pub struct Store {
    state: Arc<RwLock<StoreState>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Opens the store backed by the JSON snapshot at `path`.
    ///
    /// - Missing file → empty store (the file is created on first write)
    /// - Empty or whitespace-only file → empty store
    /// - Malformed JSON → [`StoreError::CorruptStore`]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => {
                tracing::debug!(path = %path.display(), "Store file is empty, starting fresh");
                StoreState::default()
            }
            Ok(bytes) => serde_json::from_slice::<StoreState>(&bytes).map_err(|source| {
                StoreError::CorruptStore {
                    path: path.display().to_string(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No store file found, starting fresh");
                StoreState::default()
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        tracing::info!(
            path = %path.display(),
            subscriptions = state.subscription_count(),
            feed_errors = state.feed_errors.len(),
            "Loaded store"
        );

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            path: Some(path),
        })
    }

    /// A store that lives only in memory; mutations are never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            path: None,
        }
    }

    /// Path of the backing snapshot file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// Adds a subscription, stamping `last_checked` with the current time.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadySubscribed`] when the user already follows `sub.feed_url`.
    pub async fn add(&self, mut sub: Subscription) -> Result<(), StoreError> {
        self.mutate(move |state| {
            let user_subs = state.subscriptions.entry(sub.user_id).or_default();
            if user_subs.contains_key(&sub.feed_url) {
                return Err(StoreError::AlreadySubscribed);
            }
            sub.last_checked = Utc::now();
            user_subs.insert(sub.feed_url.clone(), sub);
            Ok(true)
        })
        .await
    }

    /// Removes a subscription. Removing an absent subscription is not an error.
    ///
    /// A user whose last subscription is removed disappears from the store.
    pub async fn remove(&self, user_id: i64, feed_url: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            let Some(user_subs) = state.subscriptions.get_mut(&user_id) else {
                return Ok(false);
            };
            let removed = user_subs.remove(feed_url).is_some();
            if user_subs.is_empty() {
                state.subscriptions.remove(&user_id);
            }
            Ok(removed)
        })
        .await
    }

    /// All subscriptions of one user, in unspecified order.
    pub async fn user_subscriptions(&self, user_id: i64) -> Vec<Subscription> {
        let state = self.state.read().await;
        state
            .subscriptions
            .get(&user_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every subscription in the store, in unspecified order.
    pub async fn all_subscriptions(&self) -> Vec<Subscription> {
        let state = self.state.read().await;
        state
            .subscriptions
            .values()
            .flat_map(|subs| subs.values().cloned())
            .collect()
    }

    /// Records a successful poll: sets `last_checked` to now and the watermark to `guid`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the subscription was removed in the meantime.
    pub async fn update_last_checked(
        &self,
        user_id: i64,
        feed_url: &str,
        guid: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            let sub = state
                .subscriptions
                .get_mut(&user_id)
                .and_then(|subs| subs.get_mut(feed_url))
                .ok_or(StoreError::NotFound)?;
            sub.last_checked = Utc::now();
            sub.last_item_guid = guid.to_owned();
            Ok(true)
        })
        .await
    }

    // ========================================================================
    // Feed Error Operations
    // ========================================================================

    /// Creates or updates the failure record for `feed_url`.
    pub async fn record_feed_error(&self, feed_url: &str, message: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            let now = Utc::now();
            let entry = state
                .feed_errors
                .entry(feed_url.to_owned())
                .or_insert_with(|| FeedError {
                    feed_url: feed_url.to_owned(),
                    error_count: 0,
                    last_error: String::new(),
                    last_error_at: now,
                    first_error_at: now,
                });
            entry.error_count = entry.error_count.saturating_add(1);
            entry.last_error = message.to_owned();
            entry.last_error_at = now;
            Ok(true)
        })
        .await
    }

    /// Drops the failure record for `feed_url`, if any.
    pub async fn clear_feed_error(&self, feed_url: &str) -> Result<(), StoreError> {
        self.mutate(|state| Ok(state.feed_errors.remove(feed_url).is_some()))
            .await
    }

    /// Current failure record for `feed_url`, if its latest fetch failed.
    pub async fn feed_error(&self, feed_url: &str) -> Option<FeedError> {
        self.state.read().await.feed_errors.get(feed_url).cloned()
    }

    /// A copy of the full state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Applies `f` to a copy of the state under the write lock.
    ///
    /// `f` returns whether it changed anything; unchanged states skip the
    /// disk write. The copy replaces the live state only after it has been
    /// persisted.
    async fn mutate<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<bool, StoreError>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        if !f(&mut next)? {
            return Ok(());
        }
        if let Some(path) = &self.path {
            write_snapshot(path, &next).await?;
        }
        *guard = next;
        Ok(())
    }
}

/// Writes the state next to `path` and atomically renames it into place.
///
/// A crash at any point leaves either the previous or the new snapshot on
/// disk, never a partially written one.
async fn write_snapshot(path: &Path, state: &StoreState) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(StoreError::Serialize)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Clock-derived temp name; create_new refuses to reuse or follow an existing file.
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_owned());
    let temp_path = path.with_file_name(format!(".{}.tmp.{:016x}", file_name, suffix));

    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(windows)]
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await?;
        }

        tokio::fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&temp_path).await;
        tracing::warn!(path = %path.display(), error = %e, "Failed to persist store");
        return Err(StoreError::Io(e));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FeedInfo;
    use pretty_assertions::assert_eq;

    fn sub(user_id: i64, url: &str) -> Subscription {
        Subscription::new(user_id, user_id * 10, url, FeedInfo::new("Feed", "", ""))
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate() {
        let store = Store::in_memory();
        store.add(sub(1, "https://a.com/rss")).await.unwrap();
        let err = store.add(sub(1, "https://a.com/rss")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadySubscribed));
        assert_eq!(store.user_subscriptions(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_feed_for_two_users() {
        let store = Store::in_memory();
        store.add(sub(1, "https://a.com/rss")).await.unwrap();
        store.add(sub(2, "https://a.com/rss")).await.unwrap();
        assert_eq!(store.all_subscriptions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_last_subscription_drops_user_bucket() {
        let store = Store::in_memory();
        store.add(sub(1, "https://a.com/rss")).await.unwrap();
        store.remove(1, "https://a.com/rss").await.unwrap();

        assert!(store.user_subscriptions(1).await.is_empty());
        assert!(store.snapshot().await.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn test_remove_absent_is_ok() {
        let store = Store::in_memory();
        store.remove(7, "https://nowhere.com/rss").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_last_checked_missing_is_not_found() {
        let store = Store::in_memory();
        let err = store
            .update_last_checked(1, "https://a.com/rss", "guid")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_update_last_checked_sets_guid() {
        let store = Store::in_memory();
        store.add(sub(1, "https://a.com/rss")).await.unwrap();
        store
            .update_last_checked(1, "https://a.com/rss", "item-7")
            .await
            .unwrap();
        let subs = store.user_subscriptions(1).await;
        assert_eq!(subs[0].last_item_guid, "item-7");
    }

    #[tokio::test]
    async fn test_feed_error_counts_and_clears() {
        let store = Store::in_memory();
        store.record_feed_error("https://a.com/rss", "boom").await.unwrap();
        let first = store.feed_error("https://a.com/rss").await.unwrap();
        store.record_feed_error("https://a.com/rss", "bang").await.unwrap();
        let second = store.feed_error("https://a.com/rss").await.unwrap();

        assert_eq!(first.error_count, 1);
        assert_eq!(second.error_count, 2);
        assert_eq!(second.last_error, "bang");
        assert_eq!(second.first_error_at, first.first_error_at);

        store.clear_feed_error("https://a.com/rss").await.unwrap();
        assert!(store.feed_error("https://a.com/rss").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes the rename fail.
        let path = dir.path().join("db.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), b"x").unwrap();

        let store = Store {
            state: Arc::new(RwLock::new(StoreState::default())),
            path: Some(path),
        };
        assert!(store.add(sub(1, "https://a.com/rss")).await.is_err());
        assert!(store.all_subscriptions().await.is_empty());
    }
}
