//! Local-file persistence for change-stream resume tokens.
//!
//! Follows the same shape as a `CheckpointStore` trait (load/save behind a
//! simple async interface) but backed by a local file rather than a Mongo
//! collection, with the save throttled under a mutex guarding the
//! last-written timestamp: skip the write if the interval hasn't elapsed.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mongodb::change_stream::event::ResumeToken;
use tokio::sync::Mutex;

/// Persists and reloads an opaque [`ResumeToken`] blob.
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    /// Best-effort save, throttled to at most once per configured interval.
    /// Drops (does nothing) if the interval hasn't elapsed or another save is
    /// in flight; this is safe because resume tokens are monotonic.
    async fn save(&self, token: &ResumeToken);

    /// Loads the last persisted token, or `None` if none exists or the
    /// stored blob can't be parsed (corruption is treated as absence, not an
    /// error).
    async fn load(&self) -> Option<ResumeToken>;

    /// Drops the stored token, e.g. after the server reports it as expired.
    async fn clear(&self);
}

struct ThrottleState {
    last_save: Instant,
}

/// Persists the resume token as a raw BSON-serialized blob in a single local
/// file.
pub struct FileResumeTokenStore {
    path: PathBuf,
    save_interval: Duration,
    state: Mutex<ThrottleState>,
}

impl FileResumeTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_interval(path, Duration::from_secs(5))
    }

    pub fn with_interval(path: impl Into<PathBuf>, save_interval: Duration) -> Self {
        Self {
            path: path.into(),
            save_interval,
            state: Mutex::new(ThrottleState {
                // Force the first save attempt through regardless of interval.
                last_save: Instant::now() - save_interval,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResumeTokenStore for FileResumeTokenStore {
    async fn save(&self, token: &ResumeToken) {
        let mut state = self.state.lock().await;
        if state.last_save.elapsed() < self.save_interval {
            return;
        }

        let bytes = match bson::to_vec(token) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize resume token, skipping save");
                return;
            }
        };

        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => {
                state.last_save = Instant::now();
                tracing::debug!(path = %self.path.display(), "checkpointed resume token");
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to persist resume token");
            }
        }
    }

    async fn load(&self) -> Option<ResumeToken> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to read resume token file");
                return None;
            }
        };

        match bson::from_slice::<ResumeToken>(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(error = %e, "resume token file is corrupt, starting without a checkpoint");
                None
            }
        }
    }

    async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "failed to clear resume token file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;
    use tempfile::tempdir;

    fn sample_token() -> ResumeToken {
        bson::from_bson::<ResumeToken>(Bson::Document(mongodb::bson::doc! { "_data": "8201" }))
            .unwrap()
    }

    #[tokio::test]
    async fn round_trips_through_the_file() {
        let dir = tempdir().unwrap();
        let store = FileResumeTokenStore::with_interval(dir.path().join("resume_token.bin"), Duration::ZERO);

        assert!(store.load().await.is_none());

        let token = sample_token();
        store.save(&token).await;

        let loaded = store.load().await.expect("token should round-trip");
        assert_eq!(bson::to_vec(&loaded).unwrap(), bson::to_vec(&token).unwrap());
    }

    #[tokio::test]
    async fn throttles_saves_within_the_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_token.bin");
        let store = FileResumeTokenStore::with_interval(&path, Duration::from_secs(60));

        store.save(&sample_token()).await;
        assert!(path.exists());

        tokio::fs::remove_file(&path).await.unwrap();
        // Second save within the interval should be dropped, not re-written.
        store.save(&sample_token()).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_treated_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_token.bin");
        tokio::fs::write(&path, b"not bson").await.unwrap();

        let store = FileResumeTokenStore::new(&path);
        assert!(store.load().await.is_none());
    }
}
