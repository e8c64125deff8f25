//! Key-value storage of member stories, keyed by member id.
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway::types::UserId;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoryError;

#[async_trait]
pub trait StoryStore: Send + Sync + 'static {
    async fn load(&self, member: UserId) -> Result<Option<String>, StoryError>;
    async fn save(&self, member: UserId, story: &str) -> Result<(), StoryError>;
}

/// In-memory story storage for development and testing.
///
/// All data is lost on restart.
#[derive(Default)]
pub struct MemoryStoryStore {
    stories: RwLock<HashMap<UserId, String>>,
}

impl MemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoryStore for MemoryStoryStore {
    async fn load(&self, member: UserId) -> Result<Option<String>, StoryError> {
        Ok(self.stories.read().await.get(&member).cloned())
    }

    async fn save(&self, member: UserId, story: &str) -> Result<(), StoryError> {
        self.stories.write().await.insert(member, story.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStory {
    story: String,
    saved_at: DateTime<Utc>,
}

/// Stories persisted as one JSON object keyed by member id.
///
/// The whole file is rewritten on every save, through a temporary file
/// renamed over the original.
pub struct JsonFileStoryStore {
    path: PathBuf,
    stories: Mutex<BTreeMap<String, StoredStory>>,
}

impl JsonFileStoryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoryError> {
        let path = path.as_ref().to_path_buf();
        let stories = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Loaded {} stories from {}", stories.len(), path.display());
        Ok(Self {
            path,
            stories: Mutex::new(stories),
        })
    }

    async fn persist(&self, stories: &BTreeMap<String, StoredStory>) -> Result<(), StoryError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, serde_json::to_vec_pretty(stories)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StoryStore for JsonFileStoryStore {
    async fn load(&self, member: UserId) -> Result<Option<String>, StoryError> {
        Ok(self
            .stories
            .lock()
            .await
            .get(&member.to_string())
            .map(|stored| stored.story.clone()))
    }

    async fn save(&self, member: UserId, story: &str) -> Result<(), StoryError> {
        let mut stories = self.stories.lock().await;
        let mut updated = stories.clone();
        updated.insert(
            member.to_string(),
            StoredStory {
                story: story.to_string(),
                saved_at: Utc::now(),
            },
        );
        self.persist(&updated).await?;
        *stories = updated;
        debug!("Saved story for member {member}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("citygate-{}-{name}.json", std::process::id()))
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStoryStore::new();
        assert_eq!(store.load(UserId(1)).await.unwrap(), None);
        store.save(UserId(1), "came in from the rain").await.unwrap();
        assert_eq!(
            store.load(UserId(1)).await.unwrap().as_deref(),
            Some("came in from the rain")
        );
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let path = scratch_path("reopen");
        let _ = tokio::fs::remove_file(&path).await;

        let store = JsonFileStoryStore::open(&path).await.unwrap();
        store.save(UserId(42), "first story").await.unwrap();
        store.save(UserId(42), "second story").await.unwrap();
        drop(store);

        let reopened = JsonFileStoryStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.load(UserId(42)).await.unwrap().as_deref(),
            Some("second story")
        );
        assert_eq!(reopened.load(UserId(7)).await.unwrap(), None);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn failed_write_leaves_no_story_behind() {
        let path = std::env::temp_dir()
            .join(format!("citygate-missing-{}", std::process::id()))
            .join("stories.json");

        let store = JsonFileStoryStore::open(&path).await.unwrap();
        assert!(matches!(
            store.save(UserId(42), "never written").await,
            Err(StoryError::Io(_))
        ));
        assert_eq!(store.load(UserId(42)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = scratch_path("corrupt");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = JsonFileStoryStore::open(&path).await;
        assert!(matches!(result, Err(StoryError::Json(_))));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
