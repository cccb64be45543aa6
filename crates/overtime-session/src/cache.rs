//! Local object cache for API entities.
//!
//! One writer at a time mutates the cache through a [`WriteTransaction`];
//! readers take frozen [`Snapshot`]s. A transaction works on a private copy
//! of the committed tables and is swapped in atomically on success, so a
//! snapshot never observes a partial or later write.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, trace, warn};

use crate::error::CacheError;
use crate::types::{Avatar, User, UserAvatar};

/// Broadcast channel capacity for cache updates.
const BROADCAST_CHANNEL_CAPACITY: usize = 256;

/// Kind of a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    User,
    Avatar,
    UserAvatar,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Avatar => write!(f, "avatar"),
            EntityKind::UserAvatar => write!(f, "user_avatar"),
        }
    }
}

/// A cached entity type, keyed by a string id.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    /// A new, empty entity with the given id.
    fn with_id(id: &str) -> Self;

    fn id(&self) -> &str;

    fn table(tables: &Tables) -> &HashMap<String, Self>;

    fn table_mut(tables: &mut Tables) -> &mut HashMap<String, Self>;
}

/// Merge-on-present update from a server payload.
///
/// Implementations only write fields present in `from`; absent fields keep
/// their stored values.
pub trait Merge<R: ?Sized> {
    fn merge(&mut self, from: &R);
}

/// A payload that upserts onto a cached entity.
pub trait Upsert: Sized {
    type Target: Entity + Merge<Self>;

    /// Id of the entity this payload describes.
    fn entity_id(&self) -> &str;

    /// Upsert records nested in this payload. Runs before the payload itself
    /// is merged so that id lookups from the parent resolve.
    fn upsert_related(&self, _txn: &mut WriteTransaction) {}
}

/// The full set of entity tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub(crate) users: HashMap<String, User>,
    #[serde(default)]
    pub(crate) avatars: HashMap<String, Avatar>,
    #[serde(default)]
    pub(crate) user_avatars: HashMap<String, UserAvatar>,
}

impl Tables {
    fn len(&self) -> usize {
        self.users.len() + self.avatars.len() + self.user_avatars.len()
    }

    fn clear(&mut self) {
        self.users.clear();
        self.avatars.clear();
        self.user_avatars.clear();
    }
}

/// An immutable point-in-time view of the cache.
///
/// Cheap to clone and safe to move across tasks.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tables: Arc<Tables>,
}

impl Snapshot {
    /// Look up an entity by id.
    pub fn get<T: Entity>(&self, id: &str) -> Option<&T> {
        T::table(&self.tables).get(id)
    }

    /// All entities of a kind, ordered by id.
    pub fn all<T: Entity>(&self) -> Vec<&T> {
        let mut items: Vec<&T> = T::table(&self.tables).values().collect();
        items.sort_by(|a, b| a.id().cmp(b.id()));
        items
    }

    /// Entities of a kind matching a predicate, ordered by id.
    pub fn filter<T: Entity>(&self, predicate: impl Fn(&T) -> bool) -> Vec<&T> {
        self.all::<T>().into_iter().filter(|e| predicate(e)).collect()
    }

    pub fn count<T: Entity>(&self) -> usize {
        T::table(&self.tables).len()
    }

    /// Total number of entities across all kinds.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mutable working copy handed to the single writer.
pub struct WriteTransaction {
    tables: Tables,
    changed: Vec<(EntityKind, String)>,
    cleared: bool,
}

impl WriteTransaction {
    fn new(tables: Tables) -> Self {
        Self {
            tables,
            changed: Vec::new(),
            cleared: false,
        }
    }

    fn touch(&mut self, kind: EntityKind, id: &str) {
        if !self.changed.iter().any(|(k, i)| *k == kind && i == id) {
            self.changed.push((kind, id.to_string()));
        }
    }

    /// Return the entity with `id`, inserting an empty one if absent.
    pub fn find_or_create<T: Entity>(&mut self, id: &str) -> &mut T {
        self.touch(T::KIND, id);
        T::table_mut(&mut self.tables)
            .entry(id.to_string())
            .or_insert_with(|| {
                trace!(kind = %T::KIND, id = %id, "cache: created entity");
                T::with_id(id)
            })
    }

    /// Find-or-create the payload's entity and merge the payload onto it.
    pub fn upsert<R: Upsert>(&mut self, from: &R) -> &mut R::Target {
        from.upsert_related(self);
        let entity = self.find_or_create::<R::Target>(from.entity_id());
        entity.merge(from);
        entity
    }

    pub fn get<T: Entity>(&self, id: &str) -> Option<&T> {
        T::table(&self.tables).get(id)
    }

    /// Live handle to an existing entity.
    pub fn get_mut<T: Entity>(&mut self, id: &str) -> Option<&mut T> {
        if T::table(&self.tables).contains_key(id) {
            self.touch(T::KIND, id);
        }
        T::table_mut(&mut self.tables).get_mut(id)
    }

    pub fn delete<T: Entity>(&mut self, id: &str) -> Option<T> {
        let removed = T::table_mut(&mut self.tables).remove(id);
        if removed.is_some() {
            self.touch(T::KIND, id);
        }
        removed
    }

    /// Remove every entity of every kind.
    pub fn delete_all(&mut self) {
        self.tables.clear();
        self.changed.clear();
        self.cleared = true;
    }
}

/// Update event for cache subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    /// A transaction committed changes to these entities.
    Committed { changed: Vec<(EntityKind, String)> },
    /// Every entity was removed.
    Cleared,
}

/// Cache of API entities with single-writer transactions.
pub struct ObjectCache {
    committed: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
    updates_tx: broadcast::Sender<CacheUpdate>,
}

impl ObjectCache {
    /// Create a new empty in-memory cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_tables(Tables::default(), None))
    }

    /// Open a file-backed cache, loading existing contents if present.
    ///
    /// Every commit is written to `path` before it becomes visible.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, CacheError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tables = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            Tables::default()
        };

        debug!(path = %path.display(), entities = tables.len(), "opened object cache");
        Ok(Arc::new(Self::with_tables(tables, Some(path))))
    }

    fn with_tables(tables: Tables, path: Option<PathBuf>) -> Self {
        let (updates_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self {
            committed: RwLock::new(Arc::new(tables)),
            writer: Mutex::new(()),
            path,
            updates_tx,
        }
    }

    /// Subscribe to cache updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheUpdate> {
        self.updates_tx.subscribe()
    }

    /// Frozen view of the committed state.
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            tables: Arc::clone(&*self.committed.read().await),
        }
    }

    /// Frozen copy of a single entity.
    pub async fn find_one<T: Entity>(&self, id: &str) -> Option<T> {
        let committed = self.committed.read().await;
        T::table(&**committed).get(id).cloned()
    }

    /// Number of cached entities of a kind.
    pub async fn count<T: Entity>(&self) -> usize {
        let committed = self.committed.read().await;
        T::table(&**committed).len()
    }

    /// Run `f` as the single writer and commit its changes.
    ///
    /// If `f` fails, or the commit cannot be persisted, nothing is committed.
    /// The writer lock is released on every path.
    pub async fn write<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&mut WriteTransaction) -> Result<R, CacheError>,
    {
        let _writer = self.writer.lock().await;

        let base = Arc::clone(&*self.committed.read().await);
        let mut txn = WriteTransaction::new(Tables::clone(&base));

        let result = match f(&mut txn) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "cache write aborted");
                return Err(e);
            }
        };

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &txn.tables).await {
                warn!(path = %path.display(), error = %e, "failed to persist cache");
                return Err(CacheError::Write(e.to_string()));
            }
        }

        let WriteTransaction {
            tables,
            changed,
            cleared,
        } = txn;
        *self.committed.write().await = Arc::new(tables);

        if cleared {
            self.broadcast(CacheUpdate::Cleared);
        }
        if !changed.is_empty() {
            trace!(changed = changed.len(), "cache: committed");
            self.broadcast(CacheUpdate::Committed { changed });
        }

        Ok(result)
    }

    /// Find or create an entity in its own transaction, returning a frozen copy.
    pub async fn find_or_create<T: Entity>(&self, id: &str) -> Result<T, CacheError> {
        self.write(|txn| Ok(txn.find_or_create::<T>(id).clone()))
            .await
    }

    /// Upsert a payload in its own transaction, returning a frozen copy.
    pub async fn upsert<R: Upsert + Sync>(&self, from: &R) -> Result<R::Target, CacheError> {
        self.write(|txn| Ok(txn.upsert(from).clone())).await
    }

    /// Atomically remove every entity.
    pub async fn delete_all(&self) -> Result<(), CacheError> {
        self.write(|txn| {
            txn.delete_all();
            Ok(())
        })
        .await?;
        debug!("cache cleared");
        Ok(())
    }

    fn broadcast(&self, update: CacheUpdate) {
        if self.updates_tx.send(update).is_err() {
            trace!("no subscribers for cache update");
        }
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::with_tables(Tables::default(), None)
    }
}

/// Write tables to `path` via a temporary file and rename.
async fn persist(path: &Path, tables: &Tables) -> Result<(), CacheError> {
    let content = serde_json::to_vec(tables)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AvatarResponse, SparseUserResponse, UserAvatarResponse, UserResponse};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn profile(id: &str) -> SparseUserResponse {
        SparseUserResponse {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_find_or_create_returns_existing() {
        let cache = ObjectCache::new();

        let created = cache.find_or_create::<User>("u1").await.unwrap();
        assert_eq!(created.id, "u1");
        assert_eq!(cache.count::<User>().await, 1);

        cache
            .write(|txn| {
                txn.find_or_create::<User>("u1").username = Some("kd".to_string());
                Ok(())
            })
            .await
            .unwrap();

        let found = cache.find_or_create::<User>("u1").await.unwrap();
        assert_eq!(found.username.as_deref(), Some("kd"));
        assert_eq!(cache.count::<User>().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_find_or_create_yields_one_entity() {
        let cache = ObjectCache::new();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.find_or_create::<User>("same").await })
            })
            .collect();

        for result in futures_util::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap().id, "same");
        }

        assert_eq!(cache.count::<User>().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_frozen() {
        let cache = ObjectCache::new();
        cache.find_or_create::<User>("u1").await.unwrap();

        let before = cache.snapshot().await;

        cache
            .write(|txn| {
                txn.find_or_create::<User>("u1").name = Some("Later".to_string());
                txn.find_or_create::<User>("u2");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(before.count::<User>(), 1);
        assert_eq!(before.get::<User>("u1").unwrap().name, None);

        let after = cache.snapshot().await;
        assert_eq!(after.count::<User>(), 2);
        assert_eq!(after.get::<User>("u1").unwrap().name.as_deref(), Some("Later"));
    }

    #[tokio::test]
    async fn test_failed_transaction_commits_nothing() {
        let cache = ObjectCache::new();

        let result: Result<(), CacheError> = cache
            .write(|txn| {
                txn.find_or_create::<User>("u1");
                Err(CacheError::Write("boom".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(cache.snapshot().await.is_empty());

        // The writer lock was released.
        cache.find_or_create::<User>("u2").await.unwrap();
        assert_eq!(cache.count::<User>().await, 1);
    }

    #[tokio::test]
    async fn test_upsert_merges_on_present() {
        let cache = ObjectCache::new();

        let first = UserResponse {
            profile: SparseUserResponse {
                username: Some("first".to_string()),
                bio: Some("hello".to_string()),
                total_coins: Some(10),
                ..profile("u1")
            },
            phone_verified: Some(true),
            ..Default::default()
        };
        cache.upsert(&first).await.unwrap();

        let second = UserResponse {
            profile: SparseUserResponse {
                username: Some("second".to_string()),
                ..profile("u1")
            },
            ..Default::default()
        };
        let merged = cache.upsert(&second).await.unwrap();

        assert_eq!(merged.username.as_deref(), Some("second"));
        assert_eq!(merged.bio.as_deref(), Some("hello"));
        assert_eq!(merged.total_coins, 10);
        assert!(merged.phone_verified);
        assert_eq!(cache.count::<User>().await, 1);
    }

    #[tokio::test]
    async fn test_avatar_upsert_includes_user_avatars() {
        let cache = ObjectCache::new();

        let avatar = AvatarResponse {
            id: "a1".to_string(),
            name: Some("Hooper".to_string()),
            user_avatars: Some(vec![UserAvatarResponse {
                id: "ua1".to_string(),
                user_id: "u1".to_string(),
                avatar_id: "a1".to_string(),
            }]),
            ..Default::default()
        };
        cache.upsert(&avatar).await.unwrap();

        let snapshot = cache.snapshot().await;
        assert!(snapshot.get::<Avatar>("a1").unwrap().is_unlocked);

        let user_avatar = snapshot.get::<UserAvatar>("ua1").unwrap();
        assert_eq!(
            user_avatar.avatar(&snapshot).unwrap().name.as_deref(),
            Some("Hooper")
        );
    }

    #[tokio::test]
    async fn test_delete_all() {
        let cache = ObjectCache::new();
        let mut updates = cache.subscribe();

        cache.find_or_create::<User>("u1").await.unwrap();
        cache.find_or_create::<Avatar>("a1").await.unwrap();
        cache.delete_all().await.unwrap();

        assert!(cache.snapshot().await.is_empty());

        assert_eq!(
            updates.recv().await.unwrap(),
            CacheUpdate::Committed {
                changed: vec![(EntityKind::User, "u1".to_string())]
            }
        );
        assert_eq!(
            updates.recv().await.unwrap(),
            CacheUpdate::Committed {
                changed: vec![(EntityKind::Avatar, "a1".to_string())]
            }
        );
        assert_eq!(updates.recv().await.unwrap(), CacheUpdate::Cleared);
    }

    #[tokio::test]
    async fn test_delete_single_entity() {
        let cache = ObjectCache::new();
        cache.find_or_create::<User>("u1").await.unwrap();
        cache.find_or_create::<User>("u2").await.unwrap();

        let removed = cache
            .write(|txn| Ok(txn.delete::<User>("u1")))
            .await
            .unwrap();
        assert!(removed.is_some());
        assert!(cache.find_one::<User>("u1").await.is_none());
        assert!(cache.find_one::<User>("u2").await.is_some());
    }

    #[tokio::test]
    async fn test_file_backed_cache_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache").join("objects.json");

        let cache = ObjectCache::open(&path).await.unwrap();
        cache
            .write(|txn| {
                txn.find_or_create::<User>("u1").username = Some("kd".to_string());
                Ok(())
            })
            .await
            .unwrap();

        let reopened = ObjectCache::open(&path).await.unwrap();
        let user = reopened.find_one::<User>("u1").await.unwrap();
        assert_eq!(user.username.as_deref(), Some("kd"));
    }

    #[tokio::test]
    async fn test_persist_failure_discards_commit() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("cache");
        let cache = ObjectCache::open(dir.join("objects.json")).await.unwrap();

        std::fs::remove_dir_all(&dir).unwrap();

        let result = cache.find_or_create::<User>("u1").await;
        assert!(matches!(result, Err(CacheError::Write(_))));
        assert_eq!(cache.count::<User>().await, 0);
    }
}
