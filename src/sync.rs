use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time;

use crate::api::RemoteClient;
use crate::cache::RecordCache;
use crate::crypto;
use crate::error::{Result, SyncError};
use crate::logger;
use crate::models::{Group, Record, RecordDraft};
use crate::session::{Session, SessionEpoch};

/// Outcome of a full sync. `undecryptable` lists record ids whose fields did
/// not decrypt with the current key; the caller decides how to present them.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub records: usize,
    pub groups: usize,
    pub undecryptable: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EntityKind {
    Group,
    Record,
}

// One async lock per entity id. Two in-flight mutations of the same record
// are serialized in submission order; mutations of different entities still
// run concurrently.
struct EntityLocks {
    inner: Mutex<HashMap<(EntityKind, i64), Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, kind: EntityKind, id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap();
            map.entry((kind, id))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    fn forget(&self, kind: EntityKind, id: i64) {
        let mut map = self.inner.lock().unwrap();
        map.remove(&(kind, id));
    }
}

/// Orchestrates remote calls, the cipher and the record cache.
///
/// Every mutation is network-first: the cache is only touched after the
/// server acknowledged the change, so the cache never holds a state the
/// server does not know about. The cache is volatile and rebuilt on login;
/// the server is the only durable store.
pub struct SyncRepository<R> {
    remote: R,
    session: Arc<Session>,
    cache: RecordCache,
    locks: EntityLocks,
}

impl<R: RemoteClient> SyncRepository<R> {
    pub fn new(remote: R, session: Arc<Session>, cache: RecordCache) -> Self {
        Self {
            remote,
            session,
            cache,
            locks: EntityLocks::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Authenticate with username and password, then pull the full record
    /// set. The secret key is validated locally before anything goes out.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        secret_key: &str,
    ) -> Result<SyncReport> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(SyncError::Validation(
                "username and password are required".to_string(),
            ));
        }
        crypto::decode_key(secret_key)?;

        let auth = self.remote.login(username, password).await?;
        let epoch =
            self.session
                .set_authenticated(secret_key, auth.user_id, &auth.username, &auth.token);
        logger::log(&format!("sync: signed in as {}", auth.username));
        self.full_sync(epoch).await
    }

    /// Silent login with a previously issued token.
    pub async fn login_with_token(&self, token: &str, secret_key: &str) -> Result<SyncReport> {
        if token.trim().is_empty() {
            return Err(SyncError::Validation("token is required".to_string()));
        }
        crypto::decode_key(secret_key)?;

        let auth = self.remote.login_with_token(token).await?;
        let epoch =
            self.session
                .set_authenticated(secret_key, auth.user_id, &auth.username, &auth.token);
        logger::log(&format!("sync: token login as {}", auth.username));
        self.full_sync(epoch).await
    }

    /// Create an account, then run the login lifecycle.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        secret_key: &str,
    ) -> Result<SyncReport> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(SyncError::Validation(
                "username and password are required".to_string(),
            ));
        }
        crypto::decode_key(secret_key)?;

        let auth = self.remote.register(username, password).await?;
        let epoch =
            self.session
                .set_authenticated(secret_key, auth.user_id, &auth.username, &auth.token);
        logger::log(&format!("sync: registered {}", auth.username));
        self.full_sync(epoch).await
    }

    /// Clear the session and wipe the cache in one logical transaction so no
    /// decrypted data of the previous user stays resident.
    pub async fn logout(&self) -> Result<()> {
        self.session.clear();
        self.cache.replace_all(Vec::new(), &[]).await?;
        self.cache.set_groups(Vec::new()).await?;
        logger::log("sync: signed out, cache wiped");
        Ok(())
    }

    /// Re-fetch everything for the current session.
    pub async fn refresh(&self) -> Result<SyncReport> {
        let epoch = self.ensure_authenticated()?;
        self.full_sync(epoch).await
    }

    async fn full_sync(&self, epoch: SessionEpoch) -> Result<SyncReport> {
        let token = self.session.token();

        let records = self.remote.fetch_records(&token, None).await?;
        self.ensure_current(epoch)?;
        let n_records = records.len();
        let key = self.session.key_bytes()?;
        let undecryptable: Vec<i64> = self
            .cache
            .replace_all(records, &key)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let groups = self.remote.fetch_groups(&token).await?;
        self.ensure_current(epoch)?;
        let n_groups = groups.len();
        self.cache.set_groups(groups).await?;

        Ok(SyncReport {
            records: n_records,
            groups: n_groups,
            undecryptable,
        })
    }

    pub async fn create_group(&self, name: &str, comment: Option<&str>) -> Result<Group> {
        if name.trim().is_empty() {
            return Err(SyncError::Validation("group name is required".to_string()));
        }
        let epoch = self.ensure_authenticated()?;
        let token = self.session.token();

        let group = self.remote.create_group(&token, name, comment).await?;
        self.ensure_current(epoch)?;
        self.cache.add_group(group.clone()).await?;
        Ok(group)
    }

    pub async fn rename_group(
        &self,
        id: i64,
        name: &str,
        comment: Option<&str>,
    ) -> Result<Option<Group>> {
        if name.trim().is_empty() {
            return Err(SyncError::Validation("group name is required".to_string()));
        }
        let epoch = self.ensure_authenticated()?;
        let _guard = self.locks.acquire(EntityKind::Group, id).await;

        let Some(current) = self.group_in_cache(id) else {
            return Ok(None);
        };

        let mut updated = current;
        updated.name = Some(name.to_string());
        updated.comment = comment.map(|c| c.to_string());
        updated.updated_at = Utc::now().to_rfc3339();

        let token = self.session.token();
        let saved = self.remote.update_group(&token, &updated).await?;
        self.ensure_current(epoch)?;
        let renamed = self
            .cache
            .rename_group(id, saved.name, saved.comment, saved.updated_at)
            .await?;
        Ok(renamed)
    }

    /// Delete a group. The server cascades on its side; the cache purges the
    /// group's records in the same mutation.
    pub async fn delete_group(&self, id: i64) -> Result<Option<Group>> {
        let epoch = self.ensure_authenticated()?;
        let _guard = self.locks.acquire(EntityKind::Group, id).await;

        if self.group_in_cache(id).is_none() {
            // Already gone, benign race with a refresh.
            return Ok(None);
        }

        let token = self.session.token();
        self.remote.delete_group(&token, id).await?;
        self.ensure_current(epoch)?;
        let removed = self.cache.remove_group(id).await?;
        self.locks.forget(EntityKind::Group, id);
        Ok(removed)
    }

    pub async fn create_record(&self, draft: RecordDraft) -> Result<Record> {
        if draft.title.trim().is_empty() {
            return Err(SyncError::Validation("title is required".to_string()));
        }
        let epoch = self.ensure_authenticated()?;
        let key = self.session.key_bytes()?;

        let wire = self.seal_draft(&draft, 0, &key)?;
        let token = self.session.token();
        let created = self.remote.create_record(&token, &wire).await?;
        self.ensure_current(epoch)?;

        // Keep the plaintext we already have; only identity and timestamps
        // come from the server.
        let record = Record {
            id: created.id,
            group_id: created.group_id,
            owner_user_id: created.owner_user_id,
            title: draft.title,
            username: draft.username,
            secret: draft.secret,
            link: draft.link,
            note: draft.note,
            updated_at: created.updated_at,
        };
        self.cache.add_record(record.clone()).await?;
        Ok(record)
    }

    pub async fn update_record(&self, id: i64, draft: RecordDraft) -> Result<Option<Record>> {
        if draft.title.trim().is_empty() {
            return Err(SyncError::Validation("title is required".to_string()));
        }
        let epoch = self.ensure_authenticated()?;
        let _guard = self.locks.acquire(EntityKind::Record, id).await;

        if !self.record_in_cache(id).await? {
            return Ok(None);
        }

        let key = self.session.key_bytes()?;
        let wire = self.seal_draft(&draft, id, &key)?;
        let token = self.session.token();
        let saved = self.remote.update_record(&token, &wire).await?;
        self.ensure_current(epoch)?;

        let updated = self.cache.update_record(id, draft, saved.updated_at).await?;
        Ok(updated)
    }

    pub async fn delete_record(&self, id: i64) -> Result<Option<Record>> {
        let epoch = self.ensure_authenticated()?;
        let _guard = self.locks.acquire(EntityKind::Record, id).await;

        if !self.record_in_cache(id).await? {
            return Ok(None);
        }

        let token = self.session.token();
        self.remote.delete_record(&token, id).await?;
        self.ensure_current(epoch)?;
        let removed = self.cache.remove_record(id).await?;
        self.locks.forget(EntityKind::Record, id);
        Ok(removed)
    }

    /// Local search over the decrypted cache; the server is never involved.
    ///
    /// Matches case-insensitively against title and username. Secrets and
    /// notes stay out of matching so they cannot surface through result
    /// lists. A blank term falls back to per-group browsing.
    pub async fn search(&self, term: &str) -> Result<()> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            self.cache.clear_search().await?;
            return Ok(());
        }

        let hits: Vec<Record> = self
            .cache
            .all_records()
            .await?
            .into_iter()
            .filter(|r| {
                r.title.to_lowercase().contains(&needle)
                    || r.username.to_lowercase().contains(&needle)
            })
            .collect();
        self.cache.set_search_results(hits).await?;
        Ok(())
    }

    fn seal_draft(&self, draft: &RecordDraft, id: i64, key: &[u8]) -> Result<Record> {
        Ok(Record {
            id,
            group_id: draft.group_id,
            owner_user_id: self.session.snapshot().user_id,
            title: crypto::encrypt_field(key, &draft.title)?,
            username: crypto::encrypt_field(key, &draft.username)?,
            secret: crypto::encrypt_field(key, &draft.secret)?,
            link: draft.link.clone(),
            note: draft.note.clone(),
            updated_at: Utc::now().to_rfc3339(),
        })
    }

    fn ensure_authenticated(&self) -> Result<SessionEpoch> {
        if !self.session.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        Ok(self.session.epoch())
    }

    // A completion that lands after login/logout replaced the session is
    // dropped, never applied to the cache.
    fn ensure_current(&self, epoch: SessionEpoch) -> Result<()> {
        if self.session.is_current(epoch) {
            Ok(())
        } else {
            logger::log("sync: dropping stale completion from a previous session");
            Err(SyncError::Stale)
        }
    }

    fn group_in_cache(&self, id: i64) -> Option<Group> {
        self.cache.groups().iter().find(|g| g.id == id).cloned()
    }

    async fn record_in_cache(&self, id: i64) -> Result<bool> {
        Ok(self
            .cache
            .all_records()
            .await?
            .iter()
            .any(|r| r.id == id))
    }
}

/// Coalesce rapid search keystrokes before scanning the cache.
///
/// Feed every keystroke's current term into the returned sender; the scan
/// only runs once the input has been quiet for `delay`.
pub fn spawn_search_debouncer<R>(
    repo: Arc<SyncRepository<R>>,
    delay: Duration,
) -> mpsc::UnboundedSender<String>
where
    R: RemoteClient + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut term = first;
            let mut closed = false;
            loop {
                match time::timeout(delay, rx.recv()).await {
                    Ok(Some(newer)) => term = newer,
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
            if let Err(e) = repo.search(&term).await {
                logger::log(&format!("sync: debounced search failed: {}", e));
            }
            if closed {
                return;
            }
        }
    });
    tx
}
