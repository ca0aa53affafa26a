use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};
use crate::logger;
use crate::models::{Group, Record, RecordDraft};

/// Immutable snapshot of the two UI-facing projections.
///
/// Published as a whole on every mutation; readers hold an `Arc` into the
/// previous snapshot and never observe a half-applied change.
#[derive(Clone, Default)]
pub struct CacheView {
    pub groups: Arc<Vec<Group>>,
    pub records: Arc<Vec<Record>>,
    pub selected_group: Option<i64>,
    pub selected_record: Option<i64>,
    pub search_active: bool,
}

enum CacheRequest {
    ReplaceAll {
        records: Vec<Record>,
        key: Zeroizing<Vec<u8>>,
        reply: oneshot::Sender<Vec<(i64, CryptoError)>>,
    },
    SetGroups {
        groups: Vec<Group>,
        reply: oneshot::Sender<()>,
    },
    AddGroup {
        group: Group,
        reply: oneshot::Sender<()>,
    },
    RemoveGroup {
        id: i64,
        reply: oneshot::Sender<Option<Group>>,
    },
    RenameGroup {
        id: i64,
        name: Option<String>,
        comment: Option<String>,
        updated_at: String,
        reply: oneshot::Sender<Option<Group>>,
    },
    AddRecord {
        record: Record,
        reply: oneshot::Sender<()>,
    },
    RemoveRecord {
        id: i64,
        reply: oneshot::Sender<Option<Record>>,
    },
    UpdateRecord {
        id: i64,
        draft: RecordDraft,
        updated_at: String,
        reply: oneshot::Sender<Option<Record>>,
    },
    SelectGroup {
        id: Option<i64>,
        reply: oneshot::Sender<()>,
    },
    SetSearchResults {
        records: Vec<Record>,
        reply: oneshot::Sender<()>,
    },
    ClearSearch {
        reply: oneshot::Sender<()>,
    },
    AllRecords {
        reply: oneshot::Sender<Vec<Record>>,
    },
}

/// Handle to the in-memory record store.
///
/// All mutation is funneled through one actor task, which is what makes
/// concurrent readers safe without any lock on the data itself. The cache is
/// volatile: it never talks to the network and is rebuilt on every login.
#[derive(Clone)]
pub struct RecordCache {
    tx: mpsc::UnboundedSender<CacheRequest>,
    view_rx: watch::Receiver<CacheView>,
}

impl RecordCache {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(CacheView::default());

        let actor = CacheInternal::new(view_tx);
        tokio::spawn(actor.run(rx));

        Self { tx, view_rx }
    }

    /// Full-sync ingest: decrypt every record with `key` and rebuild the map.
    ///
    /// Records whose fields cannot be decrypted are kept with their original
    /// ciphertext and reported by id so the caller can tell the user.
    pub async fn replace_all(
        &self,
        records: Vec<Record>,
        key: &[u8],
    ) -> Result<Vec<(i64, CryptoError)>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::ReplaceAll {
                records,
                key: Zeroizing::new(key.to_vec()),
                reply,
            })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn set_groups(&self, groups: Vec<Group>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::SetGroups { groups, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn add_group(&self, group: Group) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::AddGroup { group, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn remove_group(&self, id: i64) -> Result<Option<Group>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::RemoveGroup { id, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn rename_group(
        &self,
        id: i64,
        name: Option<String>,
        comment: Option<String>,
        updated_at: String,
    ) -> Result<Option<Group>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::RenameGroup {
                id,
                name,
                comment,
                updated_at,
                reply,
            })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn add_record(&self, record: Record) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::AddRecord { record, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn remove_record(&self, id: i64) -> Result<Option<Record>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::RemoveRecord { id, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn update_record(
        &self,
        id: i64,
        draft: RecordDraft,
        updated_at: String,
    ) -> Result<Option<Record>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::UpdateRecord {
                id,
                draft,
                updated_at,
                reply,
            })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn select_group(&self, id: Option<i64>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::SelectGroup { id, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn set_search_results(&self, records: Vec<Record>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::SetSearchResults { records, reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    pub async fn clear_search(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::ClearSearch { reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    /// Clone of every cached record across all groups. Search scans this.
    pub async fn all_records(&self) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheRequest::AllRecords { reply })
            .map_err(|_| anyhow::anyhow!("cache actor shutdown"))?;
        rx.await.context("cache actor dropped reply")
    }

    /// Current groups view.
    pub fn groups(&self) -> Arc<Vec<Group>> {
        self.view_rx.borrow().groups.clone()
    }

    /// Current view snapshot.
    pub fn snapshot(&self) -> CacheView {
        self.view_rx.borrow().clone()
    }

    /// Subscribe to view changes (one value per committed mutation).
    pub fn subscribe(&self) -> watch::Receiver<CacheView> {
        self.view_rx.clone()
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

// Single-writer internals. Only the actor task touches these fields.
struct CacheInternal {
    records: HashMap<i64, Vec<Record>>,
    groups: Vec<Group>,
    search_results: Vec<Record>,
    search_active: bool,
    selected_group: Option<i64>,
    selected_record: Option<i64>,
    view_tx: watch::Sender<CacheView>,
}

impl CacheInternal {
    fn new(view_tx: watch::Sender<CacheView>) -> Self {
        Self {
            records: HashMap::new(),
            groups: Vec::new(),
            search_results: Vec::new(),
            search_active: false,
            selected_group: None,
            selected_record: None,
            view_tx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CacheRequest>) {
        while let Some(req) = rx.recv().await {
            match req {
                CacheRequest::ReplaceAll { records, key, reply } => {
                    let _ = reply.send(self.replace_all(records, &key));
                }
                CacheRequest::SetGroups { groups, reply } => {
                    let _ = reply.send(self.set_groups(groups));
                }
                CacheRequest::AddGroup { group, reply } => {
                    let _ = reply.send(self.add_group(group));
                }
                CacheRequest::RemoveGroup { id, reply } => {
                    let _ = reply.send(self.remove_group(id));
                }
                CacheRequest::RenameGroup {
                    id,
                    name,
                    comment,
                    updated_at,
                    reply,
                } => {
                    let _ = reply.send(self.rename_group(id, name, comment, updated_at));
                }
                CacheRequest::AddRecord { record, reply } => {
                    let _ = reply.send(self.add_record(record));
                }
                CacheRequest::RemoveRecord { id, reply } => {
                    let _ = reply.send(self.remove_record(id));
                }
                CacheRequest::UpdateRecord {
                    id,
                    draft,
                    updated_at,
                    reply,
                } => {
                    let _ = reply.send(self.update_record(id, draft, updated_at));
                }
                CacheRequest::SelectGroup { id, reply } => {
                    let _ = reply.send(self.select_group(id));
                }
                CacheRequest::SetSearchResults { records, reply } => {
                    let _ = reply.send(self.set_search_results(records));
                }
                CacheRequest::ClearSearch { reply } => {
                    let _ = reply.send(self.clear_search());
                }
                CacheRequest::AllRecords { reply } => {
                    let _ = reply.send(self.all_records());
                }
            }
        }
    }

    /// Rebuild and publish both views. Called after every mutation.
    fn publish(&self) {
        let records = if self.search_active {
            self.search_results.clone()
        } else if let Some(gid) = self.selected_group {
            self.records.get(&gid).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };

        let view = CacheView {
            groups: Arc::new(self.groups.clone()),
            records: Arc::new(records),
            selected_group: self.selected_group,
            selected_record: self.selected_record,
            search_active: self.search_active,
        };
        let _ = self.view_tx.send(view);
    }

    fn replace_all(
        &mut self,
        records: Vec<Record>,
        key: &[u8],
    ) -> Vec<(i64, CryptoError)> {
        self.records.clear();
        self.search_results.clear();
        self.search_active = false;
        self.selected_group = None;
        self.selected_record = None;

        let mut failures = Vec::new();
        for mut record in records {
            if let Err(e) = decrypt_record_fields(key, &mut record) {
                logger::log(&format!("cache: cannot decrypt record {}: {}", record.id, e));
                failures.push((record.id, e));
            }
            self.records.entry(record.group_id).or_default().push(record);
        }

        self.publish();
        failures
    }

    fn set_groups(&mut self, groups: Vec<Group>) {
        if let Some(gid) = self.selected_group {
            if !groups.iter().any(|g| g.id == gid) {
                self.selected_group = None;
                self.selected_record = None;
            }
        }
        self.groups = groups;
        self.publish();
    }

    fn add_group(&mut self, group: Group) {
        let id = group.id;
        self.groups.push(group);
        self.records.entry(id).or_default();
        // Auto-navigate to the newly created group.
        self.selected_group = Some(id);
        self.selected_record = None;
        self.search_active = false;
        self.search_results.clear();
        self.publish();
    }

    fn remove_group(&mut self, id: i64) -> Option<Group> {
        let pos = self.groups.iter().position(|g| g.id == id)?;
        let removed = self.groups.remove(pos);

        // Cascade: the group's records go with it, including any that are
        // currently showing up in search results.
        self.records.remove(&id);
        self.search_results.retain(|r| r.group_id != id);

        if self.selected_group == Some(id) {
            self.selected_group = None;
            self.selected_record = None;
        }
        self.publish();
        Some(removed)
    }

    fn rename_group(
        &mut self,
        id: i64,
        name: Option<String>,
        comment: Option<String>,
        updated_at: String,
    ) -> Option<Group> {
        let group = self.groups.iter_mut().find(|g| g.id == id)?;
        group.name = name;
        group.comment = comment;
        group.updated_at = updated_at;
        let updated = group.clone();
        self.publish();
        Some(updated)
    }

    fn add_record(&mut self, record: Record) {
        let visible = !self.search_active && self.selected_group == Some(record.group_id);
        let id = record.id;
        self.records.entry(record.group_id).or_default().push(record);
        if visible {
            // "Scroll to last inserted" policy.
            self.selected_record = Some(id);
        }
        self.publish();
    }

    fn remove_record(&mut self, id: i64) -> Option<Record> {
        let removed = self.take_record(id)?;
        self.search_results.retain(|r| r.id != id);
        if self.selected_record == Some(id) {
            self.selected_record = None;
        }
        self.publish();
        Some(removed)
    }

    fn update_record(
        &mut self,
        id: i64,
        draft: RecordDraft,
        updated_at: String,
    ) -> Option<Record> {
        let record = self
            .records
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|r| r.id == id)?;

        record.title = draft.title;
        record.username = draft.username;
        record.secret = draft.secret;
        record.link = draft.link;
        record.note = draft.note;
        record.updated_at = updated_at;
        let updated = record.clone();

        if let Some(hit) = self.search_results.iter_mut().find(|r| r.id == id) {
            *hit = updated.clone();
        }
        self.publish();
        Some(updated)
    }

    fn select_group(&mut self, id: Option<i64>) {
        self.selected_group = id;
        self.selected_record = None;
        self.search_active = false;
        self.search_results.clear();
        self.publish();
    }

    fn set_search_results(&mut self, records: Vec<Record>) {
        self.search_results = records;
        self.search_active = true;
        self.selected_record = None;
        self.publish();
    }

    fn clear_search(&mut self) {
        self.search_active = false;
        self.search_results.clear();
        self.selected_record = None;
        self.publish();
    }

    fn all_records(&self) -> Vec<Record> {
        self.records.values().flatten().cloned().collect()
    }

    fn take_record(&mut self, id: i64) -> Option<Record> {
        for list in self.records.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                return Some(list.remove(pos));
            }
        }
        None
    }
}

fn decrypt_record_fields(key: &[u8], record: &mut Record) -> Result<(), CryptoError> {
    let title = crypto::decrypt_field(key, &record.title)?;
    let username = crypto::decrypt_field(key, &record.username)?;
    let secret = crypto::decrypt_field(key, &record.secret)?;
    record.title = title;
    record.username = username;
    record.secret = secret;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn group(id: i64, name: &str) -> Group {
        Group {
            id,
            owner_user_id: 1,
            name: Some(name.to_string()),
            comment: None,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn plain_record(id: i64, group_id: i64, title: &str, username: &str) -> Record {
        Record {
            id,
            group_id,
            owner_user_id: 1,
            title: title.to_string(),
            username: username.to_string(),
            secret: "s3cret".to_string(),
            link: None,
            note: None,
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn sealed_record(id: i64, group_id: i64, title: &str, username: &str) -> Record {
        let mut record = plain_record(id, group_id, title, username);
        record.title = crypto::encrypt_field(KEY, &record.title).expect("encrypt");
        record.username = crypto::encrypt_field(KEY, &record.username).expect("encrypt");
        record.secret = crypto::encrypt_field(KEY, &record.secret).expect("encrypt");
        record
    }

    #[tokio::test]
    async fn replace_all_decrypts_and_groups_by_group_id() {
        let cache = RecordCache::new();
        let records = vec![
            sealed_record(1, 10, "GitHub", "alice"),
            sealed_record(2, 20, "Gmail", "bob"),
            sealed_record(3, 10, "Crates.io", "alice"),
        ];

        let failures = cache.replace_all(records, KEY).await.expect("replace");
        assert!(failures.is_empty());

        let mut all = cache.all_records().await.expect("all");
        all.sort_by_key(|r| r.id);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].title, "GitHub");
        assert_eq!(all[1].username, "bob");
        assert_eq!(all[2].secret, "s3cret");

        // Views start cleared after a full sync.
        let view = cache.snapshot();
        assert!(view.records.is_empty());
        assert_eq!(view.selected_group, None);
    }

    #[tokio::test]
    async fn replace_all_reports_undecryptable_records() {
        let cache = RecordCache::new();
        let mut bad = sealed_record(7, 10, "Broken", "mallory");
        bad.title = "AAAA".to_string();

        let failures = cache
            .replace_all(vec![sealed_record(1, 10, "Ok", "alice"), bad], KEY)
            .await
            .expect("replace");

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 7);
        // The record survives with its original ciphertext fields.
        let all = cache.all_records().await.expect("all");
        assert!(all.iter().any(|r| r.id == 7 && r.title == "AAAA"));
    }

    #[tokio::test]
    async fn remove_group_cascades_to_records_and_view() {
        let cache = RecordCache::new();
        cache
            .replace_all(
                vec![sealed_record(1, 10, "R1", "alice"), sealed_record(2, 20, "R2", "bob")],
                KEY,
            )
            .await
            .expect("replace");
        cache
            .set_groups(vec![group(10, "G1"), group(20, "G2")])
            .await
            .expect("groups");
        cache.select_group(Some(10)).await.expect("select");
        assert_eq!(cache.snapshot().records.len(), 1);

        let removed = cache.remove_group(10).await.expect("remove");
        assert_eq!(removed.expect("present").id, 10);

        let view = cache.snapshot();
        assert_eq!(view.selected_group, None);
        assert!(view.records.is_empty());

        // Only G2's record is left anywhere in the map.
        let all = cache.all_records().await.expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 2);
    }

    #[tokio::test]
    async fn add_record_selects_it_when_its_group_is_visible() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");

        cache
            .add_record(plain_record(5, 10, "New", "alice"))
            .await
            .expect("add");

        let view = cache.snapshot();
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.selected_record, Some(5));
    }

    #[tokio::test]
    async fn add_record_to_hidden_group_leaves_view_alone() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1"), group(20, "G2")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");

        cache
            .add_record(plain_record(5, 20, "Elsewhere", "bob"))
            .await
            .expect("add");

        let view = cache.snapshot();
        assert!(view.records.is_empty());
        assert_eq!(view.selected_record, None);
    }

    #[tokio::test]
    async fn remove_record_resets_selection() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");
        cache.add_record(plain_record(5, 10, "A", "alice")).await.expect("add");
        assert_eq!(cache.snapshot().selected_record, Some(5));

        let removed = cache.remove_record(5).await.expect("remove");
        assert_eq!(removed.expect("present").id, 5);

        let view = cache.snapshot();
        assert!(view.records.is_empty());
        assert_eq!(view.selected_record, None);
    }

    #[tokio::test]
    async fn mutating_an_absent_id_returns_none() {
        let cache = RecordCache::new();
        assert!(cache.remove_record(99).await.expect("remove").is_none());
        assert!(cache.remove_group(99).await.expect("remove").is_none());
        assert!(cache
            .update_record(99, RecordDraft::default(), String::new())
            .await
            .expect("update")
            .is_none());
        assert!(cache
            .rename_group(99, None, None, String::new())
            .await
            .expect("rename")
            .is_none());
    }

    #[tokio::test]
    async fn search_view_overrides_and_clear_restores_group_view() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");
        cache.add_record(plain_record(1, 10, "GitHub", "alice")).await.expect("add");
        cache.add_record(plain_record(2, 10, "Gmail", "bob")).await.expect("add");

        cache
            .set_search_results(vec![plain_record(1, 10, "GitHub", "alice")])
            .await
            .expect("search");
        let view = cache.snapshot();
        assert!(view.search_active);
        assert_eq!(view.records.len(), 1);

        cache.clear_search().await.expect("clear");
        let view = cache.snapshot();
        assert!(!view.search_active);
        assert_eq!(view.records.len(), 2);
        assert_eq!(view.selected_group, Some(10));
    }

    #[tokio::test]
    async fn update_record_refreshes_visible_view_in_place() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");
        cache.add_record(plain_record(1, 10, "Old", "alice")).await.expect("add");

        let draft = RecordDraft {
            group_id: 10,
            title: "New".to_string(),
            username: "alice".to_string(),
            secret: "changed".to_string(),
            link: Some("https://example.com".to_string()),
            note: None,
        };
        let updated = cache
            .update_record(1, draft, "2024-06-01T00:00:00Z".to_string())
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.title, "New");

        let view = cache.snapshot();
        assert_eq!(view.records[0].title, "New");
        assert_eq!(view.records[0].updated_at, "2024-06-01T00:00:00Z");
    }

    #[tokio::test]
    async fn subscribers_see_a_fresh_snapshot_per_mutation() {
        let cache = RecordCache::new();
        let mut rx = cache.subscribe();

        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        rx.changed().await.expect("changed");
        let first = rx.borrow_and_update().clone();
        assert_eq!(first.groups.len(), 1);

        cache.select_group(Some(10)).await.expect("select");
        cache.add_record(plain_record(1, 10, "A", "alice")).await.expect("add");
        rx.changed().await.expect("changed");
        let second = rx.borrow_and_update().clone();
        assert_eq!(second.records.len(), 1);

        // The earlier snapshot is untouched by later mutations.
        assert!(first.records.is_empty());
    }

    #[tokio::test]
    async fn wipe_leaves_nothing_reachable() {
        let cache = RecordCache::new();
        cache.set_groups(vec![group(10, "G1")]).await.expect("groups");
        cache.select_group(Some(10)).await.expect("select");
        cache.add_record(plain_record(1, 10, "A", "alice")).await.expect("add");

        cache.replace_all(Vec::new(), &[]).await.expect("wipe");
        cache.set_groups(Vec::new()).await.expect("groups");

        let view = cache.snapshot();
        assert!(view.groups.is_empty());
        assert!(view.records.is_empty());
        assert!(cache.all_records().await.expect("all").is_empty());
    }
}
