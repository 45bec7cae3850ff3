//! Document storage orchestrator
//!
//! Implements the archive operations as commands executed against the
//! underlying shard databases, keeping the in-memory folder tree in step
//! with every write.

mod find;
mod maintenance;
mod meta;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use domla_common::config::ArchiveConfig;
use domla_common::error::{Error, Result};
use domla_common::types::{
    Action, Assignment, Content, Document, FolderInfo, HistoryEntry, ROOT_FOLDER,
};
use domla_common::utils::{new_id, now_ticks};

use crate::delta;
use crate::fulltext::FulltextIndex;
use crate::identity::deny_view_only;
use crate::mapper::{self, BatchQueue};
use crate::optimizer::Optimizer;
use crate::shards::ShardPool;
use crate::sqlite::Connection;
use crate::tree::VirtualTree;

const LATEST_REVISION: &str =
    "SELECT IFNULL(MAX(SeqId), 0) FROM DocumentHistories WHERE Owner = :Id";

const LATEST_CONTENT: &str = "SELECT c.Id, c.Owner, c.SeqId, c.Checksum, c.Data \
     FROM DocumentContents c \
     JOIN DocumentHistories h ON c.Owner = h.Id \
     WHERE h.Owner = :Id \
     ORDER BY c.SeqId DESC LIMIT 1";

const CONTENT_CHAIN: &str = "SELECT c.Id, c.Owner, c.SeqId, c.Checksum, c.Data \
     FROM DocumentContents c \
     JOIN DocumentHistories h ON c.Owner = h.Id \
     WHERE h.Owner = :Id \
     ORDER BY c.SeqId DESC";

const ASSIGNMENT_AT: &str =
    "SELECT a.Id, a.Owner, a.SeqId, a.AssignmentType, a.AssignmentId, a.Path \
     FROM DocumentAssignments a \
     JOIN DocumentHistories h ON a.Owner = h.Id \
     WHERE h.Owner = :Id AND a.Path = :Path \
     ORDER BY a.SeqId DESC LIMIT 1";

const ASSIGNMENTS_OF: &str =
    "SELECT a.Id, a.Owner, a.SeqId, a.AssignmentType, a.AssignmentId, a.Path \
     FROM DocumentAssignments a \
     JOIN DocumentHistories h ON a.Owner = h.Id \
     WHERE h.Owner = :Id \
     ORDER BY a.SeqId";

const HISTORY_OF: &str =
    "SELECT Id, Owner, SeqId, Created, Action, Actor, Comment, Source, Target \
     FROM DocumentHistories \
     WHERE Owner = :Id \
     ORDER BY SeqId";

const HISTORY_AT: &str =
    "SELECT COUNT(*) FROM DocumentHistories WHERE Owner = :Id AND SeqId = :SeqId";

pub(crate) fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Folder paths are stored lower-cased; an empty path means the root.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        ROOT_FOLDER.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

fn ensure_unlocked_for(document: &Document, user: &str) -> Result<()> {
    if !document.locker.is_empty() && document.locker != user {
        return Err(Error::Lock(format!(
            "document {} is locked by {}",
            document.id, document.locker
        )));
    }
    Ok(())
}

/// The archive storage engine
pub struct DocumentStorage {
    pool: Arc<ShardPool>,
    folders: Arc<VirtualTree>,
    fulltext: FulltextIndex,
    optimizer: Optimizer,
}

impl DocumentStorage {
    /// Open the archive described by `config`, creating shards on first use
    /// and building the folder tree from the stored assignments. The
    /// constructor returns once the tree is complete.
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        config.validate()?;

        if !config.is_in_memory() {
            std::fs::create_dir_all(&config.data_location)?;
        }

        let pool = Arc::new(ShardPool::open(config)?);
        let folders = Arc::new(VirtualTree::new());
        Self::build_folder_tree(&pool, &folders)?;

        let fulltext = FulltextIndex::open(config)?;
        let optimizer = Optimizer::with_period(
            Arc::clone(&pool),
            Duration::from_secs(config.optimize_hours.max(1) * 60 * 60),
        );

        info!(
            "archive storage ready with {} shard(s)",
            pool.shards().len()
        );

        Ok(Self {
            pool,
            folders,
            fulltext,
            optimizer,
        })
    }

    /// Stop the background optimizer; further ticks are suppressed while
    /// an in-flight pass may still finish.
    pub fn shutdown(&mut self) {
        self.optimizer.cancel();
    }

    /// Populate the folder tree from every shard: live document counts per
    /// path, with directory-class items tracked as references.
    fn build_folder_tree(pool: &ShardPool, folders: &Arc<VirtualTree>) -> Result<()> {
        let entries = pool.fan_out(|reader| {
            let mut statement = reader.prepare(
                "SELECT a.Path, d.FileName = :Marker AS IsFolder, COUNT(*) AS Documents \
                 FROM DocumentAssignments a \
                 JOIN DocumentHistories h ON a.Owner = h.Id \
                 JOIN Documents d ON h.Owner = d.Id \
                 WHERE d.State = 0 \
                 GROUP BY a.Path, IsFolder",
            )?;
            statement.set("Marker", domla_common::types::FOLDER_ITEM_NAME)?;
            let mut rows = statement.query()?;

            let mut partial = Vec::new();
            while let Some(row) = rows.next()? {
                partial.push((
                    row.get_text("Path")?,
                    row.get_int("IsFolder")? == 1,
                    row.get_i64("Documents")?,
                ));
            }
            Ok(partial)
        })?;

        // The same path can surface from several shards; counts add up.
        let mut documents: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        let mut references: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for (path, is_folder, count) in entries {
            let slot = if is_folder {
                references.entry(path).or_default()
            } else {
                documents.entry(path).or_default()
            };
            *slot += count;
        }

        folders.load(
            &documents
                .into_iter()
                .map(|(path, count)| FolderInfo::new(path, count))
                .collect::<Vec<_>>(),
        );
        folders.load_references(
            &references
                .into_iter()
                .map(|(path, count)| FolderInfo::new(path, count))
                .collect::<Vec<_>>(),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fetch helpers; callers hold the appropriate shard lock and pass the
    // connection straight through.
    // ------------------------------------------------------------------

    fn fetch(connection: &Connection, id: &str) -> Result<Option<Document>> {
        mapper::load::<Document>(connection, id)
    }

    fn fetch_required(connection: &Connection, id: &str) -> Result<Document> {
        Self::fetch(connection, id)?.ok_or_else(|| Error::not_found(format!("document {id}")))
    }

    /// Fetch for mutations: rejects deleted documents and foreign locks
    fn fetch_checked(connection: &Connection, id: &str, user: &str) -> Result<Document> {
        let document = Self::fetch_required(connection, id)?;
        if document.deleted {
            return Err(Error::Lock(format!("document {id} is deleted")));
        }
        ensure_unlocked_for(&document, user)?;
        Ok(document)
    }

    fn latest_revision(connection: &Connection, id: &str) -> Result<i64> {
        let mut statement = connection.prepare(LATEST_REVISION)?;
        statement.set("Id", id)?;
        statement.execute_scalar_int()
    }

    fn latest_content(connection: &Connection, id: &str) -> Result<Option<Content>> {
        let mut statement = connection.prepare(LATEST_CONTENT)?;
        statement.set("Id", id)?;
        let mut rows = statement.query()?;
        match rows.next()? {
            Some(row) => Ok(Some(<Content as mapper::Mapped>::materialize(&row)?)),
            None => Ok(None),
        }
    }

    fn contents_descending(connection: &Connection, id: &str) -> Result<Vec<Content>> {
        let mut statement = connection.prepare(CONTENT_CHAIN)?;
        statement.set("Id", id)?;
        let mut rows = statement.query()?;
        let mut chain = Vec::new();
        while let Some(row) = rows.next()? {
            chain.push(<Content as mapper::Mapped>::materialize(&row)?);
        }
        Ok(chain)
    }

    fn assignment_at(connection: &Connection, id: &str, path: &str) -> Result<Option<Assignment>> {
        let mut statement = connection.prepare(ASSIGNMENT_AT)?;
        statement.set("Id", id)?;
        statement.set("Path", path)?;
        let mut rows = statement.query()?;
        match rows.next()? {
            Some(row) => Ok(Some(<Assignment as mapper::Mapped>::materialize(&row)?)),
            None => Ok(None),
        }
    }

    fn assignments_of(connection: &Connection, id: &str) -> Result<Vec<Assignment>> {
        let mut statement = connection.prepare(ASSIGNMENTS_OF)?;
        statement.set("Id", id)?;
        let mut rows = statement.query()?;
        let mut assignments = Vec::new();
        while let Some(row) = rows.next()? {
            assignments.push(<Assignment as mapper::Mapped>::materialize(&row)?);
        }
        Ok(assignments)
    }

    fn history_exists(connection: &Connection, id: &str, revision: i64) -> Result<bool> {
        let mut statement = connection.prepare(HISTORY_AT)?;
        statement.set("Id", id)?;
        statement.set("SeqId", revision)?;
        Ok(statement.execute_scalar_int()? > 0)
    }

    fn history_entry(
        document: &str,
        revision: i64,
        actions: &[Action],
        actor: &str,
        comment: &str,
        source: &str,
        target: &str,
    ) -> HistoryEntry {
        HistoryEntry {
            id: new_id(),
            document: document.to_string(),
            revision,
            created: now_ticks(),
            action: Action::join(actions),
            actor: actor.to_string(),
            comment: comment.to_string(),
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    /// Tree bookkeeping for one assignment of `document`
    fn tree_add(&self, document: &Document, path: &str) {
        if document.is_folder_item() {
            self.folders.add_uncounted(path);
        } else {
            self.folders.add(path);
        }
    }

    fn tree_remove(&self, document: &Document, path: &str) -> Result<()> {
        if document.is_folder_item() {
            self.folders.remove_uncounted(path)
        } else {
            self.folders.remove(path)
        }
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Store a document: a new one when the header has no id yet, a new
    /// revision of the existing one otherwise. The header is updated in
    /// place with the assigned id, revision and size.
    pub fn save(
        &self,
        document: &mut Document,
        data: &[u8],
        user: &str,
        comment: &str,
    ) -> Result<()> {
        deny_view_only(user)?;

        if document.id.is_empty() {
            self.insert_document(document, data, user, comment)
        } else {
            self.update_document(document, data, user, comment)
        }
    }

    fn insert_document(
        &self,
        document: &mut Document,
        data: &[u8],
        user: &str,
        comment: &str,
    ) -> Result<()> {
        document.id = new_id();
        document.creator = user.to_string();
        document.created = now_ticks();
        document.deleted = false;
        document.size = data.len() as i64;
        document.revision = 1;
        document.folder_path = normalize_path(&document.folder_path);

        debug!("inserting document {} into {}", document.id, document.folder_path);

        let history = Self::history_entry(
            &document.id,
            1,
            &[Action::Created],
            user,
            comment,
            "",
            "",
        );
        let content = Content {
            id: new_id(),
            history: history.id.clone(),
            revision: 1,
            checksum: checksum(data),
            data: data.to_vec(),
        };
        let assignment = Assignment {
            id: new_id(),
            history: history.id.clone(),
            revision: 1,
            assignment_type: document.associated_class.clone(),
            assignment_id: document.associated_item.clone(),
            path: document.folder_path.clone(),
        };

        let shard = self.pool.shard_for(&document.id)?;
        {
            let writer = shard.writer();
            let mut batch = BatchQueue::new();
            batch.insert(document.clone());
            batch.insert(history);
            batch.insert(content);
            batch.insert(assignment);
            batch.flush(&writer)?;
        }

        let path = document.folder_path.clone();
        self.tree_add(document, &path);
        Ok(())
    }

    fn update_document(
        &self,
        document: &mut Document,
        data: &[u8],
        user: &str,
        comment: &str,
    ) -> Result<()> {
        let shard = self.pool.shard_for(&document.id)?;
        let writer = shard.writer();

        let current = Self::fetch_checked(&writer, &document.id, user)?;

        let mut actions = Vec::new();
        if current.file_name != document.file_name {
            actions.push(Action::Renamed);
        }
        if current.display_name != document.display_name {
            actions.push(Action::Retitled);
        }
        if current.keywords != document.keywords {
            actions.push(Action::Keywords);
        }
        actions.push(Action::Revision);

        let revision = Self::latest_revision(&writer, &document.id)? + 1;
        let previous = Self::latest_content(&writer, &document.id)?.ok_or_else(|| {
            Error::Integrity(format!("document {} has no content", document.id))
        })?;

        debug!(
            "updating document {} to revision {revision} ({})",
            document.id,
            Action::join(&actions)
        );

        let history =
            Self::history_entry(&document.id, revision, &actions, user, comment, "", "");

        // Reverse delta: the stored row for the old revision becomes a
        // patch that reproduces it from the new bytes.
        let patch = delta::create_patch(data, &previous.data)?;
        let mut rewritten = previous;
        rewritten.data = patch;
        rewritten.checksum = checksum(&rewritten.data);

        let fresh = Content {
            id: new_id(),
            history: history.id.clone(),
            revision,
            checksum: checksum(data),
            data: data.to_vec(),
        };

        let mut header = current;
        header.file_name = document.file_name.clone();
        header.display_name = document.display_name.clone();
        header.keywords = document.keywords.clone();
        header.size = data.len() as i64;

        let mut batch = BatchQueue::new();
        batch.update(header);
        batch.insert(history);
        batch.update(rewritten);
        batch.insert(fresh);
        batch.flush(&writer)?;

        document.revision = revision;
        document.size = data.len() as i64;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Header reads
    // ------------------------------------------------------------------

    /// Minimal header fetch: only the fields of the header table. Deleted
    /// documents load fine.
    pub fn load(&self, id: &str, user: &str) -> Result<Document> {
        debug!("load {id} for {user}");
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();
        Self::fetch_required(&reader, id)
    }

    /// Full header with revision, folder and association data; `revision`
    /// zero means the newest one.
    pub fn find_by_id(&self, id: &str, revision: i64) -> Result<Document> {
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();

        let mut document = Self::fetch_required(&reader, id)?;
        find::decorate(&reader, &mut document)?;

        if revision > 0 {
            if !Self::history_exists(&reader, id, revision)? {
                return Err(Error::not_found(format!("revision {revision} of {id}")));
            }
            document.revision = revision;
        }
        Ok(document)
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    pub fn lock(&self, id: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();

        let mut document = Self::fetch_required(&writer, id)?;
        ensure_unlocked_for(&document, user)?;
        document.locker = user.to_string();

        let mut batch = BatchQueue::new();
        batch.update(document);
        batch.flush(&writer)
    }

    pub fn unlock(&self, id: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();

        let mut document = Self::fetch_required(&writer, id)?;
        ensure_unlocked_for(&document, user)?;
        document.locker = String::new();

        let mut batch = BatchQueue::new();
        batch.update(document);
        batch.flush(&writer)
    }

    // ------------------------------------------------------------------
    // Folder operations
    // ------------------------------------------------------------------

    /// Move the assignment at `old_path` to `new_path`
    pub fn move_document(
        &self,
        id: &str,
        old_path: &str,
        new_path: &str,
        user: &str,
    ) -> Result<()> {
        deny_view_only(user)?;

        let source = normalize_path(old_path);
        let target = normalize_path(new_path);

        let shard = self.pool.shard_for(id)?;
        let document;
        {
            let writer = shard.writer();
            document = Self::fetch_checked(&writer, id, user)?;

            let mut assignment = Self::assignment_at(&writer, id, &source)?
                .ok_or_else(|| Error::not_found(format!("{id} at {source}")))?;
            assignment.path = target.clone();

            let revision = Self::latest_revision(&writer, id)? + 1;
            let history = Self::history_entry(
                id,
                revision,
                &[Action::Moved],
                user,
                "",
                &source,
                &target,
            );

            let mut batch = BatchQueue::new();
            batch.insert(history);
            batch.update(assignment);
            batch.flush(&writer)?;
        }

        self.tree_add(&document, &target);
        self.tree_remove(&document, &source)
    }

    /// Add a second assignment of the same document at `target_path`
    pub fn link(&self, id: &str, source_path: &str, target_path: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let source = normalize_path(source_path);
        let target = normalize_path(target_path);

        let shard = self.pool.shard_for(id)?;
        let document;
        {
            let writer = shard.writer();
            document = Self::fetch_checked(&writer, id, user)?;

            let origin = Self::assignment_at(&writer, id, &source)?
                .ok_or_else(|| Error::not_found(format!("{id} at {source}")))?;

            let revision = Self::latest_revision(&writer, id)? + 1;
            let history = Self::history_entry(
                id,
                revision,
                &[Action::Linked],
                user,
                "",
                &source,
                &target,
            );
            let link = Assignment {
                id: new_id(),
                history: history.id.clone(),
                revision,
                assignment_type: origin.assignment_type,
                assignment_id: origin.assignment_id,
                path: target.clone(),
            };

            let mut batch = BatchQueue::new();
            batch.insert(history);
            batch.insert(link);
            batch.flush(&writer)?;
        }

        self.tree_add(&document, &target);
        Ok(())
    }

    /// Clone the document into `target_path` under a fresh id. The clone
    /// always carries the fully reconstructed latest content; the source
    /// path only selects which assignment must exist.
    pub fn copy(
        &self,
        id: &str,
        source_path: &str,
        target_path: &str,
        user: &str,
    ) -> Result<String> {
        deny_view_only(user)?;

        let source = normalize_path(source_path);

        let (original, bytes) = {
            let shard = self.pool.shard_for(id)?;
            let reader = shard.reader();
            let document = Self::fetch_required(&reader, id)?;
            Self::assignment_at(&reader, id, &source)?
                .ok_or_else(|| Error::not_found(format!("{id} at {source}")))?;
            let content = Self::latest_content(&reader, id)?
                .ok_or_else(|| Error::Integrity(format!("document {id} has no content")))?;
            (document, content.data)
        };

        let mut clone = original;
        clone.id = String::new();
        clone.locker = String::new();
        clone.folder_path = target_path.to_string();

        self.insert_document(&mut clone, &bytes, user, "")?;
        Ok(clone.id)
    }

    /// Attach an associated item to the assignment at `path`
    pub fn associate(
        &self,
        id: &str,
        path: &str,
        item: &str,
        class: &str,
        user: &str,
    ) -> Result<()> {
        deny_view_only(user)?;

        let at = normalize_path(path);
        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();

        Self::fetch_checked(&writer, id, user)?;
        let mut assignment = Self::assignment_at(&writer, id, &at)?
            .ok_or_else(|| Error::not_found(format!("{id} at {at}")))?;
        assignment.assignment_id = item.to_string();
        assignment.assignment_type = class.to_string();

        let mut batch = BatchQueue::new();
        batch.update(assignment);
        batch.flush(&writer)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Soft-delete: the document stays recoverable via `undelete`
    pub fn delete(&self, id: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let document;
        let assignments;
        {
            let writer = shard.writer();
            let current = Self::fetch_required(&writer, id)?;
            if current.deleted {
                return Err(Error::Lock(format!("document {id} is already deleted")));
            }
            ensure_unlocked_for(&current, user)?;

            assignments = Self::assignments_of(&writer, id)?;
            let revision = Self::latest_revision(&writer, id)? + 1;
            let history =
                Self::history_entry(id, revision, &[Action::Deleted], user, "", "", "");

            let mut header = current.clone();
            header.deleted = true;

            let mut batch = BatchQueue::new();
            batch.update(header);
            batch.insert(history);
            batch.flush(&writer)?;
            document = current;
        }

        for assignment in &assignments {
            self.tree_remove(&document, &assignment.path)?;
        }
        Ok(())
    }

    /// Bring a soft-deleted document back
    pub fn undelete(&self, id: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let document;
        let assignments;
        {
            let writer = shard.writer();
            let current = Self::fetch_required(&writer, id)?;
            if !current.deleted {
                return Err(Error::Lock(format!("document {id} is not deleted")));
            }

            assignments = Self::assignments_of(&writer, id)?;
            let revision = Self::latest_revision(&writer, id)? + 1;
            let history =
                Self::history_entry(id, revision, &[Action::Recovered], user, "", "", "");

            let mut header = current.clone();
            header.deleted = false;

            let mut batch = BatchQueue::new();
            batch.update(header);
            batch.insert(history);
            batch.flush(&writer)?;
            document = current;
        }

        for assignment in &assignments {
            self.tree_add(&document, &assignment.path);
        }
        Ok(())
    }

    pub fn undelete_many(&self, ids: &[String], user: &str) -> Result<()> {
        for id in ids {
            self.undelete(id, user)?;
        }
        Ok(())
    }

    /// Hard-delete the document row; history, contents, assignments and
    /// meta rows follow through the deferred cascades.
    pub fn destroy(&self, id: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let document;
        let assignments;
        {
            let writer = shard.writer();
            let current = Self::fetch_required(&writer, id)?;
            ensure_unlocked_for(&current, user)?;

            assignments = Self::assignments_of(&writer, id)?;

            let mut batch = BatchQueue::new();
            batch.delete(current.clone());
            batch.flush(&writer)?;
            document = current;
        }

        // A soft-deleted document no longer counts in the tree.
        if !document.deleted {
            for assignment in &assignments {
                self.tree_remove(&document, &assignment.path)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Header mutations
    // ------------------------------------------------------------------

    /// Change the display title
    pub fn rename(&self, id: &str, user: &str, display: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();

        let mut document = Self::fetch_checked(&writer, id, user)?;
        document.display_name = display.to_string();

        let revision = Self::latest_revision(&writer, id)? + 1;
        let history = Self::history_entry(id, revision, &[Action::Retitled], user, "", "", "");

        let mut batch = BatchQueue::new();
        batch.update(document);
        batch.insert(history);
        batch.flush(&writer)
    }

    /// Replace the free-text keywords on the header
    pub fn assign_keywords(&self, id: &str, keywords: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();

        let mut document = Self::fetch_checked(&writer, id, user)?;
        document.keywords = keywords.to_string();

        let revision = Self::latest_revision(&writer, id)? + 1;
        let history = Self::history_entry(id, revision, &[Action::Keywords], user, "", "", "");

        let mut batch = BatchQueue::new();
        batch.update(document);
        batch.insert(history);
        batch.flush(&writer)
    }

    // ------------------------------------------------------------------
    // Content reads
    // ------------------------------------------------------------------

    /// The stored newest content, verbatim
    pub fn read(&self, id: &str, user: &str) -> Result<Content> {
        debug!("read {id} for {user}");
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();
        Self::latest_content(&reader, id)?
            .ok_or_else(|| Error::not_found(format!("content of {id}")))
    }

    /// Reconstruct the content at `revision` by applying the stored
    /// patches from the newest row downward.
    pub fn read_at(&self, id: &str, user: &str, revision: i64) -> Result<Content> {
        if revision <= 0 {
            return self.read(id, user);
        }
        debug!("read {id} at revision {revision} for {user}");

        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();

        let chain = Self::contents_descending(&reader, id)?;
        let newest = chain
            .first()
            .ok_or_else(|| Error::not_found(format!("content of {id}")))?;
        if revision > newest.revision {
            return Err(Error::not_found(format!("revision {revision} of {id}")));
        }

        let mut buffer = newest.data.clone();
        let mut at = newest.revision;
        for entry in &chain[1..] {
            if entry.revision < revision {
                break;
            }
            buffer = delta::apply_patch(&buffer, &entry.data)?;
            at = entry.revision;
        }

        Ok(Content {
            id: String::new(),
            history: String::new(),
            revision: at,
            checksum: checksum(&buffer),
            data: buffer,
        })
    }

    /// Every history row of the document, in insertion order
    pub fn revisions(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();

        let mut statement = reader.prepare(HISTORY_OF)?;
        statement.set("Id", id)?;
        let mut rows = statement.query()?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(<HistoryEntry as mapper::Mapped>::materialize(&row)?);
        }
        if entries.is_empty() {
            return Err(Error::not_found(format!("document {id}")));
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Folder reads
    // ------------------------------------------------------------------

    /// The folder at `root` (empty means the tree root) and its direct
    /// subfolders, with document counts.
    pub fn folders_for_path(&self, root: &str) -> Result<Vec<FolderInfo>> {
        let at = normalize_path(root);
        let entries = self.folders.content(&at)?;
        Ok(entries
            .into_iter()
            .map(|entry| FolderInfo::new(entry.display, entry.documents))
            .collect())
    }

    /// Every path the document is assigned to. Unknown ids yield an empty
    /// list rather than an error.
    pub fn folders_of(&self, id: &str) -> Result<Vec<String>> {
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();
        Ok(Self::assignments_of(&reader, id)?
            .into_iter()
            .map(|assignment| assignment.path)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_normalize_to_lowercase_root() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("  "), "/");
        assert_eq!(normalize_path("/One/Two"), "/one/two");
        assert_eq!(normalize_path("/already"), "/already");
    }

    #[test]
    fn lock_ownership_is_enforced() {
        let mut document = Document::default();
        assert!(ensure_unlocked_for(&document, "willi").is_ok());

        document.locker = "willi".to_string();
        assert!(ensure_unlocked_for(&document, "willi").is_ok());
        assert!(matches!(
            ensure_unlocked_for(&document, "otto"),
            Err(Error::Lock(_))
        ));
    }

    #[test]
    fn checksums_are_stable_hex() {
        let first = checksum(&[3, 2, 1, 0, 1, 2, 3]);
        let second = checksum(&[3, 2, 1, 0, 1, 2, 3]);
        assert_eq!(first, second);
        assert_eq!(first.len(), 8);
        assert_ne!(first, checksum(&[]));
    }

    #[test]
    fn history_entries_join_actions() {
        let entry = DocumentStorage::history_entry(
            "d1",
            4,
            &[Action::Renamed, Action::Revision],
            "willi",
            "note",
            "",
            "",
        );
        assert_eq!(entry.document, "d1");
        assert_eq!(entry.revision, 4);
        assert_eq!(entry.action, "Renamed;Revision");
        assert_eq!(entry.comment, "note");
        assert!(!entry.id.is_empty());
    }
}
