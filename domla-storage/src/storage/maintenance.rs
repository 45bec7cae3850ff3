//! Backup, restore and full-text rebuild

use std::path::Path;

use tracing::info;

use domla_common::error::{Error, Result};

use crate::sqlite::Connection;

use super::DocumentStorage;

const IMPORT: &str = "DELETE FROM DocumentMetas;
     DELETE FROM DocumentContents;
     DELETE FROM DocumentAssignments;
     DELETE FROM DocumentHistories;
     DELETE FROM Documents;
     DELETE FROM DocumentTags;
     INSERT INTO Documents SELECT * FROM backup.Documents;
     INSERT INTO DocumentTags SELECT * FROM backup.DocumentTags;
     INSERT INTO DocumentHistories SELECT * FROM backup.DocumentHistories;
     INSERT INTO DocumentAssignments SELECT * FROM backup.DocumentAssignments;
     INSERT INTO DocumentContents SELECT * FROM backup.DocumentContents;
     INSERT INTO DocumentMetas (Owner, Tags) SELECT Owner, Tags FROM backup.DocumentMetas;";

impl DocumentStorage {
    /// Snapshot every shard into `target`, one `NNNdomla.archive` file per
    /// shard, each written under the shard's write lock.
    pub fn backup(&self, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target)?;
        info!("backing up {} shard(s) to {target:?}", self.pool.shards().len());

        for shard in self.pool.shards() {
            let file = target.join(format!("{:03}domla.archive", shard.number()));
            if file.exists() {
                std::fs::remove_file(&file)?;
            }

            let writer = shard.writer();
            let mut statement = writer.prepare("VACUUM INTO :Target")?;
            statement.set("Target", file.to_string_lossy().as_ref())?;
            statement.execute()?;
        }
        Ok(())
    }

    /// Replace every shard's content with the snapshot in `source`, then
    /// rebuild the in-memory folder tree.
    pub fn restore(&self, source: &Path) -> Result<()> {
        info!("restoring {} shard(s) from {source:?}", self.pool.shards().len());

        for shard in self.pool.shards() {
            let file = source.join(format!("{:03}domla.archive", shard.number()));
            if !file.is_file() {
                return Err(Error::not_found(format!("backup file {file:?}")));
            }

            let writer = shard.writer();
            let mut attach = writer.prepare("ATTACH DATABASE :Source AS backup")?;
            attach.set("Source", file.to_string_lossy().as_ref())?;
            attach.execute()?;
            drop(attach);

            let imported = Self::import_attached(&writer);
            let detached = writer.execute_batch("DETACH DATABASE backup");
            imported?;
            detached?;
        }

        self.folders.clear();
        Self::build_folder_tree(&self.pool, &self.folders)
    }

    fn import_attached(connection: &Connection) -> Result<()> {
        let scope = connection.begin()?;
        connection.execute_batch(IMPORT)?;
        scope.commit()
    }

    /// Re-index every live document's words into the external full-text
    /// index, replacing its previous state.
    pub fn rebuild_fulltext(&self) -> Result<()> {
        self.fulltext.clear()?;

        let entries = self.pool.fan_out(|reader| {
            let mut statement = reader.prepare(
                "SELECT Id, FileName, DisplayName, Keywords FROM Documents WHERE State = 0",
            )?;
            let mut rows = statement.query()?;

            let mut partial = Vec::new();
            while let Some(row) = rows.next()? {
                let id = row.get_text("Id")?;
                let mut words: Vec<String> = Vec::new();
                for source in [
                    row.get_text("FileName")?,
                    row.get_text("DisplayName")?,
                    row.get_text("Keywords")?,
                ] {
                    words.extend(source.split_whitespace().map(str::to_string));
                }
                partial.push((id, words));
            }
            Ok(partial)
        })?;

        let count = entries.len();
        for (id, words) in entries {
            self.fulltext.index(&id, &words)?;
        }

        info!("full-text index rebuilt over {count} document(s)");
        Ok(())
    }
}
