//! Meta-tag handling
//!
//! Meta data arrives as record-separator separated `key=value` tokens. The
//! key parts feed the per-shard global tag set, the raw string goes into
//! the FTS table for `find_metadata`.

use domla_common::error::{Error, Result};
use domla_common::types::META_TAG_SEPARATOR;

use crate::identity::deny_view_only;
use crate::sqlite::Connection;

use super::DocumentStorage;

fn tokens_of(data: &str) -> Vec<String> {
    data.split(META_TAG_SEPARATOR)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn key_of(token: &str) -> &str {
    token.split('=').next().unwrap_or(token)
}

fn insert_meta(connection: &Connection, id: &str, data: &str, tokens: &[String]) -> Result<()> {
    for token in tokens {
        let mut register = connection
            .prepare("INSERT OR IGNORE INTO DocumentTags (Tag) VALUES (:Tag)")?;
        register.set("Tag", key_of(token))?;
        register.execute()?;
    }

    let mut insert =
        connection.prepare("INSERT INTO DocumentMetas (Owner, Tags) VALUES (:Owner, :Tags)")?;
    insert.set("Owner", id)?;
    insert.set("Tags", data)?;
    insert.execute()
}

impl DocumentStorage {
    /// Attach meta tags to a document. The string must carry at least one
    /// token.
    pub fn assign_metadata(&self, id: &str, data: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let tokens = tokens_of(data);
        if tokens.is_empty() {
            return Err(Error::Invalid("empty meta data".into()));
        }

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();
        Self::fetch_required(&writer, id)?;

        let scope = writer.begin()?;
        insert_meta(&writer, id, data, &tokens)?;
        scope.commit()
    }

    /// Replace every meta tag of the document; an empty string clears them
    pub fn replace_metadata(&self, id: &str, data: &str, user: &str) -> Result<()> {
        deny_view_only(user)?;

        let tokens = tokens_of(data);

        let shard = self.pool.shard_for(id)?;
        let writer = shard.writer();
        Self::fetch_required(&writer, id)?;

        let scope = writer.begin()?;
        {
            let mut wipe = writer.prepare("DELETE FROM DocumentMetas WHERE Owner = :Owner")?;
            wipe.set("Owner", id)?;
            wipe.execute()?;
        }
        if !tokens.is_empty() {
            insert_meta(&writer, id, data, &tokens)?;
        }
        scope.commit()
    }

    /// Every known tag name, merged over all shards
    pub fn list_meta_tags(&self) -> Result<Vec<String>> {
        let mut tags = self.pool.fan_out(|reader| {
            let mut statement = reader.prepare("SELECT Tag FROM DocumentTags")?;
            let mut rows = statement.query()?;
            let mut partial = Vec::new();
            while let Some(row) = rows.next()? {
                partial.push(row.get_text("Tag")?);
            }
            Ok(partial)
        })?;

        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// The meta-tag tokens attached to one document
    pub fn list_meta_tags_of(&self, id: &str) -> Result<Vec<String>> {
        let shard = self.pool.shard_for(id)?;
        let reader = shard.reader();

        let mut statement = reader.prepare("SELECT Tags FROM DocumentMetas WHERE Owner = :Owner")?;
        statement.set("Owner", id)?;
        let mut rows = statement.query()?;

        let mut tags = Vec::new();
        while let Some(row) = rows.next()? {
            tags.extend(tokens_of(&row.get_text("Tags")?));
        }
        tags.sort();
        tags.dedup();
        Ok(tags)
    }
}
