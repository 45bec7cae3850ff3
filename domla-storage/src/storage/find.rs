//! Search operations, fanned out over every shard reader

use domla_common::error::{Error, Result};
use domla_common::types::{Document, META_TAG_SEPARATOR};
use domla_common::utils::split_path;

use crate::mapper::Mapped;
use crate::sqlite::Connection;

use super::{normalize_path, DocumentStorage};

const HEADER_SELECT: &str =
    "SELECT d.Id, d.Creator, d.Created, d.FileName, d.DisplayName, d.State, \
            d.Locker, d.Keywords, d.Size \
     FROM Documents d";

const ASSIGNED_AT: &str = "EXISTS (\
     SELECT 1 FROM DocumentAssignments a \
     JOIN DocumentHistories h ON a.Owner = h.Id \
     WHERE h.Owner = d.Id AND a.Path = :Path)";

/// Fill the non-header fields from the history and assignment rows
pub(super) fn decorate(connection: &Connection, document: &mut Document) -> Result<()> {
    document.revision = DocumentStorage::latest_revision(connection, &document.id)?;

    if let Some(assignment) = DocumentStorage::assignments_of(connection, &document.id)?
        .into_iter()
        .last()
    {
        document.folder_path = assignment.path;
        document.associated_item = assignment.assignment_id;
        document.associated_class = assignment.assignment_type;
    }
    Ok(())
}

/// Run a header query with the given named bindings and decorate every hit
fn query_documents(
    connection: &Connection,
    sql: &str,
    bindings: &[(String, String)],
) -> Result<Vec<Document>> {
    let mut statement = connection.prepare(sql)?;
    for (name, value) in bindings {
        statement.set(name.as_str(), value.as_str())?;
    }

    let mut found = Vec::new();
    {
        let mut rows = statement.query()?;
        while let Some(row) = rows.next()? {
            found.push(<Document as Mapped>::materialize(&row)?);
        }
    }

    for document in &mut found {
        decorate(connection, document)?;
    }
    Ok(found)
}

/// OR-combined LIKE clauses over one column, one binding per word
fn like_any(column: &str, words: &str) -> Option<(String, Vec<(String, String)>)> {
    let words: Vec<&str> = words.split_whitespace().collect();
    if words.is_empty() {
        return None;
    }

    let mut clauses = Vec::new();
    let mut bindings = Vec::new();
    for (index, word) in words.iter().enumerate() {
        clauses.push(format!("{column} LIKE :W{index}"));
        bindings.push((format!("W{index}"), format!("%{word}%")));
    }
    Some((clauses.join(" OR "), bindings))
}

impl DocumentStorage {
    /// Exact, case-insensitive file name lookup within one folder
    pub fn find(&self, folder_path: &str, file_name: &str) -> Result<Option<Document>> {
        let path = normalize_path(folder_path);
        let sql = format!(
            "{HEADER_SELECT} WHERE LOWER(d.FileName) = LOWER(:Name) AND {ASSIGNED_AT}"
        );
        let bindings = vec![
            ("Name".to_string(), file_name.to_string()),
            ("Path".to_string(), path),
        ];

        let mut found = self
            .pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))?;
        Ok(if found.is_empty() {
            None
        } else {
            Some(found.swap_remove(0))
        })
    }

    /// Exact, case-insensitive display title lookup within one folder
    pub fn find_title(&self, folder_path: &str, display_name: &str) -> Result<Vec<Document>> {
        let path = normalize_path(folder_path);
        let sql = format!(
            "{HEADER_SELECT} WHERE LOWER(d.DisplayName) = LOWER(:Display) AND {ASSIGNED_AT}"
        );
        let bindings = vec![
            ("Display".to_string(), display_name.to_string()),
            ("Path".to_string(), path),
        ];

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }

    /// Documents whose keywords contain any of the given words
    pub fn find_keywords(&self, words: &str) -> Result<Vec<Document>> {
        let Some((clause, bindings)) = like_any("d.Keywords", words) else {
            return Ok(Vec::new());
        };
        let sql = format!("{HEADER_SELECT} WHERE {clause}");

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }

    /// Documents whose file name contains any of the given words
    pub fn find_filenames(&self, words: &str) -> Result<Vec<Document>> {
        let Some((clause, bindings)) = like_any("d.FileName", words) else {
            return Ok(Vec::new());
        };
        let sql = format!("{HEADER_SELECT} WHERE {clause}");

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }

    /// Documents whose file name matches the regular expression
    pub fn find_filename_match(&self, expression: &str) -> Result<Vec<Document>> {
        let sql = format!("{HEADER_SELECT} WHERE d.FileName REGEXP :Pattern");
        let bindings = vec![("Pattern".to_string(), expression.to_string())];

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }

    /// Soft-deleted documents below `root`, at most `depth` folder levels
    /// deeper; `None` searches the whole subtree.
    pub fn find_deleted(&self, root: &str, depth: Option<i64>) -> Result<Vec<Document>> {
        let at = normalize_path(root);

        let mut sql = format!(
            "SELECT DISTINCT d.Id, d.Creator, d.Created, d.FileName, d.DisplayName, \
                    d.State, d.Locker, d.Keywords, d.Size \
             FROM Documents d \
             JOIN DocumentHistories h ON h.Owner = d.Id \
             JOIN DocumentAssignments a ON a.Owner = h.Id \
             WHERE d.State = 1 AND a.Path LIKE :Root || '%'"
        );
        let mut bindings = vec![("Root".to_string(), at.clone())];

        if let Some(levels) = depth {
            let base = split_path(&at, '/').len() as i64;
            sql.push_str(" AND PARTSCOUNT(a.Path, '/') - :Base <= :Depth");
            bindings.push(("Base".to_string(), base.to_string()));
            bindings.push(("Depth".to_string(), levels.to_string()));
        }

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }

    /// Documents carrying every one of the given meta tags. Tags arrive as
    /// record-separator separated `key=value` tokens; each token is
    /// matched as a prefix against the indexed tag rows.
    pub fn find_metadata(&self, tags: &str) -> Result<Vec<Document>> {
        let tokens: Vec<&str> = tags
            .split(META_TAG_SEPARATOR)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(Error::Invalid("no meta tags given".into()));
        }

        let expression = tokens
            .iter()
            .map(|token| format!("\"{token}\"*"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let sql = format!(
            "{HEADER_SELECT} WHERE d.Id IN \
             (SELECT Owner FROM DocumentMetas WHERE DocumentMetas MATCH :Expression)"
        );
        let bindings = vec![("Expression".to_string(), expression)];

        self.pool
            .fan_out(|reader| query_documents(reader, &sql, &bindings))
    }
}
