//! External full-text index
//!
//! A write-only sink next to the shard databases. The archive does not
//! touch it on the save path; it is filled by `rebuild_fulltext` and can
//! answer word queries once populated.

use std::path::Path;

use parking_lot::RwLock;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use tracing::info;

use domla_common::config::ArchiveConfig;
use domla_common::error::{Error, Result};

const SEARCH_LIMIT: usize = 10;
const WRITER_HEAP_BYTES: usize = 50_000_000;

fn engine(context: &str, error: impl std::fmt::Display) -> Error {
    Error::engine(format!("fulltext {context}: {error}"), -1)
}

/// Word index over document metadata, keyed by document id
pub struct FulltextIndex {
    index: Index,
    reader: IndexReader,
    writer: RwLock<IndexWriter>,
    id_field: Field,
    words_field: Field,
}

impl FulltextIndex {
    /// Open (or create) the index configured for the archive
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let words_field = schema_builder.add_text_field("words", TEXT);
        let schema = schema_builder.build();

        let index = if config.is_in_memory() {
            Index::create_in_ram(schema)
        } else {
            let location = config.fulltext_path();
            std::fs::create_dir_all(&location)?;
            info!("opening full-text index at {location:?}");
            Self::open_in_dir(&location, schema)?
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e| engine("reader", e))?;

        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .map_err(|e| engine("writer", e))?;

        Ok(Self {
            index,
            reader,
            writer: RwLock::new(writer),
            id_field,
            words_field,
        })
    }

    fn open_in_dir(location: &Path, schema: Schema) -> Result<Index> {
        Index::create_in_dir(location, schema.clone())
            .or_else(|_| Index::open_in_dir(location))
            .map_err(|e| engine("open", e))
    }

    /// Replace the indexed words of one document
    pub fn index(&self, id: &str, words: &[String]) -> Result<()> {
        let mut writer = self.writer.write();

        let term = tantivy::Term::from_field_text(self.id_field, id);
        writer.delete_term(term);
        writer
            .add_document(doc!(
                self.id_field => id,
                self.words_field => words.join(" ")
            ))
            .map_err(|e| engine("add", e))?;
        writer.commit().map_err(|e| engine("commit", e))?;
        drop(writer);

        self.reader.reload().map_err(|e| engine("reload", e))
    }

    /// Word query, OR-combined, best ten matches in relevance order
    pub fn search(&self, words: &[String]) -> Result<Vec<String>> {
        let searcher = self.reader.searcher();

        let parser = QueryParser::for_index(&self.index, vec![self.words_field]);
        let expression = words.join(" OR ");
        let query = parser
            .parse_query(&expression)
            .map_err(|e| engine("query", e))?;

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(SEARCH_LIMIT))
            .map_err(|e| engine("search", e))?;

        let mut result = Vec::new();
        for (_score, address) in top_docs {
            let document: TantivyDocument =
                searcher.doc(address).map_err(|e| engine("fetch", e))?;
            let id = document
                .get_first(self.id_field)
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            result.push(id);
        }

        Ok(result)
    }

    /// Drop every indexed document; used before a rebuild
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.write();
        writer.delete_all_documents().map_err(|e| engine("clear", e))?;
        writer.commit().map_err(|e| engine("commit", e))?;
        drop(writer);

        self.reader.reload().map_err(|e| engine("reload", e))
    }
}
