//! Persistence mapper
//!
//! Declares how each entity binds to its table and synthesizes the four
//! default statements (insert, update, delete, select). A `BatchQueue`
//! stages writes and flushes them inside a single transaction, reusing one
//! prepared statement per entity and operation.

use std::collections::HashMap;

use domla_common::error::Result;
use domla_common::types::{Assignment, Content, Document, HistoryEntry};

use crate::sqlite::{Connection, RowView, Statement};

/// Table binding for a persistent entity type. The first column is
/// always `Id`.
pub trait Mapped: Sized {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    /// Bind every column value to the prepared statement
    fn bind(&self, statement: &mut Statement<'_>) -> Result<()>;

    /// Rebuild the entity from a result row
    fn materialize(row: &RowView<'_>) -> Result<Self>;

    fn id(&self) -> &str;
}

pub fn insert_sql<T: Mapped>() -> String {
    let columns = T::COLUMNS.join(", ");
    let values = T::COLUMNS
        .iter()
        .map(|c| format!(":{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", T::TABLE, columns, values)
}

pub fn update_sql<T: Mapped>() -> String {
    let assignments = T::COLUMNS
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case("Id"))
        .map(|c| format!("{c} = :{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("UPDATE {} SET {} WHERE Id = :Id", T::TABLE, assignments)
}

pub fn delete_sql<T: Mapped>() -> String {
    format!("DELETE FROM {} WHERE Id = :Id", T::TABLE)
}

pub fn select_sql<T: Mapped>() -> String {
    format!(
        "SELECT {} FROM {} WHERE Id = :Id",
        T::COLUMNS.join(", "),
        T::TABLE
    )
}

/// Load one entity by id through the default select
pub fn load<T: Mapped>(connection: &Connection, id: &str) -> Result<Option<T>> {
    let mut statement = connection.prepare(&select_sql::<T>())?;
    statement.set("Id", id)?;
    let mut rows = statement.query()?;
    match rows.next()? {
        Some(row) => Ok(Some(T::materialize(&row)?)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Insert,
    Update,
    Delete,
}

/// Closed set of entities the archive persists.
///
/// Dispatching over this enum replaces the process-wide registry of mapper
/// factories: the set of entity types is fixed, so the table is the type
/// system's.
#[derive(Debug, Clone)]
pub enum Record {
    Document(Document),
    History(HistoryEntry),
    Assignment(Assignment),
    Content(Content),
}

impl From<Document> for Record {
    fn from(value: Document) -> Self {
        Record::Document(value)
    }
}

impl From<HistoryEntry> for Record {
    fn from(value: HistoryEntry) -> Self {
        Record::History(value)
    }
}

impl From<Assignment> for Record {
    fn from(value: Assignment) -> Self {
        Record::Assignment(value)
    }
}

impl From<Content> for Record {
    fn from(value: Content) -> Self {
        Record::Content(value)
    }
}

impl Record {
    fn table(&self) -> &'static str {
        match self {
            Record::Document(_) => Document::TABLE,
            Record::History(_) => HistoryEntry::TABLE,
            Record::Assignment(_) => Assignment::TABLE,
            Record::Content(_) => Content::TABLE,
        }
    }

    fn id(&self) -> &str {
        match self {
            Record::Document(item) => item.id(),
            Record::History(item) => item.id(),
            Record::Assignment(item) => item.id(),
            Record::Content(item) => item.id(),
        }
    }

    fn sql(&self, op: Op) -> String {
        match (self, op) {
            (Record::Document(_), Op::Insert) => insert_sql::<Document>(),
            (Record::Document(_), Op::Update) => update_sql::<Document>(),
            (Record::Document(_), Op::Delete) => delete_sql::<Document>(),
            (Record::History(_), Op::Insert) => insert_sql::<HistoryEntry>(),
            (Record::History(_), Op::Update) => update_sql::<HistoryEntry>(),
            (Record::History(_), Op::Delete) => delete_sql::<HistoryEntry>(),
            (Record::Assignment(_), Op::Insert) => insert_sql::<Assignment>(),
            (Record::Assignment(_), Op::Update) => update_sql::<Assignment>(),
            (Record::Assignment(_), Op::Delete) => delete_sql::<Assignment>(),
            (Record::Content(_), Op::Insert) => insert_sql::<Content>(),
            (Record::Content(_), Op::Update) => update_sql::<Content>(),
            (Record::Content(_), Op::Delete) => delete_sql::<Content>(),
        }
    }

    fn bind(&self, statement: &mut Statement<'_>, op: Op) -> Result<()> {
        if op == Op::Delete {
            return statement.set("Id", self.id());
        }
        match self {
            Record::Document(item) => item.bind(statement),
            Record::History(item) => item.bind(statement),
            Record::Assignment(item) => item.bind(statement),
            Record::Content(item) => item.bind(statement),
        }
    }
}

/// Staged inserts, updates and deletes, flushed in one transaction
#[derive(Default)]
pub struct BatchQueue {
    inserts: Vec<Record>,
    updates: Vec<Record>,
    deletes: Vec<Record>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: impl Into<Record>) {
        self.inserts.push(record.into());
    }

    pub fn update(&mut self, record: impl Into<Record>) {
        self.updates.push(record.into());
    }

    pub fn delete(&mut self, record: impl Into<Record>) {
        self.deletes.push(record.into());
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Run every staged operation inside one transaction. A failure rolls
    /// the whole batch back; the queue is drained either way.
    pub fn flush(&mut self, connection: &Connection) -> Result<()> {
        let scope = connection.begin()?;
        let mut cache: HashMap<(&'static str, Op), Statement<'_>> = HashMap::new();

        let deletes = std::mem::take(&mut self.deletes);
        let inserts = std::mem::take(&mut self.inserts);
        let updates = std::mem::take(&mut self.updates);

        for (records, op) in [
            (deletes, Op::Delete),
            (inserts, Op::Insert),
            (updates, Op::Update),
        ] {
            for record in records {
                let key = (record.table(), op);
                if !cache.contains_key(&key) {
                    cache.insert(key, connection.prepare(&record.sql(op))?);
                }
                let statement = cache.get_mut(&key).expect("statement just cached");
                record.bind(statement, op)?;
                statement.execute()?;
            }
        }

        drop(cache);
        scope.commit()
    }
}
