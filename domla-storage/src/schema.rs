//! Schema bootstrap and entity table bindings
//!
//! Idempotent DDL for the shard databases plus the `Mapped` declarations
//! of the four persistent entities.

use domla_common::error::Result;
use domla_common::types::{Assignment, Content, Document, HistoryEntry};

use crate::mapper::Mapped;
use crate::sqlite::{Connection, RowView, Statement};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS Documents(
        Id TEXT NOT NULL PRIMARY KEY,
        Creator TEXT NOT NULL,
        Created LONG NOT NULL,
        FileName TEXT NOT NULL,
        DisplayName TEXT,
        State INT NOT NULL,
        Locker TEXT,
        Keywords TEXT,
        Size INT
    )",
    "CREATE INDEX IF NOT EXISTS Documents_IDX1 ON Documents(
        Keywords
    )",
    "CREATE TABLE IF NOT EXISTS DocumentTags(
        Tag TEXT NOT NULL PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS DocumentHistories(
        Id TEXT NOT NULL PRIMARY KEY,
        Owner TEXT NOT NULL,
        SeqId INT NOT NULL,
        Created LONG NOT NULL,
        Action TEXT NOT NULL,
        Actor TEXT NOT NULL,
        Comment TEXT,
        Source TEXT,
        Target TEXT,
        FOREIGN KEY(Owner) REFERENCES Documents(Id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS DocumentHistories_IDX1 ON DocumentHistories(
        Owner, SeqId
    )",
    "CREATE TABLE IF NOT EXISTS DocumentAssignments(
        Id TEXT NOT NULL PRIMARY KEY,
        Owner TEXT NOT NULL,
        SeqId INT NOT NULL,
        AssignmentType TEXT,
        AssignmentId TEXT,
        Path TEXT NOT NULL,
        FOREIGN KEY(Owner) REFERENCES DocumentHistories(Id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
    )",
    "CREATE INDEX IF NOT EXISTS DocumentAssignments_IDX1 ON DocumentAssignments(
        Path, Owner
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS DocumentAssignments_IDX2 ON DocumentAssignments(
        Owner, SeqId
    )",
    "CREATE TABLE IF NOT EXISTS DocumentContents(
        Id TEXT NOT NULL PRIMARY KEY,
        Owner TEXT NOT NULL,
        SeqId INT NOT NULL,
        Checksum TEXT NOT NULL,
        Data BLOB NOT NULL,
        FOREIGN KEY(Owner) REFERENCES DocumentHistories(Id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS DocumentContents_IDX1 ON DocumentContents(
        Owner, SeqId
    )",
    "CREATE VIRTUAL TABLE IF NOT EXISTS DocumentMetas USING fts5(
        Owner UNINDEXED,
        Tags
    )",
    "CREATE TRIGGER IF NOT EXISTS Documents_Del AFTER DELETE ON Documents BEGIN
        DELETE FROM DocumentMetas WHERE Owner = old.Id;
    END",
];

/// Create every table, index, virtual table and trigger if missing
pub fn ensure(connection: &Connection) -> Result<()> {
    for sql in SCHEMA {
        connection.execute_batch(sql)?;
    }
    Ok(())
}

impl Mapped for Document {
    const TABLE: &'static str = "Documents";
    const COLUMNS: &'static [&'static str] = &[
        "Id",
        "Creator",
        "Created",
        "FileName",
        "DisplayName",
        "State",
        "Locker",
        "Keywords",
        "Size",
    ];

    fn bind(&self, statement: &mut Statement<'_>) -> Result<()> {
        statement.set("Id", &self.id)?;
        statement.set("Creator", &self.creator)?;
        statement.set("Created", self.created)?;
        statement.set("FileName", &self.file_name)?;
        statement.set("DisplayName", &self.display_name)?;
        statement.set("State", i64::from(self.deleted))?;
        statement.set("Locker", &self.locker)?;
        statement.set("Keywords", &self.keywords)?;
        statement.set("Size", self.size)
    }

    fn materialize(row: &RowView<'_>) -> Result<Self> {
        Ok(Document {
            id: row.get_text("Id")?,
            creator: row.get_text("Creator")?,
            created: row.get_i64("Created")?,
            file_name: row.get_text("FileName")?,
            display_name: row.get_text("DisplayName")?,
            deleted: row.get_int("State")? == 1,
            locker: row.get_text("Locker")?,
            keywords: row.get_text("Keywords")?,
            size: row.get_i64("Size")?,
            ..Document::default()
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Mapped for HistoryEntry {
    const TABLE: &'static str = "DocumentHistories";
    const COLUMNS: &'static [&'static str] = &[
        "Id", "Owner", "SeqId", "Created", "Action", "Actor", "Comment", "Source", "Target",
    ];

    fn bind(&self, statement: &mut Statement<'_>) -> Result<()> {
        statement.set("Id", &self.id)?;
        statement.set("Owner", &self.document)?;
        statement.set("SeqId", self.revision)?;
        statement.set("Created", self.created)?;
        statement.set("Action", &self.action)?;
        statement.set("Actor", &self.actor)?;
        statement.set("Comment", &self.comment)?;
        statement.set("Source", &self.source)?;
        statement.set("Target", &self.target)
    }

    fn materialize(row: &RowView<'_>) -> Result<Self> {
        Ok(HistoryEntry {
            id: row.get_text("Id")?,
            document: row.get_text("Owner")?,
            revision: row.get_i64("SeqId")?,
            created: row.get_i64("Created")?,
            action: row.get_text("Action")?,
            actor: row.get_text("Actor")?,
            comment: row.get_text("Comment")?,
            source: row.get_text("Source")?,
            target: row.get_text("Target")?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Mapped for Assignment {
    const TABLE: &'static str = "DocumentAssignments";
    const COLUMNS: &'static [&'static str] =
        &["Id", "Owner", "SeqId", "AssignmentType", "AssignmentId", "Path"];

    fn bind(&self, statement: &mut Statement<'_>) -> Result<()> {
        statement.set("Id", &self.id)?;
        statement.set("Owner", &self.history)?;
        statement.set("SeqId", self.revision)?;
        statement.set("AssignmentType", &self.assignment_type)?;
        statement.set("AssignmentId", &self.assignment_id)?;
        statement.set("Path", &self.path)
    }

    fn materialize(row: &RowView<'_>) -> Result<Self> {
        Ok(Assignment {
            id: row.get_text("Id")?,
            history: row.get_text("Owner")?,
            revision: row.get_i64("SeqId")?,
            assignment_type: row.get_text("AssignmentType")?,
            assignment_id: row.get_text("AssignmentId")?,
            path: row.get_text("Path")?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl Mapped for Content {
    const TABLE: &'static str = "DocumentContents";
    const COLUMNS: &'static [&'static str] = &["Id", "Owner", "SeqId", "Checksum", "Data"];

    fn bind(&self, statement: &mut Statement<'_>) -> Result<()> {
        statement.set("Id", &self.id)?;
        statement.set("Owner", &self.history)?;
        statement.set("SeqId", self.revision)?;
        statement.set("Checksum", &self.checksum)?;
        statement.set("Data", &self.data)
    }

    fn materialize(row: &RowView<'_>) -> Result<Self> {
        Ok(Content {
            id: row.get_text("Id")?,
            history: row.get_text("Owner")?,
            revision: row.get_i64("SeqId")?,
            checksum: row.get_text("Checksum")?,
            data: row.get_blob("Data")?,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}
