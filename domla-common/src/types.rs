//! Domain type definitions for the Domla archive

use serde::{Deserialize, Serialize};

/// Tick timestamp: 100ns intervals since 0001-01-01T00:00:00Z
pub type Ticks = i64;

/// Login of the reserved read-only user; every mutation by it is denied
pub const VIEW_ONLY_USER: &str = "viewonly";

/// Reserved file name marking a directory-class item. Such items are
/// tracked as references in the folder tree, not as documents.
pub const FOLDER_ITEM_NAME: &str = "folder.info";

/// Root folder path
pub const ROOT_FOLDER: &str = "/";

/// Separator between meta-tag tokens (ASCII record separator)
pub const META_TAG_SEPARATOR: char = '\x1e';

// ============================================================================
// Entities
// ============================================================================

/// Document header.
///
/// `revision`, `folder_path`, `associated_item` and `associated_class` are
/// not columns of the header table; they are filled from the history and
/// assignment rows when a document is looked up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Login of the creating user
    pub creator: String,
    pub created: Ticks,
    /// Raw file name
    pub file_name: String,
    /// Human readable title
    pub display_name: String,
    /// Soft-delete flag (row state 1)
    pub deleted: bool,
    /// Login of the locking user, empty when unlocked
    pub locker: String,
    /// Free text keywords
    pub keywords: String,
    /// Byte length of the newest content
    pub size: i64,

    /// Latest history sequence number
    pub revision: i64,
    /// Folder path of the latest assignment
    pub folder_path: String,
    /// Item associated with the latest assignment
    pub associated_item: String,
    /// Class of the associated item
    pub associated_class: String,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            id: String::new(),
            creator: String::new(),
            created: 0,
            file_name: String::new(),
            display_name: String::new(),
            deleted: false,
            locker: String::new(),
            keywords: String::new(),
            size: 0,
            revision: 0,
            folder_path: ROOT_FOLDER.to_string(),
            associated_item: String::new(),
            associated_class: String::new(),
        }
    }
}

impl Document {
    /// True when this header represents a directory-class item
    pub fn is_folder_item(&self) -> bool {
        self.file_name == FOLDER_ITEM_NAME
    }
}

/// One append-only history row recording a change to a document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    /// Owning document id
    pub document: String,
    /// Dense 1-based sequence number per document
    pub revision: i64,
    pub created: Ticks,
    /// One or more `Action` names, `;`-joined
    pub action: String,
    /// Login of the acting user
    pub actor: String,
    pub comment: String,
    pub source: String,
    pub target: String,
}

/// A (document, folder-path) association at a given revision
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    /// Owning history entry id
    pub history: String,
    pub revision: i64,
    pub assignment_type: String,
    pub assignment_id: String,
    /// Folder path, always lower-cased
    pub path: String,
}

/// Stored content row: verbatim bytes for the newest revision, a reverse
/// patch for every older one
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    /// Owning history entry id
    pub history: String,
    pub revision: i64,
    pub checksum: String,
    pub data: Vec<u8>,
}

/// Qualified folder name and the count of contained documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub name: String,
    pub documents: i64,
}

impl FolderInfo {
    pub fn new(name: impl Into<String>, documents: i64) -> Self {
        Self {
            name: name.into(),
            documents,
        }
    }
}

// ============================================================================
// History actions
// ============================================================================

/// The recorded kinds of document changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Deleted,
    Recovered,
    Renamed,
    Retitled,
    Keywords,
    Revision,
    Moved,
    Linked,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Created => "Created",
            Action::Deleted => "Deleted",
            Action::Recovered => "Recovered",
            Action::Renamed => "Renamed",
            Action::Retitled => "Retitled",
            Action::Keywords => "Keywords",
            Action::Revision => "Revision",
            Action::Moved => "Moved",
            Action::Linked => "Linked",
        }
    }

    /// Join several actions into the stored `;`-separated form
    pub fn join(actions: &[Action]) -> String {
        actions
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
