//! In-memory virtual folder tree
//!
//! A counted tree mirroring the folder-path assignments on disk. Nodes live
//! in an arena and reference each other by index, so parent links need no
//! shared ownership; pruning returns slots to a free list. All operations
//! are linearized under a single mutex.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use domla_common::error::{Error, Result};
use domla_common::types::FolderInfo;
use domla_common::utils::split_path;

type NodeId = usize;

const ROOT: NodeId = 0;

/// A folder node plus the counts of items living directly in it.
/// `documents` counts regular documents, `references` directory-class items.
struct Node {
    name: String,
    parent: Option<NodeId>,
    documents: i64,
    references: i64,
    display: Option<String>,
    children: BTreeMap<String, NodeId>,
}

impl Node {
    fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            documents: 0,
            references: 0,
            display: None,
            children: BTreeMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.documents == 0 && self.references == 0 && self.children.is_empty()
    }
}

/// One folder with its qualified display name, as handed to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path segment ("/" for the root)
    pub name: String,
    pub documents: i64,
    /// Full path from the root
    pub display: String,
}

struct TreeInner {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
}

impl TreeInner {
    fn new() -> Self {
        Self {
            nodes: vec![Node::new("/", None)],
            free: Vec::new(),
        }
    }

    fn allocate(&mut self, name: &str, parent: NodeId) -> NodeId {
        let node = Node::new(name, Some(parent));
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    /// Walk to `path`, creating missing nodes
    fn walk_create(&mut self, path: &str) -> NodeId {
        let mut cursor = ROOT;
        for part in split_path(path, '/') {
            cursor = match self.nodes[cursor].children.get(&part) {
                Some(&child) => child,
                None => self.allocate(&part, cursor),
            };
        }
        cursor
    }

    /// Walk to `path`; unknown paths are an error
    fn walk(&self, path: &str) -> Result<NodeId> {
        let mut cursor = ROOT;
        for part in split_path(path, '/') {
            cursor = *self.nodes[cursor]
                .children
                .get(&part)
                .ok_or_else(|| Error::not_found(format!("folder {path}")))?;
        }
        Ok(cursor)
    }

    /// Qualified name, computed on first use and cached
    fn display(&mut self, id: NodeId) -> String {
        if let Some(cached) = &self.nodes[id].display {
            return cached.clone();
        }

        let mut display = self.nodes[id].name.clone();
        let mut cursor = self.nodes[id].parent;
        while let Some(parent) = cursor {
            let name = &self.nodes[parent].name;
            display = if name != "/" {
                format!("{name}/{display}")
            } else {
                format!("/{display}")
            };
            cursor = self.nodes[parent].parent;
        }

        self.nodes[id].display = Some(display.clone());
        display
    }

    /// Drop empty nodes from `id` upward until a non-empty one or the root
    fn prune(&mut self, mut id: NodeId) {
        while id != ROOT && self.nodes[id].is_empty() {
            let parent = self.nodes[id].parent.expect("non-root node has a parent");
            let name = self.nodes[id].name.clone();
            self.nodes[parent].children.remove(&name);
            self.free.push(id);
            id = parent;
        }
    }

    fn entry(&mut self, id: NodeId) -> TreeEntry {
        TreeEntry {
            name: self.nodes[id].name.clone(),
            documents: self.nodes[id].documents,
            display: self.display(id),
        }
    }
}

/// The tree itself; all public operations lock the arena
pub struct VirtualTree {
    inner: Mutex<TreeInner>,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTree {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner::new()),
        }
    }

    /// Bulk-build from (path, count) pairs; the terminal node of each path
    /// takes the supplied document count.
    pub fn load(&self, entries: &[FolderInfo]) {
        let mut inner = self.inner.lock();
        for entry in entries {
            let node = inner.walk_create(&entry.name);
            inner.nodes[node].documents = entry.documents;
        }
    }

    /// Bulk-add directory-class reference counts
    pub fn load_references(&self, entries: &[FolderInfo]) {
        let mut inner = self.inner.lock();
        for entry in entries {
            let node = inner.walk_create(&entry.name);
            inner.nodes[node].references += entry.documents;
        }
    }

    pub fn add(&self, path: &str) {
        let mut inner = self.inner.lock();
        let node = inner.walk_create(path);
        inner.nodes[node].documents += 1;
    }

    pub fn add_uncounted(&self, path: &str) {
        let mut inner = self.inner.lock();
        let node = inner.walk_create(path);
        inner.nodes[node].references += 1;
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let node = inner.walk(path)?;
        inner.nodes[node].documents -= 1;
        inner.prune(node);
        Ok(())
    }

    pub fn remove_uncounted(&self, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let node = inner.walk(path)?;
        inner.nodes[node].references -= 1;
        inner.prune(node);
        Ok(())
    }

    /// The folder at `path` followed by its direct children
    pub fn content(&self, path: &str) -> Result<Vec<TreeEntry>> {
        let mut inner = self.inner.lock();
        let node = inner.walk(path)?;

        let mut result = vec![inner.entry(node)];
        let children: Vec<NodeId> = inner.nodes[node].children.values().copied().collect();
        for child in children {
            let entry = inner.entry(child);
            result.push(entry);
        }
        Ok(result)
    }

    pub fn root(&self) -> TreeEntry {
        let mut inner = self.inner.lock();
        inner.entry(ROOT)
    }

    /// Forget everything except the root; used when restoring a backup
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = TreeInner::new();
    }
}
