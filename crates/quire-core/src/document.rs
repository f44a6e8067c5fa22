//! Automerge document handling
//!
//! A project is made of two kinds of replicated document:
//!
//! - the structural document, a map of elements (folders, documents,
//!   worldbuilding entries) keyed by element id
//! - one content document per content-bearing element, holding its text
//!
//! Both are plain `AutoCommit` documents. Copying a document between storage
//! contexts is done by encoding the source and applying that update onto the
//! target, which is a no-op for changes the target already has.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use automerge::{transaction::Transactable, AutoCommit, ObjId, ObjType, ReadDoc, ROOT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::ProjectKey;
use crate::storage::{KvStore, Namespace, StorageError};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field type for {0}")]
    InvalidType(String),

    #[error("Unknown element kind: {0}")]
    InvalidKind(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Keys used in the Automerge document structure
mod keys {
    pub const ELEMENTS: &str = "elements";
    pub const BODY: &str = "body";

    // Element fields
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
    pub const PARENT: &str = "parent";
    pub const ORDER: &str = "order";
}

/// Kind of a project element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Folder,
    Document,
    Worldbuilding,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Folder => "folder",
            ElementKind::Document => "document",
            ElementKind::Worldbuilding => "worldbuilding",
        }
    }

    /// Whether elements of this kind own a content document
    pub fn has_content(&self) -> bool {
        matches!(self, ElementKind::Document | ElementKind::Worldbuilding)
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "folder" => Ok(ElementKind::Folder),
            "document" => Ok(ElementKind::Document),
            "worldbuilding" => Ok(ElementKind::Worldbuilding),
            other => Err(DocumentError::InvalidKind(other.to_string())),
        }
    }
}

/// An entry in a project's structural document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub name: String,
    pub kind: ElementKind,
    pub parent: Option<String>,
    pub order: i64,
}

impl Element {
    /// Create an element with a fresh id
    pub fn new(name: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            parent: None,
            order: 0,
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = order;
        self
    }
}

/// The structural document of a project
///
/// The `elements` map is created on first insert rather than up front, so a
/// fresh document can take another document's history without two competing
/// `elements` objects.
pub struct ProjectDocument {
    doc: AutoCommit,
}

impl ProjectDocument {
    /// A document with no history
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    /// Load a document from Automerge bytes
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(Self {
            doc: AutoCommit::load(bytes)?,
        })
    }

    /// Encode the full document as a single update
    pub fn encode(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Apply an update produced by `encode` elsewhere
    ///
    /// Returns the number of operations that were new to this document.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<usize, DocumentError> {
        Ok(self.doc.load_incremental(update)?)
    }

    /// Whether the document holds no elements
    pub fn is_empty(&self) -> bool {
        self.elements_obj()
            .ok()
            .flatten()
            .map_or(true, |obj| self.doc.length(&obj) == 0)
    }

    /// Get the underlying Automerge document (for sync operations)
    pub fn inner(&self) -> &AutoCommit {
        &self.doc
    }

    /// Get the underlying Automerge document mutably
    pub fn inner_mut(&mut self) -> &mut AutoCommit {
        &mut self.doc
    }

    /// Add or replace an element
    pub fn put_element(&mut self, element: &Element) -> Result<(), DocumentError> {
        let elements = self.ensure_elements()?;
        let obj = self.doc.put_object(&elements, element.id.as_str(), ObjType::Map)?;

        self.doc.put(&obj, keys::ID, element.id.clone())?;
        self.doc.put(&obj, keys::NAME, element.name.clone())?;
        self.doc.put(&obj, keys::KIND, element.kind.as_str())?;
        if let Some(ref parent) = element.parent {
            self.doc.put(&obj, keys::PARENT, parent.clone())?;
        }
        self.doc.put(&obj, keys::ORDER, element.order)?;
        Ok(())
    }

    /// Remove an element
    pub fn remove_element(&mut self, id: &str) -> Result<(), DocumentError> {
        let elements = self
            .elements_obj()?
            .ok_or_else(|| DocumentError::ElementNotFound(id.to_string()))?;
        if self.doc.get(&elements, id)?.is_none() {
            return Err(DocumentError::ElementNotFound(id.to_string()));
        }
        self.doc.delete(&elements, id)?;
        Ok(())
    }

    /// Get an element by id
    pub fn element(&self, id: &str) -> Result<Option<Element>, DocumentError> {
        let Some(elements) = self.elements_obj()? else {
            return Ok(None);
        };
        match self.doc.get(&elements, id)? {
            Some((_, obj)) => Ok(Some(self.read_element(&obj, id)?)),
            None => Ok(None),
        }
    }

    /// All elements, ordered by parent, then order, then id
    pub fn elements(&self) -> Result<Vec<Element>, DocumentError> {
        let Some(elements_id) = self.elements_obj()? else {
            return Ok(Vec::new());
        };

        let mut elements = Vec::new();
        for key in self.doc.keys(&elements_id) {
            if let Some((_, obj)) = self.doc.get(&elements_id, &key)? {
                elements.push(self.read_element(&obj, &key)?);
            }
        }
        elements.sort_by(|a, b| {
            (&a.parent, a.order, &a.id).cmp(&(&b.parent, b.order, &b.id))
        });
        Ok(elements)
    }

    /// Elements that own a content document
    pub fn content_elements(&self) -> Result<Vec<Element>, DocumentError> {
        Ok(self
            .elements()?
            .into_iter()
            .filter(|e| e.kind.has_content())
            .collect())
    }

    // ==================== Private helpers ====================

    fn elements_obj(&self) -> Result<Option<ObjId>, DocumentError> {
        Ok(self.doc.get(ROOT, keys::ELEMENTS)?.map(|(_, id)| id))
    }

    fn ensure_elements(&mut self) -> Result<ObjId, DocumentError> {
        match self.elements_obj()? {
            Some(id) => Ok(id),
            None => Ok(self.doc.put_object(ROOT, keys::ELEMENTS, ObjType::Map)?),
        }
    }

    fn read_element(&self, obj: &ObjId, id: &str) -> Result<Element, DocumentError> {
        let kind = self.get_string(obj, keys::KIND)?.parse()?;
        Ok(Element {
            id: id.to_string(),
            name: self.get_string(obj, keys::NAME)?,
            kind,
            parent: self.get_optional_string(obj, keys::PARENT)?,
            order: self.get_i64(obj, keys::ORDER)?.unwrap_or(0),
        })
    }

    fn get_string(&self, obj: &ObjId, key: &str) -> Result<String, DocumentError> {
        match self.doc.get(obj, key)? {
            Some((value, _)) => value
                .to_str()
                .map(|s| s.to_string())
                .ok_or_else(|| DocumentError::InvalidType(key.to_string())),
            None => Err(DocumentError::MissingField(key.to_string())),
        }
    }

    fn get_optional_string(&self, obj: &ObjId, key: &str) -> Result<Option<String>, DocumentError> {
        match self.doc.get(obj, key)? {
            Some((value, _)) => Ok(value.to_str().map(|s| s.to_string())),
            None => Ok(None),
        }
    }

    fn get_i64(&self, obj: &ObjId, key: &str) -> Result<Option<i64>, DocumentError> {
        match self.doc.get(obj, key)? {
            Some((value, _)) => value
                .to_i64()
                .map(Some)
                .ok_or_else(|| DocumentError::InvalidType(key.to_string())),
            None => Ok(None),
        }
    }
}

impl Default for ProjectDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Rich content of a single element
pub struct ContentDocument {
    doc: AutoCommit,
}

impl ContentDocument {
    /// A document with no history
    pub fn new() -> Self {
        Self {
            doc: AutoCommit::new(),
        }
    }

    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(Self {
            doc: AutoCommit::load(bytes)?,
        })
    }

    pub fn encode(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    pub fn apply_update(&mut self, update: &[u8]) -> Result<usize, DocumentError> {
        Ok(self.doc.load_incremental(update)?)
    }

    /// Current body text (empty if never written)
    pub fn text(&self) -> Result<String, DocumentError> {
        match self.doc.get(ROOT, keys::BODY)? {
            Some((_, body)) => Ok(self.doc.text(&body)?),
            None => Ok(String::new()),
        }
    }

    /// Replace the body text
    pub fn set_text(&mut self, text: &str) -> Result<(), DocumentError> {
        let body = match self.doc.get(ROOT, keys::BODY)? {
            Some((_, body)) => body,
            None => self.doc.put_object(ROOT, keys::BODY, ObjType::Text)?,
        };
        let len = self.doc.length(&body) as isize;
        self.doc.splice_text(&body, 0, len, text)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.text().map(|t| t.is_empty()).unwrap_or(true)
    }
}

impl Default for ContentDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads and saves project documents in a record store
///
/// Structural documents live in their context's namespace. Content documents
/// are keyed `owner:slug:element` with no namespace prefix, so they follow a
/// project only through an explicit key rewrite.
#[derive(Clone)]
pub struct DocumentStore {
    kv: Arc<dyn KvStore>,
}

impl DocumentStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Raw bytes of a structural document
    pub fn project_bytes(&self, ns: &Namespace, key: &ProjectKey) -> Result<Option<Vec<u8>>, DocumentError> {
        Ok(self.kv.get(ns, &structure_key(key))?)
    }

    pub fn load_project(&self, ns: &Namespace, key: &ProjectKey) -> Result<Option<ProjectDocument>, DocumentError> {
        match self.project_bytes(ns, key)? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(ProjectDocument::load(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub fn save_project(
        &self,
        ns: &Namespace,
        key: &ProjectKey,
        doc: &mut ProjectDocument,
    ) -> Result<(), DocumentError> {
        let bytes = doc.encode();
        debug!(project = %key, bytes = bytes.len(), "Saving structural document");
        self.kv.put(ns, &structure_key(key), &bytes)?;
        Ok(())
    }

    pub fn delete_project(&self, ns: &Namespace, key: &ProjectKey) -> Result<(), DocumentError> {
        self.kv.delete(ns, &structure_key(key))?;
        Ok(())
    }

    /// Raw bytes of an element's content document
    pub fn content_bytes(&self, key: &ProjectKey, element_id: &str) -> Result<Option<Vec<u8>>, DocumentError> {
        Ok(self.kv.get(&Namespace::Unscoped, &content_key(key, element_id))?)
    }

    pub fn load_content(&self, key: &ProjectKey, element_id: &str) -> Result<Option<ContentDocument>, DocumentError> {
        match self.content_bytes(key, element_id)? {
            Some(bytes) if !bytes.is_empty() => Ok(Some(ContentDocument::load(&bytes)?)),
            _ => Ok(None),
        }
    }

    pub fn save_content(
        &self,
        key: &ProjectKey,
        element_id: &str,
        doc: &mut ContentDocument,
    ) -> Result<(), DocumentError> {
        self.kv
            .put(&Namespace::Unscoped, &content_key(key, element_id), &doc.encode())?;
        Ok(())
    }

    pub fn delete_content(&self, key: &ProjectKey, element_id: &str) -> Result<(), DocumentError> {
        self.kv
            .delete(&Namespace::Unscoped, &content_key(key, element_id))?;
        Ok(())
    }

    /// Delete a project's structural document and the content documents of
    /// every element it lists
    ///
    /// Content documents are shared by every namespace holding the same
    /// project key, so they are kept while another namespace still has a
    /// structural document for it. A structural document that no longer
    /// decodes is treated as listing no elements. Returns the number of
    /// content documents removed.
    pub fn delete_all(&self, ns: &Namespace, key: &ProjectKey) -> Result<usize, DocumentError> {
        let element_ids = self.listed_content_ids(ns, key)?;
        self.delete_project(ns, key)?;

        if self.held_elsewhere(key)? {
            debug!(project = %key, "Content documents still referenced by another namespace");
            return Ok(0);
        }
        for element_id in &element_ids {
            self.delete_content(key, element_id)?;
        }
        Ok(element_ids.len())
    }

    /// Ids of the content-bearing elements a structural document lists
    ///
    /// Storage failures propagate; an undecodable document yields no ids.
    fn listed_content_ids(&self, ns: &Namespace, key: &ProjectKey) -> Result<Vec<String>, DocumentError> {
        let doc = match self.load_project(ns, key) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(Vec::new()),
            Err(DocumentError::Storage(e)) => return Err(DocumentError::Storage(e)),
            Err(e) => {
                warn!(project = %key, namespace = %ns, error = %e, "Structural document is corrupt, ignoring it");
                return Ok(Vec::new());
            }
        };
        match doc.content_elements() {
            Ok(elements) => Ok(elements.into_iter().map(|e| e.id).collect()),
            Err(e) => {
                warn!(project = %key, namespace = %ns, error = %e, "Unreadable elements in structural document, ignoring them");
                Ok(Vec::new())
            }
        }
    }

    /// Whether any namespace still has a structural document for `key`
    fn held_elsewhere(&self, key: &ProjectKey) -> Result<bool, DocumentError> {
        let suffix = structure_key(key);
        for prefix in [Namespace::Local.prefix(), "srv:".to_string()] {
            let held = self
                .kv
                .scan_prefix(&Namespace::Unscoped, &prefix)?
                .iter()
                .any(|(k, _)| k.ends_with(&suffix) && k.len() > suffix.len());
            if held {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Copy every document of a project to a new key within one namespace
    ///
    /// Used when a project's identity changes (re-key after remote creation).
    pub fn copy_project(&self, ns: &Namespace, from: &ProjectKey, to: &ProjectKey) -> Result<(), DocumentError> {
        let Some(bytes) = self.project_bytes(ns, from)? else {
            return Ok(());
        };
        let doc = ProjectDocument::load(&bytes)?;
        let mut content: HashMap<String, Vec<u8>> = HashMap::new();
        for element in doc.content_elements()? {
            if let Some(body) = self.content_bytes(from, &element.id)? {
                content.insert(element.id, body);
            }
        }

        self.kv.put(ns, &structure_key(to), &bytes)?;
        for (element_id, body) in content {
            self.kv
                .put(&Namespace::Unscoped, &content_key(to, &element_id), &body)?;
        }
        Ok(())
    }
}

fn structure_key(key: &ProjectKey) -> String {
    format!("doc:{}:elements", key.storage_id())
}

fn content_key(key: &ProjectKey, element_id: &str) -> String {
    format!("{}:{}", key.storage_id(), element_id)
}
