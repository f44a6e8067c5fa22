//! Binding live documents to project stores
//!
//! `DocumentPersistence` is the server's only path to disk. A connection goes
//! through three steps:
//!
//! 1. `authorize` claims or checks ownership of the document name
//! 2. `bind` merges the stored update log into the live document, writes a
//!    baseline snapshot, and returns an [`UpdateLog`] that appends every later
//!    change
//! 3. `write_state` stores a full snapshot when the last connection leaves
//!
//! ```ignore
//! let persistence = DocumentPersistence::new(StoreRegistry::new(data_dir));
//! let name = persistence.authorize("project:alice:novel:elements", "alice")?;
//!
//! let mut doc = AutoCommit::new();
//! let mut log = persistence.bind(&name, &mut doc)?;
//! // ... apply remote changes to doc ...
//! log.persist(&mut doc)?;
//! ```

use std::sync::Arc;

use automerge::{AutoCommit, ChangeHash};
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, PersistenceResult};
use crate::name::DocumentName;
use crate::store::{ProjectStore, StoreRegistry};

/// Append-only writer for one bound document
///
/// Tracks the heads already on disk so each `persist` writes only the
/// changes made since the previous one.
pub struct UpdateLog {
    name: DocumentName,
    store: Arc<ProjectStore>,
    persisted_heads: Vec<ChangeHash>,
}

impl UpdateLog {
    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Append any changes not yet on disk
    ///
    /// Returns whether anything was written.
    pub fn persist(&mut self, doc: &mut AutoCommit) -> PersistenceResult<bool> {
        let heads = doc.get_heads();
        if heads == self.persisted_heads {
            return Ok(false);
        }

        let update = doc.save_after(&self.persisted_heads);
        if !update.is_empty() {
            self.store.append_update(&self.name.to_string(), &update)?;
            debug!(document = %self.name, bytes = update.len(), "Appended update");
        }
        self.persisted_heads = heads;
        Ok(true)
    }
}

/// Server-side persistence for network-synchronised documents
pub struct DocumentPersistence {
    stores: StoreRegistry,
}

impl DocumentPersistence {
    pub fn new(stores: StoreRegistry) -> Self {
        Self { stores }
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Parse a document name and check `identity` may open it
    ///
    /// The first identity to open a never-seen name becomes its permanent
    /// owner. Anyone else gets `OwnershipViolation`.
    pub fn authorize(&self, raw_name: &str, identity: &str) -> PersistenceResult<DocumentName> {
        let name = DocumentName::parse(raw_name)?;
        let store = self.stores.store_for(&name)?;

        let owner = store.claim_owner(raw_name, identity)?;
        if owner != identity {
            warn!(document = %name, identity, owner = %owner, "Rejected non-owner");
            return Err(PersistenceError::OwnershipViolation {
                document: name.to_string(),
                owner,
            });
        }
        Ok(name)
    }

    /// Load the stored history of `name` into `doc` and start logging it
    pub fn bind(&self, name: &DocumentName, doc: &mut AutoCommit) -> PersistenceResult<UpdateLog> {
        let store = self.stores.store_for(name)?;
        let key = name.to_string();

        let updates = store.load_updates(&key)?;
        for update in &updates {
            doc.load_incremental(update)
                .map_err(|source| PersistenceError::Document {
                    document: key.clone(),
                    source,
                })?;
        }

        // Baseline: one snapshot replaces whatever log led here
        store.replace_updates(&key, &doc.save())?;

        info!(document = %name, updates = updates.len(), "Bound document");
        Ok(UpdateLog {
            name: name.clone(),
            persisted_heads: doc.get_heads(),
            store,
        })
    }

    /// Store a full snapshot of `doc`
    ///
    /// Used when a document is released. The update log already holds every
    /// change, so this only compacts it.
    pub fn write_state(&self, log: &mut UpdateLog, doc: &mut AutoCommit) -> PersistenceResult<()> {
        let key = log.name.to_string();
        log.store.replace_updates(&key, &doc.save())?;
        log.persisted_heads = doc.get_heads();
        debug!(document = %log.name, "Wrote document snapshot");
        Ok(())
    }
}
