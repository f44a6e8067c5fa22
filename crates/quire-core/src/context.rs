//! Storage contexts
//!
//! A storage context is an isolation domain: local-only mode, or one remote
//! server. Every context maps to exactly one [`Namespace`] and every other
//! component receives the context explicitly as a [`ContextHandle`] rather
//! than reading the active pointer, which lets migration hold a source and a
//! target context at the same time.
//!
//! Remote context ids are the first 8 hex digits of the SHA-256 of the
//! normalized endpoint, so configuring the same server twice (with a trailing
//! slash, an upper-case scheme or an explicit default port) never fragments
//! its data.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::storage::{get_json, put_json, scan_json, KvStore, Namespace, StorageError};

/// Id of the local-only context
pub const LOCAL_CONTEXT_ID: &str = "local";

const DESCRIPTOR_PREFIX: &str = "descriptor:";
const ACTIVE_KEY: &str = "active";
const TOKEN_KEY: &str = "auth:token";

/// Errors raised by context management
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid server endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Unsupported endpoint scheme '{0}': use http, https, ws or wss")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Identifier of a storage context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    /// The local sentinel
    pub fn local() -> Self {
        Self(LOCAL_CONTEXT_ID.to_string())
    }

    /// Id for an already-normalized endpoint
    pub fn for_normalized_endpoint(normalized: &str) -> Self {
        let digest = Sha256::digest(normalized.as_bytes());
        Self(hex::encode(&digest[..4]))
    }

    /// Id for a raw endpoint string
    pub fn for_endpoint(endpoint: &str) -> Result<Self, ContextError> {
        Ok(Self::for_normalized_endpoint(&normalize_endpoint(endpoint)?))
    }

    /// Wrap a stored id string
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_CONTEXT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of storage context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Local,
    Remote,
}

/// Profile of the signed-in user, cached from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedProfile {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Server version information, cached from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server_version: String,
    #[serde(default)]
    pub min_client_version: Option<String>,
}

/// A configured storage context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageContextDescriptor {
    pub id: ContextId,
    pub kind: ContextKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub cached_profile: Option<CachedProfile>,
    #[serde(default)]
    pub cached_version_info: Option<VersionInfo>,
    pub added_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl StorageContextDescriptor {
    fn local() -> Self {
        let now = Utc::now();
        Self {
            id: ContextId::local(),
            kind: ContextKind::Local,
            endpoint: None,
            display_name: "Local".to_string(),
            cached_profile: None,
            cached_version_info: None,
            added_at: now,
            last_used_at: now,
        }
    }

    /// Explicit handle for passing this context to other components
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            id: self.id.clone(),
            namespace: derive_namespace(&self.id),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// A context as seen by the components that read and write its records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHandle {
    pub id: ContextId,
    pub namespace: Namespace,
    pub endpoint: Option<String>,
}

impl ContextHandle {
    pub fn local() -> Self {
        StorageContextDescriptor::local().handle()
    }

    /// Handle for a remote endpoint without consulting a registry
    pub fn remote(endpoint: &str) -> Result<Self, ContextError> {
        let normalized = normalize_endpoint(endpoint)?;
        let id = ContextId::for_normalized_endpoint(&normalized);
        Ok(Self {
            namespace: derive_namespace(&id),
            id,
            endpoint: Some(normalized),
        })
    }

    pub fn is_local(&self) -> bool {
        self.id.is_local()
    }

    /// Endpoint label used in migration records
    pub fn endpoint_label(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(LOCAL_CONTEXT_ID)
    }
}

/// Derive the namespace for a context id
///
/// Pure: the same id always yields the same namespace.
pub fn derive_namespace(id: &ContextId) -> Namespace {
    if id.is_local() {
        Namespace::Local
    } else {
        Namespace::Server(id.as_str().to_string())
    }
}

/// Derive the namespace for a raw endpoint string
pub fn namespace_for_endpoint(endpoint: &str) -> Result<Namespace, ContextError> {
    Ok(derive_namespace(&ContextId::for_endpoint(endpoint)?))
}

/// Normalize a server endpoint
///
/// Lower-cases scheme and host, drops the port when it is the scheme's
/// default, and strips trailing slashes, query and fragment. An endpoint
/// without a scheme is treated as `https`.
pub fn normalize_endpoint(endpoint: &str) -> Result<String, ContextError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(ContextError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "endpoint is empty".to_string(),
        });
    }

    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&with_scheme).map_err(|e| ContextError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;

    let scheme = url.scheme().to_ascii_lowercase();
    if !matches!(scheme.as_str(), "http" | "https" | "ws" | "wss") {
        return Err(ContextError::UnsupportedScheme(scheme));
    }

    let host = url
        .host_str()
        .ok_or_else(|| ContextError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "endpoint has no host".to_string(),
        })?
        .to_ascii_lowercase();

    // Url::port() is None when the port equals the scheme default
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let path = url.path().trim_end_matches('/');

    Ok(format!("{}://{}{}{}", scheme, host, port, path))
}

/// Registry of configured contexts plus the active pointer
///
/// Descriptors and the active id live in the `Registry` namespace. A local
/// descriptor always exists.
pub struct ContextRegistry {
    kv: Arc<dyn KvStore>,
    descriptors: BTreeMap<ContextId, StorageContextDescriptor>,
    active: ContextId,
}

impl ContextRegistry {
    /// Load the registry, creating the local descriptor on first use
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self, ContextError> {
        let ns = Namespace::Registry;
        let mut descriptors: BTreeMap<ContextId, StorageContextDescriptor> =
            scan_json(kv.as_ref(), &ns, DESCRIPTOR_PREFIX)?
                .into_iter()
                .map(|(_, d): (String, StorageContextDescriptor)| (d.id.clone(), d))
                .collect();

        if !descriptors.contains_key(&ContextId::local()) {
            let local = StorageContextDescriptor::local();
            put_json(kv.as_ref(), &ns, &descriptor_key(&local.id), &local)?;
            descriptors.insert(local.id.clone(), local);
        }

        let stored_active: Option<ContextId> = get_json(kv.as_ref(), &ns, ACTIVE_KEY)?;
        let active = match stored_active {
            Some(id) if descriptors.contains_key(&id) => id,
            Some(id) => {
                warn!(context = %id, "Active context no longer exists, using local");
                ContextId::local()
            }
            None => ContextId::local(),
        };

        Ok(Self {
            kv,
            descriptors,
            active,
        })
    }

    pub fn active_id(&self) -> &ContextId {
        &self.active
    }

    /// The active descriptor
    pub fn active(&self) -> StorageContextDescriptor {
        self.descriptors
            .get(&self.active)
            .cloned()
            .unwrap_or_else(StorageContextDescriptor::local)
    }

    pub fn active_handle(&self) -> ContextHandle {
        self.active().handle()
    }

    pub fn get(&self, id: &ContextId) -> Option<&StorageContextDescriptor> {
        self.descriptors.get(id)
    }

    pub fn handle(&self, id: &ContextId) -> Option<ContextHandle> {
        self.get(id).map(StorageContextDescriptor::handle)
    }

    /// Find a context by id or display name
    pub fn find(&self, id_or_name: &str) -> Option<&StorageContextDescriptor> {
        self.descriptors
            .get(&ContextId::from_raw(id_or_name))
            .or_else(|| {
                self.descriptors
                    .values()
                    .find(|d| d.display_name.eq_ignore_ascii_case(id_or_name))
            })
    }

    /// All descriptors, local first, then by when they were added
    pub fn list(&self) -> Vec<&StorageContextDescriptor> {
        let mut list: Vec<_> = self.descriptors.values().collect();
        list.sort_by_key(|d| (!d.id.is_local(), d.added_at));
        list
    }

    /// Register a remote endpoint, or refresh it if already known
    pub fn register(
        &mut self,
        endpoint: &str,
        display_name: Option<&str>,
    ) -> Result<StorageContextDescriptor, ContextError> {
        let normalized = normalize_endpoint(endpoint)?;
        let id = ContextId::for_normalized_endpoint(&normalized);
        let now = Utc::now();

        let descriptor = match self.descriptors.get_mut(&id) {
            Some(existing) => {
                debug!(context = %id, "Endpoint already registered, refreshing");
                existing.last_used_at = now;
                if let Some(name) = display_name {
                    existing.display_name = name.to_string();
                }
                existing.clone()
            }
            None => {
                let host_label = Url::parse(&normalized)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| normalized.clone());
                let descriptor = StorageContextDescriptor {
                    id: id.clone(),
                    kind: ContextKind::Remote,
                    endpoint: Some(normalized),
                    display_name: display_name.map(str::to_string).unwrap_or(host_label),
                    cached_profile: None,
                    cached_version_info: None,
                    added_at: now,
                    last_used_at: now,
                };
                info!(context = %id, endpoint = ?descriptor.endpoint, "Registered storage context");
                self.descriptors.insert(id.clone(), descriptor.clone());
                descriptor
            }
        };

        self.persist_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    /// Make `id` the active context
    ///
    /// An unknown id is a logged no-op rather than an error: this is reachable
    /// from background paths that must not fail.
    pub fn switch_active(&mut self, id: &ContextId) -> Result<bool, ContextError> {
        let Some(descriptor) = self.descriptors.get_mut(id) else {
            warn!(context = %id, "Ignoring switch to unknown storage context");
            return Ok(false);
        };

        descriptor.last_used_at = Utc::now();
        let descriptor = descriptor.clone();
        self.persist_descriptor(&descriptor)?;

        self.active = id.clone();
        put_json(self.kv.as_ref(), &Namespace::Registry, ACTIVE_KEY, &self.active)?;
        info!(context = %id, "Switched active storage context");
        Ok(true)
    }

    /// Remove a remote context
    ///
    /// Removing the active context moves the pointer to the most recently used
    /// remaining descriptor. The local descriptor cannot be removed, so there
    /// is always one to fall back to. Stored records are left in place.
    pub fn remove(&mut self, id: &ContextId) -> Result<bool, ContextError> {
        if id.is_local() {
            warn!("The local storage context cannot be removed");
            return Ok(false);
        }
        if self.descriptors.remove(id).is_none() {
            return Ok(false);
        }

        self.kv
            .delete(&Namespace::Registry, &descriptor_key(id))?;

        if &self.active == id {
            let fallback = self
                .descriptors
                .values()
                .max_by_key(|d| d.last_used_at)
                .map(|d| d.id.clone())
                .unwrap_or_else(ContextId::local);
            info!(removed = %id, fallback = %fallback, "Removed active storage context");
            self.active = fallback;
            put_json(self.kv.as_ref(), &Namespace::Registry, ACTIVE_KEY, &self.active)?;
        }

        Ok(true)
    }

    /// Store profile and version information fetched from a server
    pub fn update_cached_info(
        &mut self,
        id: &ContextId,
        profile: Option<CachedProfile>,
        version: Option<VersionInfo>,
    ) -> Result<bool, ContextError> {
        let Some(descriptor) = self.descriptors.get_mut(id) else {
            return Ok(false);
        };
        if profile.is_some() {
            descriptor.cached_profile = profile;
        }
        if version.is_some() {
            descriptor.cached_version_info = version;
        }
        let descriptor = descriptor.clone();
        self.persist_descriptor(&descriptor)?;
        Ok(true)
    }

    fn persist_descriptor(&self, descriptor: &StorageContextDescriptor) -> Result<(), ContextError> {
        put_json(
            self.kv.as_ref(),
            &Namespace::Registry,
            &descriptor_key(&descriptor.id),
            descriptor,
        )?;
        Ok(())
    }
}

fn descriptor_key(id: &ContextId) -> String {
    format!("{}{}", DESCRIPTOR_PREFIX, id)
}

/// Bearer tokens, stored per context
///
/// A token lives inside its own context's namespace, so a token issued by one
/// server is never presented to another. The local context holds no token.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KvStore>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get(&self, context: &ContextHandle) -> Result<Option<String>, StorageError> {
        if context.is_local() {
            return Ok(None);
        }
        get_json(self.kv.as_ref(), &context.namespace, TOKEN_KEY)
    }

    /// Store a token; returns false for the local context
    pub fn set(&self, context: &ContextHandle, token: &str) -> Result<bool, StorageError> {
        if context.is_local() {
            warn!("Refusing to store a bearer token for the local context");
            return Ok(false);
        }
        put_json(self.kv.as_ref(), &context.namespace, TOKEN_KEY, &token)?;
        Ok(true)
    }

    pub fn clear(&self, context: &ContextHandle) -> Result<(), StorageError> {
        self.kv.delete(&context.namespace, TOKEN_KEY)
    }
}
