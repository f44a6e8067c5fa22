//! Remote project API
//!
//! The reconciler talks to the remote authority through the
//! [`RemoteProjectApi`] trait. [`HttpProjectApi`] is the JSON-over-HTTP
//! implementation; tests substitute scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::context::{CachedProfile, ContextHandle, TokenStore, VersionInfo};
use crate::media::MediaRecord;
use crate::models::{MetadataPatch, ModelError, ProjectKey, Tombstone};

/// Errors returned by the remote authority
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server responded with {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Project already exists on the server")]
    Conflict { existing: Option<RemoteProject> },

    #[error("Not found on the server")]
    NotFound,

    #[error("Failed to decode server response: {0}")]
    Decode(String),

    #[error("Not signed in: {0}")]
    Unauthorized(String),

    #[error("The local context has no remote server")]
    NoEndpoint,
}

impl RemoteError {
    /// Duplicate creation, treated as success by callers
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }

    /// Failures worth retrying on the next trigger
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Status { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Network(e.to_string())
        }
    }
}

/// A project as known to the remote authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProject {
    /// Server-assigned identity
    pub id: String,
    pub owner: String,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_media_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteProject {
    /// The authoritative project key
    pub fn key(&self) -> Result<ProjectKey, ModelError> {
        ProjectKey::new(self.owner.clone(), self.slug.clone())
    }
}

/// Body of a create-project request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub slug: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TombstoneQuery {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TombstoneAnswer {
    #[serde(default)]
    tombstones: Vec<Tombstone>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaUpload<'a> {
    id: &'a str,
    filename: &'a str,
    mime_type: &'a str,
    data: String,
}

/// Operations the reconciler needs from the remote authority
#[async_trait]
pub trait RemoteProjectApi: Send + Sync {
    /// Create a project; a duplicate create yields `RemoteError::Conflict`
    async fn create_project(
        &self,
        owner: &str,
        request: &CreateProjectRequest,
    ) -> Result<RemoteProject, RemoteError>;

    /// Fetch the server's current view of a project
    async fn get_project(&self, key: &ProjectKey) -> Result<RemoteProject, RemoteError>;

    /// Apply a metadata patch
    async fn update_project(
        &self,
        key: &ProjectKey,
        patch: &MetadataPatch,
    ) -> Result<RemoteProject, RemoteError>;

    /// Tombstones the server holds for any of `keys`
    async fn check_tombstones(&self, keys: &[ProjectKey]) -> Result<Vec<Tombstone>, RemoteError>;

    /// Upload a media blob for a project
    async fn upload_media(&self, key: &ProjectKey, media: &MediaRecord) -> Result<(), RemoteError>;
}

/// `RemoteProjectApi` over HTTP with bearer authentication
pub struct HttpProjectApi {
    client: Client,
    base_url: String,
    context: ContextHandle,
    tokens: TokenStore,
}

impl HttpProjectApi {
    /// Client for a remote context
    ///
    /// The token is read from `tokens` on every request, under this context's
    /// own namespace.
    pub fn new(context: &ContextHandle, tokens: TokenStore, timeout: Duration) -> Result<Self, RemoteError> {
        let endpoint = context.endpoint.as_deref().ok_or(RemoteError::NoEndpoint)?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("quire/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: http_base(endpoint),
            context: context.clone(),
            tokens,
        })
    }

    /// Profile of the signed-in user
    pub async fn fetch_profile(&self) -> Result<CachedProfile, RemoteError> {
        let response = self.authorized(self.client.get(self.url("/api/me")))?.send().await?;
        decode(check(response).await?).await
    }

    /// Server version information (no credential needed)
    pub async fn fetch_version(&self) -> Result<VersionInfo, RemoteError> {
        let response = self.client.get(self.url("/api/version")).send().await?;
        decode(check(response).await?).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn project_url(&self, key: &ProjectKey) -> String {
        self.url(&format!("/api/projects/{}/{}", key.owner, key.slug))
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, RemoteError> {
        let token = self
            .tokens
            .get(&self.context)
            .map_err(|e| RemoteError::Unauthorized(e.to_string()))?
            .ok_or_else(|| RemoteError::Unauthorized(format!("no token for {}", self.base_url)))?;
        Ok(request.bearer_auth(token))
    }
}

#[async_trait]
impl RemoteProjectApi for HttpProjectApi {
    async fn create_project(
        &self,
        owner: &str,
        request: &CreateProjectRequest,
    ) -> Result<RemoteProject, RemoteError> {
        debug!(owner, slug = %request.slug, "Creating remote project");
        let response = self
            .authorized(self.client.post(self.url(&format!("/api/projects/{}", owner))))?
            .json(request)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let existing = response.json::<RemoteProject>().await.ok();
            return Err(RemoteError::Conflict { existing });
        }
        decode(check(response).await?).await
    }

    async fn get_project(&self, key: &ProjectKey) -> Result<RemoteProject, RemoteError> {
        let response = self
            .authorized(self.client.get(self.project_url(key)))?
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn update_project(
        &self,
        key: &ProjectKey,
        patch: &MetadataPatch,
    ) -> Result<RemoteProject, RemoteError> {
        let response = self
            .authorized(self.client.patch(self.project_url(key)))?
            .json(patch)
            .send()
            .await?;
        decode(check(response).await?).await
    }

    async fn check_tombstones(&self, keys: &[ProjectKey]) -> Result<Vec<Tombstone>, RemoteError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let query = TombstoneQuery {
            keys: keys.iter().map(ProjectKey::to_string).collect(),
        };
        let response = self
            .authorized(self.client.post(self.url("/api/tombstones/check")))?
            .json(&query)
            .send()
            .await?;
        let answer: TombstoneAnswer = decode(check(response).await?).await?;
        Ok(answer.tombstones)
    }

    async fn upload_media(&self, key: &ProjectKey, media: &MediaRecord) -> Result<(), RemoteError> {
        let body = MediaUpload {
            id: &media.id,
            filename: &media.filename,
            mime_type: &media.mime_type,
            data: BASE64.encode(&media.data),
        };
        let response = self
            .authorized(self.client.post(format!("{}/media", self.project_url(key))))?
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

/// REST base URL for an endpoint, mapping websocket schemes to HTTP
fn http_base(endpoint: &str) -> String {
    let base = if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        endpoint.to_string()
    };
    base.trim_end_matches('/').to_string()
}

/// Map non-success statuses to errors
async fn check(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RemoteError::Unauthorized(format!("server responded {}", status)))
        }
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound),
        StatusCode::CONFLICT => Err(RemoteError::Conflict { existing: None }),
        _ => Err(RemoteError::Status {
            code: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        }),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use std::sync::Arc;

    #[test]
    fn test_http_base() {
        assert_eq!(http_base("wss://quire.example.com"), "https://quire.example.com");
        assert_eq!(http_base("ws://localhost:3030"), "http://localhost:3030");
        assert_eq!(http_base("https://quire.example.com/"), "https://quire.example.com");
    }

    #[test]
    fn test_error_classification() {
        assert!(RemoteError::Conflict { existing: None }.is_conflict());
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Status {
            code: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Status {
            code: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::NotFound.is_transient());
    }

    #[test]
    fn test_local_context_has_no_client() {
        let tokens = TokenStore::new(Arc::new(MemoryKvStore::new()));
        let result = HttpProjectApi::new(&ContextHandle::local(), tokens, Duration::from_secs(5));
        assert!(matches!(result, Err(RemoteError::NoEndpoint)));
    }

    #[test]
    fn test_remote_project_key() {
        let project = RemoteProject {
            id: "p-1".to_string(),
            owner: "alice".to_string(),
            slug: "my-novel".to_string(),
            title: "My Novel".to_string(),
            description: None,
            cover_media_id: None,
            updated_at: None,
        };
        assert_eq!(project.key().unwrap(), ProjectKey::new("alice", "my-novel").unwrap());

        let json = r#"{"id":"p-2","owner":"bob","slug":"notes","title":"Notes"}"#;
        let parsed: RemoteProject = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.key().unwrap().to_string(), "bob/notes");
    }

    #[test]
    fn test_create_request_omits_empty_fields() {
        let request = CreateProjectRequest {
            slug: "my-novel".to_string(),
            title: "My Novel".to_string(),
            description: None,
            template_id: None,
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"slug":"my-novel","title":"My Novel"}"#
        );
    }
}
