//! Connection credentials and origin checks
//!
//! Session validation belongs to the account service; the server only needs
//! to turn a bearer credential into a user identity. [`StaticSessions`] does
//! that from a fixed token table in the server config.

use std::collections::HashMap;

use url::Url;

/// Resolves a session credential to a user identity
pub trait SessionAuthenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Option<String>;
}

/// Token table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    tokens: HashMap<String, String>,
}

impl StaticSessions {
    pub fn new<I, K, V>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl SessionAuthenticator for StaticSessions {
    fn authenticate(&self, credential: &str) -> Option<String> {
        if credential.is_empty() {
            return None;
        }
        self.tokens.get(credential).cloned()
    }
}

/// Whether a request's `Origin` header is on the allow-list
///
/// A missing origin is rejected. Origins are compared after normalisation,
/// so `HTTPS://App.Example.com:443` matches `https://app.example.com`.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin.and_then(normalize_origin) else {
        return false;
    };
    allowed
        .iter()
        .filter_map(|a| normalize_origin(a))
        .any(|a| a == origin)
}

fn normalize_origin(origin: &str) -> Option<String> {
    let url = Url::parse(origin.trim()).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Credential from an `Authorization: Bearer` header or a `token` query parameter
pub fn extract_credential(authorization: Option<&str>, query: Option<&str>) -> Option<String> {
    if let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}
