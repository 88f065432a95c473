//! Units of crawl work and the records they yield

use crate::url::{extract_host, normalize_url};
use crate::UrlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// Offset/limit position of an API listing page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub offset: u64,
    pub limit: u32,
}

/// One unit of crawl work
///
/// Targets are never mutated once queued: a follow-up page or a retry is a
/// new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Name of the configured source this target belongs to
    pub source: String,

    /// Base URL, without pagination parameters
    pub url: Url,

    /// Pagination position for offset/limit APIs
    #[serde(default)]
    pub cursor: Option<Cursor>,

    /// Discovery depth; seeds are 0
    pub depth: u32,

    /// Zero-based attempt number
    #[serde(default)]
    pub attempt: u32,

    /// Identity of the record a detail target is expected to yield
    #[serde(default)]
    pub identity_hint: Option<String>,
}

impl Target {
    /// Creates a depth-0 target from a configured seed URL
    pub fn seed(source: &str, url: &str) -> Result<Self, UrlError> {
        let url = Url::parse(url).map_err(|e| UrlError::Parse(e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UrlError::InvalidScheme(url.scheme().to_string()));
        }
        if url.host_str().is_none() {
            return Err(UrlError::MissingHost);
        }

        Ok(Self {
            source: source.to_string(),
            url,
            cursor: None,
            depth: 0,
            attempt: 0,
            identity_hint: None,
        })
    }

    /// Returns a copy positioned at `offset` with page size `limit`
    pub fn with_cursor(mut self, offset: u64, limit: u32) -> Self {
        self.cursor = Some(Cursor { offset, limit });
        self
    }

    /// Returns a copy with `key` set to `value` on the base URL
    ///
    /// An existing value for `key` is replaced. Continuation pages keep it.
    pub fn with_query_param(mut self, key: &str, value: &str) -> Self {
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        self.url
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(key, value);
        self
    }

    /// Returns a copy that expects to yield `identity`
    pub fn with_identity_hint(mut self, identity: impl Into<String>) -> Self {
        self.identity_hint = Some(identity.into());
        self
    }

    /// Creates a continuation target one level deeper
    pub fn follow(&self, url: Url, cursor: Option<Cursor>) -> Self {
        Self {
            source: self.source.clone(),
            url,
            cursor,
            depth: self.depth + 1,
            attempt: 0,
            identity_hint: None,
        }
    }

    /// Creates the next attempt of this target
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// The URL actually requested: the base URL plus `offset`/`limit`
    ///
    /// Existing `offset`/`limit` parameters on the base URL are replaced.
    pub fn request_url(&self) -> Url {
        let Some(cursor) = self.cursor else {
            return self.url.clone();
        };

        let mut url = self.url.clone();
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != "offset" && k != "limit")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("offset", &cursor.offset.to_string())
            .append_pair("limit", &cursor.limit.to_string());
        url
    }

    /// Key used for visited markers (normalized request URL)
    ///
    /// The attempt number is not part of the key.
    pub fn visit_key(&self) -> String {
        let request = self.request_url();
        normalize_url(request.as_str())
            .map(String::from)
            .unwrap_or_else(|_| request.into())
    }

    /// Host (with explicit port) of the target
    pub fn host(&self) -> Option<String> {
        extract_host(&self.url)
    }

    /// Document kind served by this URL
    ///
    /// The last path segment that is not a numeric id: `/routes` and
    /// `/routes/123` are both `routes`. Falls back to the source name.
    pub fn kind(&self) -> String {
        self.url
            .path_segments()
            .and_then(|segments| {
                segments
                    .filter(|s| !s.is_empty() && !s.chars().all(|c| c.is_ascii_digit()))
                    .last()
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.source.clone())
    }
}

/// One extracted listing
///
/// Two records with equal identity are the same logical entity regardless
/// of their fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// `<source host>/<kind>/<document id>`
    pub identity: String,
    pub source: String,
    pub kind: String,
    pub document_id: String,
    pub fields: Map<String, Value>,
    pub observed_at: DateTime<Utc>,
    /// URL the record was extracted from
    pub url: String,
}

impl Record {
    /// Builds a record extracted from `target`
    pub fn new(
        target: &Target,
        kind: &str,
        document_id: &str,
        fields: Map<String, Value>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let host = target.host().unwrap_or_default();
        Self {
            identity: identity_for(&host, kind, document_id),
            source: target.source.clone(),
            kind: kind.to_string(),
            document_id: document_id.to_string(),
            fields,
            observed_at,
            url: target.request_url().into(),
        }
    }
}

/// Formats a record identity
pub fn identity_for(host: &str, kind: &str, document_id: &str) -> String {
    format!("{}/{}/{}", host, kind, document_id)
}
