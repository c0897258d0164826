//! Remote registry client — the authoritative external catalog the
//! pipeline pulls from.
//!
//! The client is optional at construction: with no client only the
//! registry-independent bootstrap steps can do useful work.

pub mod http;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub use http::HttpRegistryClient;

/// Kinds of records the registry serves and the catalog stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Language,
    Country,
    Discipline,
    Institution,
    Unit,
    Source,
    Publisher,
    Conference,
    Author,
    Publication,
    Statement,
    Fee,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::Country => "country",
            Self::Discipline => "discipline",
            Self::Institution => "institution",
            Self::Unit => "unit",
            Self::Source => "source",
            Self::Publisher => "publisher",
            Self::Conference => "conference",
            Self::Author => "author",
            Self::Publication => "publication",
            Self::Statement => "statement",
            Self::Fee => "fee",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "language" => Self::Language,
            "country" => Self::Country,
            "discipline" => Self::Discipline,
            "institution" => Self::Institution,
            "unit" => Self::Unit,
            "source" => Self::Source,
            "publisher" => Self::Publisher,
            "conference" => Self::Conference,
            "author" => Self::Author,
            "publication" => Self::Publication,
            "statement" => Self::Statement,
            "fee" => Self::Fee,
            other => return Err(format!("unknown record kind: {other}")),
        })
    }
}

/// One page of a pageable registry resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
}

/// Result of the pre-flight authorization probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The registry answered an authenticated call.
    Authorized,
    /// No client, or the registry could not be reached for a reason other
    /// than authorization.
    Unavailable(String),
    /// The registry rejected our credentials.
    Forbidden(String),
}

impl ProbeOutcome {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Self::Authorized)
    }

    /// Human-readable reason for a failed probe.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Authorized => None,
            Self::Unavailable(m) | Self::Forbidden(m) => Some(m),
        }
    }
}

/// Capability the pipeline needs from the remote registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Trivial authenticated call used as the pre-flight check.
    async fn probe(&self) -> Result<(), RegistryError>;

    /// Fetch a small non-paged dictionary (languages, countries, disciplines).
    async fn fetch_dictionary(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<serde_json::Value>, RegistryError>;

    /// Fetch one page (0-based) of a pageable resource.
    async fn fetch_page(
        &self,
        kind: RecordKind,
        page: u32,
        page_size: u32,
    ) -> Result<Page, RegistryError>;

    /// Look up many records of one kind in a single round trip.
    async fn fetch_batch(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<Vec<serde_json::Value>, RegistryError>;
}

/// Run the pre-flight probe against an optional client.
pub async fn probe_client(client: Option<&dyn RegistryClient>) -> ProbeOutcome {
    let Some(client) = client else {
        tracing::warn!("No registry client configured; remote steps cannot run");
        return ProbeOutcome::Unavailable("Registry client is not configured".to_string());
    };

    match client.probe().await {
        Ok(()) => {
            tracing::info!("Registry authorization confirmed");
            ProbeOutcome::Authorized
        }
        Err(e) => {
            let message = e.user_message();
            tracing::error!(error = %message, "Registry probe failed");
            if e.is_authorization() {
                ProbeOutcome::Forbidden(message)
            } else {
                ProbeOutcome::Unavailable(message)
            }
        }
    }
}

static AUTHORIZATION_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b403\b|forbidden|authori[sz]ation").expect("valid regex")
});

/// Whether a message carries the forbidden/authorization signature.
pub fn looks_like_authorization(text: &str) -> bool {
    AUTHORIZATION_SIGNATURE.is_match(text)
}

/// Pull the most useful message out of a registry error body.
///
/// Registry error bodies are usually JSON with a `description` or `message`
/// field; anything else is returned verbatim.
pub fn extract_body_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => json
            .get("description")
            .or_else(|| json.get("message"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        Err(_) => body.to_string(),
    }
}

impl RegistryError {
    /// HTTP 403, or a "Forbidden"/"authorization" mention in the message or body.
    pub fn is_authorization(&self) -> bool {
        match self {
            Self::Forbidden { .. } => true,
            Self::Http { status: 403, .. } => true,
            Self::Http { body, .. } => looks_like_authorization(body),
            Self::NotConfigured | Self::Timeout { .. } => false,
            Self::Transport { reason, .. } | Self::InvalidResponse { reason, .. } => {
                looks_like_authorization(reason)
            }
        }
    }

    /// Message suitable for the job record and dashboard.
    pub fn user_message(&self) -> String {
        match self {
            Self::Forbidden { body, .. } | Self::Http { body, .. } if !body.is_empty() => {
                extract_body_message(body)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_signature_matches() {
        assert!(looks_like_authorization("HTTP 403"));
        assert!(looks_like_authorization("Forbidden"));
        assert!(looks_like_authorization("Missing authorization token"));
        assert!(looks_like_authorization("Authorisation required"));
        assert!(!looks_like_authorization("HTTP 4030 bytes"));
        assert!(!looks_like_authorization("connection refused"));
    }

    #[test]
    fn extract_prefers_description_then_message() {
        assert_eq!(
            extract_body_message(r#"{"description":"No access","message":"Forbidden"}"#),
            "No access"
        );
        assert_eq!(extract_body_message(r#"{"message":"Forbidden"}"#), "Forbidden");
        assert_eq!(extract_body_message("plain text"), "plain text");
    }

    #[test]
    fn http_403_is_authorization() {
        let err = RegistryError::Http {
            status: 403,
            url: "/x".into(),
            body: String::new(),
        };
        assert!(err.is_authorization());

        let err = RegistryError::Http {
            status: 500,
            url: "/x".into(),
            body: "oops".into(),
        };
        assert!(!err.is_authorization());
    }

    #[test]
    fn user_message_uses_body_description() {
        let err = RegistryError::Forbidden {
            url: "/x".into(),
            body: r#"{"description":"Token expired"}"#.into(),
        };
        assert_eq!(err.user_message(), "Token expired");
        assert_eq!(
            RegistryError::NotConfigured.user_message(),
            "Registry client is not configured"
        );
    }

    #[tokio::test]
    async fn probe_without_client_is_unavailable() {
        let outcome = probe_client(None).await;
        assert!(matches!(outcome, ProbeOutcome::Unavailable(_)));
        assert!(!outcome.is_authorized());
    }

    #[test]
    fn record_kind_round_trips_through_str() {
        for kind in [RecordKind::Source, RecordKind::Publication, RecordKind::Fee] {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<RecordKind>().is_err());
    }

    #[test]
    fn page_parses_registry_shape() {
        let page: Page = serde_json::from_str(
            r#"{"content":[{"mongoId":"a"}],"number":0,"totalElements":1,"totalPages":1}"#,
        )
        .unwrap();
        assert_eq!(page.content.len(), 1);
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.total_elements, 1);
    }
}
