//! Per-job ledger of references the import could not reconcile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::RecordKind;

/// What went wrong with a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// A record points at a publication the registry no longer serves.
    PublicationNotFound,
    /// A publication lists an author the registry no longer serves.
    AuthorNotFound,
}

impl InconsistencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicationNotFound => "publication_not_found",
            Self::AuthorNotFound => "author_not_found",
        }
    }
}

impl std::fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InconsistencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "publication_not_found" => Self::PublicationNotFound,
            "author_not_found" => Self::AuthorNotFound,
            other => return Err(format!("unknown inconsistency kind: {other}")),
        })
    }
}

/// One unresolved reference found during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub job_id: Uuid,
    pub kind: InconsistencyKind,
    /// Kind of the records holding the reference.
    pub referenced_by: RecordKind,
    /// Registry id that could not be resolved.
    pub reference_id: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

impl Inconsistency {
    pub fn new(
        job_id: Uuid,
        kind: InconsistencyKind,
        referenced_by: RecordKind,
        reference_id: impl Into<String>,
    ) -> Self {
        let reference_id = reference_id.into();
        Self {
            job_id,
            kind,
            referenced_by,
            message: format!("{referenced_by} references {reference_id}, which the registry did not return"),
            reference_id,
            recorded_at: Utc::now(),
        }
    }
}
