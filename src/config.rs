//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::registry::StepKind;

/// Default registry endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://pbn.nauka.gov.pl";

/// Process-level configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port of the live-update WebSocket server.
    pub ws_port: u16,
    /// Registry connection settings; `None` when no credentials are set.
    pub registry: Option<RegistryConfig>,
    /// Pipeline tuning knobs.
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    /// Read configuration from `CATALOG_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("CATALOG_SYNC_DB_PATH")
            .unwrap_or_else(|_| "./data/catalog-sync.db".to_string());

        let ws_port = parse_env("CATALOG_SYNC_WS_PORT", 8090u16)?;

        let mut pipeline = PipelineSettings::default();
        let interval_ms = parse_env(
            "CATALOG_SYNC_PROGRESS_INTERVAL_MS",
            pipeline.progress_interval.as_millis() as u64,
        )?;
        pipeline.progress_interval = Duration::from_millis(interval_ms);

        let registry = match (
            std::env::var("CATALOG_SYNC_APP_ID"),
            std::env::var("CATALOG_SYNC_APP_TOKEN"),
        ) {
            (Ok(app_id), Ok(app_token)) => Some(RegistryConfig {
                base_url: std::env::var("CATALOG_SYNC_REGISTRY_URL")
                    .unwrap_or_else(|_| DEFAULT_REGISTRY_URL.to_string()),
                app_id,
                app_token: SecretString::from(app_token),
                user_token: std::env::var("CATALOG_SYNC_USER_TOKEN")
                    .ok()
                    .map(SecretString::from),
                ..RegistryConfig::default()
            }),
            (Ok(_), Err(_)) => {
                return Err(ConfigError::MissingEnvVar("CATALOG_SYNC_APP_TOKEN".into()));
            }
            _ => None,
        };

        Ok(Self {
            db_path: PathBuf::from(db_path),
            ws_port,
            registry,
            pipeline,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Remote registry connection settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_token: SecretString,
    pub user_token: Option<SecretString>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Attempts for transport-level failures (HTTP errors are not retried).
    pub max_retries: u32,
    pub retry_backoff_min_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            app_id: String::new(),
            app_token: SecretString::from(String::new()),
            user_token: None,
            request_timeout: Duration::from_secs(60),
            max_retries: 15,
            retry_backoff_min_ms: 1_000,
            retry_backoff_max_ms: 5_000,
        }
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Minimum interval between persisted subtask progress writes.
    pub progress_interval: Duration,
    /// How often a paused run re-reads its status.
    pub pause_poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(500),
            pause_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Which steps of the pipeline are enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepToggles {
    pub initial_setup: bool,
    pub institution_setup: bool,
    pub sources: bool,
    pub publishers: bool,
    pub conferences: bool,
    pub authors: bool,
    pub publications: bool,
    pub data_integration: bool,
    pub statements: bool,
    pub fees: bool,
}

impl Default for StepToggles {
    fn default() -> Self {
        Self {
            initial_setup: true,
            institution_setup: true,
            sources: true,
            publishers: true,
            conferences: true,
            authors: true,
            publications: true,
            data_integration: true,
            statements: true,
            fees: true,
        }
    }
}

impl StepToggles {
    /// Every step disabled; useful as a base for selecting a few.
    pub fn none() -> Self {
        Self {
            initial_setup: false,
            institution_setup: false,
            sources: false,
            publishers: false,
            conferences: false,
            authors: false,
            publications: false,
            data_integration: false,
            statements: false,
            fees: false,
        }
    }

    pub fn is_enabled(&self, kind: StepKind) -> bool {
        match kind {
            StepKind::InitialSetup => self.initial_setup,
            StepKind::InstitutionSetup => self.institution_setup,
            StepKind::SourceImport => self.sources,
            StepKind::PublisherImport => self.publishers,
            StepKind::ConferenceImport => self.conferences,
            StepKind::AuthorImport => self.authors,
            StepKind::PublicationImport => self.publications,
            StepKind::DataIntegration => self.data_integration,
            StepKind::StatementImport => self.statements,
            StepKind::FeeImport => self.fees,
        }
    }

    pub fn set(&mut self, kind: StepKind, enabled: bool) {
        let slot = match kind {
            StepKind::InitialSetup => &mut self.initial_setup,
            StepKind::InstitutionSetup => &mut self.institution_setup,
            StepKind::SourceImport => &mut self.sources,
            StepKind::PublisherImport => &mut self.publishers,
            StepKind::ConferenceImport => &mut self.conferences,
            StepKind::AuthorImport => &mut self.authors,
            StepKind::PublicationImport => &mut self.publications,
            StepKind::DataIntegration => &mut self.data_integration,
            StepKind::StatementImport => &mut self.statements,
            StepKind::FeeImport => &mut self.fees,
        };
        *slot = enabled;
    }
}

/// Per-run import configuration, captured into the job record at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub steps: StepToggles,
    /// Name of the organizational unit that receives unaffiliated records.
    pub default_unit_name: String,
    pub default_unit_abbreviation: Option<String>,
    /// Delete previously imported publications before importing.
    pub delete_existing: bool,
    /// Page size for paged registry resources.
    pub page_size: u32,
    /// Ids per batched registry lookup.
    pub batch_size: usize,
    /// When the registry is unreachable (but not forbidden), skip the
    /// registry-dependent steps instead of aborting the run.
    pub skip_unreachable_steps: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            steps: StepToggles::default(),
            default_unit_name: "Default Faculty".to_string(),
            default_unit_abbreviation: None,
            delete_existing: false,
            page_size: 100,
            batch_size: 50,
            skip_unreachable_steps: false,
        }
    }
}

impl ImportConfig {
    /// Validate parameters against the step registry's schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !StepKind::ALL.iter().any(|k| self.steps.is_enabled(*k)) {
            return Err(ConfigError::InvalidValue {
                key: "steps".into(),
                message: "at least one step must be enabled".into(),
            });
        }
        // Both steps stamp records with the default unit.
        let needs_unit = self.steps.institution_setup || self.steps.data_integration;
        if needs_unit && self.default_unit_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "default_unit_name".into(),
                message: "must not be empty".into(),
            });
        }
        if !(1..=1000).contains(&self.page_size) {
            return Err(ConfigError::InvalidValue {
                key: "page_size".into(),
                message: format!("{} is outside 1..=1000", self.page_size),
            });
        }
        if !(1..=500).contains(&self.batch_size) {
            return Err(ConfigError::InvalidValue {
                key: "batch_size".into(),
                message: format!("{} is outside 1..=500", self.batch_size),
            });
        }
        Ok(())
    }

    /// Parse a JSON import configuration.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ImportConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_no_enabled_steps() {
        let config = ImportConfig {
            steps: StepToggles::none(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_blank_unit_name_only_when_a_step_needs_the_unit() {
        let mut config = ImportConfig {
            default_unit_name: "  ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Data integration still stamps `unitId` on what it fetches.
        config.steps.institution_setup = false;
        assert!(config.validate().is_err());

        config.steps.data_integration = false;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_sizes() {
        let config = ImportConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ImportConfig {
            batch_size: 10_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config =
            ImportConfig::from_json(r#"{"steps":{"fees":false},"delete_existing":true}"#).unwrap();
        assert!(!config.steps.fees);
        assert!(config.steps.sources);
        assert!(config.delete_existing);
        assert_eq!(config.page_size, 100);
    }

    #[test]
    fn toggles_set_and_read_back() {
        let mut toggles = StepToggles::none();
        toggles.set(StepKind::AuthorImport, true);
        assert!(toggles.is_enabled(StepKind::AuthorImport));
        assert!(!toggles.is_enabled(StepKind::FeeImport));
    }
}
