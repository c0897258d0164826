//! Static step registry: the closed, ordered set of pipeline steps.

use serde::{Deserialize, Serialize};

use crate::config::ImportConfig;
use crate::registry::RecordKind;
use crate::steps::Step;
use crate::steps::integration::DataIntegration;
use crate::steps::records::RecordImport;
use crate::steps::setup::{InitialSetup, InstitutionSetup};

/// Every step the pipeline knows about, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    InitialSetup,
    InstitutionSetup,
    SourceImport,
    PublisherImport,
    ConferenceImport,
    AuthorImport,
    PublicationImport,
    StatementImport,
    FeeImport,
    DataIntegration,
}

impl StepKind {
    /// Registry order. Later steps may depend on artifacts of earlier ones.
    pub const ALL: [StepKind; 10] = [
        StepKind::InitialSetup,
        StepKind::InstitutionSetup,
        StepKind::SourceImport,
        StepKind::PublisherImport,
        StepKind::ConferenceImport,
        StepKind::AuthorImport,
        StepKind::PublicationImport,
        StepKind::StatementImport,
        StepKind::FeeImport,
        StepKind::DataIntegration,
    ];

    /// Stable machine name, used as the key in results and statistics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialSetup => "initial_setup",
            Self::InstitutionSetup => "institution_setup",
            Self::SourceImport => "source_import",
            Self::PublisherImport => "publisher_import",
            Self::ConferenceImport => "conference_import",
            Self::AuthorImport => "author_import",
            Self::PublicationImport => "publication_import",
            Self::DataIntegration => "data_integration",
            Self::StatementImport => "statement_import",
            Self::FeeImport => "fee_import",
        }
    }

    /// Human-readable label shown on dashboards.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InitialSetup => "Initial setup",
            Self::InstitutionSetup => "Institution setup",
            Self::SourceImport => "Source import",
            Self::PublisherImport => "Publisher import",
            Self::ConferenceImport => "Conference import",
            Self::AuthorImport => "Author import",
            Self::PublicationImport => "Publication import",
            Self::DataIntegration => "Data integration",
            Self::StatementImport => "Statement import",
            Self::FeeImport => "Fee import",
        }
    }

    /// A failing required step halts the pipeline and fails the run.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::InitialSetup | Self::InstitutionSetup)
    }

    /// Whether the step cannot do anything without the remote registry.
    pub fn requires_registry(&self) -> bool {
        !matches!(self, Self::InitialSetup | Self::InstitutionSetup)
    }

    /// Catalog kind a paged import step fills.
    pub fn record_kind(&self) -> Option<RecordKind> {
        match self {
            Self::SourceImport => Some(RecordKind::Source),
            Self::PublisherImport => Some(RecordKind::Publisher),
            Self::ConferenceImport => Some(RecordKind::Conference),
            Self::AuthorImport => Some(RecordKind::Author),
            Self::PublicationImport => Some(RecordKind::Publication),
            Self::StatementImport => Some(RecordKind::Statement),
            Self::FeeImport => Some(RecordKind::Fee),
            Self::InitialSetup | Self::InstitutionSetup | Self::DataIntegration => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown step: {s}"))
    }
}

/// Typed parameters resolved from the import configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepParams {
    None,
    Institution {
        unit_name: String,
        abbreviation: Option<String>,
    },
    Records {
        kind: RecordKind,
        page_size: u32,
        delete_existing: bool,
    },
    Integration {
        batch_size: usize,
        /// Unit used when no earlier step published one.
        unit_name: String,
    },
}

/// One enabled step of a particular run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub kind: StepKind,
    /// 0-based position among the enabled steps.
    pub position: usize,
    pub params: StepParams,
}

impl StepDescriptor {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn label(&self) -> &'static str {
        self.kind.label()
    }

    pub fn is_required(&self) -> bool {
        self.kind.is_required()
    }
}

fn params_for(kind: StepKind, config: &ImportConfig) -> StepParams {
    match kind {
        StepKind::InitialSetup => StepParams::None,
        StepKind::InstitutionSetup => StepParams::Institution {
            unit_name: config.default_unit_name.trim().to_string(),
            abbreviation: config.default_unit_abbreviation.clone(),
        },
        StepKind::DataIntegration => StepParams::Integration {
            batch_size: config.batch_size,
            unit_name: config.default_unit_name.trim().to_string(),
        },
        other => StepParams::Records {
            kind: other.record_kind().unwrap_or(RecordKind::Publication),
            page_size: config.page_size,
            delete_existing: other == StepKind::PublicationImport && config.delete_existing,
        },
    }
}

/// Enabled steps for `config`, in registry order.
pub fn resolve_steps(config: &ImportConfig) -> Vec<StepDescriptor> {
    StepKind::ALL
        .into_iter()
        .filter(|kind| config.steps.is_enabled(*kind))
        .enumerate()
        .map(|(position, kind)| StepDescriptor {
            kind,
            position,
            params: params_for(kind, config),
        })
        .collect()
}

/// Instantiate the built-in implementation of a step.
pub fn build_step(descriptor: &StepDescriptor) -> Box<dyn Step> {
    match descriptor.kind {
        StepKind::InitialSetup => Box::new(InitialSetup),
        StepKind::InstitutionSetup => Box::new(InstitutionSetup),
        StepKind::DataIntegration => Box::new(DataIntegration),
        kind => Box::new(RecordImport::new(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepToggles;

    #[test]
    fn all_steps_resolve_in_registry_order() {
        let steps = resolve_steps(&ImportConfig::default());
        assert_eq!(steps.len(), StepKind::ALL.len());
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.position, i);
            assert_eq!(step.kind, StepKind::ALL[i]);
        }
        assert!(steps[0].is_required());
        assert!(steps[1].is_required());
        assert!(steps[2..].iter().all(|s| !s.is_required()));
    }

    #[test]
    fn disabled_steps_are_filtered_and_positions_compacted() {
        let mut toggles = StepToggles::none();
        toggles.set(StepKind::InstitutionSetup, true);
        toggles.set(StepKind::FeeImport, true);
        let config = ImportConfig {
            steps: toggles,
            ..ImportConfig::default()
        };

        let steps = resolve_steps(&config);
        let kinds: Vec<_> = steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::InstitutionSetup, StepKind::FeeImport]);
        assert_eq!(steps[1].position, 1);
    }

    #[test]
    fn params_follow_config() {
        let config = ImportConfig {
            default_unit_name: "  Faculty of Physics ".into(),
            default_unit_abbreviation: Some("FP".into()),
            delete_existing: true,
            page_size: 25,
            batch_size: 10,
            ..ImportConfig::default()
        };
        let steps = resolve_steps(&config);
        let by_kind = |kind| steps.iter().find(|s| s.kind == kind).unwrap().params.clone();

        assert_eq!(
            by_kind(StepKind::InstitutionSetup),
            StepParams::Institution {
                unit_name: "Faculty of Physics".into(),
                abbreviation: Some("FP".into()),
            }
        );
        assert_eq!(
            by_kind(StepKind::PublicationImport),
            StepParams::Records {
                kind: RecordKind::Publication,
                page_size: 25,
                delete_existing: true,
            }
        );
        assert_eq!(
            by_kind(StepKind::AuthorImport),
            StepParams::Records {
                kind: RecordKind::Author,
                page_size: 25,
                delete_existing: false,
            }
        );
        assert_eq!(
            by_kind(StepKind::DataIntegration),
            StepParams::Integration {
                batch_size: 10,
                unit_name: "Faculty of Physics".into(),
            }
        );
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in StepKind::ALL {
            assert_eq!(kind.name().parse::<StepKind>().unwrap(), kind);
            assert_eq!(build_step(&StepDescriptor {
                kind,
                position: 0,
                params: StepParams::None,
            })
            .kind(), kind);
        }
        assert!("nope".parse::<StepKind>().is_err());
    }

    #[test]
    fn only_bootstrap_steps_run_without_registry() {
        let local: Vec<_> = StepKind::ALL
            .into_iter()
            .filter(|k| !k.requires_registry())
            .collect();
        assert_eq!(local, vec![StepKind::InitialSetup, StepKind::InstitutionSetup]);
    }
}
