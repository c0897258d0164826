//! Bootstrap steps: dictionaries and the default organizational unit.

use async_trait::async_trait;

use crate::error::{RegistryError, StepError};
use crate::job::log::LogLevel;
use crate::pipeline::registry::{StepKind, StepParams};
use crate::registry::RecordKind;
use crate::steps::records::import_pages;
use crate::steps::{RunArtifacts, Step, StepContext, StepOutput, output, record_id};

/// Dictionaries created locally when the registry cannot be used.
const BASIC_LANGUAGES: &[(&str, &str)] = &[
    ("pl", "Polish"),
    ("en", "English"),
    ("de", "German"),
    ("fr", "French"),
];

const BASIC_DISCIPLINES: &[(&str, &str)] = &[
    ("2.3", "Computer science and telecommunications"),
    ("3.1", "Medical sciences"),
    ("3.2", "Pharmaceutical sciences"),
];

/// Languages, countries, disciplines and institutions.
///
/// Uses the registry when one is configured; otherwise, or when the very
/// first dictionary cannot be fetched for a non-authorization reason, it
/// falls back to a minimal local setup.
pub struct InitialSetup;

impl InitialSetup {
    async fn dictionary(
        &self,
        ctx: &mut StepContext,
        kind: RecordKind,
    ) -> Result<Result<usize, RegistryError>, StepError> {
        let client = ctx.client()?;
        let items = match client.fetch_dictionary(kind).await {
            Ok(items) => items,
            Err(e) => return Ok(Err(e)),
        };

        let job_id = ctx.job_id();
        let mut stored = 0;
        for item in &items {
            let Some(id) = record_id(item) else {
                ctx.handle_error("entry has no identifier", &format!("Importing {kind}"))
                    .await;
                continue;
            };
            let stored_one = ctx
                .catalog()
                .upsert_record(kind, &id, item, Some(job_id))
                .await;
            match stored_one {
                Ok(_) => stored += 1,
                Err(e) => ctx.handle_error(e, &format!("Storing {kind} {id}")).await,
            }
        }
        Ok(Ok(stored))
    }

    async fn minimal_setup(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
        let job_id = ctx.job_id();
        let mut created = 0;
        for (code, name) in BASIC_LANGUAGES {
            let payload = serde_json::json!({"code": code, "name": name});
            if ctx
                .catalog()
                .upsert_record(RecordKind::Language, code, &payload, Some(job_id))
                .await?
            {
                created += 1;
            }
        }
        for (code, name) in BASIC_DISCIPLINES {
            let payload = serde_json::json!({"code": code, "name": name});
            if ctx
                .catalog()
                .upsert_record(RecordKind::Discipline, code, &payload, Some(job_id))
                .await?
            {
                created += 1;
            }
        }
        ctx.log(
            LogLevel::Info,
            format!("Created {created} basic dictionary entries"),
            None,
        )
        .await;
        ctx.update_progress(4, 4, "Minimal initial setup finished")
            .await?;

        Ok(output(serde_json::json!({
            "languages_integrated": false,
            "countries_integrated": false,
            "disciplines_synced": false,
            "institutions_fetched": false,
            "minimal_setup": true,
            "created": created,
            "message": "Minimal setup finished; registry credentials are needed for a full import",
        })))
    }
}

#[async_trait]
impl Step for InitialSetup {
    fn kind(&self) -> StepKind {
        StepKind::InitialSetup
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
        if !ctx.has_client() {
            ctx.log(
                LogLevel::Warning,
                "No registry client configured; running minimal setup",
                None,
            )
            .await;
            return self.minimal_setup(ctx).await;
        }

        ctx.update_progress(0, 4, "Importing languages").await?;
        let languages = match self.dictionary(ctx, RecordKind::Language).await? {
            Ok(n) => n,
            Err(e) if e.is_authorization() => {
                ctx.log(
                    LogLevel::Critical,
                    format!("Registry authorization failed: {}", e.user_message()),
                    None,
                )
                .await;
                return Err(StepError::Registry(e));
            }
            Err(e) => {
                ctx.log(
                    LogLevel::Warning,
                    format!("Could not import languages: {}", e.user_message()),
                    None,
                )
                .await;
                return self.minimal_setup(ctx).await;
            }
        };
        ctx.raise_if_cancelled().await?;

        ctx.update_progress(1, 4, "Importing countries").await?;
        let countries = match self.dictionary(ctx, RecordKind::Country).await? {
            Ok(n) => n,
            Err(e) => {
                ctx.handle_registry_error(e, "Could not import countries")
                    .await?;
                0
            }
        };
        ctx.raise_if_cancelled().await?;

        ctx.update_progress(2, 4, "Importing disciplines").await?;
        let disciplines = match self.dictionary(ctx, RecordKind::Discipline).await? {
            Ok(n) => n,
            Err(e) => {
                ctx.handle_registry_error(e, "Could not import disciplines")
                    .await?;
                0
            }
        };
        ctx.raise_if_cancelled().await?;

        ctx.update_progress(3, 4, "Fetching institutions").await?;
        let page_size = 100;
        let institutions =
            import_pages(ctx, RecordKind::Institution, page_size, "Fetching institutions").await?;

        ctx.update_progress(4, 4, "Initial setup finished").await?;

        Ok(output(serde_json::json!({
            "languages_integrated": true,
            "countries_integrated": true,
            "disciplines_synced": true,
            "institutions_fetched": true,
            "languages": languages,
            "countries": countries,
            "disciplines": disciplines,
            "institutions": institutions.stored(),
        })))
    }
}

/// Ensures the default organizational unit exists and publishes its id as
/// a run artifact for later steps.
pub struct InstitutionSetup;

#[async_trait]
impl Step for InstitutionSetup {
    fn kind(&self) -> StepKind {
        StepKind::InstitutionSetup
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
        let StepParams::Institution {
            unit_name,
            abbreviation,
        } = ctx.params().clone()
        else {
            return Err(StepError::Failed(
                "institution setup needs a default unit name".into(),
            ));
        };
        if unit_name.is_empty() {
            return Err(StepError::Failed("default unit name is empty".into()));
        }

        ctx.update_progress(0, 2, "Creating default unit").await?;
        let unit_id = ctx
            .catalog()
            .ensure_unit(&unit_name, abbreviation.as_deref())
            .await?;
        let payload = serde_json::json!({
            "id": unit_id,
            "name": unit_name,
            "abbreviation": abbreviation,
            "default": true,
        });
        ctx.catalog()
            .upsert_record(RecordKind::Unit, &unit_id, &payload, Some(ctx.job_id()))
            .await?;
        ctx.artifacts_mut().insert(
            RunArtifacts::DEFAULT_UNIT_ID,
            serde_json::json!(unit_id.clone()),
        );
        ctx.log(
            LogLevel::Info,
            format!("Default unit ready: {unit_name}"),
            Some(serde_json::json!({"unit_id": unit_id})),
        )
        .await;

        ctx.update_progress(2, 2, "Institution setup finished").await?;
        Ok(output(serde_json::json!({
            "default_unit_id": unit_id,
            "unit_name": unit_name,
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::ImportConfig;
    use crate::live::LiveChannel;
    use crate::pipeline::registry::resolve_steps;
    use crate::registry::{Page, RegistryClient};
    use crate::steps::RunEnv;
    use crate::store::{CatalogSink, JobStore, LibSqlBackend};

    enum Mode {
        Working,
        Down,
        Forbidden,
    }

    struct FakeRegistry {
        mode: Mode,
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn probe(&self) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn fetch_dictionary(
            &self,
            kind: RecordKind,
        ) -> Result<Vec<serde_json::Value>, RegistryError> {
            match self.mode {
                Mode::Working => Ok(vec![
                    serde_json::json!({"code": format!("{kind}-1")}),
                    serde_json::json!({"code": format!("{kind}-2")}),
                ]),
                Mode::Down => Err(RegistryError::Transport {
                    url: "/api/v1/dictionary/languages".into(),
                    reason: "connection refused".into(),
                }),
                Mode::Forbidden => Err(RegistryError::Forbidden {
                    url: "/api/v1/dictionary/languages".into(),
                    body: "{}".into(),
                }),
            }
        }

        async fn fetch_page(
            &self,
            _kind: RecordKind,
            page: u32,
            _page_size: u32,
        ) -> Result<Page, RegistryError> {
            Ok(Page {
                content: vec![serde_json::json!({"id": format!("I{page}")})],
                number: page,
                total_elements: 2,
                total_pages: 2,
            })
        }

        async fn fetch_batch(
            &self,
            _kind: RecordKind,
            _ids: &[String],
        ) -> Result<Vec<serde_json::Value>, RegistryError> {
            Ok(Vec::new())
        }
    }

    async fn context(
        kind: StepKind,
        client: Option<Arc<dyn RegistryClient>>,
    ) -> (Arc<LibSqlBackend>, StepContext) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let job = db.create_job("admin", ImportConfig::default()).await.unwrap();
        db.mark_running(job.id, 10).await.unwrap();
        let env = RunEnv::new(
            job.id,
            db.clone(),
            db.clone(),
            client,
            LiveChannel::new(32),
            Duration::ZERO,
        );
        let descriptor = resolve_steps(&ImportConfig::default())
            .into_iter()
            .find(|d| d.kind == kind)
            .unwrap();
        (db, StepContext::new(env, descriptor, RunArtifacts::default()))
    }

    #[tokio::test]
    async fn without_client_runs_minimal_setup() {
        let (db, mut ctx) = context(StepKind::InitialSetup, None).await;
        let out = InitialSetup.run(&mut ctx).await.unwrap();
        assert_eq!(out["minimal_setup"], true);
        assert_eq!(db.count_records(RecordKind::Language).await.unwrap(), 4);
        assert_eq!(db.count_records(RecordKind::Discipline).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unreachable_registry_falls_back() {
        let client: Arc<dyn RegistryClient> = Arc::new(FakeRegistry { mode: Mode::Down });
        let (_db, mut ctx) = context(StepKind::InitialSetup, Some(client)).await;
        let out = InitialSetup.run(&mut ctx).await.unwrap();
        assert_eq!(out["minimal_setup"], true);
    }

    #[tokio::test]
    async fn forbidden_registry_is_fatal() {
        let client: Arc<dyn RegistryClient> = Arc::new(FakeRegistry {
            mode: Mode::Forbidden,
        });
        let (_db, mut ctx) = context(StepKind::InitialSetup, Some(client)).await;
        let err = InitialSetup.run(&mut ctx).await.unwrap_err();
        assert!(err.is_authorization());
    }

    #[tokio::test]
    async fn full_setup_imports_dictionaries_and_institutions() {
        let client: Arc<dyn RegistryClient> = Arc::new(FakeRegistry {
            mode: Mode::Working,
        });
        let (db, mut ctx) = context(StepKind::InitialSetup, Some(client)).await;
        let out = InitialSetup.run(&mut ctx).await.unwrap();
        assert_eq!(out["languages"], 2);
        assert_eq!(out["countries"], 2);
        assert_eq!(out["institutions"], 2);
        assert_eq!(db.count_records(RecordKind::Institution).await.unwrap(), 2);
        assert!(ctx.errors().is_empty());
    }

    #[tokio::test]
    async fn institution_setup_publishes_default_unit() {
        let (db, mut ctx) = context(StepKind::InstitutionSetup, None).await;
        let out = InstitutionSetup.run(&mut ctx).await.unwrap();
        let unit_id = out["default_unit_id"].as_str().unwrap().to_string();
        assert_eq!(
            ctx.artifacts().get_str(RunArtifacts::DEFAULT_UNIT_ID),
            Some(unit_id.as_str())
        );
        let record = db.get_record(RecordKind::Unit, &unit_id).await.unwrap().unwrap();
        assert_eq!(record.payload["name"], "Default Faculty");
    }
}
