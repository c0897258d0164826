//! Data integration: resolve records referenced by imported data but not
//! present in the catalog, using batched registry lookups.

use async_trait::async_trait;

use crate::error::StepError;
use crate::job::inconsistency::{Inconsistency, InconsistencyKind};
use crate::job::log::LogLevel;
use crate::pipeline::registry::{StepKind, StepParams};
use crate::registry::RecordKind;
use crate::steps::{RunArtifacts, Step, StepContext, StepOutput, output, record_id};

/// Missing ids listed in the unresolved-references warning.
const LOGGED_UNRESOLVED_LIMIT: usize = 20;

/// One reference to resolve: `from.field` points at `target` records.
struct ReferencePass {
    from: RecordKind,
    field: &'static str,
    target: RecordKind,
    /// Ledger entry for an id the registry does not return.
    missing_as: InconsistencyKind,
}

/// Publications first so that their author references are visible to the
/// author pass.
const PASSES: &[ReferencePass] = &[
    ReferencePass {
        from: RecordKind::Statement,
        field: "publicationId",
        target: RecordKind::Publication,
        missing_as: InconsistencyKind::PublicationNotFound,
    },
    ReferencePass {
        from: RecordKind::Fee,
        field: "publicationId",
        target: RecordKind::Publication,
        missing_as: InconsistencyKind::PublicationNotFound,
    },
    ReferencePass {
        from: RecordKind::Publication,
        field: "authors",
        target: RecordKind::Author,
        missing_as: InconsistencyKind::AuthorNotFound,
    },
];

#[derive(Debug, Default)]
struct PassTally {
    fetched: u64,
    batches: u64,
    unresolved: Vec<String>,
}

pub struct DataIntegration;

impl DataIntegration {
    async fn default_unit(&self, ctx: &mut StepContext, unit_name: &str) -> Result<String, StepError> {
        if let Some(id) = ctx.artifacts().get_str(RunArtifacts::DEFAULT_UNIT_ID) {
            return Ok(id.to_string());
        }
        if unit_name.is_empty() {
            return Err(StepError::Failed(
                "no default unit available for data integration".into(),
            ));
        }
        let id = ctx.catalog().ensure_unit(unit_name, None).await?;
        ctx.artifacts_mut()
            .insert(RunArtifacts::DEFAULT_UNIT_ID, serde_json::json!(id.clone()));
        Ok(id)
    }

    async fn resolve(
        &self,
        ctx: &mut StepContext,
        pass: &ReferencePass,
        batch_size: usize,
        unit_id: &str,
    ) -> Result<PassTally, StepError> {
        let mut tally = PassTally::default();
        let missing = ctx
            .catalog()
            .missing_references(pass.from, pass.field, pass.target)
            .await?;
        if missing.is_empty() {
            return Ok(tally);
        }

        ctx.log(
            LogLevel::Info,
            format!(
                "{} {} records referenced by {} are missing",
                missing.len(),
                pass.target,
                pass.from
            ),
            None,
        )
        .await;

        let client = ctx.client()?;
        let job_id = ctx.job_id();
        let total = missing.len() as u64;
        let mut subtask =
            ctx.create_subtask_progress(&format!("Resolving {} for {}", pass.target, pass.from));
        let mut done: u64 = 0;

        for chunk in missing.chunks(batch_size.max(1)) {
            ctx.raise_if_cancelled().await?;
            tally.batches += 1;

            let fetched = client.fetch_batch(pass.target, chunk).await;
            match fetched {
                Ok(records) => {
                    let mut found = std::collections::HashSet::new();
                    for mut record in records {
                        let Some(id) = record_id(&record) else {
                            ctx.handle_error(
                                "record has no identifier",
                                &format!("Resolving {}", pass.target),
                            )
                            .await;
                            continue;
                        };
                        if pass.target == RecordKind::Publication
                            && let Some(map) = record.as_object_mut()
                        {
                            map.entry("unitId")
                                .or_insert_with(|| serde_json::json!(unit_id));
                        }
                        let stored = ctx
                            .catalog()
                            .upsert_record(pass.target, &id, &record, Some(job_id))
                            .await;
                        match stored {
                            Ok(_) => {
                                tally.fetched += 1;
                                found.insert(id);
                            }
                            Err(e) => {
                                ctx.handle_error(e, &format!("Storing {} {id}", pass.target))
                                    .await
                            }
                        }
                    }
                    tally
                        .unresolved
                        .extend(chunk.iter().filter(|id| !found.contains(*id)).cloned());
                }
                Err(e) => {
                    ctx.handle_registry_error(
                        e,
                        &format!("Batch lookup of {} {}", chunk.len(), pass.target),
                    )
                    .await?;
                    tally.unresolved.extend(chunk.iter().cloned());
                }
            }

            done += chunk.len() as u64;
            subtask
                .update(done, total, &format!("{done} of {total}"))
                .await?;
        }
        subtask.clear().await?;
        Ok(tally)
    }
}

#[async_trait]
impl Step for DataIntegration {
    fn kind(&self) -> StepKind {
        StepKind::DataIntegration
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
        let StepParams::Integration {
            batch_size,
            unit_name,
        } = ctx.params().clone()
        else {
            return Err(StepError::Failed(
                "data integration was resolved without a batch size".into(),
            ));
        };

        let unit_id = self.default_unit(ctx, &unit_name).await?;
        let phases = PASSES.len() as u64;

        let mut publications = 0;
        let mut authors = 0;
        let mut batches = 0;
        let mut unresolved = Vec::new();
        let mut recorded = 0;

        for (i, pass) in PASSES.iter().enumerate() {
            ctx.update_progress(
                i as u64,
                phases,
                &format!("Resolving {} referenced by {}", pass.target, pass.from),
            )
            .await?;

            let tally = self.resolve(ctx, pass, batch_size, &unit_id).await?;
            match pass.target {
                RecordKind::Author => authors += tally.fetched,
                _ => publications += tally.fetched,
            }
            batches += tally.batches;

            if !tally.unresolved.is_empty() {
                let job_id = ctx.job_id();
                let items: Vec<Inconsistency> = tally
                    .unresolved
                    .iter()
                    .map(|id| Inconsistency::new(job_id, pass.missing_as, pass.from, id.as_str()))
                    .collect();
                recorded += ctx
                    .env()
                    .store
                    .record_inconsistencies(job_id, &items)
                    .await?;
            }
            unresolved.extend(tally.unresolved);
        }

        if !unresolved.is_empty() {
            let shown: Vec<&String> = unresolved.iter().take(LOGGED_UNRESOLVED_LIMIT).collect();
            ctx.log(
                LogLevel::Warning,
                format!(
                    "{} references could not be resolved; {recorded} new inconsistencies recorded",
                    unresolved.len()
                ),
                Some(serde_json::json!({ "ids": shown })),
            )
            .await;
        }

        ctx.update_progress(phases, phases, "Data integration finished")
            .await?;

        Ok(output(serde_json::json!({
            "data_integrated": true,
            "default_unit_id": unit_id,
            "publications_fetched": publications,
            "authors_fetched": authors,
            "batches": batches,
            "unresolved": unresolved.len(),
            "inconsistencies_recorded": recorded,
        })))
    }
}
