//! Paged imports of registry resources into the catalog.

use async_trait::async_trait;

use crate::error::StepError;
use crate::job::CancellationToken;
use crate::job::log::LogLevel;
use crate::pipeline::registry::{StepKind, StepParams};
use crate::registry::RecordKind;
use crate::steps::{Step, StepContext, StepOutput, output, record_id};

/// Tally of one paged import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageImport {
    pub created: u64,
    pub updated: u64,
    pub total: u64,
    pub pages: u32,
    pub failed_pages: u32,
}

impl PageImport {
    pub fn stored(&self) -> u64 {
        self.created + self.updated
    }
}

/// Walk every page of `kind`, upserting each record into the catalog.
///
/// Per-record failures are recorded and skipped; a failed page fetch is
/// routed through `handle_registry_error` (fatal only for authorization
/// faults). Cancellation is checked every `CANCEL_CHECK_INTERVAL` records.
pub async fn import_pages(
    ctx: &mut StepContext,
    kind: RecordKind,
    page_size: u32,
    subtask_name: &str,
) -> Result<PageImport, StepError> {
    let client = ctx.client()?;
    let job_id = ctx.job_id();
    let mut subtask = ctx.create_subtask_progress(subtask_name);
    let mut tally = PageImport::default();
    let mut index: usize = 0;
    let mut page: u32 = 0;
    let mut total_pages: Option<u32> = None;

    loop {
        if let Some(total_pages) = total_pages
            && page >= total_pages
        {
            break;
        }

        let fetched = client.fetch_page(kind, page, page_size).await;
        let current = match fetched {
            Ok(current) => current,
            Err(e) => {
                tally.failed_pages += 1;
                ctx.handle_registry_error(e, &format!("Fetching {kind} page {page}"))
                    .await?;
                // Without a first page there is no page count to continue with.
                if total_pages.is_none() {
                    break;
                }
                page += 1;
                continue;
            }
        };

        if total_pages.is_none() {
            tally.total = current.total_elements;
            total_pages = Some(current.total_pages);
            ctx.log(
                LogLevel::Info,
                format!(
                    "{} {kind} records in {} pages",
                    current.total_elements, current.total_pages
                ),
                None,
            )
            .await;
        }
        if current.content.is_empty() {
            break;
        }

        for item in &current.content {
            if CancellationToken::should_check(index) {
                ctx.raise_if_cancelled().await?;
            }
            index += 1;

            let Some(id) = record_id(item) else {
                ctx.handle_error("record has no identifier", &format!("Importing {kind}"))
                    .await;
                continue;
            };
            let stored = ctx
                .catalog()
                .upsert_record(kind, &id, item, Some(job_id))
                .await;
            match stored {
                Ok(true) => tally.created += 1,
                Ok(false) => tally.updated += 1,
                Err(e) => ctx.handle_error(e, &format!("Storing {kind} {id}")).await,
            }
        }

        tally.pages += 1;
        let processed = index as u64;
        let total = tally.total.max(processed);
        subtask
            .update(processed, total, &format!("page {} of {}", page + 1, total_pages.unwrap_or(0)))
            .await?;
        ctx.update_progress(processed, total, &format!("{processed} of {total} {kind} records"))
            .await?;
        page += 1;
    }

    subtask.clear().await?;
    Ok(tally)
}

/// Import of one pageable registry resource.
pub struct RecordImport {
    kind: StepKind,
}

impl RecordImport {
    pub fn new(kind: StepKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Step for RecordImport {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn run(&self, ctx: &mut StepContext) -> Result<StepOutput, StepError> {
        let StepParams::Records {
            kind,
            page_size,
            delete_existing,
        } = ctx.params().clone()
        else {
            return Err(StepError::Failed(format!(
                "{} was resolved without paging parameters",
                self.kind
            )));
        };

        // Fail before touching the catalog if there is nothing to import from.
        ctx.client()?;

        let mut deleted = 0;
        if delete_existing {
            deleted = ctx.catalog().delete_records(kind).await?;
            ctx.log(
                LogLevel::Info,
                format!("Deleted {deleted} previously imported {kind} records"),
                None,
            )
            .await;
        }

        let tally = import_pages(ctx, kind, page_size, self.kind.label()).await?;

        Ok(output(serde_json::json!({
            "kind": kind.as_str(),
            "created": tally.created,
            "updated": tally.updated,
            "total": tally.total,
            "pages": tally.pages,
            "failed_pages": tally.failed_pages,
            "deleted": deleted,
        })))
    }
}
