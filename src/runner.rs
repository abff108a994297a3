//! runner.rs
//!
//! Executes one workflow run: tasks in dependency order, each retried after
//! the workflow's retry delay, dependants of a failed task skipped.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::errors::IngestError;
use crate::loader::{load_directives, RunContext, SourceFetcher, SourceSpec};
use crate::metrics::{ROWS_IMPORTED, TASK_HISTOGRAM, TASK_RUNS};
use crate::store::{apply_directives, RepositoryProvider, VersionedRepository};
use crate::table::LoadDirective;
use crate::workflow::{TaskDefinition, TaskKind, Workflow};

/// Everything the runner needs from configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub remote_name: String,
    pub branch: String,
    pub dags_folder: PathBuf,
    pub dry_run: bool,
    pub datasets: BTreeMap<String, Vec<SourceSpec>>,
}

impl From<&Settings> for RunnerSettings {
    fn from(s: &Settings) -> Self {
        RunnerSettings {
            remote_name: s.remote_name.clone(),
            branch: s.branch.clone(),
            dags_folder: s.dags_folder.clone(),
            dry_run: s.dry_run,
            datasets: s
                .datasets
                .iter()
                .map(|(name, d)| (name.clone(), d.sources.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failed,
    UpstreamFailed,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Success => "success",
            TaskOutcome::Failed => "failed",
            TaskOutcome::UpstreamFailed => "upstream_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub workflow: String,
    pub logical_date: DateTime<Utc>,
    pub outcomes: Vec<(String, TaskOutcome)>,
}

impl WorkflowReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| *o == TaskOutcome::Success)
    }

    pub fn outcome(&self, task_id: &str) -> Option<TaskOutcome> {
        self.outcomes
            .iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, o)| *o)
    }
}

/// Runs tasks against a repository provider, fetching dataset sources with `F`.
pub struct TaskRunner<P, F> {
    provider: P,
    fetcher: F,
    settings: RunnerSettings,
}

impl<P, F> TaskRunner<P, F>
where
    P: RepositoryProvider,
    F: SourceFetcher,
{
    pub fn new(provider: P, fetcher: F, settings: RunnerSettings) -> Self {
        TaskRunner {
            provider,
            fetcher,
            settings,
        }
    }

    /// Run every task of `workflow` for one logical date.
    pub async fn run_workflow(
        &self,
        workflow: &Workflow,
        logical_date: DateTime<Utc>,
    ) -> Result<WorkflowReport, IngestError> {
        let order = workflow
            .execution_order()
            .map_err(|e| IngestError::InvalidWorkflow(workflow.name.clone(), e))?;

        info!(
            workflow = %workflow.name,
            logical_date = %logical_date,
            tasks = order.len(),
            "Starting workflow run"
        );

        let mut failed: HashSet<&str> = HashSet::new();
        let mut outcomes = Vec::with_capacity(order.len());

        for task in order {
            let outcome = if task.depends_on.iter().any(|d| failed.contains(d.as_str())) {
                warn!(
                    workflow = %workflow.name,
                    task = %task.task_id,
                    "Skipping task, an upstream task failed"
                );
                TASK_RUNS
                    .with_label_values(&[workflow.name.as_str(), "upstream_failed"])
                    .inc();
                TaskOutcome::UpstreamFailed
            } else {
                self.run_with_retries(workflow, task, logical_date).await
            };

            if outcome != TaskOutcome::Success {
                failed.insert(task.task_id.as_str());
            }
            outcomes.push((task.task_id.clone(), outcome));
        }

        let report = WorkflowReport {
            workflow: workflow.name.clone(),
            logical_date,
            outcomes,
        };
        info!(
            workflow = %workflow.name,
            succeeded = report.succeeded(),
            failed = failed.len(),
            "Workflow run complete"
        );
        Ok(report)
    }

    async fn run_with_retries(
        &self,
        workflow: &Workflow,
        task: &TaskDefinition,
        logical_date: DateTime<Utc>,
    ) -> TaskOutcome {
        let args = &workflow.default_args;
        let start = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            match self.run_task(workflow, task, logical_date).await {
                Ok(()) => {
                    info!(
                        workflow = %workflow.name,
                        task = %task.task_id,
                        attempt,
                        "Task succeeded"
                    );
                    break TaskOutcome::Success;
                }
                Err(e) if attempt <= args.retries => {
                    warn!(
                        workflow = %workflow.name,
                        task = %task.task_id,
                        attempt,
                        error = %e,
                        retry_in = ?args.retry_delay,
                        "Task failed, will retry"
                    );
                    TASK_RUNS
                        .with_label_values(&[workflow.name.as_str(), "retry"])
                        .inc();
                    if args.email_on_retry {
                        warn!(to = ?args.email, task = %task.task_id, "Retry notification requested but no mail transport is configured");
                    }
                    sleep(args.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        workflow = %workflow.name,
                        task = %task.task_id,
                        attempt,
                        error = %e,
                        "Task failed"
                    );
                    if args.email_on_failure {
                        warn!(to = ?args.email, task = %task.task_id, "Failure notification requested but no mail transport is configured");
                    }
                    break TaskOutcome::Failed;
                }
            }
        };

        TASK_RUNS
            .with_label_values(&[workflow.name.as_str(), outcome.label()])
            .inc();
        TASK_HISTOGRAM.observe(start.elapsed().as_secs_f64());
        outcome
    }

    /// One attempt of one task.
    pub async fn run_task(
        &self,
        workflow: &Workflow,
        task: &TaskDefinition,
        logical_date: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        let mut ctx = RunContext::new(&workflow.name, &task.task_id, logical_date);
        ctx.params = task.resolve_params(logical_date);

        match &task.kind {
            TaskKind::RemoteSync { remote, dataset } => {
                self.sync_remote(remote, dataset, &ctx).await.map(|_| ())
            }
            TaskKind::Shell { command } => self.run_shell(&task.task_id, command).await,
        }
    }

    /// Load a dataset's directives into a fresh clone of `remote`, then
    /// commit and push. The clone is released whether or not that worked.
    pub async fn sync_remote(
        &self,
        remote: &str,
        dataset: &str,
        ctx: &RunContext,
    ) -> Result<u64, IngestError> {
        let sources = self
            .settings
            .datasets
            .get(dataset)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IngestError::UnknownDataset(dataset.to_string()))?;

        let directives = load_directives(sources, ctx, &self.fetcher).await?;

        let workspace = workspace_name(ctx);
        let mut repo = self.provider.checkout(remote, &workspace).await?;
        let result = self.apply_and_publish(&mut repo, &directives, ctx).await;
        let released = repo.release().await;

        let written = result?;
        released?;
        Ok(written)
    }

    async fn apply_and_publish<R: VersionedRepository + Send>(
        &self,
        repo: &mut R,
        directives: &[LoadDirective],
        ctx: &RunContext,
    ) -> Result<u64, IngestError> {
        let written = apply_directives(repo, directives).await?;
        ROWS_IMPORTED.inc_by(written);

        if self.settings.dry_run {
            info!(
                workflow = %ctx.workflow,
                task = %ctx.task,
                rows = written,
                "Dry run, not committing or pushing"
            );
            return Ok(written);
        }

        let message = format!(
            "{}/{} load for {}",
            ctx.workflow,
            ctx.task,
            ctx.logical_date.format("%Y-%m-%d %H:%M")
        );
        if repo.commit(&message).await? {
            repo.push(&self.settings.remote_name, &self.settings.branch)
                .await?;
        } else {
            info!(workflow = %ctx.workflow, task = %ctx.task, "No changes to commit");
        }
        Ok(written)
    }

    /// Run an import script through `sh -c` with `{dags_folder}` filled in.
    pub async fn run_shell(&self, task_id: &str, command: &str) -> Result<(), IngestError> {
        let rendered = command.replace(
            "{dags_folder}",
            &self.settings.dags_folder.to_string_lossy(),
        );
        info!(task = task_id, command = %rendered, "Running shell task");

        let status = Command::new("sh")
            .arg("-c")
            .arg(&rendered)
            .status()
            .await
            .map_err(|source| IngestError::Spawn {
                task: task_id.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(IngestError::Command {
                task: task_id.to_string(),
                status,
            });
        }
        Ok(())
    }
}

/// Database name for a run's working copy: ASCII alphanumerics and `_` only.
pub fn workspace_name(ctx: &RunContext) -> String {
    let raw = format!(
        "{}_{}_{}",
        ctx.workflow,
        ctx.task,
        ctx.logical_date.format("%Y%m%d%H%M%S")
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
