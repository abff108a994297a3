//! scheduler.rs
//!
//! Decides which registered workflows are due. Only the latest missed slot
//! fires unless a workflow opts into catch-up; nothing is persisted, so a
//! restart starts from the latest slot again.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::errors::{IngestError, WorkflowValidationError};
use crate::workflow::Workflow;

/// Registration capability consumed by the workflow registry.
pub trait Scheduler {
    fn register(&mut self, workflow: Workflow) -> Result<(), IngestError>;
}

#[derive(Debug)]
struct Entry {
    workflow: Workflow,
    last_slot: Option<DateTime<Utc>>,
    last_succeeded: bool,
}

/// A workflow run the caller should execute now.
#[derive(Debug, Clone)]
pub struct DueRun {
    pub workflow: Workflow,
    pub logical_date: DateTime<Utc>,
}

/// In-memory scheduler polled on a fixed tick.
#[derive(Debug, Default)]
pub struct TickScheduler {
    entries: Vec<Entry>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.entries.iter().map(|e| &e.workflow)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Claim every run due at `now`. Each returned run advances its
    /// workflow's last slot, so the same slot is never handed out twice.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<DueRun> {
        let mut runs = Vec::new();

        for entry in &mut self.entries {
            let wf = &entry.workflow;
            let Some(next) = wf.schedule.next_after(wf.start_date, entry.last_slot) else {
                continue;
            };
            if next > now {
                continue;
            }
            if wf.default_args.depends_on_past && !entry.last_succeeded {
                debug!(workflow = %wf.name, "Previous run failed, holding back");
                continue;
            }

            let slot = if wf.default_args.catchup {
                next
            } else {
                wf.schedule.latest_slot(wf.start_date, now).unwrap_or(next)
            };
            entry.last_slot = Some(slot);
            runs.push(DueRun {
                workflow: wf.clone(),
                logical_date: slot,
            });
        }

        runs
    }

    /// Record how a run ended; only matters for `depends_on_past`.
    pub fn finish(&mut self, workflow: &str, succeeded: bool) {
        match self.entries.iter_mut().find(|e| e.workflow.name == workflow) {
            Some(entry) => entry.last_succeeded = succeeded,
            None => warn!(workflow, "Finished run for unknown workflow"),
        }
    }

    /// When the next slot of `workflow` falls.
    pub fn next_run(&self, workflow: &str) -> Option<DateTime<Utc>> {
        let entry = self.entries.iter().find(|e| e.workflow.name == workflow)?;
        entry
            .workflow
            .schedule
            .next_after(entry.workflow.start_date, entry.last_slot)
    }
}

impl Scheduler for TickScheduler {
    fn register(&mut self, workflow: Workflow) -> Result<(), IngestError> {
        workflow
            .validate()
            .map_err(|e| IngestError::InvalidWorkflow(workflow.name.clone(), e))?;
        if self.entries.iter().any(|e| e.workflow.name == workflow.name) {
            return Err(IngestError::InvalidWorkflow(
                workflow.name.clone(),
                WorkflowValidationError::DuplicateWorkflow(workflow.name.clone()),
            ));
        }
        self.entries.push(Entry {
            workflow,
            last_slot: None,
            last_succeeded: true,
        });
        Ok(())
    }
}
