//! workflow.rs
//!
//! Declarative workflow model: schedule, start date, default run arguments
//! and a task graph. Nothing here executes anything; see `runner` and
//! `scheduler` for that.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WorkflowValidationError;

/// When a workflow fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Schedule {
    /// Fixed period measured from the start date.
    Interval(#[serde(with = "humantime_serde")] Duration),
    /// Six-field cron expression (seconds first).
    Cron(String),
    /// A single run at the start date.
    Once,
}

impl Schedule {
    pub fn hourly() -> Self {
        Schedule::Interval(Duration::from_secs(60 * 60))
    }

    pub fn daily() -> Self {
        Schedule::Interval(Duration::from_secs(24 * 60 * 60))
    }

    pub fn weekly() -> Self {
        Schedule::Interval(Duration::from_secs(7 * 24 * 60 * 60))
    }

    pub fn cron(expression: &str) -> Self {
        Schedule::Cron(expression.to_string())
    }

    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        match self {
            Schedule::Interval(d) if d.is_zero() => Err(WorkflowValidationError::ZeroInterval),
            Schedule::Cron(expr) => parse_cron(expr).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// First slot strictly after `last`, or the first slot at or after
    /// `start` when nothing has run yet.
    pub fn next_after(
        &self,
        start: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => match last {
                None => Some(start),
                Some(_) => None,
            },
            Schedule::Interval(period) => {
                let step = TimeDelta::from_std(*period).ok()?;
                match last {
                    Some(last) if last >= start => {
                        let step_ms = step.num_milliseconds();
                        if step_ms <= 0 {
                            return None;
                        }
                        let k = (last - start).num_milliseconds() / step_ms + 1;
                        Some(start + TimeDelta::milliseconds(k * step_ms))
                    }
                    _ => Some(start),
                }
            }
            Schedule::Cron(expr) => {
                let schedule = parse_cron(expr).ok()?;
                let floor = start - TimeDelta::seconds(1);
                let from = last.map_or(floor, |l| l.max(floor));
                schedule.after(&from).next()
            }
        }
    }

    /// Most recent slot at or before `now`.
    pub fn latest_slot(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now < start {
            return None;
        }
        match self {
            Schedule::Once => Some(start),
            Schedule::Interval(period) => {
                let step_ms = TimeDelta::from_std(*period).ok()?.num_milliseconds();
                if step_ms <= 0 {
                    return None;
                }
                let k = (now - start).num_milliseconds() / step_ms;
                Some(start + TimeDelta::milliseconds(k * step_ms))
            }
            Schedule::Cron(expr) => {
                let schedule = parse_cron(expr).ok()?;
                schedule
                    .after(&(start - TimeDelta::seconds(1)))
                    .take_while(|t| *t <= now)
                    .last()
            }
        }
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule, WorkflowValidationError> {
    cron::Schedule::from_str(expr).map_err(|e| WorkflowValidationError::InvalidCron {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

/// Arguments every task of a workflow inherits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultArgs {
    pub owner: String,
    /// A run only fires when the previous run of the workflow succeeded.
    pub depends_on_past: bool,
    pub email: Vec<String>,
    pub email_on_failure: bool,
    pub email_on_retry: bool,
    /// Fire every missed slot instead of only the latest one.
    pub catchup: bool,
    pub retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        DefaultArgs {
            owner: "liquidata-etl".to_string(),
            depends_on_past: false,
            email: vec!["airflow@liquidata.co".to_string()],
            email_on_failure: false,
            email_on_retry: false,
            catchup: false,
            retries: 1,
            retry_delay: Duration::from_secs(5 * 60),
        }
    }
}

/// A task parameter, resolved against the run's logical date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskParam {
    Literal(String),
    /// Logical date minus `lag_days`, formatted `YYYYMMDD`.
    DumpDate { lag_days: i64 },
}

impl TaskParam {
    pub fn literal(value: &str) -> Self {
        TaskParam::Literal(value.to_string())
    }

    pub fn resolve(&self, logical_date: DateTime<Utc>) -> String {
        match self {
            TaskParam::Literal(v) => v.clone(),
            TaskParam::DumpDate { lag_days } => (logical_date - TimeDelta::days(*lag_days))
                .format("%Y%m%d")
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TaskKind {
    /// Clone `remote`, load `dataset`'s directives, commit and push back.
    RemoteSync { remote: String, dataset: String },
    /// Run an external import command; `{dags_folder}` is substituted.
    Shell { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, TaskParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl TaskDefinition {
    pub fn remote_sync(task_id: &str, remote: &str, dataset: &str) -> Self {
        Self::new(
            task_id,
            TaskKind::RemoteSync {
                remote: remote.to_string(),
                dataset: dataset.to_string(),
            },
        )
    }

    pub fn shell(task_id: &str, command: &str) -> Self {
        Self::new(
            task_id,
            TaskKind::Shell {
                command: command.to_string(),
            },
        )
    }

    fn new(task_id: &str, kind: TaskKind) -> Self {
        TaskDefinition {
            task_id: task_id.to_string(),
            kind,
            params: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_param(mut self, name: &str, param: TaskParam) -> Self {
        self.params.insert(name.to_string(), param);
        self
    }

    /// Declare that this task runs only after `upstream` succeeded.
    pub fn after(mut self, upstream: &str) -> Self {
        self.depends_on.push(upstream.to_string());
        self
    }

    /// All params resolved for one run.
    pub fn resolve_params(&self, logical_date: DateTime<Utc>) -> BTreeMap<String, String> {
        self.params
            .iter()
            .map(|(k, p)| (k.clone(), p.resolve(logical_date)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub schedule: Schedule,
    pub start_date: DateTime<Utc>,
    pub default_args: DefaultArgs,
    pub tasks: Vec<TaskDefinition>,
}

impl Workflow {
    pub fn new(
        name: &str,
        schedule: Schedule,
        start_date: DateTime<Utc>,
        default_args: DefaultArgs,
    ) -> Self {
        Workflow {
            name: name.to_string(),
            schedule,
            start_date,
            default_args,
            tasks: Vec::new(),
        }
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn get_task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// `(upstream, downstream)` pairs in declaration order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .flat_map(|t| {
                t.depends_on
                    .iter()
                    .map(move |up| (up.clone(), t.task_id.clone()))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowValidationError::EmptyWorkflowName);
        }
        if self.tasks.is_empty() {
            return Err(WorkflowValidationError::NoTasks);
        }
        self.schedule.validate()?;

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.task_id.trim().is_empty() {
                return Err(WorkflowValidationError::EmptyTaskId);
            }
            if !seen.insert(task.task_id.as_str()) {
                return Err(WorkflowValidationError::DuplicateTask(task.task_id.clone()));
            }
            match &task.kind {
                TaskKind::Shell { command } if command.trim().is_empty() => {
                    return Err(WorkflowValidationError::EmptyCommand {
                        task: task.task_id.clone(),
                    });
                }
                TaskKind::RemoteSync { remote, .. } if remote.trim().is_empty() => {
                    return Err(WorkflowValidationError::EmptyRemote {
                        task: task.task_id.clone(),
                    });
                }
                _ => {}
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if dep == &task.task_id {
                    return Err(WorkflowValidationError::SelfDependency {
                        task: task.task_id.clone(),
                    });
                }
                if !seen.contains(dep.as_str()) {
                    return Err(WorkflowValidationError::UnknownDependency {
                        task: task.task_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.execution_order().map(|_| ())
    }

    /// Tasks in dependency order; ties keep declaration order.
    pub fn execution_order(&self) -> Result<Vec<&TaskDefinition>, WorkflowValidationError> {
        let mut remaining: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.task_id.as_str(), t.depends_on.len()))
            .collect();
        let mut order: Vec<&TaskDefinition> = Vec::with_capacity(self.tasks.len());
        let mut placed: HashSet<&str> = HashSet::new();

        while order.len() < self.tasks.len() {
            let next = self
                .tasks
                .iter()
                .find(|t| !placed.contains(t.task_id.as_str()) && remaining[t.task_id.as_str()] == 0);

            let Some(task) = next else {
                let stuck = self
                    .tasks
                    .iter()
                    .find(|t| !placed.contains(t.task_id.as_str()))
                    .map(|t| t.task_id.clone())
                    .unwrap_or_default();
                return Err(WorkflowValidationError::Cycle { task: stuck });
            };

            placed.insert(task.task_id.as_str());
            order.push(task);
            for downstream in &self.tasks {
                let hits = downstream
                    .depends_on
                    .iter()
                    .filter(|d| **d == task.task_id)
                    .count();
                if hits > 0 {
                    if let Some(n) = remaining.get_mut(downstream.task_id.as_str()) {
                        *n = n.saturating_sub(hits);
                    }
                }
            }
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn wf(tasks: Vec<TaskDefinition>) -> Workflow {
        let mut w = Workflow::new("wf", Schedule::daily(), at(2019, 10, 8, 0), DefaultArgs::default());
        w.tasks = tasks;
        w
    }

    #[test]
    fn default_args_match_house_defaults() {
        let args = DefaultArgs::default();
        assert_eq!(args.owner, "liquidata-etl");
        assert_eq!(args.retry_delay, Duration::from_secs(300));
        assert!(!args.catchup && !args.email_on_failure && !args.email_on_retry);
        assert!(!args.depends_on_past);
    }

    #[test]
    fn interval_slots_align_to_start() {
        let s = Schedule::hourly();
        let start = at(2019, 10, 9, 0);
        assert_eq!(s.next_after(start, None), Some(start));
        let late = start + TimeDelta::minutes(90);
        assert_eq!(s.next_after(start, Some(late)), Some(at(2019, 10, 9, 2)));
        assert_eq!(s.next_after(start, Some(at(2019, 10, 9, 1))), Some(at(2019, 10, 9, 2)));
        assert_eq!(
            s.latest_slot(start, at(2019, 10, 9, 5) + TimeDelta::minutes(59)),
            Some(at(2019, 10, 9, 5))
        );
        assert_eq!(s.latest_slot(start, at(2019, 10, 8, 23)), None);
    }

    #[test]
    fn cron_slots_follow_expression() {
        let s = Schedule::cron("0 0 8 5,24 * *");
        let start = at(2019, 10, 18, 0);
        assert_eq!(s.next_after(start, None), Some(at(2019, 10, 24, 8)));
        assert_eq!(s.next_after(start, Some(at(2019, 10, 24, 8))), Some(at(2019, 11, 5, 8)));
        assert_eq!(s.latest_slot(start, at(2019, 11, 20, 0)), Some(at(2019, 11, 5, 8)));
    }

    #[test]
    fn once_fires_a_single_time() {
        let start = at(2019, 12, 2, 0);
        assert_eq!(Schedule::Once.next_after(start, None), Some(start));
        assert_eq!(Schedule::Once.next_after(start, Some(start)), None);
    }

    #[test]
    fn bad_schedules_fail_validation() {
        assert!(matches!(
            Schedule::cron("0 8 5,24 * * * * *").validate(),
            Err(WorkflowValidationError::InvalidCron { .. })
        ));
        assert_eq!(
            Schedule::Interval(Duration::ZERO).validate(),
            Err(WorkflowValidationError::ZeroInterval)
        );
    }

    #[test]
    fn dump_date_param_lags_logical_date() {
        let p = TaskParam::DumpDate { lag_days: 4 };
        assert_eq!(p.resolve(at(2019, 11, 5, 8)), "20191101");
        assert_eq!(TaskParam::literal("latest").resolve(at(2019, 11, 5, 8)), "latest");
    }

    #[test]
    fn execution_order_respects_edges() {
        let w = wf(vec![
            TaskDefinition::shell("c", "true").after("b"),
            TaskDefinition::shell("a", "true"),
            TaskDefinition::shell("b", "true").after("a"),
        ]);
        let order: Vec<&str> = w
            .execution_order()
            .unwrap()
            .iter()
            .map(|t| t.task_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(
            w.edges(),
            vec![("b".to_string(), "c".to_string()), ("a".to_string(), "b".to_string())]
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let w = wf(vec![
            TaskDefinition::shell("a", "true").after("b"),
            TaskDefinition::shell("b", "true").after("a"),
        ]);
        assert!(matches!(w.validate(), Err(WorkflowValidationError::Cycle { .. })));
    }

    #[test]
    fn structural_errors_are_reported() {
        assert_eq!(wf(vec![]).validate(), Err(WorkflowValidationError::NoTasks));
        assert_eq!(
            wf(vec![TaskDefinition::shell("a", "x"), TaskDefinition::shell("a", "y")]).validate(),
            Err(WorkflowValidationError::DuplicateTask("a".into()))
        );
        assert_eq!(
            wf(vec![TaskDefinition::shell("a", "x").after("a")]).validate(),
            Err(WorkflowValidationError::SelfDependency { task: "a".into() })
        );
        assert_eq!(
            wf(vec![TaskDefinition::shell("a", "x").after("zz")]).validate(),
            Err(WorkflowValidationError::UnknownDependency {
                task: "a".into(),
                dependency: "zz".into()
            })
        );
        assert_eq!(
            wf(vec![TaskDefinition::shell("a", "  ")]).validate(),
            Err(WorkflowValidationError::EmptyCommand { task: "a".into() })
        );
        assert_eq!(
            wf(vec![TaskDefinition::remote_sync("a", "", "ds")]).validate(),
            Err(WorkflowValidationError::EmptyRemote { task: "a".into() })
        );
    }

    #[test]
    fn serializes_task_kind_inline() {
        let task = TaskDefinition::remote_sync("raw", "owner/repo", "raw_ds");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "remote_sync");
        assert_eq!(json["remote"], "owner/repo");
        assert!(json.get("depends_on").is_none());
    }
}
