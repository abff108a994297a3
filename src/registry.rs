//! registry.rs
//!
//! Every dataset workflow this service runs. Each is pure declaration:
//! a schedule, a start date, shared default args and a task graph.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::errors::{IngestError, WorkflowValidationError};
use crate::workflow::{DefaultArgs, Schedule, TaskDefinition, TaskKind, TaskParam, Workflow};

pub const FX_RATES_REPO: &str = "oscarbatori/fx-test-data";
pub const MTA_REPO: &str = "oscarbatori/mta-data";
pub const IP_TO_COUNTRY_REPO: &str = "Liquidata/ip-to-country";
pub const WIKIPEDIA_WORDS_REPO: &str = "Liquidata/wikipedia-word-frequency";
pub const WIKIPEDIA_NGRAMS_REPO: &str = "Liquidata/wikipedia-ngrams";
pub const FIVE_THIRTY_EIGHT_POLLS_REPO: &str = "five-thirty-eight/polls";

/// Wikipedia XML dumps land on the 1st and 20th; jobs run four days later.
pub const WIKIPEDIA_CRON: &str = "0 0 8 5,24 * *";
pub const WIKIPEDIA_DUMP_LAG_DAYS: i64 = 4;

/// Dump dates the ngram backfill replays, one independent task each.
pub const NGRAM_BACKFILL_DATES: [&str; 7] = [
    "20190820", "20190901", "20190920", "20191001", "20191020", "20191101", "20191120",
];

fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn import_script(dataset: &str, script: &str) -> String {
    format!("{{dags_folder}}/{dataset}/{script}")
}

/// Build and validate every workflow with the given default args.
pub fn build(defaults: &DefaultArgs) -> Result<Vec<Workflow>, IngestError> {
    let args = || defaults.clone();
    let dump_date = TaskParam::DumpDate {
        lag_days: WIKIPEDIA_DUMP_LAG_DAYS,
    };

    let mut workflows = vec![
        Workflow::new("fx_rates", Schedule::hourly(), date(2019, 10, 9), args())
            .task(TaskDefinition::remote_sync("fx_rates_raw", FX_RATES_REPO, "fx_rates_raw"))
            .task(
                TaskDefinition::remote_sync("fx_rates_averages", FX_RATES_REPO, "fx_rates_averages")
                    .after("fx_rates_raw"),
            ),
        Workflow::new("mta_data", Schedule::daily(), date(2019, 10, 8), args())
            .task(TaskDefinition::remote_sync("raw_mta_data", MTA_REPO, "mta_data")),
        Workflow::new("ip_to_country", Schedule::daily(), date(2019, 10, 8), args())
            .task(TaskDefinition::remote_sync("ip_to_country", IP_TO_COUNTRY_REPO, "ip_to_country")),
    ];

    for (name, start, script) in [
        ("word_net", date(2019, 10, 22), "import_from_source.pl"),
        ("code_search_net", date(2019, 10, 23), "import_from_source.pl"),
        ("usda_all_foods", date(2019, 10, 24), "import_from_source.pl"),
        ("tatoeba_sentence_translations", date(2019, 10, 21), "import-from-source.pl"),
        ("neural_code_search_eval", date(2019, 10, 25), "import_from_source.pl"),
    ] {
        workflows.push(
            Workflow::new(name, Schedule::weekly(), start, args())
                .task(TaskDefinition::shell("import-data", &import_script(name, script))),
        );
    }

    workflows.push(
        Workflow::new(
            "wikipedia-word-frequency",
            Schedule::cron(WIKIPEDIA_CRON),
            date(2019, 10, 18),
            args(),
        )
        .task(
            TaskDefinition::remote_sync("import-data", WIKIPEDIA_WORDS_REPO, "wikipedia_word_frequency")
                .with_param("dump_date", dump_date.clone()),
        ),
    );

    workflows.push(
        Workflow::new(
            "wikipedia-ngrams",
            Schedule::cron(WIKIPEDIA_CRON),
            date(2019, 11, 5),
            args(),
        )
        .task(
            TaskDefinition::remote_sync("import-data", WIKIPEDIA_NGRAMS_REPO, "wikipedia_ngrams")
                .with_param("dump_date", dump_date)
                .with_param("dump_target", TaskParam::literal("latest")),
        ),
    );

    let mut backfill = Workflow::new(
        "wikipedia-ngrams-backfill",
        Schedule::Once,
        date(2019, 12, 2),
        args(),
    );
    for dump in NGRAM_BACKFILL_DATES {
        backfill = backfill.task(
            TaskDefinition::remote_sync(
                &format!("backfill-data-{dump}"),
                WIKIPEDIA_NGRAMS_REPO,
                "wikipedia_ngrams",
            )
            .with_param("dump_date", TaskParam::literal(dump))
            .with_param("dump_target", TaskParam::literal(dump)),
        );
    }
    workflows.push(backfill);

    workflows.push(
        Workflow::new(
            "five_thirty_eight_polls",
            Schedule::hourly(),
            date(2019, 12, 3),
            args(),
        )
        .task(TaskDefinition::remote_sync(
            "five_thirty_eight_polls",
            FIVE_THIRTY_EIGHT_POLLS_REPO,
            "five_thirty_eight_polls",
        )),
    );

    validate_all(&workflows)?;
    Ok(workflows)
}

/// Validate each workflow and reject duplicate names.
pub fn validate_all(workflows: &[Workflow]) -> Result<(), IngestError> {
    let mut names = HashSet::new();
    for wf in workflows {
        wf.validate()
            .map_err(|e| IngestError::InvalidWorkflow(wf.name.clone(), e))?;
        if !names.insert(wf.name.as_str()) {
            return Err(IngestError::InvalidWorkflow(
                wf.name.clone(),
                WorkflowValidationError::DuplicateWorkflow(wf.name.clone()),
            ));
        }
    }
    Ok(())
}

/// Datasets referenced by remote-sync tasks, deduplicated and sorted.
pub fn datasets(workflows: &[Workflow]) -> Vec<String> {
    let mut out: Vec<String> = workflows
        .iter()
        .flat_map(|w| w.tasks.iter())
        .filter_map(|t| match &t.kind {
            TaskKind::RemoteSync { dataset, .. } => Some(dataset.clone()),
            TaskKind::Shell { .. } => None,
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Scheduler-facing view of one workflow: its declaration plus the task
/// graph's edges.
#[derive(Debug, Serialize)]
pub struct WorkflowDescription<'a> {
    pub name: &'a str,
    pub schedule: &'a Schedule,
    pub start_date: DateTime<Utc>,
    pub default_args: &'a DefaultArgs,
    pub tasks: &'a [TaskDefinition],
    pub edges: Vec<(String, String)>,
}

pub fn describe(workflows: &[Workflow]) -> Vec<WorkflowDescription<'_>> {
    workflows
        .iter()
        .map(|w| WorkflowDescription {
            name: &w.name,
            schedule: &w.schedule,
            start_date: w.start_date,
            default_args: &w.default_args,
            tasks: &w.tasks,
            edges: w.edges(),
        })
        .collect()
}
