use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tabular_ingest::errors::IngestError;
use tabular_ingest::loader::{SourceFetcher, SourceSpec};
use tabular_ingest::registry;
use tabular_ingest::runner::{RunnerSettings, TaskOutcome, TaskRunner};
use tabular_ingest::store::MemoryStore;
use tabular_ingest::table::{ImportMode, TableData};
use tabular_ingest::workflow::{DefaultArgs, Schedule, TaskDefinition, Workflow};

/// Serves the same CSV for every URL, failing the first `fail_first` calls.
#[derive(Default)]
struct CannedFetcher {
    fail_first: usize,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl CannedFetcher {
    fn failing(n: usize) -> Self {
        CannedFetcher {
            fail_first: n,
            ..Default::default()
        }
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

impl SourceFetcher for CannedFetcher {
    async fn fetch(&self, url: &str) -> Result<TableData, IngestError> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err(IngestError::UnknownDataset(format!("transient failure for {url}")));
        }
        TableData::from_reader(url, "currency_id,rate\nEUR,1.1\nGBP,1.3\n".as_bytes())
    }
}

fn logical_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 11, 24, 8, 0, 0).unwrap()
}

fn source(table: &str, url: &str) -> Vec<SourceSpec> {
    vec![SourceSpec {
        table: table.to_string(),
        url: url.to_string(),
        primary_key: None,
        mode: ImportMode::Update,
    }]
}

fn settings(datasets: &[(&str, Vec<SourceSpec>)], dry_run: bool) -> RunnerSettings {
    RunnerSettings {
        remote_name: "origin".to_string(),
        branch: "master".to_string(),
        dags_folder: PathBuf::from("dags"),
        dry_run,
        datasets: datasets
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn fast_args() -> DefaultArgs {
    DefaultArgs {
        retries: 1,
        retry_delay: Duration::ZERO,
        ..DefaultArgs::default()
    }
}

fn fx_workflow() -> Workflow {
    Workflow::new("fx_rates", Schedule::hourly(), logical_date(), fast_args())
        .task(TaskDefinition::remote_sync("fx_rates_raw", "oscarbatori/fx-test-data", "raw"))
        .task(
            TaskDefinition::remote_sync("fx_rates_averages", "oscarbatori/fx-test-data", "avg")
                .after("fx_rates_raw"),
        )
}

#[tokio::test]
async fn remote_sync_clones_loads_commits_and_pushes() {
    let store = MemoryStore::new();
    let runner = TaskRunner::new(
        store.clone(),
        CannedFetcher::default(),
        settings(
            &[
                ("raw", source("fx_raw", "https://fx/{date}.csv")),
                ("avg", source("fx_avg", "https://fx/avg.csv")),
            ],
            false,
        ),
    );

    let report = runner.run_workflow(&fx_workflow(), logical_date()).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(
        store.checkouts(),
        vec![
            (
                "oscarbatori/fx-test-data".to_string(),
                "fx_rates_fx_rates_raw_20191124080000".to_string()
            ),
            (
                "oscarbatori/fx-test-data".to_string(),
                "fx_rates_fx_rates_averages_20191124080000".to_string()
            ),
        ]
    );
    assert_eq!(store.commits().len(), 2);
    assert_eq!(
        store.pushes(),
        vec![("origin".to_string(), "master".to_string()); 2]
    );
    assert_eq!(store.releases(), 2);

    let raw = store.table("fx_raw").unwrap();
    assert_eq!(raw.primary_key, vec!["currency_id".to_string()]);
    assert_eq!(raw.rows.len(), 2);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let store = MemoryStore::new();
    let fetcher = CannedFetcher::failing(1);
    let runner = TaskRunner::new(
        store.clone(),
        fetcher,
        settings(&[("raw", source("fx_raw", "https://fx/raw.csv"))], false),
    );
    let wf = Workflow::new("fx", Schedule::hourly(), logical_date(), fast_args())
        .task(TaskDefinition::remote_sync("raw", "o/r", "raw"));

    let report = runner.run_workflow(&wf, logical_date()).await.unwrap();

    assert_eq!(report.outcome("raw"), Some(TaskOutcome::Success));
    assert_eq!(store.commits().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_skip_dependants() {
    let store = MemoryStore::new();
    let fetcher = CannedFetcher::failing(usize::MAX);
    let runner = TaskRunner::new(
        store.clone(),
        fetcher,
        settings(
            &[
                ("raw", source("fx_raw", "https://fx/raw.csv")),
                ("avg", source("fx_avg", "https://fx/avg.csv")),
            ],
            false,
        ),
    );

    let report = runner.run_workflow(&fx_workflow(), logical_date()).await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.outcome("fx_rates_raw"), Some(TaskOutcome::Failed));
    assert_eq!(
        report.outcome("fx_rates_averages"),
        Some(TaskOutcome::UpstreamFailed)
    );
    assert!(store.checkouts().is_empty());
}

#[tokio::test]
async fn dataset_without_sources_fails_the_task() {
    let store = MemoryStore::new();
    let runner = TaskRunner::new(store.clone(), CannedFetcher::default(), settings(&[], false));
    let wf = Workflow::new(
        "mta_data",
        Schedule::daily(),
        logical_date(),
        DefaultArgs {
            retries: 0,
            ..fast_args()
        },
    )
    .task(TaskDefinition::remote_sync("raw_mta_data", "oscarbatori/mta-data", "mta_data"));

    let err = runner
        .run_task(&wf, &wf.tasks[0], logical_date())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UnknownDataset(name) if name == "mta_data"));

    let report = runner.run_workflow(&wf, logical_date()).await.unwrap();
    assert_eq!(report.outcome("raw_mta_data"), Some(TaskOutcome::Failed));
}

#[tokio::test]
async fn dry_run_loads_without_commit_or_push() {
    let store = MemoryStore::new();
    let runner = TaskRunner::new(
        store.clone(),
        CannedFetcher::default(),
        settings(&[("raw", source("fx_raw", "https://fx/raw.csv"))], true),
    );
    let wf = Workflow::new("fx", Schedule::hourly(), logical_date(), fast_args())
        .task(TaskDefinition::remote_sync("raw", "o/r", "raw"));

    let report = runner.run_workflow(&wf, logical_date()).await.unwrap();

    assert!(report.succeeded());
    assert!(store.table("fx_raw").is_some());
    assert!(store.commits().is_empty());
    assert!(store.pushes().is_empty());
    assert_eq!(store.releases(), 1);
}

#[tokio::test]
async fn ngram_params_render_into_source_urls() {
    let store = MemoryStore::new();
    let fetcher = CannedFetcher::default();
    let runner = TaskRunner::new(
        store.clone(),
        &fetcher,
        settings(
            &[(
                "wikipedia_ngrams",
                source("unigram_counts", "https://dumps/{dump_date}/{dump_target}.csv"),
            )],
            false,
        ),
    );
    let workflows = registry::build(&fast_args()).unwrap();
    let find = |name: &str| workflows.iter().find(|w| w.name == name).unwrap();

    let ngrams = runner
        .run_workflow(find("wikipedia-ngrams"), logical_date())
        .await
        .unwrap();
    let backfill = runner
        .run_workflow(find("wikipedia-ngrams-backfill"), logical_date())
        .await
        .unwrap();

    assert!(ngrams.succeeded());
    assert!(backfill.succeeded());
    assert_eq!(backfill.outcomes.len(), 7);

    let urls = fetcher.urls();
    assert_eq!(urls.len(), 8);
    assert_eq!(urls[0], "https://dumps/20191120/latest.csv");
    assert_eq!(urls[1], "https://dumps/20190820/20190820.csv");
    assert_eq!(urls[7], "https://dumps/20191120/20191120.csv");
}

#[tokio::test]
async fn shell_tasks_render_dags_folder_and_report_exit_status() {
    let dags = tempfile::tempdir().unwrap();
    let mut cfg = settings(&[], false);
    cfg.dags_folder = dags.path().to_path_buf();
    let runner = TaskRunner::new(MemoryStore::new(), CannedFetcher::default(), cfg);

    runner
        .run_shell("import-data", "test -d {dags_folder}")
        .await
        .unwrap();

    let err = runner.run_shell("import-data", "exit 3").await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Command { ref task, status } if task == "import-data" && status.code() == Some(3)
    ));
}
