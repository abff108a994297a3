//! Entrypoint: set up tracing, register every dataset workflow, start the HTTP
//! metrics & health server, and begin the scheduling loop.
//!
//! This application uses a strongly-typed configuration (`Settings`) defined in `config.rs`,
//! which provides:
//!  - `database_url`       – Dolt sql-server connection string
//!  - `tick_interval`      – How often to check for due workflows
//!  - `server_bind`        – HTTP bind address for metrics & health endpoints
//!  - `datasets`           – The CSV sources behind each remote-sync task

use std::{net::SocketAddr, time::Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use prometheus::{Encoder, TextEncoder}; // ← bring Encoder trait into scope
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tabular_ingest::config::Settings;
use tabular_ingest::dolt::DoltServer;
use tabular_ingest::errors::IngestError;
use tabular_ingest::loader::HttpFetcher;
use tabular_ingest::metrics;
use tabular_ingest::registry;
use tabular_ingest::runner::{RunnerSettings, TaskRunner};
use tabular_ingest::scheduler::{Scheduler, TickScheduler};

/// Application entrypoint for the dataset loaders.
///
/// **Workflow**:
/// 1. Initialise tracing/logging from `RUST_LOG` (or default to `info`).
/// 2. Load `Config.toml` (and apply any `APP__…` env-var overrides).
/// 3. Build and register every dataset workflow.
/// 4. Launch a background HTTP server on `/metrics` and `/healthz`.
/// 5. Enter the scheduling loop: every `tick_interval`, run all due
///    workflows concurrently and record how each ended.
#[tokio::main]
async fn main() -> Result<(), IngestError> {
    // ───────────────────────────────────────────────────────────────
    // 1. Initialise tracing / logging
    // ───────────────────────────────────────────────────────────────
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    info!("Starting dataset loaders…");

    // ───────────────────────────────────────────────────────────────
    // 2. Load configuration
    // ───────────────────────────────────────────────────────────────
    let settings = Settings::new()?;
    info!(?settings, "Loaded configuration");

    // ───────────────────────────────────────────────────────────────
    // 3. Workflow registry
    // ───────────────────────────────────────────────────────────────
    let workflows = registry::build(&settings.default_args)?;
    for dataset in registry::datasets(&workflows) {
        if settings.dataset_sources(&dataset).is_empty() {
            warn!(%dataset, "No sources configured; tasks loading it will fail");
        }
    }

    let mut scheduler = TickScheduler::new();
    for workflow in workflows {
        scheduler.register(workflow)?;
    }
    info!(workflows = scheduler.len(), "Registered workflows");

    let server = DoltServer::new(&settings.database_url, &settings.remote_host)?;
    let runner = TaskRunner::new(server, HttpFetcher::new()?, RunnerSettings::from(&settings));

    // ───────────────────────────────────────────────────────────────
    // 4. HTTP server for metrics & health
    // ───────────────────────────────────────────────────────────────
    //
    // We must set the `Content-Type` header on `/metrics` to:
    //     text/plain; version=0.0.4; charset=utf-8
    // Otherwise Prometheus (v3+) will reject the scrape.
    let addr: SocketAddr = settings.bind_addr()?;

    let make_svc = make_service_fn(move |_conn| {
        async move {
            Ok::<_, IngestError>(service_fn(move |req: Request<Body>| {
                async move {
                    match (req.method(), req.uri().path()) {
                        // ─── METRICS ENDPOINT ────────────────────────────────
                        (&Method::GET, "/metrics") => {
                            let metrics_text = metrics::gather_metrics();
                            let encoder = TextEncoder::new();
                            let mime = encoder.format_type();

                            let resp = Response::builder()
                                .header("Content-Type", mime)
                                .body(Body::from(metrics_text))
                                .expect("Failed to build /metrics response");

                            Ok::<Response<Body>, IngestError>(resp)
                        }

                        // ─── HEALTHCHECK ENDPOINT ───────────────────────────
                        (&Method::GET, "/healthz") => {
                            Ok::<Response<Body>, IngestError>(Response::new(Body::from("OK")))
                        }

                        // ─── ANY OTHER ROUTE ────────────────────────────────
                        _ => {
                            let not_found = Response::builder()
                                .status(404)
                                .body(Body::empty())
                                .unwrap_or_default();
                            Ok::<Response<Body>, IngestError>(not_found)
                        }
                    }
                }
            }))
        }
    });

    // Spawn the metrics & health HTTP server
    tokio::spawn(async move {
        info!(%addr, "Starting metrics & health server");
        if let Err(e) = Server::bind(&addr).serve(make_svc).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    // ───────────────────────────────────────────────────────────────
    // 5. Scheduling loop
    // ───────────────────────────────────────────────────────────────
    let mut ticker = interval(settings.tick_interval);

    loop {
        ticker.tick().await;

        let due = scheduler.due(Utc::now());
        if due.is_empty() {
            continue;
        }

        let cycle_start = Instant::now();
        info!("Running {} due workflows", due.len());

        // One future per due run, each returning (workflow_name, succeeded)
        let mut runs = FuturesUnordered::new();
        for run in &due {
            let runner = &runner;
            runs.push(async move {
                match runner.run_workflow(&run.workflow, run.logical_date).await {
                    Ok(report) => (run.workflow.name.clone(), report.succeeded()),
                    Err(e) => {
                        error!(workflow = %run.workflow.name, error = %e, "Workflow run aborted");
                        (run.workflow.name.clone(), false)
                    }
                }
            });
        }

        let mut total_failed = 0;
        while let Some((name, succeeded)) = runs.next().await {
            if !succeeded {
                total_failed += 1;
            }
            scheduler.finish(&name, succeeded);
        }

        info!(
            total_runs = due.len(),
            total_failed = total_failed,
            cycle_s = cycle_start.elapsed().as_secs_f64(),
            "Scheduling cycle complete"
        );
    }
}
