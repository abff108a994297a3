//! loader.rs
//!
//! Dataset loaders: turn a dataset's configured sources into ordered load
//! directives for one run. Sources are CSV documents fetched over HTTP; their
//! URLs are templates rendered against the run context.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::IngestError;
use crate::metrics::{SOURCE_FETCH_COUNTER, SOURCE_FETCH_HISTOGRAM};
use crate::table::{infer_primary_key, ImportMode, LoadDirective, TableData};

/// One configured row source of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSpec {
    /// Destination table
    pub table: String,

    /// CSV location; `{name}` placeholders are filled from the run context
    pub url: String,

    /// Key columns; when omitted they are inferred from the header
    #[serde(default)]
    pub primary_key: Option<Vec<String>>,

    #[serde(default)]
    pub mode: ImportMode,
}

/// What a loader knows about the run it is producing directives for.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub workflow: String,
    pub task: String,
    pub logical_date: DateTime<Utc>,
    pub params: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(workflow: &str, task: &str, logical_date: DateTime<Utc>) -> Self {
        RunContext {
            workflow: workflow.to_string(),
            task: task.to_string(),
            logical_date,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match self.params.get(name) {
            Some(v) => Some(v.clone()),
            None if name == "date" => Some(self.logical_date.format("%Y%m%d").to_string()),
            None => None,
        }
    }

    /// Fill every `{name}` placeholder in `template`. `{date}` defaults to the
    /// logical date as `YYYYMMDD` unless a param overrides it.
    pub fn render(&self, template: &str) -> Result<String, IngestError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| IngestError::Template {
                template: template.to_string(),
                param: after.to_string(),
            })?;
            let name = &after[..close];
            let value = self.lookup(name).ok_or_else(|| IngestError::Template {
                template: template.to_string(),
                param: name.to_string(),
            })?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

/// Retrieves one CSV row source.
pub trait SourceFetcher {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<TableData, IngestError>> + Send;
}

impl<T: SourceFetcher + Sync> SourceFetcher for &T {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<TableData, IngestError>> + Send {
        (**self).fetch(url)
    }
}

/// Fetches CSV sources over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, IngestError> {
        let client = Client::builder()
            .user_agent(concat!("tabular-ingest/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()
            .map_err(|e| IngestError::Fetch("client setup".to_string(), e))?;
        Ok(HttpFetcher { client })
    }
}

impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<TableData, IngestError> {
        SOURCE_FETCH_COUNTER.inc();
        let start = Instant::now();

        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| IngestError::Fetch(url.to_string(), e))?
            .bytes()
            .await
            .map_err(|e| IngestError::Fetch(url.to_string(), e))?;

        let data = TableData::from_reader(url, &bytes[..])?;

        SOURCE_FETCH_HISTOGRAM.observe(start.elapsed().as_secs_f64());
        Ok(data)
    }
}

/// Fetch every source of a dataset, in order, into load directives.
pub async fn load_directives<F: SourceFetcher>(
    sources: &[SourceSpec],
    ctx: &RunContext,
    fetcher: &F,
) -> Result<Vec<LoadDirective>, IngestError> {
    let mut directives = Vec::with_capacity(sources.len());

    for source in sources {
        let url = ctx.render(&source.url)?;
        let data = fetcher.fetch(&url).await?;
        let primary_key = match &source.primary_key {
            Some(key) => key.clone(),
            None => infer_primary_key(&data.columns),
        };
        debug!(
            table = %source.table,
            url   = %url,
            rows  = data.len(),
            "Fetched source"
        );
        directives.push(LoadDirective {
            table: source.table.clone(),
            data,
            primary_key,
            mode: source.mode,
        });
    }

    info!(
        workflow   = %ctx.workflow,
        task       = %ctx.task,
        directives = directives.len(),
        "Prepared load directives"
    );
    Ok(directives)
}
