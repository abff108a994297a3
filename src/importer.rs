//! importer.rs
//!
//! One-off bulk loader for per-entity CSV exports laid out as
//! `<root>/<entity_id>/<table_key>.csv`. Each recognised file is upserted
//! into its mapped table; anything else is skipped. The first I/O, CSV or
//! store error aborts the run and leaves earlier loads in place.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use crate::errors::IngestError;
use crate::metrics::{FILES_SKIPPED, ROWS_IMPORTED};
use crate::store::TableStore;
use crate::table::{infer_primary_key, ImportMode, TableData};

/// Destination table for an export file's lookup key.
pub fn table_for_key(key: &str) -> Option<&'static str> {
    match key {
        "CareerTotalsAllStarSeason" => Some("career_totals_allstar"),
        "CareerTotalsPostSeason" => Some("career_totals_post_season"),
        "CareerTotalsRegularSeason" => Some("career_totals_regular_season"),
        "SeasonRankingsPostSeason" => Some("rankings_post_season"),
        "SeasonRankingsRegularSeason" => Some("rankings_regular_season"),
        "SeasonTotalsAllStarSeason" => Some("season_totals_allstar"),
        "SeasonTotalsPostSeason" => Some("season_totals_post_season"),
        "SeasonTotalsRegularSeason" => Some("season_totals_regular_season"),
        _ => None,
    }
}

/// File name up to the first `.`.
pub fn lookup_key(file_name: &str) -> &str {
    file_name.split('.').next().unwrap_or(file_name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub entities: usize,
    pub loads: usize,
    pub skipped: usize,
    pub rows: u64,
}

/// Sorted entry names of a directory.
fn list_dir(dir: &Path) -> Result<Vec<String>, IngestError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))? {
        let entry = entry.map_err(|e| IngestError::io(dir, e))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Walk every entity directory under `root` and upsert its recognised
/// exports into `store`, writing `"{count}/{total}: {entity_id}"` to
/// `progress` before each entity.
pub async fn import_exports<S, W>(
    root: &Path,
    store: &mut S,
    progress: &mut W,
) -> Result<ImportSummary, IngestError>
where
    S: TableStore,
    W: Write,
{
    let entities = list_dir(root)?;
    let total = entities.len();
    let mut summary = ImportSummary::default();

    for (i, entity_id) in entities.iter().enumerate() {
        writeln!(progress, "{}/{}: {}", i + 1, total, entity_id)
            .map_err(|e| IngestError::io(root, e))?;
        summary.entities += 1;

        let entity_dir = root.join(entity_id);
        for file_name in list_dir(&entity_dir)? {
            let Some(table) = table_for_key(lookup_key(&file_name)) else {
                debug!(entity = %entity_id, file = %file_name, "No table for export, skipping");
                FILES_SKIPPED.inc();
                summary.skipped += 1;
                continue;
            };

            let path = entity_dir.join(&file_name);
            let data = TableData::from_path(&path)?;
            let primary_key = infer_primary_key(&data.columns);

            let rows = store
                .bulk_import(table, &data, &primary_key, ImportMode::Update)
                .await?;

            debug!(
                entity = %entity_id,
                table,
                rows,
                primary_key = ?primary_key,
                "Imported export"
            );
            ROWS_IMPORTED.inc_by(rows);
            summary.loads += 1;
            summary.rows += rows;
        }
    }

    info!(
        entities = summary.entities,
        loads = summary.loads,
        skipped = summary.skipped,
        rows = summary.rows,
        "Import complete"
    );
    Ok(summary)
}
