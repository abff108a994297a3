//! store.rs
//!
//! Capabilities of a versioned tabular repository, as the importer and the
//! task runner consume them, plus an in-process implementation used for
//! tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::errors::IngestError;
use crate::table::{ImportMode, LoadDirective, TableData};

/// Bulk-load capability: write a whole row source into one table.
pub trait TableStore {
    /// Create `table` if missing, then write every row of `data` keyed by
    /// `primary_key` according to `mode`. Returns the number of rows written.
    fn bulk_import(
        &mut self,
        table: &str,
        data: &TableData,
        primary_key: &[String],
        mode: ImportMode,
    ) -> impl Future<Output = Result<u64, IngestError>> + Send;
}

/// A checked-out working copy that can record and publish its changes.
pub trait VersionedRepository: TableStore {
    /// Stage and commit all working changes. Returns `false` when there was
    /// nothing to commit.
    fn commit(&mut self, message: &str) -> impl Future<Output = Result<bool, IngestError>> + Send;

    fn push(
        &mut self,
        remote: &str,
        branch: &str,
    ) -> impl Future<Output = Result<(), IngestError>> + Send;

    /// Throw away the working copy.
    fn release(self) -> impl Future<Output = Result<(), IngestError>> + Send
    where
        Self: Sized;
}

/// Clones remote repositories into fresh working copies.
pub trait RepositoryProvider {
    type Repo: VersionedRepository + Send;

    fn checkout(
        &self,
        remote: &str,
        workspace: &str,
    ) -> impl Future<Output = Result<Self::Repo, IngestError>> + Send;
}

/// Apply directives in order, stopping at the first failure.
pub async fn apply_directives<S: TableStore + Send>(
    store: &mut S,
    directives: &[LoadDirective],
) -> Result<u64, IngestError> {
    let mut written = 0;
    for d in directives {
        written += store
            .bulk_import(&d.table, &d.data, &d.primary_key, d.mode)
            .await?;
    }
    Ok(written)
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One `bulk_import` call as the memory store saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub table: String,
    pub primary_key: Vec<String>,
    pub mode: ImportMode,
    pub rows: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    imports: Vec<ImportRecord>,
    checkouts: Vec<(String, String)>,
    commits: Vec<String>,
    pushes: Vec<(String, String)>,
    releases: usize,
    dirty: bool,
}

/// Shared, cloneable in-memory repository. Every clone (and every checkout)
/// sees the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.lock().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.lock().tables.keys().cloned().collect()
    }

    pub fn imports(&self) -> Vec<ImportRecord> {
        self.lock().imports.clone()
    }

    pub fn checkouts(&self) -> Vec<(String, String)> {
        self.lock().checkouts.clone()
    }

    pub fn commits(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    pub fn pushes(&self) -> Vec<(String, String)> {
        self.lock().pushes.clone()
    }

    pub fn releases(&self) -> usize {
        self.lock().releases
    }

    fn import(
        &self,
        table: &str,
        data: &TableData,
        primary_key: &[String],
        mode: ImportMode,
    ) -> Result<u64, IngestError> {
        let mut state = self.lock();
        state.imports.push(ImportRecord {
            table: table.to_string(),
            primary_key: primary_key.to_vec(),
            mode,
            rows: data.len(),
        });

        let key_positions = data
            .column_positions(primary_key)
            .map_err(|missing| IngestError::Schema {
                table: table.to_string(),
                reason: format!("key column {missing} is not in the header"),
            })?;

        let target = state
            .tables
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable {
                columns: data.columns.clone(),
                primary_key: primary_key.to_vec(),
                rows: Vec::new(),
            });

        if target.columns != data.columns {
            return Err(IngestError::Schema {
                table: table.to_string(),
                reason: format!(
                    "columns {:?} do not match existing {:?}",
                    data.columns, target.columns
                ),
            });
        }

        if mode == ImportMode::Replace {
            target.rows.clear();
        }

        let key_of = |row: &[String]| -> Vec<String> {
            key_positions.iter().map(|&i| row[i].clone()).collect()
        };

        // Keyless updates match on the whole row so re-running a load adds nothing.
        if key_positions.is_empty() && mode == ImportMode::Update {
            let present: HashSet<Vec<String>> = target.rows.iter().cloned().collect();
            let missing: Vec<Vec<String>> = data
                .rows
                .iter()
                .filter(|row| !present.contains(*row))
                .cloned()
                .collect();
            let written = missing.len() as u64;
            target.rows.extend(missing);
            state.dirty |= written > 0;
            return Ok(written);
        }

        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        if !key_positions.is_empty() {
            for (i, row) in target.rows.iter().enumerate() {
                index.insert(key_of(row), i);
            }
        }

        for row in &data.rows {
            if key_positions.is_empty() {
                target.rows.push(row.clone());
                continue;
            }
            let key = key_of(row);
            match index.get(&key) {
                Some(_) if mode == ImportMode::Append => {
                    return Err(IngestError::DuplicateKey {
                        table: table.to_string(),
                        key,
                    });
                }
                Some(&i) => target.rows[i] = row.clone(),
                None => {
                    index.insert(key, target.rows.len());
                    target.rows.push(row.clone());
                }
            }
        }

        state.dirty = true;
        Ok(data.len() as u64)
    }
}

impl TableStore for MemoryStore {
    async fn bulk_import(
        &mut self,
        table: &str,
        data: &TableData,
        primary_key: &[String],
        mode: ImportMode,
    ) -> Result<u64, IngestError> {
        self.import(table, data, primary_key, mode)
    }
}

impl VersionedRepository for MemoryStore {
    async fn commit(&mut self, message: &str) -> Result<bool, IngestError> {
        let mut state = self.lock();
        if !state.dirty {
            return Ok(false);
        }
        state.dirty = false;
        state.commits.push(message.to_string());
        Ok(true)
    }

    async fn push(&mut self, remote: &str, branch: &str) -> Result<(), IngestError> {
        self.lock()
            .pushes
            .push((remote.to_string(), branch.to_string()));
        Ok(())
    }

    async fn release(self) -> Result<(), IngestError> {
        self.lock().releases += 1;
        Ok(())
    }
}

impl RepositoryProvider for MemoryStore {
    type Repo = MemoryStore;

    async fn checkout(&self, remote: &str, workspace: &str) -> Result<MemoryStore, IngestError> {
        self.lock()
            .checkouts
            .push((remote.to_string(), workspace.to_string()));
        Ok(self.clone())
    }
}
