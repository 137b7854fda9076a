//! Flat-file historical record: backup, schema diff, merge, dedup, atomic persist.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rentwatch_core::{ListingRecord, INSERT_DATE_FORMAT};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub data_dir: PathBuf,
    pub file_name: String,
    /// Sub-directory of `data_dir` holding dated backup snapshots.
    pub backup_dir: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            file_name: "idealista_data.csv".to_string(),
            backup_dir: "idealista_data_backups".to_string(),
        }
    }
}

/// A flat table whose header defines the schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoricalTable {
    columns: Vec<String>,
    rows: Vec<ListingRecord>,
}

impl HistoricalTable {
    pub fn new(columns: Vec<String>, rows: Vec<ListingRecord>) -> Self {
        Self { columns, rows }
    }

    /// Table over `records` with the sorted union of their field names as header.
    pub fn from_records(records: &[ListingRecord]) -> Self {
        let columns: BTreeSet<String> = records
            .iter()
            .flat_map(|r| r.field_names().map(str::to_string))
            .collect();
        Self {
            columns: columns.into_iter().collect(),
            rows: records.to_vec(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[ListingRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_set(&self) -> BTreeSet<String> {
        self.columns.iter().cloned().collect()
    }

    /// Drop rows sharing a dedup key, keeping the last occurrence of each.
    ///
    /// Surviving rows keep their relative order. Returns the number removed.
    pub fn deduplicated(self) -> (Self, usize) {
        let before = self.rows.len();
        let mut seen = HashSet::new();
        let mut kept: Vec<ListingRecord> = self
            .rows
            .into_iter()
            .rev()
            .filter(|row| seen.insert(row.dedup_key()))
            .collect();
        kept.reverse();
        let removed = before - kept.len();
        let unkeyed = kept
            .iter()
            .filter(|row| row.dedup_key().property_code.is_empty())
            .count();
        if unkeyed > 0 {
            debug!(unkeyed, "rows without propertyCode are deduplicated on price and size only");
        }
        (
            Self {
                columns: self.columns,
                rows: kept,
            },
            removed,
        )
    }

    pub fn from_csv(bytes: &[u8]) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(bytes);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            rows.push(ListingRecord::from_text_cells(
                columns.iter().cloned().zip(record.iter().map(str::to_string)),
            ));
        }
        Ok(Self { columns, rows })
    }

    /// Serialize with the header first; fields a row lacks become empty cells.
    pub fn to_csv(&self) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(self.columns.iter().map(|column| row.text(column)))?;
        }
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }
}

/// Column sets of the history and an incoming batch differ.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "incoming schema differs from history (missing: [{}], extra: [{}])",
    .missing.join(", "),
    .extra.join(", ")
)]
pub struct SchemaMismatch {
    /// In the history, absent from the incoming batch.
    pub missing: Vec<String>,
    /// In the incoming batch, absent from the history.
    pub extra: Vec<String>,
}

impl SchemaMismatch {
    pub fn between(existing: &BTreeSet<String>, incoming: &BTreeSet<String>) -> Option<Self> {
        let missing: Vec<String> = existing.difference(incoming).cloned().collect();
        let extra: Vec<String> = incoming.difference(existing).cloned().collect();
        if missing.is_empty() && extra.is_empty() {
            None
        } else {
            Some(Self { missing, extra })
        }
    }
}

/// Merge `incoming` after `existing` and deduplicate, newest row winning.
///
/// Returns the merged table (existing header order) and the number of rows
/// removed as duplicates. An empty `incoming` leaves `existing` as is.
pub fn reconcile_tables(
    existing: &HistoricalTable,
    incoming: &[ListingRecord],
) -> Result<(HistoricalTable, usize), SchemaMismatch> {
    if incoming.is_empty() {
        return Ok((existing.clone(), 0));
    }

    let incoming_fields: BTreeSet<String> = incoming
        .iter()
        .flat_map(|r| r.field_names().map(str::to_string))
        .collect();
    if let Some(mismatch) = SchemaMismatch::between(&existing.column_set(), &incoming_fields) {
        return Err(mismatch);
    }

    let merged = existing
        .rows
        .iter()
        .chain(incoming.iter())
        .cloned()
        .collect();
    Ok(HistoricalTable::new(existing.columns.clone(), merged).deduplicated())
}

#[derive(Debug, Error)]
#[error(
    "persisting historical record {} failed (backup snapshot: {})",
    .path.display(),
    describe_backup(.backup)
)]
pub struct PersistError {
    pub path: PathBuf,
    /// Recovery point taken before the failed write, if one existed.
    pub backup: Option<PathBuf>,
    #[source]
    pub source: io::Error,
}

fn describe_backup(backup: &Option<PathBuf>) -> String {
    backup
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("reading historical record {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing historical record {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("backing up {} to {}", .from.display(), .to.display())]
    Backup {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing schema-mismatch side file {}", .path.display())]
    SideFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAction {
    /// No history existed; the deduplicated batch became the history.
    Created { rows: usize, duplicates_removed: usize },
    Merged {
        existing_rows: usize,
        incoming_rows: usize,
        duplicates_removed: usize,
        persisted_rows: usize,
    },
    /// Schemas differed; the batch went to a side file and the history is untouched.
    SideFile {
        mismatch: SchemaMismatch,
        path: PathBuf,
        rows: usize,
    },
    /// Nothing was harvested.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub history_path: PathBuf,
    pub backup: Option<PathBuf>,
    pub action: ReconcileAction,
}

impl ReconcileOutcome {
    pub fn schema_mismatch(&self) -> Option<&SchemaMismatch> {
        match &self.action {
            ReconcileAction::SideFile { mismatch, .. } => Some(mismatch),
            _ => None,
        }
    }
}

/// Sole owner of the historical record file and its backup snapshots.
///
/// Runs must not overlap: backup, merge and persist are not guarded against
/// a concurrent writer.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    config: HistoryConfig,
}

impl HistoryStore {
    pub fn new(config: HistoryConfig) -> Self {
        Self { config }
    }

    pub fn history_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.file_name)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.backup_dir)
    }

    fn file_stem(&self) -> String {
        Path::new(&self.config.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "history".to_string())
    }

    pub async fn load(&self) -> Result<Option<HistoricalTable>, HistoryError> {
        let path = self.history_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(HistoryError::Read { path, source }),
        };
        let table = HistoricalTable::from_csv(&bytes)
            .map_err(|source| HistoryError::Parse { path, source })?;
        if table.columns().is_empty() {
            return Ok(None);
        }
        Ok(Some(table))
    }

    /// Copy the current history to a dated snapshot; `None` when there is no history yet.
    ///
    /// Snapshots are never overwritten: a second snapshot on the same day gets a
    /// numeric suffix.
    pub async fn backup(&self, run_date: NaiveDate) -> Result<Option<PathBuf>, HistoryError> {
        let source = self.history_path();
        let exists = fs::try_exists(&source)
            .await
            .map_err(|err| HistoryError::Read {
                path: source.clone(),
                source: err,
            })?;
        if !exists {
            debug!(path = %source.display(), "no historical record yet; backup skipped");
            return Ok(None);
        }

        let dir = self.backup_dir();
        let backup_error = |to: &Path, err: io::Error| HistoryError::Backup {
            from: source.clone(),
            to: to.to_path_buf(),
            source: err,
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| backup_error(&dir, err))?;
        let base = format!(
            "{}_backup_{}",
            self.file_stem(),
            run_date.format(INSERT_DATE_FORMAT)
        );
        let target = first_free_path(&dir, &base)
            .await
            .map_err(|err| backup_error(&dir, err))?;
        fs::copy(&source, &target)
            .await
            .map_err(|err| backup_error(&target, err))?;

        info!(backup = %target.display(), "historical record backed up");
        Ok(Some(target))
    }

    /// Back up, then merge `incoming` into the history (or divert it to a side file).
    pub async fn reconcile(
        &self,
        incoming: &[ListingRecord],
        run_date: NaiveDate,
    ) -> Result<ReconcileOutcome, HistoryError> {
        let history_path = self.history_path();
        let existing = self.load().await?;
        let backup = self.backup(run_date).await?;

        if incoming.is_empty() {
            info!("no incoming rows; historical record left untouched");
            return Ok(ReconcileOutcome {
                history_path,
                backup,
                action: ReconcileAction::Skipped,
            });
        }

        let action = match existing {
            None => {
                let (table, duplicates_removed) =
                    HistoricalTable::from_records(incoming).deduplicated();
                self.persist(&table, &history_path, &backup).await?;
                info!(
                    path = %history_path.display(),
                    rows = table.len(),
                    duplicates_removed,
                    "historical record created"
                );
                ReconcileAction::Created {
                    rows: table.len(),
                    duplicates_removed,
                }
            }
            Some(existing) => match reconcile_tables(&existing, incoming) {
                Ok((merged, duplicates_removed)) => {
                    self.persist(&merged, &history_path, &backup).await?;
                    info!(
                        path = %history_path.display(),
                        existing_rows = existing.len(),
                        incoming_rows = incoming.len(),
                        duplicates_removed,
                        rows = merged.len(),
                        "historical record merged"
                    );
                    ReconcileAction::Merged {
                        existing_rows: existing.len(),
                        incoming_rows: incoming.len(),
                        duplicates_removed,
                        persisted_rows: merged.len(),
                    }
                }
                Err(mismatch) => {
                    warn!(
                        missing = ?mismatch.missing,
                        extra = ?mismatch.extra,
                        "schema mismatch; incoming rows diverted to side file"
                    );
                    let path = self.write_side_file(incoming, run_date).await?;
                    ReconcileAction::SideFile {
                        mismatch,
                        path,
                        rows: incoming.len(),
                    }
                }
            },
        };

        Ok(ReconcileOutcome {
            history_path,
            backup,
            action,
        })
    }

    /// Atomically replace `target` with `table`; a failure names the backup taken
    /// for this run.
    async fn persist(
        &self,
        table: &HistoricalTable,
        target: &Path,
        backup: &Option<PathBuf>,
    ) -> Result<(), PersistError> {
        let written = match table.to_csv() {
            Ok(bytes) => write_atomically(target, &bytes).await,
            Err(err) => Err(io::Error::other(err)),
        };
        written.map_err(|source| PersistError {
            path: target.to_path_buf(),
            backup: backup.clone(),
            source,
        })
    }

    async fn write_side_file(
        &self,
        incoming: &[ListingRecord],
        run_date: NaiveDate,
    ) -> Result<PathBuf, HistoryError> {
        let dir = &self.config.data_dir;
        let base = format!(
            "{}_{}_schema_mismatch",
            self.file_stem(),
            run_date.format(INSERT_DATE_FORMAT)
        );
        let side_error = |path: PathBuf, source: io::Error| HistoryError::SideFile { path, source };

        let path = first_free_path(dir, &base)
            .await
            .map_err(|err| side_error(dir.clone(), err))?;
        let bytes = HistoricalTable::from_records(incoming)
            .to_csv()
            .map_err(|err| side_error(path.clone(), io::Error::other(err)))?;
        write_atomically(&path, &bytes)
            .await
            .map_err(|err| side_error(path.clone(), err))?;

        info!(path = %path.display(), rows = incoming.len(), "side file written");
        Ok(path)
    }
}

async fn first_free_path(dir: &Path, base: &str) -> io::Result<PathBuf> {
    let mut candidate = dir.join(format!("{base}.csv"));
    let mut suffix = 1u32;
    while fs::try_exists(&candidate).await? {
        candidate = dir.join(format!("{base}_{suffix}.csv"));
        suffix += 1;
    }
    Ok(candidate)
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
///
/// Readers see either the old or the new content, never a partial write.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn run_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn listing(code: &str, price: f64, size: f64, address: &str) -> ListingRecord {
        let mut record = ListingRecord::new();
        record.insert("propertyCode", code);
        record.insert("price", json!(price));
        record.insert("size", json!(size));
        record.insert("address", address);
        record
    }

    fn store_in(dir: &Path) -> HistoryStore {
        HistoryStore::new(HistoryConfig {
            data_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    async fn seed_history(store: &HistoryStore, rows: &[ListingRecord]) {
        let bytes = HistoricalTable::from_records(rows).to_csv().unwrap();
        write_atomically(&store.history_path(), &bytes).await.unwrap();
    }

    #[test]
    fn csv_round_trip_keeps_header_order_and_blanks_missing_fields() {
        let mut sparse = ListingRecord::new();
        sparse.insert("propertyCode", "7");
        let table = HistoricalTable::new(
            vec!["propertyCode".into(), "price".into(), "size".into()],
            vec![listing("1", 900.0, 50.0, "x"), sparse],
        );
        let bytes = table.to_csv().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("propertyCode,price,size\n1,900.0,50.0\n7,,\n"));

        let parsed = HistoricalTable::from_csv(&bytes).unwrap();
        assert_eq!(parsed.columns(), table.columns());
        assert_eq!(parsed.rows()[1].text("price"), "");
    }

    #[test]
    fn dedup_keeps_last_occurrence_in_order() {
        let table = HistoricalTable::from_records(&[
            listing("1", 900.0, 50.0, "old"),
            listing("2", 700.0, 40.0, "only"),
            listing("1", 900.0, 50.0, "new"),
        ]);
        let (table, removed) = table.deduplicated();
        assert_eq!(removed, 1);
        let addresses: Vec<String> = table.rows().iter().map(|r| r.text("address")).collect();
        assert_eq!(addresses, vec!["only", "new"]);
    }

    #[test]
    fn changed_price_yields_exactly_one_row_at_the_new_price() {
        let existing = HistoricalTable::from_csv(
            b"address,price,propertyCode,size\nCalle A,1500,123,70\nCalle B,800,456,40\n",
        )
        .unwrap();
        let incoming = vec![listing("123", 1600.0, 70.0, "Calle A")];

        let (merged, removed) = reconcile_tables(&existing, &incoming).unwrap();
        assert_eq!(removed, 0);
        let at_new_price: Vec<_> = merged
            .rows()
            .iter()
            .filter(|r| r.dedup_key().price == "1600")
            .collect();
        assert_eq!(at_new_price.len(), 1);
        assert_eq!(at_new_price[0].text("propertyCode"), "123");
    }

    #[test]
    fn unchanged_key_is_replaced_by_the_incoming_row() {
        let csv = b"address,price,propertyCode,size\nold,1500,123,70\n";
        let existing = HistoricalTable::from_csv(csv).unwrap();
        let incoming = vec![listing("123", 1500.0, 70.0, "new")];

        let (merged, removed) = reconcile_tables(&existing, &incoming).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.rows()[0].text("address"), "new");
    }

    #[test]
    fn schema_diff_reports_missing_and_extra_columns() {
        let existing =
            HistoricalTable::from_csv(b"address,price,propertyCode,size,floor\n").unwrap();
        let mut incoming = listing("1", 1.0, 1.0, "a");
        incoming.insert("hasLift", true);

        let mismatch = reconcile_tables(&existing, &[incoming]).unwrap_err();
        assert_eq!(mismatch.missing, vec!["floor".to_string()]);
        assert_eq!(mismatch.extra, vec!["hasLift".to_string()]);
        assert!(mismatch.to_string().contains("missing: [floor]"));
    }

    #[tokio::test]
    async fn first_run_creates_history_without_backup() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let incoming = vec![
            listing("1", 900.0, 50.0, "a"),
            listing("1", 900.0, 50.0, "b"),
        ];

        let outcome = store.reconcile(&incoming, run_date()).await.expect("reconcile");
        assert_eq!(outcome.backup, None);
        assert_eq!(
            outcome.action,
            ReconcileAction::Created {
                rows: 1,
                duplicates_removed: 1
            }
        );
        let table = store.load().await.unwrap().expect("history exists");
        assert_eq!(table.rows()[0].text("address"), "b");
        assert!(!store.backup_dir().exists());
    }

    #[tokio::test]
    async fn backup_holds_pre_merge_content_and_is_never_overwritten() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        seed_history(&store, &[listing("1", 900.0, 50.0, "a")]).await;
        let before = std::fs::read(store.history_path()).unwrap();

        let outcome = store
            .reconcile(&[listing("2", 700.0, 40.0, "b")], run_date())
            .await
            .expect("reconcile");
        let backup = outcome.backup.expect("backup taken");
        assert_eq!(
            backup,
            store.backup_dir().join("idealista_data_backup_2026-10-19.csv")
        );
        assert_eq!(std::fs::read(&backup).unwrap(), before);

        let second = store
            .reconcile(&[listing("3", 650.0, 35.0, "c")], run_date())
            .await
            .expect("second reconcile");
        assert_eq!(
            second.backup.expect("second backup"),
            store.backup_dir().join("idealista_data_backup_2026-10-19_1.csv")
        );
        assert_eq!(std::fs::read(&backup).unwrap(), before);
    }

    #[tokio::test]
    async fn reconciling_the_same_batch_twice_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        seed_history(
            &store,
            &[
                listing("1", 900.0, 50.0, "a"),
                listing("2", 700.0, 40.0, "b"),
            ],
        )
        .await;
        let incoming = vec![
            listing("2", 700.0, 40.0, "b2"),
            listing("3", 650.0, 35.0, "c"),
        ];

        store.reconcile(&incoming, run_date()).await.expect("first");
        let after_first = std::fs::read(store.history_path()).unwrap();
        let second = store.reconcile(&incoming, run_date()).await.expect("second");
        let after_second = std::fs::read(store.history_path()).unwrap();

        assert_eq!(after_first, after_second);
        assert!(matches!(
            second.action,
            ReconcileAction::Merged {
                duplicates_removed: 2,
                persisted_rows: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn schema_mismatch_diverts_batch_and_leaves_history_untouched() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let mut seeded = listing("1", 900.0, 50.0, "a");
        seeded.insert("floor", "3");
        seed_history(&store, &[seeded]).await;
        let before = std::fs::read(store.history_path()).unwrap();

        let incoming = vec![listing("2", 700.0, 40.0, "b")];
        let outcome = store.reconcile(&incoming, run_date()).await.expect("reconcile");

        let mismatch = outcome.schema_mismatch().expect("mismatch reported");
        assert_eq!(mismatch.missing, vec!["floor".to_string()]);
        assert_eq!(std::fs::read(store.history_path()).unwrap(), before);

        let ReconcileAction::SideFile { path, rows, .. } = &outcome.action else {
            panic!("expected side file, got {:?}", outcome.action);
        };
        assert_eq!(*rows, 1);
        assert_eq!(
            path,
            &dir.path().join("idealista_data_2026-10-19_schema_mismatch.csv")
        );
        let side = HistoricalTable::from_csv(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(side.rows()[0].text("propertyCode"), "2");
    }

    #[tokio::test]
    async fn empty_batch_skips_the_merge() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        seed_history(&store, &[listing("1", 900.0, 50.0, "a")]).await;
        let before = std::fs::read(store.history_path()).unwrap();

        let outcome = store.reconcile(&[], run_date()).await.expect("reconcile");
        assert_eq!(outcome.action, ReconcileAction::Skipped);
        assert!(outcome.backup.is_some());
        assert_eq!(std::fs::read(store.history_path()).unwrap(), before);
    }

    fn temp_files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect()
    }

    #[tokio::test]
    async fn failed_persist_names_the_backup_and_keeps_history() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        seed_history(&store, &[listing("a", 900.0, 50.0, "Calle Mayor 1")]).await;
        let before = std::fs::read(store.history_path()).unwrap();

        let backup = store.backup(run_date()).await.expect("backup");
        let snapshot = backup.clone().expect("history exists, so a snapshot is taken");

        // A non-empty directory at the target makes the final rename fail.
        let blocked = dir.path().join("blocked.csv");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("occupant"), b"x").unwrap();

        let merged = HistoricalTable::from_records(&[listing("b", 1000.0, 60.0, "Gran Via 2")]);
        let err = store
            .persist(&merged, &blocked, &backup)
            .await
            .expect_err("rename onto a non-empty directory fails");

        match HistoryError::from(err) {
            HistoryError::Persist(PersistError {
                path,
                backup: Some(named),
                ..
            }) => {
                assert_eq!(path, blocked);
                assert_eq!(named, snapshot);
            }
            other => panic!("expected a persist error naming the backup, got {other:?}"),
        }
        assert_eq!(std::fs::read(store.history_path()).unwrap(), before);
        assert_eq!(std::fs::read(&snapshot).unwrap(), before);
        assert!(temp_files_in(dir.path()).is_empty());
        assert!(blocked.join("occupant").exists());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files_behind() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("table.csv");
        write_atomically(&target, b"a,b\n1,2\n").await.expect("first write");
        write_atomically(&target, b"a,b\n3,4\n").await.expect("second write");

        assert_eq!(std::fs::read(&target).unwrap(), b"a,b\n3,4\n");
        assert!(temp_files_in(target.parent().unwrap()).is_empty());
    }
}
