// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The directory of report files.
//!
//! Reports are named `{app_name}-report-{id:016x}.json`. Ids are `(unix_seconds << 23) | counter`,
//! so listing them in ascending order lists reports from oldest to newest. Only
//! [`ReportStore::next_report_path`] is used from the crash path; everything else does normal
//! file I/O and must not be called while handling a crash.

use crate::report::fixup::fixup_report_text;
use crate::shared::constants::MAX_PATH_LENGTH;
use crate::shared::fixed_string::FixedString;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const COUNTER_BITS: u32 = 23;
const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Report ids are positive, got {0}")]
    InvalidId(i64),
    #[error("No report with id {0:016x}")]
    NotFound(i64),
    #[error("Report directory path is too long: {0}")]
    PathTooLong(PathBuf),
    #[error("Report {id:016x} is not valid JSON: {source}")]
    Malformed {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug)]
pub struct ReportStore {
    reports_dir: PathBuf,
    app_name: String,
    max_report_count: usize,
    /// `{reports_dir}/{app_name}-report-`, formatted ahead of time for the crash path.
    path_prefix: FixedString<MAX_PATH_LENGTH>,
    id_base: i64,
    counter: AtomicU32,
}

impl ReportStore {
    /// Opens the store in `reports_dir`, creating the directory if needed, and prunes it to
    /// `max_report_count` reports.
    pub fn new(
        reports_dir: &Path,
        app_name: &str,
        max_report_count: usize,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(reports_dir).map_err(StoreError::io(reports_dir))?;
        let mut path_prefix = FixedString::new();
        let _ = write!(
            path_prefix,
            "{}/{app_name}-report-",
            reports_dir.display()
        );
        // Room is left for the id and the extension.
        if path_prefix.len() + 16 + ".json".len() >= MAX_PATH_LENGTH - 1 {
            return Err(StoreError::PathTooLong(reports_dir.to_path_buf()));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs() as i64);
        let store = Self {
            reports_dir: reports_dir.to_path_buf(),
            app_name: app_name.to_string(),
            max_report_count,
            path_prefix,
            id_base: now << COUNTER_BITS,
            counter: AtomicU32::new(0),
        };
        store.prune()?;
        Ok(store)
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    /// A fresh id, unique within this process.
    pub fn next_id(&self) -> i64 {
        let counter = self.counter.fetch_add(1, SeqCst) & COUNTER_MASK;
        self.id_base | i64::from(counter)
    }

    /// Path for a new report. Does not allocate, so it can be called from the crash path.
    pub fn next_report_path(&self) -> (i64, FixedString<MAX_PATH_LENGTH>) {
        let id = self.next_id();
        (id, self.report_path_for(id))
    }

    pub(crate) fn report_path_for(&self, id: i64) -> FixedString<MAX_PATH_LENGTH> {
        let mut path = self.path_prefix;
        let _ = write!(path, "{id:016x}.json");
        path
    }

    fn report_path(&self, id: i64) -> PathBuf {
        self.reports_dir
            .join(format!("{}-report-{id:016x}.json", self.app_name))
    }

    fn parse_file_name(&self, name: &str) -> Option<i64> {
        let hex = name
            .strip_prefix(self.app_name.as_str())?
            .strip_prefix("-report-")?
            .strip_suffix(".json")?;
        if hex.len() != 16 {
            return None;
        }
        i64::from_str_radix(hex, 16).ok().filter(|id| *id > 0)
    }

    /// Ids of the stored reports, oldest first.
    pub fn report_ids(&self) -> Result<Vec<i64>, StoreError> {
        let entries =
            std::fs::read_dir(&self.reports_dir).map_err(StoreError::io(&self.reports_dir))?;
        let mut ids: Vec<i64> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| self.parse_file_name(entry.file_name().to_str()?))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn report_count(&self) -> Result<usize, StoreError> {
        Ok(self.report_ids()?.len())
    }

    /// The report as it was written.
    pub fn read_raw_report(&self, id: i64) -> Result<String, StoreError> {
        if id <= 0 {
            return Err(StoreError::InvalidId(id));
        }
        let path = self.report_path(id);
        std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(id),
            _ => StoreError::io(&path)(e),
        })
    }

    /// The report with its timestamp formatted and its symbols demangled.
    pub fn read_report(&self, id: i64) -> Result<String, StoreError> {
        let raw = self.read_raw_report(id)?;
        fixup_report_text(&raw).map_err(|source| StoreError::Malformed { id, source })
    }

    /// Stores a report produced outside the crash path, returning its id.
    pub fn add_user_report(&self, report: &[u8]) -> Result<i64, StoreError> {
        let id = self.next_id();
        let path = self.report_path(id);
        std::fs::write(&path, report).map_err(StoreError::io(&path))?;
        tracing::debug!("Stored user report {id:016x} at {}", path.display());
        self.prune()?;
        Ok(id)
    }

    pub fn delete_report_with_id(&self, id: i64) -> Result<(), StoreError> {
        if id <= 0 {
            return Err(StoreError::InvalidId(id));
        }
        let path = self.report_path(id);
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound(id),
            _ => StoreError::io(&path)(e),
        })
    }

    pub fn delete_all_reports(&self) -> Result<(), StoreError> {
        for id in self.report_ids()? {
            self.delete_report_with_id(id)?;
        }
        Ok(())
    }

    /// Deletes the oldest reports beyond the maximum count.
    pub fn prune(&self) -> Result<(), StoreError> {
        let ids = self.report_ids()?;
        let excess = ids.len().saturating_sub(self.max_report_count);
        for id in &ids[..excess] {
            tracing::info!("Deleting old report {id:016x}");
            match self.delete_report_with_id(*id) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
