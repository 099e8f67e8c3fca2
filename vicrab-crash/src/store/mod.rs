// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The report directory.
//!
//! Runs in normal context only. A report file is complete once it ends with
//! the terminating line; files without it are partial and are listed
//! separately. Mutations take an exclusive `flock` on a lock file in the
//! directory, reads take a shared one, and deletion renames the file to a
//! `.deleting` name before unlinking it so a reader never opens a file that
//! is half gone.

mod report_id;

pub use report_id::ReportId;

use crate::raw_report::{decode, decode_partial, DecodeError, RawReport};
use crate::shared::constants::{RECRASH_EXTENSION, REPORT_EXTENSION, VICRAB_CRASH_DONE};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".vicrab-crash.lock";
const DELETING_EXTENSION: &str = "deleting";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Report {0} not found")]
    NotFound(ReportId),
    #[error("Report {0} is partial: its capture never finished")]
    PartialReport(ReportId),
    #[error("Report {id} could not be decoded: {source}")]
    Decode {
        id: ReportId,
        #[source]
        source: DecodeError,
    },
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.into();
        move |source| StoreError::Io { path, source }
    }
}

/// Whether a report file ends with its terminating line.
fn is_complete(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let suffix = format!("\n{VICRAB_CRASH_DONE}\n");
    let len = file.metadata()?.len();
    if len < suffix.len() as u64 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-(suffix.len() as i64)))?;
    let mut tail = vec![0u8; suffix.len()];
    file.read_exact(&mut tail)?;
    Ok(tail == suffix.as_bytes())
}

/// Manages the raw reports of one application in one directory.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
    app_name: String,
}

impl ReportStore {
    /// Opens the store, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, app_name: impl Into<String>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(StoreError::io(&dir))?;
        Ok(Self {
            dir,
            app_name: app_name.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    fn file_prefix(&self) -> String {
        format!("{}-report-", self.app_name)
    }

    /// `<dir>/<app>-report-<id>.vcr`
    pub fn report_path(&self, id: ReportId) -> PathBuf {
        self.dir
            .join(format!("{}{id}.{REPORT_EXTENSION}", self.file_prefix()))
    }

    /// The marker left next to a report by a crash during its capture.
    pub fn recrash_path(&self, id: ReportId) -> PathBuf {
        let mut path = self.report_path(id).into_os_string();
        path.push(".");
        path.push(RECRASH_EXTENSION);
        PathBuf::from(path)
    }

    /// Reserves the id and path of the next report. Nothing is created on
    /// disk until a crash actually writes it.
    pub fn next_report_path(&self) -> Result<(ReportId, PathBuf), StoreError> {
        let newest = self.scan()?.last().map_or(ReportId(0), |(id, _)| *id);
        let id = ReportId::next_after(newest);
        Ok((id, self.report_path(id)))
    }

    /// `<dir>/<app>-report-`, the part of a report path before the id.
    pub fn report_path_prefix(&self) -> PathBuf {
        self.dir.join(self.file_prefix())
    }

    fn lock(&self, arg: FlockArg) -> Result<Flock<File>, StoreError> {
        let path = self.dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(StoreError::io(&path))?;
        Flock::lock(file, arg).map_err(|(_, errno)| StoreError::Io {
            path,
            source: io::Error::from(errno),
        })
    }

    /// Every report file of this application, complete or not, by id.
    fn scan(&self) -> Result<Vec<(ReportId, PathBuf)>, StoreError> {
        let prefix = self.file_prefix();
        let suffix = format!(".{REPORT_EXTENSION}");
        let mut reports = vec![];
        for entry in fs::read_dir(&self.dir).map_err(StoreError::io(&self.dir))? {
            let entry = entry.map_err(StoreError::io(&self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let id = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
                .and_then(ReportId::from_hex);
            if let Some(id) = id {
                reports.push((id, entry.path()));
            }
        }
        reports.sort_unstable_by_key(|(id, _)| *id);
        Ok(reports)
    }

    fn partition(&self) -> Result<(Vec<ReportId>, Vec<ReportId>), StoreError> {
        let mut complete = vec![];
        let mut partial = vec![];
        for (id, path) in self.scan()? {
            match is_complete(&path) {
                Ok(true) => complete.push(id),
                Ok(false) => partial.push(id),
                // Deleted between the scan and the check.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Io { path, source }),
            }
        }
        Ok((complete, partial))
    }

    /// Complete reports, oldest first.
    pub fn list(&self) -> Result<Vec<ReportId>, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        Ok(self.partition()?.0)
    }

    /// Reports whose capture never finished, oldest first.
    pub fn list_partial(&self) -> Result<Vec<ReportId>, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        Ok(self.partition()?.1)
    }

    fn read_file(&self, id: ReportId) -> Result<Vec<u8>, StoreError> {
        let path = self.report_path(id);
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(id),
            _ => StoreError::Io { path, source },
        })
    }

    /// The bytes of a complete report.
    pub fn read(&self, id: ReportId) -> Result<Vec<u8>, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        let bytes = self.read_file(id)?;
        let done = format!("\n{VICRAB_CRASH_DONE}\n");
        if !bytes.ends_with(done.as_bytes()) {
            return Err(StoreError::PartialReport(id));
        }
        Ok(bytes)
    }

    /// A complete report, decoded.
    pub fn read_report(&self, id: ReportId) -> Result<RawReport, StoreError> {
        let bytes = self.read(id)?;
        decode(&bytes).map_err(|source| StoreError::Decode { id, source })
    }

    /// Whatever can be decoded of a partial report.
    pub fn read_partial(&self, id: ReportId) -> Result<RawReport, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        let bytes = self.read_file(id)?;
        decode_partial(&bytes).map_err(|source| StoreError::Decode { id, source })
    }

    /// The marker a crash during the capture of `id` left, if any.
    pub fn read_recrash(&self, id: ReportId) -> Result<Option<RawReport>, StoreError> {
        let _lock = self.lock(FlockArg::LockShared)?;
        let path = self.recrash_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        decode_partial(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode { id, source })
    }

    fn remove(path: &Path) -> Result<bool, StoreError> {
        let mut deleting = path.as_os_str().to_owned();
        deleting.push(".");
        deleting.push(DELETING_EXTENSION);
        match fs::rename(path, &deleting) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
        fs::remove_file(&deleting).map_err(StoreError::io(deleting))?;
        Ok(true)
    }

    fn delete_locked(&self, id: ReportId) -> Result<bool, StoreError> {
        let removed = Self::remove(&self.report_path(id))?;
        Self::remove(&self.recrash_path(id))?;
        Ok(removed)
    }

    /// Deletes a report, complete or partial, and its recrash marker.
    pub fn delete(&self, id: ReportId) -> Result<(), StoreError> {
        let _lock = self.lock(FlockArg::LockExclusive)?;
        if self.delete_locked(id)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    /// Deletes every report of this application.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let _lock = self.lock(FlockArg::LockExclusive)?;
        let mut deleted = 0;
        for (id, _) in self.scan()? {
            if self.delete_locked(id)? {
                deleted += 1;
            }
        }
        tracing::debug!(deleted, dir = %self.dir.display(), "Deleted all reports");
        Ok(deleted)
    }

    /// Deletes the oldest complete reports so that at most `max_count`
    /// remain. Partial reports are neither counted nor deleted. Returns the
    /// number of reports deleted.
    pub fn prune(&self, max_count: usize) -> Result<usize, StoreError> {
        let _lock = self.lock(FlockArg::LockExclusive)?;
        let (complete, _) = self.partition()?;
        let excess = complete.len().saturating_sub(max_count);
        let mut deleted = 0;
        for id in &complete[..excess] {
            if self.delete_locked(*id)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, max_count, "Pruned old crash reports");
        }
        Ok(deleted)
    }
}
