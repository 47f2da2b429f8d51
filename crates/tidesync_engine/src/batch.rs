//! Batch manager.
//!
//! Change sets are cut into [`BatchPart`]s of at most `batch_size` rows, each
//! holding a single table. Small batches stay in memory. Once a batch grows
//! past `batch_size` rows every part is written to its own file under the
//! round directory, next to a JSON `summary` listing the parts in order:
//!
//! ```text
//! <batch_directory>/<scope_id>/<round_id>/
//!     0000_Customer.batch
//!     0001_Customer.batch
//!     0002_sales.Order.batch
//!     summary
//! ```
//!
//! Snapshots use the same layout under
//! `<snapshots_directory>/<scope_name>/<parameters>/`.

use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use tidesync_protocol::{
    BatchPart, BatchPartInfo, BatchSummary, SerializerKind, SyncParameters, SyncRow, SyncTable,
    Timestamp,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the summary file of a file-backed batch.
pub const SUMMARY_FILE: &str = "summary";

/// Extension of part files.
pub const BATCH_EXTENSION: &str = "batch";

/// File name of a part: zero-padded sequence, then the table name.
pub fn part_file_name(index: usize, table: &str) -> String {
    format!("{index:04}_{table}.{BATCH_EXTENSION}")
}

/// Directory of a round's batch.
pub fn round_directory(options: &SyncOptions, scope_id: Uuid, round_id: Uuid) -> PathBuf {
    options
        .batch_directory
        .join(scope_id.to_string())
        .join(round_id.to_string())
}

/// Directory of a snapshot.
pub fn snapshot_directory(
    options: &SyncOptions,
    scope_name: &str,
    parameters: &SyncParameters,
) -> PathBuf {
    options
        .snapshots_directory
        .join(path_segment(scope_name))
        .join(parameters.cache_key())
}

/// Scope names come from clients: keep them to a single, inert segment.
fn path_segment(name: &str) -> String {
    let segment: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

/// Accumulates rows into batch parts.
#[derive(Debug)]
pub struct BatchWriter {
    directory: PathBuf,
    batch_size: usize,
    serializer: SerializerKind,
    always_spill: bool,
    spilled: bool,
    memory: Vec<BatchPart>,
    written: Vec<BatchPartInfo>,
    current: Option<(SyncTable, Vec<SyncRow>)>,
    next_index: usize,
    total_rows: usize,
}

impl BatchWriter {
    /// Creates a writer spilling to `directory` once more than `batch_size`
    /// rows were added.
    pub fn new(directory: impl Into<PathBuf>, batch_size: usize, serializer: SerializerKind) -> Self {
        Self {
            directory: directory.into(),
            batch_size: batch_size.max(1),
            serializer,
            always_spill: false,
            spilled: false,
            memory: Vec::new(),
            written: Vec::new(),
            current: None,
            next_index: 0,
            total_rows: 0,
        }
    }

    /// Creates a writer for a new round of `scope_id`.
    pub fn for_round(options: &SyncOptions, scope_id: Uuid) -> Self {
        Self::new(
            round_directory(options, scope_id, Uuid::new_v4()),
            options.batch_size,
            options.serializer,
        )
    }

    /// Writes every part to disk, whatever the batch size.
    pub fn always_spill(mut self) -> Self {
        self.always_spill = true;
        self
    }

    /// Directory the batch spills to.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Rows added so far.
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Adds a row of `table`. Rows of one table must be added together to
    /// keep parts full.
    pub fn add_row(&mut self, table: &SyncTable, row: SyncRow) -> Result<()> {
        let same_table = matches!(&self.current, Some((t, _)) if t.full_name() == table.full_name());
        if !same_table {
            self.close_current()?;
            self.current = Some((table.clone(), Vec::new()));
        }
        if let Some((_, rows)) = self.current.as_mut() {
            rows.push(row);
            self.total_rows += 1;
            if rows.len() >= self.batch_size {
                self.close_current()?;
            }
        }
        if !self.spilled && (self.always_spill || self.total_rows > self.batch_size) {
            self.spill()?;
        }
        Ok(())
    }

    /// Adds every row of `table`.
    pub fn add_rows(&mut self, table: &SyncTable, rows: impl IntoIterator<Item = SyncRow>) -> Result<()> {
        for row in rows {
            self.add_row(table, row)?;
        }
        Ok(())
    }

    /// Adds a complete part as received, re-indexed in this batch.
    pub fn add_part(&mut self, part: BatchPart) -> Result<()> {
        self.close_current()?;
        self.total_rows += part.row_count;
        let part = BatchPart::new(self.next_index, part.table, part.rows);
        self.next_index += 1;
        self.store(part)?;
        if !self.spilled && (self.always_spill || self.total_rows > self.batch_size) {
            self.spill()?;
        }
        Ok(())
    }

    /// Drops the batch, removing whatever was already spilled.
    pub fn discard(self) {
        if self.spilled {
            if let Err(err) = fs::remove_dir_all(&self.directory) {
                warn!(directory = %self.directory.display(), error = %err, "could not remove batch directory");
            }
        }
    }

    /// Closes the batch.
    pub fn finish(self) -> Result<BatchInfo> {
        self.finish_with_timestamp(None)
    }

    /// Closes the batch, recording the timestamp it was read at.
    pub fn finish_with_timestamp(mut self, timestamp: Option<Timestamp>) -> Result<BatchInfo> {
        self.close_current()?;
        if self.always_spill && !self.spilled {
            self.spill()?;
        }
        if !self.spilled {
            return Ok(BatchInfo::in_memory(self.memory, timestamp));
        }

        let summary = BatchSummary {
            parts: self.written,
            timestamp,
            serializer: self.serializer,
        };
        let bytes = SerializerKind::Json.serialize(&summary)?;
        fs::write(self.directory.join(SUMMARY_FILE), bytes)?;
        debug!(
            directory = %self.directory.display(),
            parts = summary.parts.len(),
            rows = summary.total_rows(),
            "batch written"
        );
        Ok(BatchInfo {
            storage: BatchStorage::Directory(self.directory),
            summary,
        })
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some((table, rows)) = self.current.take() {
            if rows.is_empty() {
                return Ok(());
            }
            let part = BatchPart::new(self.next_index, table, rows);
            self.next_index += 1;
            self.store(part)?;
        }
        Ok(())
    }

    fn store(&mut self, part: BatchPart) -> Result<()> {
        if self.spilled {
            self.write_part(&part)
        } else {
            self.memory.push(part);
            Ok(())
        }
    }

    fn spill(&mut self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        self.spilled = true;
        debug!(
            directory = %self.directory.display(),
            rows = self.total_rows,
            "batch spilled to disk"
        );
        for part in mem::take(&mut self.memory) {
            self.write_part(&part)?;
        }
        Ok(())
    }

    fn write_part(&mut self, part: &BatchPart) -> Result<()> {
        let file_name = part_file_name(part.index, &part.table.full_name());
        let bytes = self.serializer.serialize(part)?;
        fs::write(self.directory.join(&file_name), bytes)?;
        self.written.push(part.info(Some(file_name)));
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum BatchStorage {
    Memory(Vec<BatchPart>),
    Directory(PathBuf),
}

/// A closed batch: its parts, in order.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    storage: BatchStorage,
    summary: BatchSummary,
}

impl BatchInfo {
    /// A batch held in memory.
    pub fn in_memory(parts: Vec<BatchPart>, timestamp: Option<Timestamp>) -> Self {
        let summary = BatchSummary {
            parts: parts.iter().map(|p| p.info(None)).collect(),
            timestamp,
            serializer: SerializerKind::default(),
        };
        Self {
            storage: BatchStorage::Memory(parts),
            summary,
        }
    }

    /// An empty batch.
    pub fn empty() -> Self {
        Self::in_memory(Vec::new(), None)
    }

    /// Opens a file-backed batch from its summary.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        let bytes = fs::read(directory.join(SUMMARY_FILE))?;
        let summary: BatchSummary = SerializerKind::Json.deserialize(&bytes)?;
        Ok(Self {
            storage: BatchStorage::Directory(directory),
            summary,
        })
    }

    /// Returns true for in-memory batches.
    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, BatchStorage::Memory(_))
    }

    /// Directory of a file-backed batch.
    pub fn directory(&self) -> Option<&Path> {
        match &self.storage {
            BatchStorage::Directory(dir) => Some(dir),
            BatchStorage::Memory(_) => None,
        }
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.summary.parts.len()
    }

    /// Rows across all parts.
    pub fn total_rows(&self) -> usize {
        self.summary.total_rows()
    }

    /// Returns true if the batch holds no row.
    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }

    /// Part descriptions, in order.
    pub fn parts_info(&self) -> &[BatchPartInfo] {
        &self.summary.parts
    }

    /// Timestamp recorded with the batch.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.summary.timestamp
    }

    /// Loads one part.
    pub fn load_part(&self, index: usize) -> Result<BatchPart> {
        match &self.storage {
            BatchStorage::Memory(parts) => parts.get(index).cloned().ok_or_else(|| missing_part(index)),
            BatchStorage::Directory(dir) => {
                let info = self.summary.parts.get(index).ok_or_else(|| missing_part(index))?;
                let file_name = info.file_name.as_deref().ok_or_else(|| missing_part(index))?;
                let bytes = fs::read(dir.join(file_name))?;
                Ok(self.summary.serializer.deserialize(&bytes)?)
            }
        }
    }

    /// Indexes of the parts holding rows of `table`.
    pub fn parts_for(&self, table: &SyncTable) -> Vec<usize> {
        self.summary
            .parts
            .iter()
            .enumerate()
            .filter(|(_, info)| table.matches_name(&info.table_name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Deletes the batch directory. Returns false if nothing was removed.
    pub fn try_remove_directory(&self) -> bool {
        let Some(dir) = self.directory() else {
            return false;
        };
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                debug!(directory = %dir.display(), "batch directory removed");
                true
            }
            Err(err) => {
                warn!(directory = %dir.display(), error = %err, "could not remove batch directory");
                false
            }
        }
    }
}

fn missing_part(index: usize) -> SyncError {
    SyncError::Protocol(format!("batch has no part {index}"))
}
