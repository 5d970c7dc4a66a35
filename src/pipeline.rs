//! Boundary to the downstream record pipeline.
//!
//! Each unit of work hands exactly one input file to a [`FileInputSink`].
//! What happens to the bytes afterwards (decoding, parsing, writing records)
//! is the sink's business. Sinks are shared by all parallel units, so they
//! must accept concurrent calls.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::sources::target::Target;

/// Errors raised by sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read input for unit {index}: {source}")]
    Read {
        index: usize,
        #[source]
        source: io::Error,
    },
}

/// The fully downloaded contents of one target.
#[derive(Debug)]
pub struct RemoteFile {
    pub target: Target,
    data: Cursor<Vec<u8>>,
}

impl RemoteFile {
    pub fn new(target: Target, bytes: Vec<u8>) -> Self {
        Self {
            target,
            data: Cursor::new(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

/// A unit's input: yields its single file once, then ends.
#[derive(Debug)]
pub struct SingleFileInput(Option<RemoteFile>);

impl SingleFileInput {
    pub fn new(file: RemoteFile) -> Self {
        Self(Some(file))
    }
}

impl Iterator for SingleFileInput {
    type Item = RemoteFile;

    fn next(&mut self) -> Option<RemoteFile> {
        self.0.take()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::from(self.0.is_some());
        (n, Some(n))
    }
}

impl ExactSizeIterator for SingleFileInput {}

/// Consumer of per-unit input files.
pub trait FileInputSink: Send + Sync {
    /// Accept unit `index`'s input, returning the number of bytes consumed.
    fn accept(&self, index: usize, input: SingleFileInput) -> Result<u64, SinkError>;
}

// =============================================================================
// Directory sink
// =============================================================================

/// Writes each unit's bytes to its own file under a directory.
///
/// Files are staged under a temporary name and renamed into place, so a unit
/// that fails leaves nothing behind.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination file for unit `index`.
    pub fn file_path(&self, index: usize, target: &Target) -> PathBuf {
        self.root.join(format!(
            "{:04}_{}_{}",
            index,
            safe_component(&target.host),
            safe_component(&target.path)
        ))
    }
}

impl FileInputSink for DirectorySink {
    fn accept(&self, index: usize, input: SingleFileInput) -> Result<u64, SinkError> {
        let mut total = 0;
        for mut file in input {
            let dest = self.file_path(index, &file.target);
            let write_err = |source: io::Error| SinkError::Write {
                path: dest.clone(),
                source,
            };

            let mut staged = tempfile::NamedTempFile::new_in(&self.root).map_err(write_err)?;
            let copied = io::copy(&mut file, &mut staged).map_err(write_err)?;
            staged.flush().map_err(write_err)?;
            staged.persist(&dest).map_err(|e| write_err(e.error))?;

            debug!(index, path = %dest.display(), bytes = copied, "unit input written");
            total += copied;
        }
        Ok(total)
    }
}

/// Convert a host or remote path into a single safe file-name component.
fn safe_component(raw: &str) -> String {
    let cleaned = raw
        .trim_start_matches('~')
        .trim_start_matches('/')
        .replace(['/', '\\', ' ', ':'], "_");

    if cleaned.is_empty() {
        "root".to_string()
    } else {
        cleaned
    }
}

// =============================================================================
// Memory sink
// =============================================================================

/// Collects unit inputs in memory, keyed by unit index.
#[derive(Debug, Default)]
pub struct MemorySink {
    files: Mutex<BTreeMap<usize, (Target, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted inputs, ordered by unit index.
    pub fn files(&self) -> Vec<(usize, Target, Vec<u8>)> {
        self.files
            .lock()
            .iter()
            .map(|(index, (target, bytes))| (*index, target.clone(), bytes.clone()))
            .collect()
    }

    pub fn get(&self, index: usize) -> Option<Vec<u8>> {
        self.files.lock().get(&index).map(|(_, bytes)| bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileInputSink for MemorySink {
    fn accept(&self, index: usize, input: SingleFileInput) -> Result<u64, SinkError> {
        let mut total = 0;
        for mut file in input {
            let mut bytes = Vec::with_capacity(file.len());
            file.read_to_end(&mut bytes)
                .map_err(|source| SinkError::Read { index, source })?;
            total += bytes.len() as u64;
            self.files.lock().insert(index, (file.target.clone(), bytes));
        }
        Ok(total)
    }
}
