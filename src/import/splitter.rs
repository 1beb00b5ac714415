//! Streams a dump file into size-bounded, line-aligned chunk files.

use super::cleaner::{ends_statement, is_directive_line};
use crate::dialect::{DialectError, validate_identifier};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write chunk {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to create scratch directory under {path}: {source}")]
    ScratchDir { path: PathBuf, source: io::Error },
    #[error("invalid table name: {0}")]
    TableName(#[from] DialectError),
    #[error("chunk size limit must be greater than zero")]
    ZeroLimit,
}

/// File name of chunk `index` for `table`; the padded index keeps lexical
/// order equal to chunk order.
pub fn chunk_file_name(table: &str, index: usize) -> String {
    format!("{}_chunk_{:06}.sql", table, index)
}

/// Chunk files of one pass. The scratch directory and every file in it are
/// removed when the set is dropped or [`ChunkSet::cleanup`] is called.
#[derive(Debug)]
pub struct ChunkSet {
    dir: TempDir,
    paths: Vec<PathBuf>,
}

impl ChunkSet {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the chunk files into `out_dir`, returning the new paths in chunk order.
    pub fn persist_into(&self, out_dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(out_dir)?;
        let mut persisted = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = out_dir.join(name);
            fs::copy(path, &target)?;
            persisted.push(target);
        }
        Ok(persisted)
    }

    pub fn cleanup(self) -> io::Result<()> {
        self.dir.close()
    }
}

struct OpenChunk {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
}

impl OpenChunk {
    fn create(path: PathBuf) -> Result<Self, SplitError> {
        let file = File::create(&path).map_err(|source| SplitError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes: 0,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), SplitError> {
        self.writer
            .write_all(line)
            .map_err(|source| SplitError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.bytes += line.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<(), SplitError> {
        self.writer.flush().map_err(|source| SplitError::Write {
            path: self.path,
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileSplitter {
    temp_root: PathBuf,
    max_chunk_bytes: u64,
}

impl FileSplitter {
    pub fn new(temp_root: impl Into<PathBuf>, max_chunk_bytes: u64) -> Self {
        Self {
            temp_root: temp_root.into(),
            max_chunk_bytes,
        }
    }

    pub fn max_chunk_bytes(&self) -> u64 {
        self.max_chunk_bytes
    }

    /// Split `source` into chunk files for `table`.
    ///
    /// The file is read once, line by line, and every byte lands in exactly one
    /// chunk. A chunk is closed before a line that would push it past the limit,
    /// unless it is still empty or a multi-line statement is open; in those cases
    /// the chunk may exceed the limit. Any I/O error discards all chunks written
    /// so far.
    pub fn split(&self, source: &Path, table: &str) -> Result<ChunkSet, SplitError> {
        let table = validate_identifier(table)?;
        if self.max_chunk_bytes == 0 {
            return Err(SplitError::ZeroLimit);
        }

        let scratch_error = |source: io::Error| SplitError::ScratchDir {
            path: self.temp_root.clone(),
            source,
        };
        fs::create_dir_all(&self.temp_root).map_err(scratch_error)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}_", table))
            .tempdir_in(&self.temp_root)
            .map_err(scratch_error)?;

        let read_error = |err: io::Error| SplitError::Read {
            path: source.to_path_buf(),
            source: err,
        };
        let file = File::open(source).map_err(read_error)?;
        let mut reader = BufReader::new(file);

        let mut paths = Vec::new();
        let mut current: Option<OpenChunk> = None;
        let mut statement_open = false;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(read_error)?;
            if read == 0 {
                break;
            }

            let line_bytes = line.len() as u64;
            let should_flush = current.as_ref().is_some_and(|chunk| {
                chunk.bytes > 0
                    && chunk.bytes + line_bytes > self.max_chunk_bytes
                    && !statement_open
            });
            if should_flush {
                if let Some(chunk) = current.take() {
                    chunk.finish()?;
                }
            }

            if current.is_none() {
                let path = dir.path().join(chunk_file_name(table, paths.len()));
                paths.push(path.clone());
                current = Some(OpenChunk::create(path)?);
            }
            if let Some(chunk) = current.as_mut() {
                chunk.write_line(&line)?;
            }

            let text = String::from_utf8_lossy(&line);
            if !is_directive_line(&text) {
                statement_open = !ends_statement(&text);
            }
        }

        if let Some(chunk) = current.take() {
            chunk.finish()?;
        }

        log::debug!(
            "split {} into {} chunks (limit {} bytes)",
            source.display(),
            paths.len(),
            self.max_chunk_bytes
        );
        Ok(ChunkSet { dir, paths })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_source(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("dump.sql");
        fs::write(&path, content).unwrap();
        path
    }

    fn concat(chunks: &ChunkSet) -> Vec<u8> {
        chunks
            .paths()
            .iter()
            .flat_map(|path| fs::read(path).unwrap())
            .collect()
    }

    fn lines_of(bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes
            .split_inclusive(|byte| *byte == b'\n')
            .map(|line| line.to_vec())
            .collect()
    }

    #[test]
    fn test_single_chunk_when_file_fits() {
        let work = tempdir().unwrap();
        let content = b"INSERT INTO t VALUES (1);\nINSERT INTO t VALUES (2);\nINSERT INTO t VALUES (3);\n";
        let source = write_source(work.path(), content);

        let chunks = FileSplitter::new(work.path().join("scratch"), 1024)
            .split(&source, "t")
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks.paths()[0].file_name().unwrap().to_str().unwrap(),
            "t_chunk_000000.sql"
        );
        assert_eq!(concat(&chunks), content.to_vec());
    }

    #[test]
    fn test_boundary_at_limit_yields_two_chunks() {
        let work = tempdir().unwrap();
        let mut content = Vec::new();
        // Twenty 25-byte statements fill exactly 500 bytes.
        for i in 0..20 {
            content.extend_from_slice(format!("INSERT INTO t VALUES({});\n", i % 10).as_bytes());
        }
        assert_eq!(content.len(), 500);
        content.extend_from_slice(b"INSERT 1;\n");
        assert_eq!(content.len(), 510);
        let source = write_source(work.path(), &content);

        let chunks = FileSplitter::new(work.path(), 500).split(&source, "t").unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(fs::metadata(&chunks.paths()[0]).unwrap().len(), 500);
        assert_eq!(fs::metadata(&chunks.paths()[1]).unwrap().len(), 10);
        assert_eq!(concat(&chunks), content);
    }

    #[test]
    fn test_chunks_respect_limit_and_never_split_lines() {
        let work = tempdir().unwrap();
        let mut content = Vec::new();
        for i in 0..200 {
            let padding = "x".repeat(i % 37);
            content.extend_from_slice(
                format!("INSERT INTO t VALUES ({}, '{}');\n", i, padding).as_bytes(),
            );
        }
        content.extend_from_slice(b"INSERT INTO t VALUES (999, 'no newline');");
        let source = write_source(work.path(), &content);

        let limit = 300;
        let chunks = FileSplitter::new(work.path(), limit).split(&source, "t").unwrap();

        assert!(chunks.len() > 1);
        assert_eq!(concat(&chunks), content);

        let source_lines = lines_of(&content);
        let mut chunk_lines = Vec::new();
        for path in chunks.paths() {
            let bytes = fs::read(path).unwrap();
            assert!(bytes.len() as u64 <= limit);
            chunk_lines.extend(lines_of(&bytes));
        }
        assert_eq!(chunk_lines, source_lines);
    }

    #[test]
    fn test_oversized_line_gets_its_own_chunk() {
        let work = tempdir().unwrap();
        let long = format!("INSERT INTO t VALUES ('{}');\n", "y".repeat(200));
        let content = format!("INSERT INTO t VALUES (1);\n{}INSERT INTO t VALUES (2);\n", long);
        let source = write_source(work.path(), content.as_bytes());

        let chunks = FileSplitter::new(work.path(), 64).split(&source, "t").unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(fs::read_to_string(&chunks.paths()[1]).unwrap(), long);
        assert_eq!(concat(&chunks), content.as_bytes().to_vec());
    }

    #[test]
    fn test_open_statement_defers_boundary() {
        let work = tempdir().unwrap();
        let content = "INSERT INTO t VALUES (1,\n'first half',\n'second half');\nINSERT INTO t VALUES (2);\n";
        let source = write_source(work.path(), content.as_bytes());

        let chunks = FileSplitter::new(work.path(), 30).split(&source, "t").unwrap();

        let first = fs::read_to_string(&chunks.paths()[0]).unwrap();
        assert_eq!(
            first,
            "INSERT INTO t VALUES (1,\n'first half',\n'second half');\n"
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(concat(&chunks), content.as_bytes().to_vec());
    }

    #[test]
    fn test_empty_file_yields_no_chunks() {
        let work = tempdir().unwrap();
        let source = write_source(work.path(), b"");

        let chunks = FileSplitter::new(work.path(), 100).split(&source, "t").unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_missing_source_leaves_no_scratch_files() {
        let work = tempdir().unwrap();
        let scratch = work.path().join("scratch");

        let err = FileSplitter::new(&scratch, 100)
            .split(&work.path().join("missing.sql"), "t")
            .unwrap_err();

        assert!(matches!(err, SplitError::Read { .. }));
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_unsafe_table_names() {
        let work = tempdir().unwrap();
        let source = write_source(work.path(), b"INSERT INTO t VALUES (1);\n");

        let err = FileSplitter::new(work.path(), 100)
            .split(&source, "../escape")
            .unwrap_err();
        assert!(matches!(err, SplitError::TableName(_)));
    }

    #[test]
    fn test_cleanup_removes_scratch_dir() {
        let work = tempdir().unwrap();
        let source = write_source(work.path(), b"INSERT INTO t VALUES (1);\n");

        let chunks = FileSplitter::new(work.path().join("scratch"), 100)
            .split(&source, "t")
            .unwrap();
        let dir = chunks.dir().to_path_buf();
        assert!(dir.exists());

        chunks.cleanup().unwrap();
        assert!(!dir.exists());
    }
}
