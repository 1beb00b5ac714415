//! Units of work handed from the coordinator to chunk executors.

use std::path::PathBuf;

/// One chunk of a dump file, ready to load.
///
/// `statements` holds the cleaned INSERTs read from the chunk's scratch file,
/// in file order. The scratch file itself belongs to the pass that created it
/// and is removed once the pass completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportChunk {
    /// Zero-based position of the chunk in the source file.
    pub index: usize,
    pub table_name: String,
    pub path: PathBuf,
    pub statements: Vec<String>,
}

impl ImportChunk {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
