use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use pdfshelf_core::DocumentId;

use crate::native::{ByteStream, DocumentResolver};
use crate::{EngineError, Result};

/// Resolves identifiers that are plain paths or `file://` URLs on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResolver;

impl FsResolver {
    pub fn new() -> Self {
        Self
    }

    /// Canonical identifier for a local file, so the same file imported twice is one shelf entry.
    pub fn id_for_path(path: &Path) -> Result<DocumentId> {
        let absolute = std::fs::canonicalize(path)?;
        Ok(DocumentId::new(absolute.to_string_lossy()))
    }

    pub fn path_of(id: &DocumentId) -> PathBuf {
        let raw = id.as_str();
        PathBuf::from(raw.strip_prefix("file://").unwrap_or(raw))
    }

    fn resolve_err(id: &DocumentId, source: std::io::Error) -> EngineError {
        EngineError::Resolve {
            id: id.clone(),
            source,
        }
    }
}

impl DocumentResolver for FsResolver {
    fn open(&self, id: &DocumentId) -> Result<Box<dyn ByteStream>> {
        let file = File::open(Self::path_of(id)).map_err(|err| Self::resolve_err(id, err))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn display_name(&self, id: &DocumentId) -> Option<String> {
        Self::path_of(id)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .filter(|name| !name.trim().is_empty())
    }

    fn persist_read_access(&self, id: &DocumentId) -> Result<()> {
        let path = Self::path_of(id);
        let meta = std::fs::metadata(&path).map_err(|err| Self::resolve_err(id, err))?;
        if !meta.is_file() {
            return Err(Self::resolve_err(
                id,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        Ok(())
    }
}
