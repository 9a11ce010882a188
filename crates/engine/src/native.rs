//! Seams to the platform capabilities the engine orchestrates but does not implement.

use std::io::{Read, Seek};
use std::sync::Arc;

use pdfshelf_core::{Bitmap, DocumentId};

use crate::Result;

/// Read-only random-access bytes of one document.
pub trait ByteStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> ByteStream for T {}

pub trait DocumentResolver: Send + Sync {
    fn open(&self, id: &DocumentId) -> Result<Box<dyn ByteStream>>;

    /// Best-effort human-readable name, usually the file name.
    fn display_name(&self, id: &DocumentId) -> Option<String>;

    /// Ask for read access that survives restarts.
    fn persist_read_access(&self, _id: &DocumentId) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    #[default]
    Display,
    Print,
}

pub trait RasterBackend: Send + Sync {
    /// Opens a renderer over `stream`. The caller keeps the stream alive until the returned
    /// document is dropped.
    fn open(&self, stream: &mut dyn ByteStream) -> Result<Box<dyn NativeDocument>>;
}

/// An open native renderer. Dropping it releases the native resources.
pub trait NativeDocument: Send {
    fn page_count(&self) -> u32;

    fn open_page(&mut self, index: u32) -> Result<Box<dyn NativePage + '_>>;
}

/// One open page. Dropping it closes the page.
pub trait NativePage {
    /// Intrinsic `(width, height)` in page units.
    fn size(&self) -> (f32, f32);

    /// Rasterizes the whole page scaled to `target`'s dimensions.
    fn render(&mut self, target: &mut Bitmap, mode: RenderMode) -> Result<()>;
}

pub trait TextExtractor: Send + Sync {
    fn open(&self, stream: Box<dyn ByteStream>) -> Result<Box<dyn TextDocument>>;
}

pub trait TextDocument: Send + Sync {
    fn page_count(&self) -> u32;

    fn page_text(&self, index: u32) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Drop whatever is playing or queued.
    Flush,
    Add,
}

pub trait SpeechEngine: Send + Sync {
    fn speak(&self, text: &str, mode: QueueMode, utterance_id: &str) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Blocks until everything submitted so far has been spoken.
    fn wait(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self);
}

pub trait SpeechFactory: Send + Sync {
    /// Blocks until the engine is ready to accept text.
    fn start(&self) -> Result<Arc<dyn SpeechEngine>>;
}
