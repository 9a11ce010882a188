//! Rendering, thumbnail and narration engine.

mod coordinator;
mod handle;
mod narration;
mod native;
mod pdfium;
mod resolver;
mod speech;
mod text;
mod thumbnail;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use pdfshelf_core::DocumentId;

pub use coordinator::{PageRenderCoordinator, rasterize_page};
pub use handle::RenderHandle;
pub use narration::Narrator;
pub use native::{
    ByteStream, DocumentResolver, NativeDocument, NativePage, QueueMode, RasterBackend,
    RenderMode, SpeechEngine, SpeechFactory, TextDocument, TextExtractor,
};
pub use pdfium::PdfiumBackend;
pub use resolver::FsResolver;
pub use speech::{CommandSpeech, CommandSpeechFactory};
pub use text::PdfTextExtractor;
pub use thumbnail::{RenderingSource, ThumbnailCache, ThumbnailKey, ThumbnailSource, ThumbnailStats};

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot resolve document {id}: {source}")]
    Resolve {
        id: DocumentId,
        #[source]
        source: std::io::Error,
    },

    #[error("page {index} out of range (document has {count} pages)")]
    PageOutOfRange { index: u32, count: u32 },

    #[error("degenerate page geometry {width}x{height}")]
    DegenerateGeometry { width: f32, height: f32 },

    #[error("render handle already closed")]
    HandleClosed,

    #[error("native renderer: {0}")]
    Native(String),

    #[error("text extraction: {0}")]
    Text(String),

    #[error("speech engine: {0}")]
    Speech(String),

    #[error("thumbnail image: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    pub fn native(msg: impl std::fmt::Display) -> Self {
        Self::Native(msg.to_string())
    }
}
