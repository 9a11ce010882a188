//! Application orchestration layer: the shelf, the display preferences and reader sessions.

mod library;
mod overlay;
mod preferences;
mod reader;
mod slots;

use std::sync::Arc;

use parking_lot::Mutex;
use pdfshelf_core::Config;
use pdfshelf_engine::{
    DocumentResolver, PageRenderCoordinator, RasterBackend, SpeechFactory, TextExtractor,
    ThumbnailCache,
};
use pdfshelf_storage::Storage;

pub use library::{BookWatch, Library};
pub use overlay::ImmersiveOverlay;
pub use preferences::Preferences;
pub use reader::ReaderSession;
pub use slots::PageSlots;

pub type SharedStorage = Arc<Mutex<Storage>>;

/// Everything a shelf or a reader needs from the platform, built once at startup.
#[derive(Clone)]
pub struct Services {
    pub resolver: Arc<dyn DocumentResolver>,
    pub backend: Arc<dyn RasterBackend>,
    pub extractor: Arc<dyn TextExtractor>,
    pub speech: Arc<dyn SpeechFactory>,
    pub coordinator: PageRenderCoordinator,
    pub thumbnails: Arc<ThumbnailCache>,
    pub config: Config,
}

impl Services {
    pub fn new(
        resolver: Arc<dyn DocumentResolver>,
        backend: Arc<dyn RasterBackend>,
        extractor: Arc<dyn TextExtractor>,
        speech: Arc<dyn SpeechFactory>,
        thumbnails: Arc<ThumbnailCache>,
        config: Config,
    ) -> Self {
        Self {
            resolver,
            backend,
            extractor,
            speech,
            coordinator: PageRenderCoordinator::new(),
            thumbnails,
            config,
        }
    }
}

/// Runs `f` against the store on the blocking pool.
pub(crate) async fn with_storage<T, F>(storage: &SharedStorage, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Storage) -> anyhow::Result<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(&storage.lock())).await?
}
