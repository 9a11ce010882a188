//! Test helpers and fixtures shared by the end-to-end suites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use pdfshelf_application::{Services, SharedStorage};
use pdfshelf_core::Config;
use pdfshelf_engine::testing::{FakeBackend, FakeSpeechFactory, FakeTextExtractor, fake_pdf};
use pdfshelf_engine::{FsResolver, RenderingSource, ThumbnailCache};
use pdfshelf_storage::Storage;

/// A workspace on disk: real files resolved through [`FsResolver`], fake renderer and speech.
pub struct Shelf {
    pub services: Services,
    pub storage: SharedStorage,
    pub backend: Arc<FakeBackend>,
    pub speech: Arc<FakeSpeechFactory>,
    pub dir: tempfile::TempDir,
}

impl Shelf {
    pub fn books_dir(&self) -> PathBuf {
        self.dir.path().join("books")
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.dir.path().join("thumbnails")
    }

    /// Writes a document the fake renderer reads as `pages` pages of 600x800.
    pub fn write_book(&self, name: &str, pages: u32) -> anyhow::Result<PathBuf> {
        let dir = self.books_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.pdf"));
        std::fs::write(&path, fake_pdf(pages, 600.0, 800.0))?;
        Ok(path)
    }
}

pub fn make_shelf() -> anyhow::Result<Shelf> {
    let dir = tempfile::tempdir()?;
    let storage = Arc::new(Mutex::new(Storage::open(dir.path().join("pdfshelf.db"))?));
    let (services, backend, speech) = make_services(dir.path(), Config::default());
    Ok(Shelf {
        services,
        storage,
        backend,
        speech,
        dir,
    })
}

pub fn make_services(
    root: &Path,
    config: Config,
) -> (Services, Arc<FakeBackend>, Arc<FakeSpeechFactory>) {
    let resolver = Arc::new(FsResolver::new());
    let backend = Arc::new(FakeBackend::default());
    let speech = Arc::new(FakeSpeechFactory::default());
    let source = Arc::new(RenderingSource::new(resolver.clone(), backend.clone()));
    let thumbnails = Arc::new(ThumbnailCache::from_config(
        root.join("thumbnails"),
        source,
        &config,
    ));
    let services = Services::new(
        resolver,
        backend.clone(),
        Arc::new(FakeTextExtractor::default()),
        speech.clone(),
        thumbnails,
        config,
    );
    (services, backend, speech)
}

#[cfg(test)]
mod tests {
    use pdfshelf_application::{Library, Preferences, ReaderSession};
    use pdfshelf_core::NarrationState;

    use super::*;

    async fn library(shelf: &Shelf) -> anyhow::Result<Arc<Library>> {
        Ok(Arc::new(
            Library::open(shelf.storage.clone(), shelf.services.clone()).await?,
        ))
    }

    #[tokio::test]
    async fn imported_file_starts_at_first_page() -> anyhow::Result<()> {
        let shelf = make_shelf()?;
        let path = shelf.write_book("ten", 10)?;
        let library = library(&shelf).await?;

        let book = library.import(FsResolver::id_for_path(&path)?).await?;
        assert_eq!(book.title, "ten.pdf");
        assert_eq!(book.total_pages, 10);
        assert_eq!(book.last_opened_page, 0);
        assert_eq!(library.books().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn reading_position_survives_restart() -> anyhow::Result<()> {
        let shelf = make_shelf()?;
        let path = shelf.write_book("novel", 10)?;
        let id = {
            let library = library(&shelf).await?;
            let prefs = Preferences::open(shelf.storage.clone()).await?;
            let book = library.import(FsResolver::id_for_path(&path)?).await?;
            let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
            session.scroll_to(5).await;
            session.close().await?;
            book.id
        };

        let storage = Arc::new(Mutex::new(Storage::open(shelf.dir.path().join("pdfshelf.db"))?));
        let library = Arc::new(Library::open(storage.clone(), shelf.services.clone()).await?);
        assert_eq!(library.book(id).await?.unwrap().last_opened_page, 5);

        let prefs = Preferences::open(storage).await?;
        let session = ReaderSession::open(library, &prefs, id).await?;
        assert_eq!(session.current_page(), 5);
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn shelf_cover_lands_in_the_disk_cache() -> anyhow::Result<()> {
        let shelf = make_shelf()?;
        let path = shelf.write_book("cover", 3)?;
        let library = library(&shelf).await?;
        let book = library.import(FsResolver::id_for_path(&path)?).await?;

        let cover = library.thumbnail(&book, 333).await.unwrap();
        assert_eq!((cover.width, cover.height), (350, 467));
        let cached: Vec<_> = std::fs::read_dir(shelf.thumbnails_dir())?.collect();
        assert_eq!(cached.len(), 1);

        let stats = shelf.backend.stats();
        assert_eq!(stats.documents_opened, stats.documents_closed);
        Ok(())
    }

    #[tokio::test]
    async fn moved_file_fails_soft() -> anyhow::Result<()> {
        let shelf = make_shelf()?;
        let path = shelf.write_book("gone", 4)?;
        let library = library(&shelf).await?;
        let prefs = Preferences::open(shelf.storage.clone()).await?;
        let book = library.import(FsResolver::id_for_path(&path)?).await?;
        std::fs::remove_file(&path)?;

        assert!(library.thumbnail(&book, 300).await.is_none());
        let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
        assert!(session.request_page(0, 600).await.is_none());
        session.close().await?;
        assert_eq!(library.book(book.id).await?.unwrap().total_pages, 4);
        Ok(())
    }

    #[tokio::test]
    async fn narration_speaks_the_open_page() -> anyhow::Result<()> {
        let shelf = make_shelf()?;
        let path = shelf.write_book("aloud", 3)?;
        let library = library(&shelf).await?;
        let prefs = Preferences::open(shelf.storage.clone()).await?;
        let book = library.import(FsResolver::id_for_path(&path)?).await?;

        let session = ReaderSession::open(library, &prefs, book.id).await?;
        session.scroll_to(1).await;
        assert_eq!(session.toggle_narration().await, NarrationState::Speaking);
        session.close().await?;

        let spoken = shelf.speech.engine().spoken();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].0, "Page 2 text.");
        assert_eq!(spoken[0].2, "page_2");
        Ok(())
    }
}
