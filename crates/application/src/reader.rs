use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use parking_lot::Mutex;
use pdfshelf_core::{Bitmap, Book, BookId, DisplaySettings, NarrationState, reader_target_width};
use pdfshelf_engine::{Narrator, RenderHandle};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{ImmersiveOverlay, Library, PageSlots, Preferences, Services};

/// One open document in the reader.
///
/// Owns the render handle and the narrator for its document. [`ReaderSession::close`] saves
/// the reading position and releases both; it runs once no matter how often it is called.
pub struct ReaderSession {
    book: Book,
    library: Arc<Library>,
    services: Services,
    handle: Option<Arc<RenderHandle>>,
    narrator: Narrator,
    slots: Arc<PageSlots>,
    settings: watch::Receiver<DisplaySettings>,
    overlay: Mutex<ImmersiveOverlay>,
    page_count: u32,
    current_page: AtomicU32,
    closed: AtomicBool,
}

impl ReaderSession {
    pub async fn open(
        library: Arc<Library>,
        preferences: &Preferences,
        id: BookId,
    ) -> anyhow::Result<Self> {
        let book = library
            .book(id)
            .await?
            .with_context(|| format!("book {id} is not on the shelf"))?;
        let services = library.services().clone();

        let handle = RenderHandle::acquire(
            services.resolver.clone(),
            services.backend.clone(),
            book.uri.clone(),
        )
        .await;
        let page_count = handle.as_ref().map(|h| h.page_count()).unwrap_or(0);
        let start = book.last_opened_page.min(page_count.saturating_sub(1));
        if page_count > 0 && page_count != book.total_pages {
            library.update_last_page(id, start, page_count).await?;
        }

        let narrator = Narrator::new(
            book.uri.clone(),
            services.resolver.clone(),
            services.extractor.clone(),
            services.speech.clone(),
            services.config.narration_max_chars,
        );
        let settings = preferences.subscribe();
        let overlay = ImmersiveOverlay::new(
            Duration::from_millis(services.config.overlay_hide_ms),
            settings.borrow().full_screen,
        );

        info!(id = %id, uri = %book.uri, page_count, start, "reader opened");
        Ok(Self {
            book,
            library,
            services,
            handle,
            narrator,
            slots: Arc::new(PageSlots::new()),
            settings,
            overlay: Mutex::new(overlay),
            page_count,
            current_page: AtomicU32::new(start),
            closed: AtomicBool::new(false),
        })
    }

    pub fn book(&self) -> &Book {
        &self.book
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// `false` when the document could not be opened or has no pages; every page request then
    /// yields `None`.
    pub fn is_renderable(&self) -> bool {
        self.handle.is_some() && self.page_count > 0
    }

    pub fn current_page(&self) -> u32 {
        self.current_page.load(Ordering::SeqCst)
    }

    /// Moves the reading position, clamped to the document. Narration follows the new page.
    pub async fn scroll_to(&self, page: u32) -> u32 {
        let page = page.min(self.page_count.saturating_sub(1));
        let previous = self.current_page.swap(page, Ordering::SeqCst);
        if previous != page {
            debug!(id = %self.book.id, page, "scrolled");
            self.narrator.on_page_changed(page).await;
        }
        page
    }

    pub fn target_width(&self, viewport_width_px: u32) -> u32 {
        reader_target_width(viewport_width_px, &self.settings.borrow(), &self.services.config)
    }

    /// Renders `page` for display. `None` on failure or when a newer request for the same page
    /// was issued while this one was in flight.
    pub async fn request_page(&self, page: u32, viewport_width_px: u32) -> Option<Bitmap> {
        let token = self.slots.begin(page);
        let width = self.target_width(viewport_width_px);
        let bitmap = self
            .services
            .coordinator
            .render_page(self.handle.as_ref(), page, width)
            .await;
        if !self.slots.finish(page, token) {
            debug!(id = %self.book.id, page, "stale render dropped");
            return None;
        }
        bitmap.map(|bitmap| self.page_for_display(bitmap))
    }

    /// Renders every page in `pages` concurrently; results come back in page order and only
    /// for requests that are still current.
    pub async fn render_visible(&self, pages: Range<u32>, viewport_width_px: u32) -> Vec<(u32, Bitmap)> {
        let width = self.target_width(viewport_width_px);
        let end = pages.end.min(self.page_count);
        let mut tasks = tokio::task::JoinSet::new();
        for page in pages.start..end {
            let token = self.slots.begin(page);
            let handle = self.handle.clone();
            let coordinator = self.services.coordinator;
            tasks.spawn(async move {
                let bitmap = coordinator.render_page(handle.as_ref(), page, width).await;
                (page, token, bitmap)
            });
        }

        let mut out = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page, token, bitmap)) => {
                    if !self.slots.finish(page, token) {
                        continue;
                    }
                    if let Some(bitmap) = bitmap {
                        out.push((page, self.page_for_display(bitmap)));
                    }
                }
                Err(err) => warn!(id = %self.book.id, error = %err, "render task failed"),
            }
        }
        out.sort_by_key(|(page, _)| *page);
        out
    }

    /// Applies dark mode inversion when enabled.
    pub fn page_for_display(&self, mut bitmap: Bitmap) -> Bitmap {
        if self.settings.borrow().dark_mode {
            bitmap.invert();
        }
        bitmap
    }

    pub async fn toggle_narration(&self) -> NarrationState {
        self.narrator.toggle(self.current_page()).await
    }

    pub fn narration_state(&self) -> NarrationState {
        self.narrator.state()
    }

    /// Waits until the current utterance has been spoken.
    pub async fn wait_for_narration(&self) {
        self.narrator.wait_until_done().await;
    }

    pub fn controls_visible(&self) -> bool {
        let mut overlay = self.overlay.lock();
        overlay.set_full_screen(self.settings.borrow().full_screen);
        overlay.controls_visible()
    }

    /// A tap on the page. Returns whether the controls changed visibility.
    pub fn tap(&self, now: Instant) -> bool {
        let mut overlay = self.overlay.lock();
        overlay.set_full_screen(self.settings.borrow().full_screen);
        overlay.tap(now)
    }

    /// Drives the auto-hide timer. Returns whether the controls changed visibility.
    pub fn tick(&self, now: Instant) -> bool {
        let mut overlay = self.overlay.lock();
        overlay.set_full_screen(self.settings.borrow().full_screen);
        overlay.tick(now)
    }

    /// Saves the reading position. A session whose document did not open, or opened with no
    /// pages, leaves the stored position and page count alone.
    pub async fn persist_progress(&self) -> anyhow::Result<()> {
        if !self.is_renderable() {
            return Ok(());
        }
        let page = self.current_page();
        self.library
            .update_last_page(self.book.id, page, self.page_count)
            .await?;
        Ok(())
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.slots.cancel_all();
        self.narrator.shutdown().await;
        let saved = self.persist_progress().await;
        if let Some(handle) = &self.handle {
            handle.close().await;
        }
        info!(id = %self.book.id, page = self.current_page(), "reader closed");
        saved
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pdfshelf_engine::testing::{FakeBackend, SpeechEvent, fake_pdf};

    use super::*;
    use crate::fixtures::{Rig, doc, rig, rig_with_backend};

    async fn setup(rig: &Rig, pages: u32) -> anyhow::Result<(Arc<Library>, Preferences, Book)> {
        rig.resolver.insert(doc("novel"), fake_pdf(pages, 600.0, 800.0));
        let library = Arc::new(Library::open(rig.storage.clone(), rig.services.clone()).await?);
        let preferences = Preferences::open(rig.storage.clone()).await?;
        let book = library.import(doc("novel")).await?;
        Ok((library, preferences, book))
    }

    #[tokio::test]
    async fn reopening_restores_position() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 10).await?;

        let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
        assert_eq!(session.current_page(), 0);
        assert_eq!(session.scroll_to(5).await, 5);
        session.close().await?;
        assert_eq!(library.book(book.id).await?.unwrap().last_opened_page, 5);

        let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
        assert_eq!(session.current_page(), 5);
        assert_eq!(session.scroll_to(99).await, 9);
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn close_releases_handle_once() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 3).await?;
        let opened_before = rig.backend.stats().documents_opened;

        let session = ReaderSession::open(library, &prefs, book.id).await?;
        session.close().await?;
        session.close().await?;

        let stats = rig.backend.stats();
        assert_eq!(stats.documents_opened - opened_before, 1);
        assert_eq!(stats.documents_opened, stats.documents_closed);
        assert!(session.request_page(0, 400).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn pages_render_at_reader_width() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 4).await?;
        let session = ReaderSession::open(library, &prefs, book.id).await?;

        let page = session.request_page(1, 600).await.unwrap();
        assert_eq!((page.width, page.height), (600, 800));

        // Narrow viewports are widened to the minimum reader width.
        let page = session.request_page(1, 100).await.unwrap();
        assert_eq!(page.width, 360);

        prefs.set_zoom(2.0).await?;
        assert_eq!(session.target_width(600), 1200);
        prefs.set_zoom(3.0).await?;
        assert_eq!(session.target_width(1000), 2200);

        let visible = session.render_visible(1..9, 600).await;
        let pages: Vec<u32> = visible.iter().map(|(page, _)| *page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn dark_mode_inverts_pages() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 2).await?;
        let session = ReaderSession::open(library, &prefs, book.id).await?;

        let light = session.request_page(0, 400).await.unwrap();
        prefs.set_dark_mode(true).await?;
        let dark = session.request_page(0, 400).await.unwrap();
        assert_eq!(dark, light.inverted());
        assert_eq!(dark.pixel(0, 0), Some([255, 255, 255, 255]));
        session.close().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn superseded_request_is_dropped() -> anyhow::Result<()> {
        let rig = rig_with_backend(FakeBackend::default().with_render_delay(Duration::from_millis(50)));
        let (library, prefs, book) = setup(&rig, 2).await?;
        let session = ReaderSession::open(library, &prefs, book.id).await?;

        let first = session.request_page(0, 400);
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.request_page(0, 500).await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_none());
        assert_eq!(second.map(|b| b.width), Some(500));
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn narration_follows_the_reader() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 6).await?;
        let session = ReaderSession::open(library, &prefs, book.id).await?;

        assert_eq!(session.toggle_narration().await, NarrationState::Speaking);
        session.scroll_to(2).await;
        assert_eq!(session.narration_state(), NarrationState::Speaking);
        session.close().await?;

        let spoken = rig.speech.engine().spoken();
        let tags: Vec<&str> = spoken.iter().map(|(_, _, tag)| tag.as_str()).collect();
        assert_eq!(tags, vec!["page_1", "page_3"]);
        assert!(rig.speech.engine().events().contains(&SpeechEvent::Shutdown));
        assert_eq!(rig.extractor.released(), 1);
        assert_eq!(session.narration_state(), NarrationState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn overlay_follows_full_screen_setting() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 1).await?;
        let session = ReaderSession::open(library, &prefs, book.id).await?;
        let now = Instant::now();

        assert!(session.controls_visible());
        assert!(!session.tap(now));

        prefs.set_full_screen(true).await?;
        assert!(!session.controls_visible());
        assert!(session.tap(now));
        assert!(session.controls_visible());
        assert!(session.tick(now + Duration::from_millis(2500)));
        assert!(!session.controls_visible());
        session.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn rejected_document_keeps_bookmark() -> anyhow::Result<()> {
        let healthy = rig();
        let (library, _, book) = setup(&healthy, 10).await?;
        library.update_last_page(book.id, 5, 10).await?;

        let degraded = rig_with_backend(FakeBackend::default().failing_open());
        degraded.resolver.insert(book.uri.clone(), fake_pdf(10, 600.0, 800.0));
        let library = Arc::new(Library::open(healthy.storage.clone(), degraded.services.clone()).await?);
        let prefs = Preferences::open(healthy.storage.clone()).await?;

        let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
        assert_eq!(session.page_count(), 0);
        assert!(!session.is_renderable());
        session.scroll_to(3).await;
        session.close().await?;

        let stored = library.book(book.id).await?.unwrap();
        assert_eq!((stored.last_opened_page, stored.total_pages), (5, 10));
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_document_opens_empty() -> anyhow::Result<()> {
        let rig = rig();
        let (library, prefs, book) = setup(&rig, 3).await?;
        rig.resolver.remove(&book.uri);

        let session = ReaderSession::open(library.clone(), &prefs, book.id).await?;
        assert!(!session.is_renderable());
        assert!(session.request_page(0, 400).await.is_none());
        session.close().await?;
        assert_eq!(library.book(book.id).await?.unwrap().total_pages, 3);
        Ok(())
    }
}
