use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use pdfshelf_core::{Bitmap, Book, BookId, DocumentId, NewBook, UNTITLED};
use pdfshelf_engine::RenderHandle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{Services, SharedStorage, with_storage};

/// The shelf: imported books, newest first, observable through [`Library::subscribe`].
pub struct Library {
    storage: SharedStorage,
    services: Services,
    books: watch::Sender<Vec<Book>>,
}

impl Library {
    pub async fn open(storage: SharedStorage, services: Services) -> anyhow::Result<Self> {
        let books = with_storage(&storage, |s| s.list_books()).await?;
        let (tx, _) = watch::channel(books);
        Ok(Self {
            storage,
            services,
            books: tx,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn books(&self) -> Vec<Book> {
        self.books.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Book>> {
        self.books.subscribe()
    }

    pub fn watch_book(&self, id: BookId) -> BookWatch {
        BookWatch {
            id,
            rx: self.books.subscribe(),
        }
    }

    pub async fn book(&self, id: BookId) -> anyhow::Result<Option<Book>> {
        with_storage(&self.storage, move |s| s.get_book(id)).await
    }

    pub async fn find(&self, uri: &DocumentId) -> anyhow::Result<Option<Book>> {
        let uri = uri.clone();
        with_storage(&self.storage, move |s| s.find_by_uri(&uri)).await
    }

    /// Adds `uri` to the shelf, probing its title and page count. A document the renderer
    /// cannot read is still added, with zero pages.
    pub async fn import(&self, uri: DocumentId) -> anyhow::Result<Book> {
        let resolver = self.services.resolver.clone();
        let probe_id = uri.clone();
        let title = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            resolver
                .persist_read_access(&probe_id)
                .with_context(|| format!("read access to {probe_id}"))?;
            Ok(resolver
                .display_name(&probe_id)
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()))
        })
        .await??;

        let total_pages = match RenderHandle::acquire(
            self.services.resolver.clone(),
            self.services.backend.clone(),
            uri.clone(),
        )
        .await
        {
            Some(handle) => {
                let pages = handle.page_count();
                handle.close().await;
                pages
            }
            None => 0,
        };

        let new_book = NewBook {
            title,
            uri: uri.clone(),
            added_at: now_millis(),
            total_pages,
        };
        let book = with_storage(&self.storage, move |s| {
            let id = s.insert_book(&new_book)?;
            s.get_book(id)?
                .with_context(|| format!("book {id} vanished after insert"))
        })
        .await?;
        info!(id = %book.id, uri = %book.uri, pages = book.total_pages, title = %book.title, "imported");
        self.refresh().await?;
        Ok(book)
    }

    /// Stores the reading position; ignored for books no longer on the shelf.
    pub async fn update_last_page(
        &self,
        id: BookId,
        page: u32,
        total_pages: u32,
    ) -> anyhow::Result<bool> {
        let updated =
            with_storage(&self.storage, move |s| s.set_last_page(id, page, total_pages)).await?;
        if updated {
            debug!(id = %id, page, total_pages, "progress saved");
            self.refresh().await?;
        }
        Ok(updated)
    }

    pub async fn delete(&self, id: BookId) -> anyhow::Result<bool> {
        let removed = with_storage(&self.storage, move |s| {
            let book = s.get_book(id)?;
            s.delete_book(id)?;
            Ok(book)
        })
        .await?;
        let Some(book) = removed else {
            return Ok(false);
        };
        self.services.thumbnails.forget(&book.uri).await;
        info!(id = %id, uri = %book.uri, "removed from shelf");
        self.refresh().await?;
        Ok(true)
    }

    /// Cover for a shelf entry; `None` while the document cannot be rendered.
    pub async fn thumbnail(&self, book: &Book, target_width_px: i32) -> Option<Arc<Bitmap>> {
        let thumb = self
            .services
            .thumbnails
            .get_thumbnail(&book.uri, target_width_px)
            .await;
        if thumb.is_none() {
            warn!(id = %book.id, uri = %book.uri, "no thumbnail");
        }
        thumb
    }

    pub async fn refresh(&self) -> anyhow::Result<()> {
        let books = with_storage(&self.storage, |s| s.list_books()).await?;
        self.books.send_replace(books);
        Ok(())
    }
}

/// Follows one book through shelf updates.
pub struct BookWatch {
    id: BookId,
    rx: watch::Receiver<Vec<Book>>,
}

impl BookWatch {
    pub fn current(&self) -> Option<Book> {
        self.rx.borrow().iter().find(|b| b.id == self.id).cloned()
    }

    /// Waits for the next shelf update and returns the book as it now stands.
    pub async fn changed(&mut self) -> anyhow::Result<Option<Book>> {
        self.rx.changed().await.context("library closed")?;
        Ok(self.current())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
