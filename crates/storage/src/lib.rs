//! Sqlite-backed persistence for the shelf and the display settings.

use std::path::Path;

use anyhow::Context as _;
use pdfshelf_core::{Book, BookId, DisplaySettings, DocumentId, NewBook, clamp_zoom};
use rusqlite::{Connection, OptionalExtension as _, Row};
use tracing::debug;

const BOOK_COLUMNS: &str = "id, title, uri, added_at, last_opened_page, total_pages";

#[derive(Debug)]
pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open sqlite db at {}", path.as_ref().display()))?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS books (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    uri TEXT NOT NULL UNIQUE,
                    added_at INTEGER NOT NULL,
                    last_opened_page INTEGER NOT NULL DEFAULT 0,
                    total_pages INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS books_added_at ON books (added_at);

                CREATE TABLE IF NOT EXISTS display_settings (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    dark_mode INTEGER NOT NULL,
                    zoom REAL NOT NULL,
                    full_screen INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO display_settings (id, dark_mode, zoom, full_screen)
                VALUES (1, 0, 1.0, 0);
                "#,
            )
            .context("migrate schema")?;
        Ok(())
    }

    /// Adds a book, or refreshes title and page count when `uri` is already on the shelf. The
    /// reading position of an existing record is kept.
    pub fn insert_book(&self, book: &NewBook) -> anyhow::Result<BookId> {
        let id = self
            .conn
            .query_row(
                r#"
                INSERT INTO books (title, uri, added_at, last_opened_page, total_pages)
                VALUES (?, ?, ?, 0, ?)
                ON CONFLICT(uri) DO UPDATE SET
                    title = excluded.title,
                    total_pages = excluded.total_pages
                RETURNING id
                "#,
                (
                    &book.title,
                    book.uri.as_str(),
                    book.added_at,
                    i64::from(book.total_pages),
                ),
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("insert book {}", book.uri))?;
        debug!(id, uri = %book.uri, "book stored");
        Ok(BookId(id))
    }

    /// Newest first.
    pub fn list_books(&self) -> anyhow::Result<Vec<Book>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {BOOK_COLUMNS} FROM books ORDER BY added_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], book_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_book(&self, id: BookId) -> anyhow::Result<Option<Book>> {
        let book = self
            .conn
            .query_row(
                &format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?"),
                [id.0],
                book_from_row,
            )
            .optional()
            .with_context(|| format!("load book {id}"))?;
        Ok(book)
    }

    pub fn find_by_uri(&self, uri: &DocumentId) -> anyhow::Result<Option<Book>> {
        let book = self
            .conn
            .query_row(
                &format!("SELECT {BOOK_COLUMNS} FROM books WHERE uri = ?"),
                [uri.as_str()],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    pub fn update_book(&self, book: &Book) -> anyhow::Result<bool> {
        let changed = self.conn.execute(
            r#"
            UPDATE books
            SET title = ?, uri = ?, added_at = ?, last_opened_page = ?, total_pages = ?
            WHERE id = ?
            "#,
            (
                &book.title,
                book.uri.as_str(),
                book.added_at,
                i64::from(book.last_opened_page),
                i64::from(book.total_pages),
                book.id.0,
            ),
        )?;
        Ok(changed > 0)
    }

    /// No-op returning `false` when the book is not on the shelf.
    pub fn set_last_page(&self, id: BookId, page: u32, total_pages: u32) -> anyhow::Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE books SET last_opened_page = ?, total_pages = ? WHERE id = ?",
                (i64::from(page), i64::from(total_pages), id.0),
            )
            .with_context(|| format!("save progress of book {id}"))?;
        Ok(changed > 0)
    }

    pub fn delete_book(&self, id: BookId) -> anyhow::Result<bool> {
        let changed = self.conn.execute("DELETE FROM books WHERE id = ?", [id.0])?;
        Ok(changed > 0)
    }

    pub fn load_display_settings(&self) -> anyhow::Result<DisplaySettings> {
        let row = self
            .conn
            .query_row(
                "SELECT dark_mode, zoom, full_screen FROM display_settings WHERE id = 1",
                [],
                |row| {
                    Ok(DisplaySettings {
                        dark_mode: row.get(0)?,
                        zoom: row.get::<_, f64>(1)? as f32,
                        full_screen: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("load display settings")?;
        let mut settings = row.unwrap_or_default();
        settings.normalize();
        Ok(settings)
    }

    pub fn save_display_settings(&self, settings: &DisplaySettings) -> anyhow::Result<()> {
        let mut settings = *settings;
        settings.normalize();
        self.conn
            .execute(
                r#"
                INSERT INTO display_settings (id, dark_mode, zoom, full_screen) VALUES (1, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    dark_mode = excluded.dark_mode,
                    zoom = excluded.zoom,
                    full_screen = excluded.full_screen
                "#,
                (
                    settings.dark_mode,
                    f64::from(settings.zoom),
                    settings.full_screen,
                ),
            )
            .context("save display settings")?;
        Ok(())
    }

    pub fn set_dark_mode(&self, enabled: bool) -> anyhow::Result<()> {
        self.conn
            .execute("UPDATE display_settings SET dark_mode = ? WHERE id = 1", [enabled])?;
        Ok(())
    }

    /// Stores `zoom` clamped to the supported range.
    pub fn set_zoom(&self, zoom: f32) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE display_settings SET zoom = ? WHERE id = 1",
            [f64::from(clamp_zoom(zoom))],
        )?;
        Ok(())
    }

    pub fn set_full_screen(&self, enabled: bool) -> anyhow::Result<()> {
        self.conn
            .execute("UPDATE display_settings SET full_screen = ? WHERE id = 1", [enabled])?;
        Ok(())
    }
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    let uri: String = row.get(2)?;
    let last_opened_page: i64 = row.get(4)?;
    let total_pages: i64 = row.get(5)?;
    Ok(Book {
        id: BookId(row.get(0)?),
        title: row.get(1)?,
        uri: DocumentId::new(uri),
        added_at: row.get(3)?,
        last_opened_page: u32::try_from(last_opened_page).unwrap_or(0),
        total_pages: u32::try_from(total_pages).unwrap_or(0),
    })
}
