use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use parking_lot::Mutex;
use pdfshelf_application::{Library, Preferences, ReaderSession, Services};
use pdfshelf_core::{Bitmap, Book, BookId, Config, NarrationState};
use pdfshelf_engine::{
    CommandSpeechFactory, FsResolver, PdfTextExtractor, PdfiumBackend, RenderingSource,
    ThumbnailCache,
};
use pdfshelf_storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Parser)]
#[command(name = "pdfshelf", version, about = "A shelf of PDF documents with a reader and narration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Add a PDF to the shelf.
    Import { path: PathBuf },
    /// List the shelf, most recently added first.
    List,
    /// Write the shelf cover of a book as PNG.
    Thumbnail {
        id: BookId,
        #[arg(long, default_value_t = 300)]
        width: i32,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render one page at reader width as PNG.
    Render {
        id: BookId,
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long, default_value_t = 1080)]
        width: u32,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Open a book at a page and remember it as the reading position.
    Read {
        id: BookId,
        /// Zero-based page; defaults to the stored position.
        #[arg(long)]
        page: Option<u32>,
    },
    /// Read a page aloud.
    Speak {
        id: BookId,
        #[arg(long)]
        page: Option<u32>,
    },
    /// Remove a book from the shelf. The file itself is left alone.
    Remove { id: BookId },
    /// Show or change display settings.
    Settings {
        #[arg(long)]
        dark_mode: Option<Switch>,
        #[arg(long)]
        zoom: Option<f32>,
        #[arg(long)]
        full_screen: Option<Switch>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let project_dirs =
        ProjectDirs::from("dev", "pdfshelf", "pdfshelf").context("resolve project dirs")?;

    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir {}", config_dir.display()))?;
    let config = load_config(&config_dir.join("config.json"))?;
    init_tracing(&config);

    let storage = Arc::new(Mutex::new(Storage::open(config_dir.join("pdfshelf.db"))?));
    let services = build_services(&config, project_dirs.cache_dir());
    let library = Arc::new(Library::open(storage.clone(), services).await?);
    let preferences = Preferences::open(storage).await?;

    match cli.command {
        Command::Import { path } => {
            let id = FsResolver::id_for_path(&path)?;
            let book = library.import(id).await?;
            println!("{}", describe(&book));
        }
        Command::List => {
            for book in library.books() {
                println!("{}", describe(&book));
            }
        }
        Command::Thumbnail { id, width, out } => {
            let book = find_book(&library, id).await?;
            let thumb = library
                .thumbnail(&book, width)
                .await
                .with_context(|| format!("no thumbnail for {}", book.uri))?;
            let out = out.unwrap_or_else(|| PathBuf::from(format!("book-{id}-cover.png")));
            save_png(&thumb, &out)?;
            println!("{}", out.display());
        }
        Command::Render {
            id,
            page,
            width,
            out,
        } => {
            let session = ReaderSession::open(library.clone(), &preferences, id).await?;
            let page = session.scroll_to(page).await;
            let rendered = session.request_page(page, width).await;
            session.close().await?;
            let bitmap =
                rendered.with_context(|| format!("page {} of book {id} did not render", page + 1))?;
            let out = out.unwrap_or_else(|| PathBuf::from(format!("book-{id}-page-{}.png", page + 1)));
            save_png(&bitmap, &out)?;
            println!("{}", out.display());
        }
        Command::Read { id, page } => {
            let session = ReaderSession::open(library.clone(), &preferences, id).await?;
            if let Some(page) = page {
                session.scroll_to(page).await;
            }
            session.close().await?;
            println!(
                "{} at page {}/{}",
                session.book().title,
                session.current_page() + 1,
                session.page_count()
            );
        }
        Command::Speak { id, page } => {
            let session = ReaderSession::open(library.clone(), &preferences, id).await?;
            if let Some(page) = page {
                session.scroll_to(page).await;
            }
            if session.toggle_narration().await == NarrationState::Speaking {
                session.wait_for_narration().await;
            } else {
                warn!(id = %id, page = session.current_page(), "nothing to narrate");
            }
            session.close().await?;
        }
        Command::Remove { id } => {
            if !library.delete(id).await? {
                anyhow::bail!("book {id} is not on the shelf");
            }
            println!("removed {id}");
        }
        Command::Settings {
            dark_mode,
            zoom,
            full_screen,
        } => {
            if let Some(switch) = dark_mode {
                preferences.set_dark_mode(switch.enabled()).await?;
            }
            if let Some(zoom) = zoom {
                preferences.set_zoom(zoom).await?;
            }
            if let Some(switch) = full_screen {
                preferences.set_full_screen(switch.enabled()).await?;
            }
            let settings = preferences.current();
            println!(
                "dark_mode={} zoom={:.2} full_screen={}",
                settings.dark_mode, settings.zoom, settings.full_screen
            );
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str::<Config>(&raw)
            .with_context(|| format!("parse config {}", path.display()))?
    } else {
        Config::default()
    };
    config.normalize();
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_env("PDFSHELF_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_services(config: &Config, cache_dir: &Path) -> Services {
    let resolver = Arc::new(FsResolver::new());
    let backend = Arc::new(PdfiumBackend::new(
        config.pdfium_lib_path.as_ref().map(PathBuf::from),
    ));
    if let Err(err) = backend.check() {
        warn!(error = %err, "pdfium unavailable, documents will open with zero pages");
    }
    let source = Arc::new(RenderingSource::new(resolver.clone(), backend.clone()));
    let thumbnails = Arc::new(ThumbnailCache::from_config(
        cache_dir.join("thumbnails"),
        source,
        config,
    ));
    info!(cache = %cache_dir.display(), "services ready");
    Services::new(
        resolver,
        backend,
        Arc::new(PdfTextExtractor::new()),
        Arc::new(CommandSpeechFactory::new(config.speech_command.clone())),
        thumbnails,
        config.clone(),
    )
}

async fn find_book(library: &Library, id: BookId) -> anyhow::Result<Book> {
    library
        .book(id)
        .await?
        .with_context(|| format!("book {id} is not on the shelf"))
}

fn describe(book: &Book) -> String {
    let progress = book.progress();
    format!(
        "{:>4}  {:<40}  {:>4}/{:<4} {:>5.1}%  {}",
        book.id.0,
        book.title,
        book.last_opened_page + 1,
        book.total_pages,
        progress.percent(),
        book.uri
    )
}

fn save_png(bitmap: &Bitmap, path: &Path) -> anyhow::Result<()> {
    image::save_buffer(
        path,
        &bitmap.pixels,
        bitmap.width,
        bitmap.height,
        image::ExtendedColorType::Rgba8,
    )
    .with_context(|| format!("write {}", path.display()))
}
