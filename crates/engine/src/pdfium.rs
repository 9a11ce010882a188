//! Native rasterization through Pdfium.
//!
//! Pdfium is not thread safe, so one process-wide worker thread owns the library and every
//! open document. [`PdfiumBackend`] and the documents it hands out are proxies that talk to
//! that thread over a channel. Pages are loaded per command and dropped before the reply.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use pdfium_render::prelude::{PdfBitmapFormat, PdfDocument, PdfRenderConfig, Pdfium};
use pdfshelf_core::Bitmap;
use tracing::{debug, info, warn};

use crate::native::{ByteStream, NativeDocument, NativePage, RasterBackend, RenderMode};
use crate::{EngineError, Result};

type Reply<T> = flume::Sender<std::result::Result<T, String>>;

enum Command {
    Open {
        bytes: Vec<u8>,
        reply: Reply<(u64, u32)>,
    },
    PageSize {
        doc: u64,
        index: u32,
        reply: Reply<(f32, f32)>,
    },
    Render {
        doc: u64,
        index: u32,
        width: u32,
        height: u32,
        mode: RenderMode,
        reply: Reply<RenderedPage>,
    },
    Close {
        doc: u64,
    },
}

struct RenderedPage {
    width: u32,
    height: u32,
    bgra: Vec<u8>,
}

static WORKER: OnceLock<std::result::Result<flume::Sender<Command>, String>> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    lib_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// `lib_path` is tried before the environment and the usual install locations. Only the
    /// first backend to open a document in the process decides which library is bound.
    pub fn new(lib_path: Option<PathBuf>) -> Self {
        Self { lib_path }
    }

    /// Binds the library now instead of on first open.
    pub fn check(&self) -> Result<()> {
        self.worker().map(|_| ())
    }

    fn worker(&self) -> Result<flume::Sender<Command>> {
        WORKER
            .get_or_init(|| spawn_worker(self.lib_path.clone()))
            .clone()
            .map_err(EngineError::Native)
    }
}

impl RasterBackend for PdfiumBackend {
    fn open(&self, stream: &mut dyn ByteStream) -> Result<Box<dyn NativeDocument>> {
        let tx = self.worker()?;
        let mut bytes = Vec::new();
        Seek::seek(&mut *stream, SeekFrom::Start(0))?;
        Read::read_to_end(&mut *stream, &mut bytes)?;
        let (doc, pages) = call(&tx, |reply| Command::Open { bytes, reply })?;
        Ok(Box::new(PdfiumDocument { tx, doc, pages }))
    }
}

struct PdfiumDocument {
    tx: flume::Sender<Command>,
    doc: u64,
    pages: u32,
}

impl Drop for PdfiumDocument {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Close { doc: self.doc });
    }
}

impl NativeDocument for PdfiumDocument {
    fn page_count(&self) -> u32 {
        self.pages
    }

    fn open_page(&mut self, index: u32) -> Result<Box<dyn NativePage + '_>> {
        let doc = self.doc;
        let size = call(&self.tx, |reply| Command::PageSize { doc, index, reply })?;
        Ok(Box::new(PdfiumPage {
            tx: &self.tx,
            doc,
            index,
            size,
        }))
    }
}

struct PdfiumPage<'a> {
    tx: &'a flume::Sender<Command>,
    doc: u64,
    index: u32,
    size: (f32, f32),
}

impl NativePage for PdfiumPage<'_> {
    fn size(&self) -> (f32, f32) {
        self.size
    }

    fn render(&mut self, target: &mut Bitmap, mode: RenderMode) -> Result<()> {
        let (doc, index) = (self.doc, self.index);
        let (width, height) = (target.width, target.height);
        let page = call(self.tx, |reply| Command::Render {
            doc,
            index,
            width,
            height,
            mode,
            reply,
        })?;
        copy_bgra_into(&page, target);
        Ok(())
    }
}

fn call<T>(
    tx: &flume::Sender<Command>,
    command: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (reply, rx) = flume::bounded(1);
    tx.send(command(reply))
        .map_err(|_| EngineError::native("pdfium worker is gone"))?;
    rx.recv()
        .map_err(|_| EngineError::native("pdfium worker dropped the request"))?
        .map_err(EngineError::Native)
}

/// Copies the overlapping region; any rows or columns the renderer did not produce stay white.
fn copy_bgra_into(page: &RenderedPage, target: &mut Bitmap) {
    let width = page.width.min(target.width) as usize;
    let height = page.height.min(target.height) as usize;
    if page.height == 0 {
        return;
    }
    let src_stride = page.bgra.len() / page.height as usize;
    let dst_stride = target.stride();
    for y in 0..height {
        let src_row = y * src_stride;
        let dst_row = y * dst_stride;
        for x in 0..width {
            let s = src_row + x * 4;
            let Some(px) = page.bgra.get(s..s + 4) else {
                continue;
            };
            let d = dst_row + x * 4;
            target.pixels[d..d + 4].copy_from_slice(&[px[2], px[1], px[0], px[3]]);
        }
    }
}

fn spawn_worker(lib_path: Option<PathBuf>) -> std::result::Result<flume::Sender<Command>, String> {
    let (tx, rx) = flume::unbounded::<Command>();
    let (ready_tx, ready_rx) = flume::bounded::<std::result::Result<(), String>>(1);
    std::thread::Builder::new()
        .name("pdfium".to_string())
        .spawn(move || {
            let pdfium = match bind_pdfium(lib_path.as_deref()) {
                Ok(pdfium) => {
                    let _ = ready_tx.send(Ok(()));
                    pdfium
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            serve(&pdfium, rx);
        })
        .map_err(|err| format!("cannot start pdfium worker: {err}"))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("pdfium bound");
            Ok(tx)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "pdfium unavailable");
            Err(err)
        }
        Err(_) => Err("pdfium worker exited during startup".to_string()),
    }
}

fn serve(pdfium: &Pdfium, rx: flume::Receiver<Command>) {
    let mut documents: HashMap<u64, PdfDocument<'_>> = HashMap::new();
    let mut next_id = 0u64;

    for command in rx.iter() {
        match command {
            Command::Open { bytes, reply } => {
                let opened = pdfium
                    .load_pdf_from_byte_vec(bytes, None)
                    .map_err(|err| err.to_string())
                    .map(|document| {
                        next_id += 1;
                        let pages = u32::from(document.pages().len());
                        documents.insert(next_id, document);
                        debug!(doc = next_id, pages, "pdfium document loaded");
                        (next_id, pages)
                    });
                let _ = reply.send(opened);
            }
            Command::PageSize { doc, index, reply } => {
                let size = with_page(&documents, doc, index, |page| {
                    Ok((page.width().value, page.height().value))
                });
                let _ = reply.send(size);
            }
            Command::Render {
                doc,
                index,
                width,
                height,
                mode,
                reply,
            } => {
                let rendered = with_page(&documents, doc, index, |page| {
                    let config = render_config(width, height, mode);
                    let bitmap = page.render_with_config(&config).map_err(|err| err.to_string())?;
                    Ok(RenderedPage {
                        width: bitmap.width().max(0) as u32,
                        height: bitmap.height().max(0) as u32,
                        bgra: bitmap.as_raw_bytes().to_vec(),
                    })
                });
                let _ = reply.send(rendered);
            }
            Command::Close { doc } => {
                if documents.remove(&doc).is_some() {
                    debug!(doc, "pdfium document closed");
                }
            }
        }
    }
}

fn with_page<T>(
    documents: &HashMap<u64, PdfDocument<'_>>,
    doc: u64,
    index: u32,
    f: impl FnOnce(&pdfium_render::prelude::PdfPage<'_>) -> std::result::Result<T, String>,
) -> std::result::Result<T, String> {
    let document = documents
        .get(&doc)
        .ok_or_else(|| format!("document {doc} is not open"))?;
    let index = u16::try_from(index).map_err(|_| format!("page index {index} out of range"))?;
    let page = document.pages().get(index).map_err(|err| err.to_string())?;
    f(&page)
}

fn render_config(width: u32, height: u32, mode: RenderMode) -> PdfRenderConfig {
    let width = i32::try_from(width.max(1)).unwrap_or(i32::MAX);
    let height = i32::try_from(height.max(1)).unwrap_or(i32::MAX);
    PdfRenderConfig::new()
        .set_target_width(width)
        .set_target_height(height)
        .render_form_data(false)
        .render_annotations(true)
        .use_grayscale_rendering(false)
        .set_reverse_byte_order(false)
        .use_print_quality(mode == RenderMode::Print)
        .set_format(PdfBitmapFormat::BGRA)
}

fn bind_pdfium(explicit: Option<&Path>) -> std::result::Result<Pdfium, String> {
    if let Some(path) = explicit {
        return Pdfium::bind_to_library(path)
            .map(Pdfium::new)
            .map_err(|err| format!("{err}: cannot load Pdfium from {}", path.display()));
    }

    if let Ok(path) = std::env::var("PDFSHELF_PDFIUM_LIB_PATH") {
        let path = PathBuf::from(path);
        return Pdfium::bind_to_library(&path).map(Pdfium::new).map_err(|err| {
            format!(
                "{err}: cannot load Pdfium from PDFSHELF_PDFIUM_LIB_PATH={}",
                path.display()
            )
        });
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = std::env::var("PDFSHELF_PDFIUM_DIR") {
        candidates.push(Pdfium::pdfium_platform_library_name_at_path(Path::new(&dir)));
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        candidates.push(Pdfium::pdfium_platform_library_name_at_path(dir));
    }
    candidates.push(Pdfium::pdfium_platform_library_name_at_path(Path::new(".pdfium")));
    candidates.push(Pdfium::pdfium_platform_library_name_at_path(Path::new(".")));

    for path in candidates {
        if let Ok(bindings) = Pdfium::bind_to_library(&path) {
            return Ok(Pdfium::new(bindings));
        }
    }

    Pdfium::bind_to_system_library()
        .map(Pdfium::new)
        .map_err(|err| {
            format!(
                "{err}: Pdfium library not found. Install it system-wide, set \
                 PDFSHELF_PDFIUM_LIB_PATH, or place {} next to the executable",
                Pdfium::pdfium_platform_library_name().to_string_lossy()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_rows_are_swizzled_with_padding() {
        // 2x2 page, stride of 12 bytes (4 bytes of padding per row).
        let bgra = vec![
            1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0, //
            7, 8, 9, 128, 10, 11, 12, 255, 0, 0, 0, 0,
        ];
        let page = RenderedPage {
            width: 2,
            height: 2,
            bgra,
        };
        let mut target = Bitmap::new(2, 2);
        copy_bgra_into(&page, &mut target);
        assert_eq!(target.pixel(0, 0), Some([3, 2, 1, 255]));
        assert_eq!(target.pixel(1, 0), Some([6, 5, 4, 255]));
        assert_eq!(target.pixel(0, 1), Some([9, 8, 7, 128]));
        assert_eq!(target.pixel(1, 1), Some([12, 11, 10, 255]));
    }

    #[test]
    fn short_render_leaves_the_rest_white() {
        let page = RenderedPage {
            width: 1,
            height: 1,
            bgra: vec![0, 0, 0, 255],
        };
        let mut target = Bitmap::new(2, 2);
        copy_bgra_into(&page, &mut target);
        assert_eq!(target.pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(target.pixel(1, 1), Some([255, 255, 255, 255]));
    }
}
