//! In-process doubles for the native seams, used by unit tests and the end-to-end crate.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pdfshelf_core::{Bitmap, DocumentId};

use crate::native::{
    ByteStream, DocumentResolver, NativeDocument, NativePage, QueueMode, RasterBackend,
    RenderMode, SpeechEngine, SpeechFactory, TextDocument, TextExtractor,
};
use crate::thumbnail::ThumbnailSource;
use crate::{EngineError, Result};

/// Bytes understood by [`FakeBackend`]: a page count and a page size.
pub fn fake_pdf(pages: u32, width: f32, height: f32) -> Vec<u8> {
    format!("fake-pdf:{pages}:{width}x{height}").into_bytes()
}

fn parse_fake_pdf(bytes: &[u8]) -> Option<(u32, (f32, f32))> {
    let text = std::str::from_utf8(bytes).ok()?;
    let rest = text.strip_prefix("fake-pdf:")?;
    let (pages, size) = rest.split_once(':')?;
    let (w, h) = size.split_once('x')?;
    Some((pages.parse().ok()?, (w.parse().ok()?, h.parse().ok()?)))
}

/// Ordered record of resource releases.
#[derive(Debug, Clone, Default)]
pub struct ReleaseLog(Arc<Mutex<Vec<&'static str>>>);

impl ReleaseLog {
    pub fn push(&self, what: &'static str) {
        self.0.lock().push(what);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }
}

#[derive(Default)]
pub struct MemoryResolver {
    documents: Mutex<HashMap<DocumentId, Vec<u8>>>,
    opens: AtomicUsize,
    streams_closed: Arc<AtomicUsize>,
    log: ReleaseLog,
}

impl MemoryResolver {
    pub fn with_document(id: DocumentId, bytes: Vec<u8>) -> Self {
        let resolver = Self::default();
        resolver.insert(id, bytes);
        resolver
    }

    pub fn insert(&self, id: DocumentId, bytes: Vec<u8>) {
        self.documents.lock().insert(id, bytes);
    }

    pub fn remove(&self, id: &DocumentId) {
        self.documents.lock().remove(id);
    }

    pub fn log(&self) -> ReleaseLog {
        self.log.clone()
    }

    pub fn release_log(&self) -> Vec<&'static str> {
        self.log.entries()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn streams_closed(&self) -> usize {
        self.streams_closed.load(Ordering::SeqCst)
    }
}

struct TrackedStream {
    inner: Cursor<Vec<u8>>,
    closed: Arc<AtomicUsize>,
    log: ReleaseLog,
}

impl Read for TrackedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Read::read(&mut self.inner, buf)
    }
}

impl Seek for TrackedStream {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        Seek::seek(&mut self.inner, pos)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.log.push("stream");
    }
}

impl DocumentResolver for MemoryResolver {
    fn open(&self, id: &DocumentId) -> Result<Box<dyn ByteStream>> {
        let bytes = self.documents.lock().get(id).cloned().ok_or_else(|| {
            EngineError::Resolve {
                id: id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such document"),
            }
        })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedStream {
            inner: Cursor::new(bytes),
            closed: self.streams_closed.clone(),
            log: self.log.clone(),
        }))
    }

    fn display_name(&self, id: &DocumentId) -> Option<String> {
        if !self.documents.lock().contains_key(id) {
            return None;
        }
        id.as_str()
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    }

    fn persist_read_access(&self, id: &DocumentId) -> Result<()> {
        if self.documents.lock().contains_key(id) {
            Ok(())
        } else {
            Err(EngineError::Resolve {
                id: id.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no access"),
            })
        }
    }
}

#[derive(Default)]
struct BackendCounters {
    documents_opened: AtomicUsize,
    documents_closed: AtomicUsize,
    pages_opened: AtomicUsize,
    pages_closed: AtomicUsize,
    renders: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStats {
    pub documents_opened: usize,
    pub documents_closed: usize,
    pub pages_opened: usize,
    pub pages_closed: usize,
    pub renders: usize,
    pub max_concurrent_renders: usize,
}

/// Renderer over [`fake_pdf`] bytes. Other bytes open as `default_pages` pages of
/// `default_size`.
pub struct FakeBackend {
    default_pages: u32,
    default_size: (f32, f32),
    fail_open: bool,
    failing_pages: HashSet<u32>,
    render_delay: Duration,
    counters: Arc<BackendCounters>,
    log: Option<ReleaseLog>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new(1, (600.0, 800.0))
    }
}

impl FakeBackend {
    pub fn new(default_pages: u32, default_size: (f32, f32)) -> Self {
        Self {
            default_pages,
            default_size,
            fail_open: false,
            failing_pages: HashSet::new(),
            render_delay: Duration::ZERO,
            counters: Arc::default(),
            log: None,
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_page(mut self, index: u32) -> Self {
        self.failing_pages.insert(index);
        self
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = delay;
        self
    }

    pub fn with_log(mut self, log: ReleaseLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn stats(&self) -> BackendStats {
        let c = &self.counters;
        BackendStats {
            documents_opened: c.documents_opened.load(Ordering::SeqCst),
            documents_closed: c.documents_closed.load(Ordering::SeqCst),
            pages_opened: c.pages_opened.load(Ordering::SeqCst),
            pages_closed: c.pages_closed.load(Ordering::SeqCst),
            renders: c.renders.load(Ordering::SeqCst),
            max_concurrent_renders: c.max_active.load(Ordering::SeqCst),
        }
    }
}

impl RasterBackend for FakeBackend {
    fn open(&self, stream: &mut dyn ByteStream) -> Result<Box<dyn NativeDocument>> {
        let mut bytes = Vec::new();
        Read::read_to_end(&mut *stream, &mut bytes)?;
        if self.fail_open {
            return Err(EngineError::native("not a pdf"));
        }
        let (page_count, page_size) =
            parse_fake_pdf(&bytes).unwrap_or((self.default_pages, self.default_size));
        self.counters.documents_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDocument {
            page_count,
            page_size,
            failing_pages: self.failing_pages.clone(),
            render_delay: self.render_delay,
            counters: self.counters.clone(),
            log: self.log.clone(),
        }))
    }
}

struct FakeDocument {
    page_count: u32,
    page_size: (f32, f32),
    failing_pages: HashSet<u32>,
    render_delay: Duration,
    counters: Arc<BackendCounters>,
    log: Option<ReleaseLog>,
}

impl Drop for FakeDocument {
    fn drop(&mut self) {
        self.counters.documents_closed.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push("renderer");
        }
    }
}

impl NativeDocument for FakeDocument {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn open_page(&mut self, index: u32) -> Result<Box<dyn NativePage + '_>> {
        if index >= self.page_count {
            return Err(EngineError::PageOutOfRange {
                index,
                count: self.page_count,
            });
        }
        self.counters.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePage {
            index,
            document: self,
        }))
    }
}

struct FakePage<'a> {
    index: u32,
    document: &'a FakeDocument,
}

impl Drop for FakePage<'_> {
    fn drop(&mut self) {
        self.document
            .counters
            .pages_closed
            .fetch_add(1, Ordering::SeqCst);
    }
}

impl NativePage for FakePage<'_> {
    fn size(&self) -> (f32, f32) {
        self.document.page_size
    }

    fn render(&mut self, target: &mut Bitmap, _mode: RenderMode) -> Result<()> {
        let counters = &self.document.counters;
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.document.render_delay.is_zero() {
            std::thread::sleep(self.document.render_delay);
        }
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.renders.fetch_add(1, Ordering::SeqCst);

        if self.document.failing_pages.contains(&self.index) {
            return Err(EngineError::native(format!("page {} is broken", self.index)));
        }
        let shade = (self.index % 200) as u8;
        for px in target.pixels.chunks_exact_mut(4) {
            px[0] = shade;
            px[1] = shade;
            px[2] = shade;
            px[3] = 255;
        }
        Ok(())
    }
}

/// Thumbnail source that counts generations and can fail the first `n` of them.
pub struct CountingSource {
    generations: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for CountingSource {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl CountingSource {
    pub fn new(delay: Duration) -> Self {
        Self {
            generations: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl ThumbnailSource for CountingSource {
    fn generate(&self, _document: &DocumentId, width: u32) -> Result<Bitmap> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(EngineError::native("generation failed"));
        }
        Ok(Bitmap::new(width, width * 4 / 3))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Speak {
        text: String,
        mode: QueueMode,
        utterance: String,
    },
    Stop,
    Shutdown,
}

#[derive(Default)]
pub struct FakeSpeech {
    events: Mutex<Vec<SpeechEvent>>,
    speak_delay: Duration,
}

impl FakeSpeech {
    pub fn events(&self) -> Vec<SpeechEvent> {
        self.events.lock().clone()
    }

    pub fn spoken(&self) -> Vec<(String, QueueMode, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SpeechEvent::Speak {
                    text,
                    mode,
                    utterance,
                } => Some((text.clone(), *mode, utterance.clone())),
                _ => None,
            })
            .collect()
    }
}

impl SpeechEngine for FakeSpeech {
    fn speak(&self, text: &str, mode: QueueMode, utterance_id: &str) -> Result<()> {
        self.events.lock().push(SpeechEvent::Speak {
            text: text.to_string(),
            mode,
            utterance: utterance_id.to_string(),
        });
        if !self.speak_delay.is_zero() {
            std::thread::sleep(self.speak_delay);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.events.lock().push(SpeechEvent::Stop);
        Ok(())
    }

    fn shutdown(&self) {
        self.events.lock().push(SpeechEvent::Shutdown);
    }
}

/// Hands out one shared [`FakeSpeech`] and counts how often it was started.
#[derive(Default)]
pub struct FakeSpeechFactory {
    engine: Arc<FakeSpeech>,
    starts: AtomicUsize,
    unavailable: bool,
}

impl FakeSpeechFactory {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Each `speak` call blocks for `delay` after recording itself.
    pub fn slow(delay: Duration) -> Self {
        Self {
            engine: Arc::new(FakeSpeech {
                speak_delay: delay,
                ..FakeSpeech::default()
            }),
            ..Self::default()
        }
    }

    pub fn engine(&self) -> Arc<FakeSpeech> {
        self.engine.clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl SpeechFactory for FakeSpeechFactory {
    fn start(&self) -> Result<Arc<dyn SpeechEngine>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(EngineError::Speech("no engine installed".to_string()));
        }
        Ok(self.engine.clone())
    }
}

/// Text for page `n` is `"Page n+1 text."` unless overridden.
#[derive(Default)]
pub struct FakeTextExtractor {
    pages: Mutex<HashMap<u32, String>>,
    opens: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl FakeTextExtractor {
    pub fn with_page(self, index: u32, text: impl Into<String>) -> Self {
        self.pages.lock().insert(index, text.into());
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl TextExtractor for FakeTextExtractor {
    fn open(&self, mut stream: Box<dyn ByteStream>) -> Result<Box<dyn TextDocument>> {
        let mut bytes = Vec::new();
        Read::read_to_end(&mut stream, &mut bytes)?;
        let page_count = parse_fake_pdf(&bytes).map(|(pages, _)| pages).unwrap_or(1);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTextDocument {
            page_count,
            pages: self.pages.lock().clone(),
            released: self.released.clone(),
        }))
    }
}

struct FakeTextDocument {
    page_count: u32,
    pages: HashMap<u32, String>,
    released: Arc<AtomicUsize>,
}

impl Drop for FakeTextDocument {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl TextDocument for FakeTextDocument {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_text(&self, index: u32) -> Result<String> {
        if index >= self.page_count {
            return Err(EngineError::PageOutOfRange {
                index,
                count: self.page_count,
            });
        }
        Ok(self
            .pages
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("Page {} text.", index + 1)))
    }
}
