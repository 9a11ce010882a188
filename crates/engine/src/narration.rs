use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pdfshelf_core::{DocumentId, NarrationState};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::native::{
    DocumentResolver, QueueMode, SpeechEngine, SpeechFactory, TextDocument, TextExtractor,
};
use crate::text::{reflow_text, truncate_chars};
use crate::{EngineError, Result};

/// Speaks the current page of one open document.
///
/// The speech engine and the text document are created on first use and kept warm until
/// [`Narrator::shutdown`]. Every failure lands back in [`NarrationState::Idle`].
pub struct Narrator {
    document: DocumentId,
    resolver: Arc<dyn DocumentResolver>,
    extractor: Arc<dyn TextExtractor>,
    speech: Arc<dyn SpeechFactory>,
    max_chars: usize,
    state: parking_lot::Mutex<NarrationState>,
    engine: Mutex<Option<Arc<dyn SpeechEngine>>>,
    text: Mutex<Option<Arc<dyn TextDocument>>>,
    // Bumped by every stop so a slow extraction cannot start speaking afterwards.
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Narrator {
    pub fn new(
        document: DocumentId,
        resolver: Arc<dyn DocumentResolver>,
        extractor: Arc<dyn TextExtractor>,
        speech: Arc<dyn SpeechFactory>,
        max_chars: usize,
    ) -> Self {
        Self {
            document,
            resolver,
            extractor,
            speech,
            max_chars: max_chars.max(1),
            state: parking_lot::Mutex::new(NarrationState::Idle),
            engine: Mutex::new(None),
            text: Mutex::new(None),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> NarrationState {
        *self.state.lock()
    }

    /// Idle starts speaking `page`; Speaking stops.
    pub async fn toggle(&self, page: u32) -> NarrationState {
        if self.state() == NarrationState::Speaking {
            self.stop().await;
            return NarrationState::Idle;
        }
        self.speak_page(page).await
    }

    /// While speaking, interrupts the old page with the new one.
    pub async fn on_page_changed(&self, page: u32) -> NarrationState {
        if self.state() != NarrationState::Speaking {
            return NarrationState::Idle;
        }
        self.speak_page(page).await
    }

    /// Halts playback; the engine and text document stay open.
    pub async fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = NarrationState::Idle;
        let engine = self.engine.lock().await.clone();
        if let Some(engine) = engine
            && let Err(err) = engine.stop()
        {
            warn!(document = %self.document, error = %err, "speech stop failed");
        }
    }

    /// Resolves once the engine has finished the current utterance.
    pub async fn wait_until_done(&self) {
        let engine = self.engine.lock().await.clone();
        let Some(engine) = engine else {
            return;
        };
        match tokio::task::spawn_blocking(move || engine.wait()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(document = %self.document, error = %err, "speech wait failed"),
            Err(err) => warn!(document = %self.document, error = %err, "speech wait task failed"),
        }
        *self.state.lock() = NarrationState::Idle;
    }

    /// Stops speech and releases the engine and text document. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = NarrationState::Idle;

        let engine = self.engine.lock().await.take();
        if let Some(engine) = engine {
            if let Err(err) = engine.stop() {
                debug!(document = %self.document, error = %err, "speech stop during shutdown failed");
            }
            engine.shutdown();
        }
        let text = self.text.lock().await.take();
        if let Some(text) = text {
            let _ = tokio::task::spawn_blocking(move || drop(text)).await;
        }
        debug!(document = %self.document, "narration shut down");
    }

    async fn speak_page(&self, page: u32) -> NarrationState {
        if self.closed.load(Ordering::SeqCst) {
            return NarrationState::Idle;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        match self.prepare_and_speak(page, generation).await {
            Ok(state) => {
                // Under the state lock so a concurrent stop either sees this write or overrides it.
                let mut current = self.state.lock();
                if self.generation.load(Ordering::SeqCst) != generation {
                    *current = NarrationState::Idle;
                    return NarrationState::Idle;
                }
                *current = state;
                state
            }
            Err(err) => {
                warn!(document = %self.document, page, error = %err, "narration failed");
                *self.state.lock() = NarrationState::Idle;
                NarrationState::Idle
            }
        }
    }

    async fn prepare_and_speak(&self, page: u32, generation: u64) -> Result<NarrationState> {
        let engine = self.engine().await?;
        let document = self.text_document().await?;

        let max_chars = self.max_chars;
        let text = tokio::task::spawn_blocking(move || -> Result<String> {
            let raw = document.page_text(page)?;
            Ok(truncate_chars(&reflow_text(&raw), max_chars).to_string())
        })
        .await??;

        if text.trim().is_empty() {
            debug!(document = %self.document, page, "page has no text to speak");
            return Ok(NarrationState::Idle);
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(self.state());
        }

        let utterance = format!("page_{}", page + 1);
        engine.speak(&text, QueueMode::Flush, &utterance)?;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(document = %self.document, utterance, "stopped while starting, silencing");
            engine.stop()?;
            return Ok(NarrationState::Idle);
        }
        debug!(document = %self.document, utterance, chars = text.chars().count(), "speaking");
        Ok(NarrationState::Speaking)
    }

    async fn engine(&self) -> Result<Arc<dyn SpeechEngine>> {
        let mut slot = self.engine.lock().await;
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let factory = self.speech.clone();
        let engine = tokio::task::spawn_blocking(move || factory.start()).await??;
        if self.closed.load(Ordering::SeqCst) {
            engine.shutdown();
            return Err(EngineError::Speech("narration already shut down".to_string()));
        }
        *slot = Some(engine.clone());
        Ok(engine)
    }

    async fn text_document(&self) -> Result<Arc<dyn TextDocument>> {
        let mut slot = self.text.lock().await;
        if let Some(document) = slot.as_ref() {
            return Ok(document.clone());
        }
        let resolver = self.resolver.clone();
        let extractor = self.extractor.clone();
        let id = self.document.clone();
        let document: Arc<dyn TextDocument> = tokio::task::spawn_blocking(move || {
            let stream = resolver.open(&id)?;
            let document: Arc<dyn TextDocument> = Arc::from(extractor.open(stream)?);
            Ok::<_, EngineError>(document)
        })
        .await??;
        *slot = Some(document.clone());
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeSpeechFactory, FakeTextExtractor, MemoryResolver, SpeechEvent, fake_pdf,
    };

    struct Rig {
        narrator: Narrator,
        speech: Arc<FakeSpeechFactory>,
        extractor: Arc<FakeTextExtractor>,
    }

    fn rig_with(extractor: FakeTextExtractor, speech: FakeSpeechFactory, max_chars: usize) -> Rig {
        let id = DocumentId::new("mem://novel.pdf");
        let resolver = Arc::new(MemoryResolver::with_document(id.clone(), fake_pdf(10, 600.0, 800.0)));
        let extractor = Arc::new(extractor);
        let speech = Arc::new(speech);
        let narrator = Narrator::new(id, resolver, extractor.clone(), speech.clone(), max_chars);
        Rig {
            narrator,
            speech,
            extractor,
        }
    }

    fn rig() -> Rig {
        rig_with(FakeTextExtractor::default(), FakeSpeechFactory::default(), 6000)
    }

    #[tokio::test]
    async fn toggling_twice_speaks_then_stops() {
        let rig = rig();
        assert_eq!(rig.narrator.toggle(2).await, NarrationState::Speaking);
        assert_eq!(rig.narrator.toggle(2).await, NarrationState::Idle);
        assert_eq!(rig.narrator.state(), NarrationState::Idle);

        let engine = rig.speech.engine();
        assert_eq!(
            engine.events(),
            vec![
                SpeechEvent::Speak {
                    text: "Page 3 text.".to_string(),
                    mode: QueueMode::Flush,
                    utterance: "page_3".to_string(),
                },
                SpeechEvent::Stop,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_speak_silences_the_engine() {
        let id = DocumentId::new("mem://novel.pdf");
        let resolver = Arc::new(MemoryResolver::with_document(id.clone(), fake_pdf(10, 600.0, 800.0)));
        let speech = Arc::new(FakeSpeechFactory::slow(std::time::Duration::from_millis(300)));
        let narrator = Arc::new(Narrator::new(
            id,
            resolver,
            Arc::new(FakeTextExtractor::default()),
            speech.clone(),
            6000,
        ));

        let toggling = tokio::spawn({
            let narrator = narrator.clone();
            async move { narrator.toggle(0).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        narrator.stop().await;

        assert_eq!(toggling.await.unwrap(), NarrationState::Idle);
        assert_eq!(narrator.state(), NarrationState::Idle);
        let events = speech.engine().events();
        assert!(matches!(events.first(), Some(SpeechEvent::Speak { .. })));
        assert_eq!(events.last(), Some(&SpeechEvent::Stop));
    }

    #[tokio::test]
    async fn engine_and_text_document_are_reused() {
        let rig = rig();
        rig.narrator.toggle(0).await;
        rig.narrator.toggle(0).await;
        rig.narrator.toggle(1).await;
        rig.narrator.on_page_changed(4).await;

        assert_eq!(rig.speech.starts(), 1);
        assert_eq!(rig.extractor.opens(), 1);
        assert_eq!(rig.extractor.released(), 0);
    }

    #[tokio::test]
    async fn page_change_while_speaking_flushes() {
        let rig = rig();
        rig.narrator.toggle(0).await;
        assert_eq!(rig.narrator.on_page_changed(1).await, NarrationState::Speaking);

        let spoken = rig.speech.engine().spoken();
        assert_eq!(spoken.len(), 2);
        assert_eq!(spoken[1], ("Page 2 text.".to_string(), QueueMode::Flush, "page_2".to_string()));
    }

    #[tokio::test]
    async fn page_change_while_idle_stays_silent() {
        let rig = rig();
        assert_eq!(rig.narrator.on_page_changed(3).await, NarrationState::Idle);
        assert_eq!(rig.speech.starts(), 0);
        assert_eq!(rig.extractor.opens(), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_everything_once() {
        let rig = rig();
        rig.narrator.toggle(0).await;
        rig.narrator.shutdown().await;
        rig.narrator.shutdown().await;

        assert_eq!(rig.narrator.state(), NarrationState::Idle);
        assert_eq!(rig.extractor.released(), 1);
        let events = rig.speech.engine().events();
        assert_eq!(
            events.iter().filter(|e| **e == SpeechEvent::Shutdown).count(),
            1
        );
        assert_eq!(rig.narrator.toggle(1).await, NarrationState::Idle);
        assert_eq!(rig.speech.starts(), 1);
    }

    #[tokio::test]
    async fn shutdown_from_idle_is_harmless() {
        let rig = rig();
        rig.narrator.shutdown().await;
        assert_eq!(rig.speech.starts(), 0);
        assert_eq!(rig.extractor.released(), 0);
    }

    #[tokio::test]
    async fn missing_engine_stays_idle() {
        let rig = rig_with(FakeTextExtractor::default(), FakeSpeechFactory::unavailable(), 6000);
        assert_eq!(rig.narrator.toggle(0).await, NarrationState::Idle);
        assert_eq!(rig.narrator.toggle(0).await, NarrationState::Idle);
        // No engine was kept, so each attempt retries.
        assert_eq!(rig.speech.starts(), 2);
    }

    #[tokio::test]
    async fn blank_page_stays_idle() {
        let extractor = FakeTextExtractor::default().with_page(0, "  \n\t ");
        let rig = rig_with(extractor, FakeSpeechFactory::default(), 6000);
        assert_eq!(rig.narrator.toggle(0).await, NarrationState::Idle);
        assert!(rig.speech.engine().spoken().is_empty());
    }

    #[tokio::test]
    async fn out_of_range_page_stays_idle() {
        let rig = rig();
        assert_eq!(rig.narrator.toggle(99).await, NarrationState::Idle);
        assert!(rig.speech.engine().spoken().is_empty());
    }

    #[tokio::test]
    async fn long_pages_are_truncated() {
        let extractor = FakeTextExtractor::default().with_page(0, "é".repeat(50));
        let rig = rig_with(extractor, FakeSpeechFactory::default(), 12);
        rig.narrator.toggle(0).await;
        let spoken = rig.speech.engine().spoken();
        assert_eq!(spoken[0].0, "é".repeat(12));
    }
}
