use std::sync::Arc;

use pdfshelf_core::{Bitmap, scaled_height};
use tracing::{debug, warn};

use crate::handle::RenderHandle;
use crate::native::{NativeDocument, RenderMode};
use crate::{EngineError, Result};

/// Turns page requests into bitmaps, one page at a time per document.
///
/// Holds no per-request state. Callers that issue overlapping requests for the same slot are
/// responsible for discarding the results they no longer want.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageRenderCoordinator {
    mode: RenderMode,
}

impl PageRenderCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: RenderMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    pub async fn render_page(
        &self,
        handle: Option<&Arc<RenderHandle>>,
        index: u32,
        target_width_px: u32,
    ) -> Option<Bitmap> {
        let handle = handle?;
        let mut guard = handle.lock_owned().await;
        let mode = self.mode;
        let rendered = tokio::task::spawn_blocking(move || {
            let renderer = guard
                .as_mut()
                .and_then(|doc| doc.renderer())
                .ok_or(EngineError::HandleClosed)?;
            rasterize_page(renderer, index, target_width_px, mode)
        })
        .await;

        match rendered {
            Ok(Ok(bitmap)) => Some(bitmap),
            Ok(Err(EngineError::HandleClosed)) => {
                debug!(document = %handle.id(), index, "render skipped, handle closed");
                None
            }
            Ok(Err(err)) => {
                warn!(document = %handle.id(), index, error = %err, "page render failed");
                None
            }
            Err(err) => {
                warn!(document = %handle.id(), index, error = %err, "page render task failed");
                None
            }
        }
    }
}

/// Rasterizes one page at `target_width` pixels, keeping the page's aspect ratio. The native
/// page is closed before returning on every path.
pub fn rasterize_page(
    renderer: &mut dyn NativeDocument,
    index: u32,
    target_width: u32,
    mode: RenderMode,
) -> Result<Bitmap> {
    let count = renderer.page_count();
    if index >= count {
        return Err(EngineError::PageOutOfRange { index, count });
    }

    let mut page = renderer.open_page(index)?;
    let (width, height) = page.size();
    let target_width = target_width.max(1);
    let target_height = scaled_height(width, height, target_width)
        .ok_or(EngineError::DegenerateGeometry { width, height })?;

    let mut bitmap = Bitmap::new(target_width, target_height);
    page.render(&mut bitmap, mode)?;
    Ok(bitmap)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pdfshelf_core::DocumentId;

    use super::*;
    use crate::testing::{FakeBackend, MemoryResolver, fake_pdf};

    async fn open(backend: &Arc<FakeBackend>, name: &str) -> Arc<RenderHandle> {
        let id = DocumentId::new(name);
        let resolver = Arc::new(MemoryResolver::with_document(id.clone(), fake_pdf(10, 600.0, 800.0)));
        RenderHandle::acquire(resolver, backend.clone(), id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn output_keeps_aspect_ratio() {
        let backend = Arc::new(FakeBackend::default());
        let handle = open(&backend, "mem://a.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        let bitmap = coordinator.render_page(Some(&handle), 0, 300).await.unwrap();
        assert_eq!((bitmap.width, bitmap.height), (300, 400));
        assert_eq!(bitmap.byte_len(), 300 * 400 * 4);

        for width in [1, 7, 120, 333, 1080, 2200] {
            let bitmap = coordinator.render_page(Some(&handle), 3, width).await.unwrap();
            let expected = ((width as f64) * 800.0 / 600.0).round() as u32;
            assert_eq!((bitmap.width, bitmap.height), (width, expected.max(1)));
        }
    }

    #[tokio::test]
    async fn pages_are_closed_after_each_render() {
        let backend = Arc::new(FakeBackend::default().failing_page(2));
        let handle = open(&backend, "mem://a.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        assert!(coordinator.render_page(Some(&handle), 1, 200).await.is_some());
        assert!(coordinator.render_page(Some(&handle), 2, 200).await.is_none());
        assert!(coordinator.render_page(Some(&handle), 3, 200).await.is_some());

        let stats = backend.stats();
        assert_eq!(stats.pages_opened, 3);
        assert_eq!(stats.pages_closed, 3);
    }

    #[tokio::test]
    async fn missing_handle_or_page_yields_nothing() {
        let backend = Arc::new(FakeBackend::default());
        let handle = open(&backend, "mem://a.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        assert!(coordinator.render_page(None, 0, 300).await.is_none());
        assert!(coordinator.render_page(Some(&handle), 10, 300).await.is_none());
        assert_eq!(backend.stats().pages_opened, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_document_renders_one_page_at_a_time() {
        let backend = Arc::new(FakeBackend::default().with_render_delay(Duration::from_millis(20)));
        let handle = open(&backend, "mem://a.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..6 {
            let handle = handle.clone();
            tasks.spawn(async move { coordinator.render_page(Some(&handle), index, 100).await });
        }
        while let Some(done) = tasks.join_next().await {
            assert!(done.unwrap().is_some());
        }

        let stats = backend.stats();
        assert_eq!(stats.renders, 6);
        assert_eq!(stats.max_concurrent_renders, 1);
    }

    #[tokio::test]
    async fn distinct_documents_do_not_contend() {
        let backend = Arc::new(FakeBackend::default());
        let first = open(&backend, "mem://a.pdf").await;
        let second = open(&backend, "mem://b.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        let _busy = first.lock_owned().await;
        let rendered = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator.render_page(Some(&second), 0, 100),
        )
        .await
        .expect("second document blocked by the first");
        assert!(rendered.is_some());
    }

    #[tokio::test]
    async fn closed_handle_fails_soft() {
        let backend = Arc::new(FakeBackend::default());
        let handle = open(&backend, "mem://a.pdf").await;
        let coordinator = PageRenderCoordinator::new();

        handle.close().await;
        assert!(coordinator.render_page(Some(&handle), 0, 300).await.is_none());
        assert_eq!(backend.stats().pages_opened, 0);
    }

    #[tokio::test]
    async fn degenerate_page_is_an_error() {
        let backend = FakeBackend::default();
        let resolver = MemoryResolver::with_document(
            DocumentId::new("mem://flat.pdf"),
            fake_pdf(1, 0.0, 800.0),
        );
        let handle =
            RenderHandle::open(&resolver, &backend, &DocumentId::new("mem://flat.pdf")).unwrap();
        let mut guard = handle.lock_owned().await;
        let renderer = guard.as_mut().and_then(|doc| doc.renderer()).unwrap();
        let err = rasterize_page(renderer, 0, 300, RenderMode::Display).unwrap_err();
        assert!(matches!(err, EngineError::DegenerateGeometry { .. }));
        drop(guard);
        assert_eq!(backend.stats().pages_closed, 1);
    }
}
