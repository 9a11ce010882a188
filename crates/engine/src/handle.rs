use std::sync::Arc;

use pdfshelf_core::DocumentId;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::Result;
use crate::native::{ByteStream, DocumentResolver, NativeDocument, RasterBackend};

/// One open byte stream plus the native renderer reading it.
///
/// The renderer slot doubles as the per-document lock: every page operation holds it, and
/// teardown empties it, so a request that arrives after [`RenderHandle::close`] finds nothing
/// to render and yields `None`.
pub struct RenderHandle {
    id: DocumentId,
    page_count: u32,
    slot: Arc<Mutex<Option<OpenDocument>>>,
}

pub(crate) struct OpenDocument {
    renderer: Option<Box<dyn NativeDocument>>,
    _stream: Box<dyn ByteStream>,
}

impl OpenDocument {
    pub(crate) fn renderer(&mut self) -> Option<&mut (dyn NativeDocument + 'static)> {
        self.renderer.as_deref_mut()
    }
}

impl Drop for OpenDocument {
    fn drop(&mut self) {
        // Renderer first; `_stream` is dropped after this body runs.
        drop(self.renderer.take());
    }
}

impl std::fmt::Debug for RenderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderHandle")
            .field("id", &self.id)
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl RenderHandle {
    /// Blocking open. Fails only when the identifier does not resolve to bytes; a renderer that
    /// refuses the bytes yields a handle with zero pages.
    pub fn open(
        resolver: &dyn DocumentResolver,
        backend: &dyn RasterBackend,
        id: &DocumentId,
    ) -> Result<Self> {
        let mut stream = resolver.open(id)?;
        let open = match backend.open(stream.as_mut()) {
            Ok(renderer) => Some(OpenDocument {
                renderer: Some(renderer),
                _stream: stream,
            }),
            Err(err) => {
                warn!(document = %id, error = %err, "native renderer rejected document");
                drop(stream);
                None
            }
        };
        let page_count = open
            .as_ref()
            .and_then(|doc| doc.renderer.as_ref())
            .map(|renderer| renderer.page_count())
            .unwrap_or(0);
        debug!(document = %id, page_count, "render handle opened");
        Ok(Self {
            id: id.clone(),
            page_count,
            slot: Arc::new(Mutex::new(open)),
        })
    }

    /// Opens on the blocking pool; `None` when the document cannot be resolved.
    pub async fn acquire(
        resolver: Arc<dyn DocumentResolver>,
        backend: Arc<dyn RasterBackend>,
        id: DocumentId,
    ) -> Option<Arc<Self>> {
        let task_id = id.clone();
        let opened = tokio::task::spawn_blocking(move || {
            RenderHandle::open(resolver.as_ref(), backend.as_ref(), &task_id)
        })
        .await;
        match opened {
            Ok(Ok(handle)) => Some(Arc::new(handle)),
            Ok(Err(err)) => {
                warn!(document = %id, error = %err, "cannot open document");
                None
            }
            Err(err) => {
                warn!(document = %id, error = %err, "open task failed");
                None
            }
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub async fn is_open(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Waits for the in-flight page operation, if any, then takes the lock.
    pub(crate) async fn lock_owned(&self) -> OwnedMutexGuard<Option<OpenDocument>> {
        self.slot.clone().lock_owned().await
    }

    /// Must not be called from async context.
    pub(crate) fn blocking_lock(&self) -> tokio::sync::MutexGuard<'_, Option<OpenDocument>> {
        self.slot.blocking_lock()
    }

    /// Releases renderer then stream. Later calls are no-ops.
    pub async fn close(&self) {
        let taken = self.slot.lock().await.take();
        if let Some(doc) = taken {
            let id = self.id.clone();
            let released = tokio::task::spawn_blocking(move || drop(doc)).await;
            if let Err(err) = released {
                warn!(document = %id, error = %err, "render handle release failed");
            } else {
                debug!(document = %id, "render handle closed");
            }
        }
    }

    /// [`RenderHandle::close`] for callers already on the blocking pool.
    pub fn close_blocking(&self) {
        if let Some(doc) = self.slot.blocking_lock().take() {
            drop(doc);
            debug!(document = %self.id, "render handle closed");
        }
    }
}
