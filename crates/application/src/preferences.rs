use pdfshelf_core::DisplaySettings;
use tokio::sync::watch;
use tracing::debug;

use crate::{SharedStorage, with_storage};

/// Display settings shared by every reader, persisted on each change.
pub struct Preferences {
    storage: SharedStorage,
    settings: watch::Sender<DisplaySettings>,
}

impl Preferences {
    pub async fn open(storage: SharedStorage) -> anyhow::Result<Self> {
        let current = with_storage(&storage, |s| s.load_display_settings()).await?;
        let (tx, _) = watch::channel(current);
        Ok(Self {
            storage,
            settings: tx,
        })
    }

    pub fn current(&self) -> DisplaySettings {
        *self.settings.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplaySettings> {
        self.settings.subscribe()
    }

    pub async fn set_dark_mode(&self, enabled: bool) -> anyhow::Result<DisplaySettings> {
        with_storage(&self.storage, move |s| s.set_dark_mode(enabled)).await?;
        Ok(self.publish(|settings| settings.dark_mode = enabled))
    }

    pub async fn toggle_dark_mode(&self) -> anyhow::Result<DisplaySettings> {
        self.set_dark_mode(!self.current().dark_mode).await
    }

    pub async fn set_zoom(&self, zoom: f32) -> anyhow::Result<DisplaySettings> {
        let mut next = self.current();
        next.zoom = zoom;
        next.normalize();
        let zoom = next.zoom;
        with_storage(&self.storage, move |s| s.set_zoom(zoom)).await?;
        Ok(self.publish(|settings| settings.zoom = zoom))
    }

    pub async fn zoom_in(&self) -> anyhow::Result<DisplaySettings> {
        let mut next = self.current();
        next.zoom_in();
        self.set_zoom(next.zoom).await
    }

    pub async fn zoom_out(&self) -> anyhow::Result<DisplaySettings> {
        let mut next = self.current();
        next.zoom_out();
        self.set_zoom(next.zoom).await
    }

    pub async fn set_full_screen(&self, enabled: bool) -> anyhow::Result<DisplaySettings> {
        with_storage(&self.storage, move |s| s.set_full_screen(enabled)).await?;
        Ok(self.publish(|settings| settings.full_screen = enabled))
    }

    pub async fn toggle_full_screen(&self) -> anyhow::Result<DisplaySettings> {
        self.set_full_screen(!self.current().full_screen).await
    }

    fn publish(&self, change: impl FnOnce(&mut DisplaySettings)) -> DisplaySettings {
        self.settings.send_modify(change);
        let now = self.current();
        debug!(dark_mode = now.dark_mode, zoom = now.zoom, full_screen = now.full_screen, "display settings changed");
        now
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pdfshelf_storage::Storage;

    use super::*;

    async fn open() -> anyhow::Result<(Preferences, SharedStorage)> {
        let storage = Arc::new(Mutex::new(Storage::open_in_memory()?));
        Ok((Preferences::open(storage.clone()).await?, storage))
    }

    #[tokio::test]
    async fn changes_are_persisted_and_published() -> anyhow::Result<()> {
        let (prefs, storage) = open().await?;
        let mut rx = prefs.subscribe();
        assert_eq!(prefs.current(), DisplaySettings::default());

        prefs.toggle_dark_mode().await?;
        assert!(rx.has_changed()?);
        assert!(rx.borrow_and_update().dark_mode);

        prefs.set_full_screen(true).await?;
        let stored = storage.lock().load_display_settings()?;
        assert!(stored.dark_mode && stored.full_screen);

        let reopened = Preferences::open(storage).await?;
        assert_eq!(reopened.current(), prefs.current());
        Ok(())
    }

    #[tokio::test]
    async fn zoom_steps_and_clamps() -> anyhow::Result<()> {
        let (prefs, storage) = open().await?;
        assert_eq!(prefs.zoom_in().await?.zoom, 1.25);
        assert_eq!(prefs.zoom_in().await?.zoom, 1.5);
        assert_eq!(prefs.zoom_out().await?.zoom, 1.25);

        assert_eq!(prefs.set_zoom(10.0).await?.zoom, 3.0);
        assert_eq!(prefs.zoom_in().await?.zoom, 3.0);
        assert_eq!(prefs.set_zoom(0.6).await?.zoom, 0.6);
        assert_eq!(prefs.zoom_out().await?.zoom, 0.5);
        assert_eq!(storage.lock().load_display_settings()?.zoom, 0.5);
        Ok(())
    }
}
