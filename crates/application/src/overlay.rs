use std::time::{Duration, Instant};

/// Reader controls in immersive (full screen) mode.
///
/// Outside full screen the controls are always shown. In full screen they start hidden, a tap
/// toggles them, and once shown they hide again after `hide_after` without further taps.
#[derive(Debug, Clone)]
pub struct ImmersiveOverlay {
    hide_after: Duration,
    full_screen: bool,
    shown_at: Option<Instant>,
}

impl ImmersiveOverlay {
    pub fn new(hide_after: Duration, full_screen: bool) -> Self {
        Self {
            hide_after,
            full_screen,
            shown_at: None,
        }
    }

    pub fn full_screen(&self) -> bool {
        self.full_screen
    }

    pub fn controls_visible(&self) -> bool {
        !self.full_screen || self.shown_at.is_some()
    }

    /// Entering or leaving full screen resets the overlay to hidden.
    pub fn set_full_screen(&mut self, full_screen: bool) {
        if self.full_screen != full_screen {
            self.full_screen = full_screen;
            self.shown_at = None;
        }
    }

    /// Returns whether visibility changed.
    pub fn tap(&mut self, now: Instant) -> bool {
        if !self.full_screen {
            return false;
        }
        self.shown_at = match self.shown_at {
            Some(_) => None,
            None => Some(now),
        };
        true
    }

    /// Hides controls that have been up for `hide_after`. Returns whether visibility changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.shown_at {
            Some(shown) if self.full_screen && now.saturating_duration_since(shown) >= self.hide_after => {
                self.shown_at = None;
                true
            }
            _ => false,
        }
    }

    /// When the pending auto-hide fires, if any.
    pub fn hide_deadline(&self) -> Option<Instant> {
        self.shown_at
            .filter(|_| self.full_screen)
            .map(|shown| shown + self.hide_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HIDE: Duration = Duration::from_millis(2500);

    #[test]
    fn windowed_mode_always_shows_controls() {
        let mut overlay = ImmersiveOverlay::new(HIDE, false);
        let now = Instant::now();
        assert!(overlay.controls_visible());
        assert!(!overlay.tap(now));
        assert!(!overlay.tick(now + HIDE * 2));
        assert!(overlay.controls_visible());
        assert_eq!(overlay.hide_deadline(), None);
    }

    #[test]
    fn full_screen_tap_shows_then_auto_hides() {
        let mut overlay = ImmersiveOverlay::new(HIDE, true);
        let start = Instant::now();
        assert!(!overlay.controls_visible());

        assert!(overlay.tap(start));
        assert!(overlay.controls_visible());
        assert_eq!(overlay.hide_deadline(), Some(start + HIDE));

        assert!(!overlay.tick(start + Duration::from_millis(2499)));
        assert!(overlay.controls_visible());
        assert!(overlay.tick(start + HIDE));
        assert!(!overlay.controls_visible());
    }

    #[test]
    fn second_tap_hides_immediately() {
        let mut overlay = ImmersiveOverlay::new(HIDE, true);
        let start = Instant::now();
        overlay.tap(start);
        overlay.tap(start + Duration::from_millis(100));
        assert!(!overlay.controls_visible());
    }

    #[test]
    fn switching_mode_resets_to_hidden() {
        let mut overlay = ImmersiveOverlay::new(HIDE, true);
        overlay.tap(Instant::now());
        overlay.set_full_screen(false);
        assert!(overlay.controls_visible());
        overlay.set_full_screen(true);
        assert!(!overlay.controls_visible());
    }
}
