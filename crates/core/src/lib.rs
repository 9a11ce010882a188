//! Core domain types for pdfshelf.

use serde::{Deserialize, Serialize};

pub const THUMBNAIL_MIN_WIDTH: u32 = 120;
pub const THUMBNAIL_MAX_WIDTH: u32 = 720;
pub const THUMBNAIL_BUCKET_STEP: u32 = 50;

pub const MIN_ZOOM: f32 = 0.5;
pub const MAX_ZOOM: f32 = 3.0;
pub const ZOOM_STEP: f32 = 0.25;

pub const UNTITLED: &str = "Untitled";

/// Opaque locator naming a document's bytes. Persisted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BookId(pub i64);

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BookId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse::<i64>().map(BookId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub uri: DocumentId,
    /// Unix epoch milliseconds.
    pub added_at: i64,
    pub last_opened_page: u32,
    pub total_pages: u32,
}

impl Book {
    pub fn progress(&self) -> Progress {
        Progress {
            current_page: self.last_opened_page,
            total_pages: self.total_pages,
        }
    }
}

/// A book about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBook {
    pub title: String,
    pub uri: DocumentId,
    pub added_at: i64,
    pub total_pages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub current_page: u32,
    pub total_pages: u32,
}

impl Progress {
    pub fn percent(&self) -> f32 {
        if self.total_pages == 0 {
            0.0
        } else {
            ((self.current_page + 1).min(self.total_pages) as f32 / self.total_pages as f32)
                * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub dark_mode: bool,
    pub zoom: f32,
    pub full_screen: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            dark_mode: false,
            zoom: 1.0,
            full_screen: false,
        }
    }
}

impl DisplaySettings {
    pub fn normalize(&mut self) {
        self.zoom = clamp_zoom(self.zoom);
    }

    pub fn zoom_in(&mut self) {
        self.zoom = clamp_zoom(self.zoom + ZOOM_STEP);
    }

    pub fn zoom_out(&mut self) {
        self.zoom = clamp_zoom(self.zoom - ZOOM_STEP);
    }

    /// Zoom above 1.0 widens the page past the viewport and enables horizontal scrolling.
    pub fn horizontal_scroll(&self) -> bool {
        self.zoom > 1.001
    }
}

pub fn clamp_zoom(zoom: f32) -> f32 {
    if zoom.is_nan() {
        return 1.0;
    }
    zoom.clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Quantizes a requested thumbnail width. Anything up to 120px maps to 120; wider requests
/// round up to the next 50px step, capped at 720. Every bucket maps to itself.
pub fn width_bucket(target_width_px: i32) -> u32 {
    let width = i64::from(target_width_px);
    if width <= i64::from(THUMBNAIL_MIN_WIDTH) {
        return THUMBNAIL_MIN_WIDTH;
    }
    let step = i64::from(THUMBNAIL_BUCKET_STEP);
    let rounded = (width + step - 1) / step * step;
    rounded.min(i64::from(THUMBNAIL_MAX_WIDTH)) as u32
}

/// Output height for a page of native size `(native_width, native_height)` rendered at
/// `target_width` pixels. `None` for degenerate geometry.
pub fn scaled_height(native_width: f32, native_height: f32, target_width: u32) -> Option<u32> {
    if !native_width.is_finite() || !native_height.is_finite() || native_width <= 0.0 {
        return None;
    }
    let height = (f64::from(native_height) * f64::from(target_width) / f64::from(native_width))
        .round();
    if height.is_nan() || height < 0.0 {
        return None;
    }
    Some((height.min(f64::from(u32::MAX)) as u32).max(1))
}

/// Pixel width a reader requests for its pages given the viewport width and zoom.
pub fn reader_target_width(viewport_width_px: u32, settings: &DisplaySettings, config: &Config) -> u32 {
    let content = if settings.horizontal_scroll() {
        (viewport_width_px as f32 * settings.zoom).round() as u32
    } else {
        viewport_width_px
    };
    content.clamp(config.reader_min_width_px, config.reader_max_width_px)
}

/// RGBA8 pixel buffer, row-major, no padding.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

impl Bitmap {
    /// Opaque white buffer of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let len = (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(4);
        Self {
            width,
            height,
            pixels: vec![255; len],
        }
    }

    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = y as usize * self.stride() + x as usize * 4;
        let px = self.pixels.get(idx..idx + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Dark-mode colour inversion; alpha is kept.
    pub fn invert(&mut self) {
        for px in self.pixels.chunks_exact_mut(4) {
            px[0] = 255 - px[0];
            px[1] = 255 - px[1];
            px[2] = 255 - px[2];
        }
    }

    pub fn inverted(&self) -> Self {
        let mut out = self.clone();
        out.invert();
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrationState {
    Idle,
    Speaking,
}

impl NarrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrationState::Idle => "idle",
            NarrationState::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for NarrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables read from `config.json`. Missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub thumbnail_memory_bytes: usize,
    pub thumbnail_permits: usize,
    pub thumbnail_disk_entries: usize,
    pub narration_max_chars: usize,
    pub overlay_hide_ms: u64,
    pub reader_min_width_px: u32,
    pub reader_max_width_px: u32,
    pub pdfium_lib_path: Option<String>,
    pub speech_command: Vec<String>,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thumbnail_memory_bytes: 12 * 1024 * 1024,
            thumbnail_permits: 2,
            thumbnail_disk_entries: 256,
            narration_max_chars: 6000,
            overlay_hide_ms: 2500,
            reader_min_width_px: 360,
            reader_max_width_px: 2200,
            pdfium_lib_path: None,
            speech_command: vec!["espeak-ng".to_string()],
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn normalize(&mut self) {
        let defaults = Config::default();
        self.thumbnail_memory_bytes = self.thumbnail_memory_bytes.max(1024 * 1024);
        self.thumbnail_permits = self.thumbnail_permits.clamp(1, 16);
        self.thumbnail_disk_entries = self.thumbnail_disk_entries.max(1);
        if self.narration_max_chars == 0 {
            self.narration_max_chars = defaults.narration_max_chars;
        }
        self.reader_min_width_px = self.reader_min_width_px.max(1);
        if self.reader_max_width_px < self.reader_min_width_px {
            self.reader_max_width_px = self.reader_min_width_px;
        }
        self.pdfium_lib_path = self
            .pdfium_lib_path
            .take()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        self.speech_command.retain(|part| !part.trim().is_empty());
        if self.speech_command.is_empty() {
            self.speech_command = defaults.speech_command;
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = defaults.log_filter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_keeps_step_boundaries() {
        for width in (150..=700).step_by(50) {
            assert_eq!(width_bucket(width), width as u32);
        }
    }

    #[test]
    fn bucket_rounds_up_and_clamps() {
        assert_eq!(width_bucket(0), 120);
        assert_eq!(width_bucket(-40), 120);
        assert_eq!(width_bucket(i32::MIN), 120);
        assert_eq!(width_bucket(101), 120);
        assert_eq!(width_bucket(120), 120);
        assert_eq!(width_bucket(121), 150);
        assert_eq!(width_bucket(151), 200);
        assert_eq!(width_bucket(719), 720);
        assert_eq!(width_bucket(721), 720);
        assert_eq!(width_bucket(i32::MAX), 720);
    }

    #[test]
    fn bucket_is_idempotent() {
        for width in [-5, 0, 37, 120, 121, 133, 480, 499, 700, 719, 720, 2000] {
            let once = width_bucket(width);
            assert_eq!(width_bucket(once as i32), once);
        }
        for bucket in [120, 150, 200, 650, 700, 720] {
            assert_eq!(width_bucket(bucket), bucket as u32);
        }
    }

    #[test]
    fn scaled_height_matches_aspect() {
        assert_eq!(scaled_height(600.0, 800.0, 300), Some(400));
        assert_eq!(scaled_height(612.0, 792.0, 360), Some(466));
        assert_eq!(scaled_height(800.0, 600.0, 1000), Some(750));
    }

    #[test]
    fn scaled_height_has_floor_of_one() {
        assert_eq!(scaled_height(1000.0, 1.0, 10), Some(1));
        assert_eq!(scaled_height(600.0, 0.0, 300), Some(1));
    }

    #[test]
    fn scaled_height_rejects_degenerate_pages() {
        assert_eq!(scaled_height(0.0, 800.0, 300), None);
        assert_eq!(scaled_height(-5.0, 800.0, 300), None);
        assert_eq!(scaled_height(f32::NAN, 800.0, 300), None);
    }

    #[test]
    fn zoom_is_clamped() {
        let mut settings = DisplaySettings {
            zoom: 9.0,
            ..DisplaySettings::default()
        };
        settings.normalize();
        assert_eq!(settings.zoom, MAX_ZOOM);
        settings.zoom_in();
        assert_eq!(settings.zoom, MAX_ZOOM);
        settings.zoom = 0.6;
        settings.zoom_out();
        assert_eq!(settings.zoom, MIN_ZOOM);
        assert_eq!(clamp_zoom(f32::NAN), 1.0);
    }

    #[test]
    fn reader_width_follows_zoom() {
        let config = Config::default();
        let mut settings = DisplaySettings::default();
        assert_eq!(reader_target_width(1080, &settings, &config), 1080);
        settings.zoom = 1.5;
        assert_eq!(reader_target_width(1080, &settings, &config), 1620);
        settings.zoom = 3.0;
        assert_eq!(reader_target_width(1080, &settings, &config), 2200);
        settings.zoom = 0.5;
        assert_eq!(reader_target_width(200, &settings, &config), 360);
    }

    #[test]
    fn invert_keeps_alpha() {
        let mut bitmap = Bitmap::from_rgba(1, 1, vec![10, 20, 30, 128]).unwrap();
        bitmap.invert();
        assert_eq!(bitmap.pixel(0, 0), Some([245, 235, 225, 128]));
    }

    #[test]
    fn from_rgba_checks_length() {
        assert!(Bitmap::from_rgba(2, 2, vec![0; 15]).is_none());
        assert!(Bitmap::from_rgba(2, 2, vec![0; 16]).is_some());
    }

    #[test]
    fn progress_handles_zero_pages() {
        let progress = Progress {
            current_page: 1,
            total_pages: 0,
        };
        assert_eq!(progress.percent(), 0.0);
        let progress = Progress {
            current_page: 4,
            total_pages: 10,
        };
        assert_eq!(progress.percent(), 50.0);
    }

    #[test]
    fn config_fills_missing_fields() {
        let mut config: Config = serde_json::from_str(r#"{"thumbnail_permits": 0}"#).unwrap();
        config.normalize();
        assert_eq!(config.thumbnail_permits, 1);
        assert_eq!(config.narration_max_chars, 6000);
        assert_eq!(config.speech_command, vec!["espeak-ng".to_string()]);
    }

    #[test]
    fn book_id_parses() {
        assert_eq!(" 42 ".parse::<BookId>().unwrap(), BookId(42));
        assert!("x".parse::<BookId>().is_err());
    }
}
