//! Zoom factor selection.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DocumentBackend, RenderRequest};

pub const MIN_SCALE: f32 = 0.1;
pub const MAX_SCALE: f32 = 5.0;

/// Page size used when the decoder cannot render a reference page.
pub const FALLBACK_PAGE_SIZE: PageSize = PageSize {
    width: 595.0,
    height: 842.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ZoomMode {
    Manual,
    #[default]
    FitWidth,
    FitHeight,
}

impl fmt::Display for ZoomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoomMode::Manual => f.write_str("Manual"),
            ZoomMode::FitWidth => f.write_str("Fit Width"),
            ZoomMode::FitHeight => f.write_str("Fit Height"),
        }
    }
}

/// Page size in pixels at scale 1.0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub device_pixel_ratio: f32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024.0,
            height: 768.0,
            device_pixel_ratio: 1.0,
        }
    }
}

/// Result of parsing a zoom entry such as `"125%"` or `"Fit Width"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoomRequest {
    Fit(ZoomMode),
    Manual(f32),
}

#[derive(Debug, Clone, Copy)]
pub struct ScalePolicy {
    pub horizontal_margin: f32,
    pub vertical_margin: f32,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            horizontal_margin: 30.0,
            vertical_margin: 20.0,
        }
    }
}

impl ScalePolicy {
    pub fn scale(
        &self,
        mode: ZoomMode,
        manual_scale: f32,
        base: PageSize,
        viewport: Viewport,
        facing_pages: bool,
    ) -> f32 {
        let available_width = (viewport.width - self.horizontal_margin).max(10.0);
        let available_height = (viewport.height - self.vertical_margin).max(10.0);
        let scale = match mode {
            ZoomMode::Manual => manual_scale,
            ZoomMode::FitWidth if facing_pages => available_width / (base.width * 2.0),
            ZoomMode::FitWidth => available_width / base.width,
            ZoomMode::FitHeight => available_height / base.height,
        };
        if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        }
    }
}

pub fn clamp_scale(scale: f32) -> f32 {
    if scale.is_finite() {
        scale.clamp(MIN_SCALE, MAX_SCALE)
    } else {
        1.0
    }
}

/// Multiplicative zoom step used by keyboard and wheel zoom.
pub fn step_scale(current: f32, factor: f32) -> f32 {
    clamp_scale(current * factor)
}

/// Wheel zoom: positive deltas zoom in by 10 %, others zoom out by 10 %.
pub fn wheel_factor(delta: f32) -> f32 {
    if delta > 0.0 {
        1.1
    } else {
        0.9
    }
}

/// Parses free-form zoom text. Values above 5 are read as percentages, so
/// `"150"`, `"150%"` and `"1.5"` all mean 1.5.
pub fn parse_zoom(text: &str) -> Option<ZoomRequest> {
    let lowered = text.to_lowercase();
    if lowered.contains("width") {
        return Some(ZoomRequest::Fit(ZoomMode::FitWidth));
    }
    if lowered.contains("height") {
        return Some(ZoomRequest::Fit(ZoomMode::FitHeight));
    }
    let value: f32 = lowered.replace('%', "").trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    let scale = if value > MAX_SCALE { value / 100.0 } else { value };
    Some(ZoomRequest::Manual(clamp_scale(scale)))
}

pub fn zoom_label(mode: ZoomMode, manual_scale: f32) -> String {
    match mode {
        ZoomMode::Manual => format!("{}%", (manual_scale * 100.0) as i32),
        other => other.to_string(),
    }
}

/// Renders page 0 at scale 1.0 to learn the base page size. Falls back to
/// `fallback` rather than failing the view.
pub fn measure_base_size(backend: &dyn DocumentBackend, fallback: PageSize) -> PageSize {
    let request = RenderRequest {
        page_index: 0,
        scale: 1.0,
        dark_mode: false,
    };
    match backend.render_page(request) {
        Ok(image) if image.width > 0 && image.height > 0 => {
            let size = PageSize {
                width: image.width as f32,
                height: image.height as f32,
            };
            debug!(width = size.width, height = size.height, "measured base page size");
            size
        }
        Ok(_) => fallback,
        Err(err) => {
            warn!(?err, "failed to measure base page size, using fallback");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;

    const A4: PageSize = FALLBACK_PAGE_SIZE;

    fn viewport(width: f32, height: f32) -> Viewport {
        Viewport {
            width,
            height,
            device_pixel_ratio: 1.0,
        }
    }

    #[test]
    fn manual_mode_returns_stored_factor() {
        let policy = ScalePolicy::default();
        let scale = policy.scale(ZoomMode::Manual, 1.75, A4, viewport(800.0, 600.0), false);
        assert_eq!(scale, 1.75);
    }

    #[test]
    fn fit_width_halves_available_width_when_facing() {
        let policy = ScalePolicy::default();
        let single = policy.scale(ZoomMode::FitWidth, 1.0, A4, viewport(1220.0, 600.0), false);
        let facing = policy.scale(ZoomMode::FitWidth, 1.0, A4, viewport(1220.0, 600.0), true);
        assert!((single - 2.0).abs() < 1e-4);
        assert!((facing - 1.0).abs() < 1e-4);
    }

    #[test]
    fn fit_height_uses_vertical_margin() {
        let policy = ScalePolicy::default();
        let scale = policy.scale(ZoomMode::FitHeight, 1.0, A4, viewport(500.0, 862.0), false);
        assert!((scale - 1.0).abs() < 1e-4);
    }

    #[test]
    fn parse_zoom_understands_percentages_and_keywords() {
        assert_eq!(parse_zoom("150%"), Some(ZoomRequest::Manual(1.5)));
        assert_eq!(parse_zoom("1.25"), Some(ZoomRequest::Manual(1.25)));
        assert_eq!(parse_zoom("900"), Some(ZoomRequest::Manual(5.0)));
        assert_eq!(
            parse_zoom("Fit Width"),
            Some(ZoomRequest::Fit(ZoomMode::FitWidth))
        );
        assert_eq!(
            parse_zoom("fit height"),
            Some(ZoomRequest::Fit(ZoomMode::FitHeight))
        );
        assert_eq!(parse_zoom("big"), None);
    }

    #[test]
    fn step_scale_clamps_to_range() {
        assert_eq!(step_scale(4.9, 1.1), MAX_SCALE);
        assert_eq!(step_scale(0.105, 0.9), MIN_SCALE);
        assert!((step_scale(1.0, 1.1) - 1.1).abs() < 1e-6);
    }

    #[test]
    fn base_size_falls_back_when_first_page_fails() {
        let backend = FakeBackend::new(3).failing_page(0);
        assert_eq!(measure_base_size(&backend, FALLBACK_PAGE_SIZE), FALLBACK_PAGE_SIZE);
        let letter = PageSize {
            width: 612.0,
            height: 792.0,
        };
        assert_eq!(measure_base_size(&backend, letter), letter);
    }

    #[test]
    fn base_size_reads_reference_render() {
        let backend = FakeBackend::new(3).with_page_size(612, 792);
        let size = measure_base_size(&backend, FALLBACK_PAGE_SIZE);
        assert_eq!(size.width, 612.0);
        assert_eq!(size.height, 792.0);
    }
}
