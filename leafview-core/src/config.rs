//! Engine tunables and persisted view preferences.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::annotations::ERASER_THRESHOLD;
use crate::scale::{PageSize, ScalePolicy, ZoomMode, FALLBACK_PAGE_SIZE};
use crate::window::WindowConfig;

pub const PREFERENCES_FILE: &str = "preferences.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("net", "leafview", "leafview")
}

/// What the controller produces for the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Image,
    Reflow,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub render_radius_before: usize,
    pub render_radius_after: usize,
    pub scale_policy: ScalePolicy,
    pub scroll_debounce: Duration,
    pub eraser_threshold: f32,
    pub fallback_page_size: PageSize,
    /// Rubber-band snips smaller than this (in logical pixels) are ignored.
    pub min_snip_size: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            render_radius_before: 7,
            render_radius_after: 8,
            scale_policy: ScalePolicy::default(),
            scroll_debounce: Duration::from_millis(150),
            eraser_threshold: ERASER_THRESHOLD,
            fallback_page_size: FALLBACK_PAGE_SIZE,
            min_snip_size: 10.0,
        }
    }
}

/// User-facing view settings. Handed to the controller at construction and
/// written back by the shell when the controller reports a change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewPreferences {
    pub zoom_mode: ZoomMode,
    pub manual_scale: f32,
    pub facing_pages: bool,
    pub continuous_scroll: bool,
    pub dark_mode: bool,
}

impl Default for ViewPreferences {
    fn default() -> Self {
        Self {
            zoom_mode: ZoomMode::FitWidth,
            manual_scale: 1.0,
            facing_pages: false,
            continuous_scroll: true,
            dark_mode: false,
        }
    }
}

impl ViewPreferences {
    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join(PREFERENCES_FILE)
    }

    /// Reads preferences from `path`. Missing or malformed files give the
    /// defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::read(path) {
            Ok(prefs) => {
                debug!(path = %path.display(), "loaded view preferences");
                prefs.sanitized()
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "ignoring unreadable preferences");
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read preferences {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse preferences {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {:?}", parent))?;
        }
        let payload = toml::to_string_pretty(self)?;
        fs::write(path, payload).with_context(|| format!("failed to write preferences {:?}", path))
    }

    fn sanitized(mut self) -> Self {
        self.manual_scale = crate::scale::clamp_scale(self.manual_scale);
        self
    }
}
