//! Sidecar annotation files and per-document reading state.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::annotations::AnnotationMap;
use crate::{DocumentId, DocumentInfo};

pub const SIDECAR_SUFFIX: &str = ".leafview.json";

/// Storage for a document's annotation map. Loading never fails: anything
/// unreadable is an empty map.
pub trait AnnotationRepository: Send + Sync {
    fn load(&self, document: &Path) -> AnnotationMap;
    fn save(&self, document: &Path, map: &AnnotationMap) -> Result<()>;
}

/// Stores annotations next to the document as `<document>.leafview.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarRepository;

impl SidecarRepository {
    pub fn sidecar_path(document: &Path) -> PathBuf {
        let mut name = OsString::from(document.as_os_str());
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }
}

impl AnnotationRepository for SidecarRepository {
    fn load(&self, document: &Path) -> AnnotationMap {
        let path = Self::sidecar_path(document);
        if !path.exists() {
            return AnnotationMap::default();
        }
        match read_json::<AnnotationMap>(&path) {
            Ok(map) => map,
            Err(err) => {
                warn!(?err, path = %path.display(), "ignoring unreadable annotation sidecar");
                AnnotationMap::default()
            }
        }
    }

    fn save(&self, document: &Path, map: &AnnotationMap) -> Result<()> {
        let path = Self::sidecar_path(document);
        write_json_atomic(&path, map)?;
        debug!(path = %path.display(), records = map.len(), "saved annotations");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAnnotationRepository {
    inner: Mutex<HashMap<PathBuf, AnnotationMap>>,
}

impl AnnotationRepository for MemoryAnnotationRepository {
    fn load(&self, document: &Path) -> AnnotationMap {
        self.inner.lock().get(document).cloned().unwrap_or_default()
    }

    fn save(&self, document: &Path, map: &AnnotationMap) -> Result<()> {
        self.inner.lock().insert(document.to_path_buf(), map.clone());
        Ok(())
    }
}

/// Where the reader left off in a document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReadingState {
    pub current_page: usize,
    pub scroll_offset: f32,
}

impl ReadingState {
    /// Clamps a restored page to the document as it exists now.
    pub fn clamped(self, page_count: usize) -> Self {
        Self {
            current_page: self.current_page.min(page_count.saturating_sub(1)),
            ..self
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<ReadingState>>;
    fn save(&self, doc: &DocumentInfo, state: &ReadingState) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn state_path(&self, doc: &DocumentInfo) -> PathBuf {
        self.root.join(format!("{}.json", doc.id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<ReadingState>> {
        let path = self.state_path(doc);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn save(&self, doc: &DocumentInfo, state: &ReadingState) -> Result<()> {
        write_json_atomic(&self.state_path(doc), state)
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<DocumentId, ReadingState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, doc: &DocumentInfo) -> Result<Option<ReadingState>> {
        Ok(self.inner.lock().get(&doc.id).copied())
    }

    fn save(&self, doc: &DocumentInfo, state: &ReadingState) -> Result<()> {
        self.inner.lock().insert(doc.id, *state);
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    serde_json::from_str(&buf).with_context(|| format!("failed to decode {:?}", path))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let payload = serde_json::to_string_pretty(value)?;
    let mut file =
        File::create(&tmp).with_context(|| format!("failed to open temp file {:?}", tmp))?;
    file.write_all(payload.as_bytes())?;
    file.flush()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}
