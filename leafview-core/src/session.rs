use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{instrument, warn};

use crate::annotations::AnnotationStore;
use crate::config::{EngineConfig, ViewPreferences};
use crate::controller::{ViewController, ViewEvent};
use crate::persistence::{AnnotationRepository, StateStore};
use crate::scale::Viewport;
use crate::{DocumentId, DocumentProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DocumentOpened(DocumentId),
    DocumentClosed(DocumentId),
    ActiveDocumentChanged(DocumentId),
}

/// Open documents, one [`ViewController`] per tab.
pub struct Session {
    documents: Vec<ViewController>,
    active: usize,
    store: Arc<dyn StateStore>,
    repository: Arc<dyn AnnotationRepository>,
    prefs: ViewPreferences,
    config: EngineConfig,
    viewport: Viewport,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Session {
    pub fn new(
        store: Arc<dyn StateStore>,
        repository: Arc<dyn AnnotationRepository>,
        prefs: ViewPreferences,
        config: EngineConfig,
    ) -> Self {
        Self {
            documents: Vec::new(),
            active: 0,
            store,
            repository,
            prefs,
            config,
            viewport: Viewport::default(),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active(&self) -> Option<&ViewController> {
        self.documents.get(self.active)
    }

    pub fn active_mut(&mut self) -> Option<&mut ViewController> {
        self.documents.get_mut(self.active)
    }

    pub fn documents(&self) -> impl Iterator<Item = &ViewController> {
        self.documents.iter()
    }

    /// Preferences that newly opened tabs start from.
    pub fn preferences(&self) -> ViewPreferences {
        self.prefs
    }

    /// Viewport used for tabs opened from now on.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// Picks up preference changes reported by the active tab. Returns the
    /// new preferences when they changed so the caller can write them back.
    pub fn absorb_preferences(&mut self, events: &[ViewEvent]) -> Option<ViewPreferences> {
        let latest = events.iter().rev().find_map(|event| match event {
            ViewEvent::PreferencesChanged(prefs) => Some(*prefs),
            _ => None,
        })?;
        self.prefs = latest;
        Some(latest)
    }

    #[instrument(skip(self, provider))]
    pub async fn open_with<P: DocumentProvider>(
        &mut self,
        provider: &P,
        path: PathBuf,
        restore: bool,
    ) -> Result<()> {
        let backend = provider.open(&path).await?;
        let info = backend.info().clone();
        let annotations = AnnotationStore::open(&info.path, Arc::clone(&self.repository));
        let mut controller = ViewController::new(
            backend,
            annotations,
            self.prefs,
            self.config,
            self.viewport,
        );
        if restore {
            match self.store.load(&info) {
                Ok(Some(state)) => controller.restore(state),
                Ok(None) => {}
                Err(err) => warn!(?err, path = %info.path.display(), "ignoring saved reading state"),
            }
        }
        self.documents.push(controller);
        self.active = self.documents.len().saturating_sub(1);
        self.events.lock().push(SessionEvent::DocumentOpened(info.id));
        self.events
            .lock()
            .push(SessionEvent::ActiveDocumentChanged(info.id));
        Ok(())
    }

    pub fn switch(&mut self, index: usize) {
        if index < self.documents.len() && index != self.active {
            self.active = index;
            let id = self.documents[self.active].info().id;
            self.events
                .lock()
                .push(SessionEvent::ActiveDocumentChanged(id));
        }
    }

    /// Closes a tab after flushing its annotations and reading position. A
    /// failed save is logged and the tab closes anyway.
    pub fn close(&mut self, index: usize) {
        if index >= self.documents.len() {
            return;
        }
        let doc = self.documents.remove(index);
        if let Err(err) = self.flush(&doc) {
            warn!(?err, path = %doc.info().path.display(), "failed to save document state on close");
        }
        self.events
            .lock()
            .push(SessionEvent::DocumentClosed(doc.info().id));
        if self.documents.is_empty() {
            self.active = 0;
        } else if index < self.active {
            self.active -= 1;
        } else if index == self.active {
            self.active = self.active.min(self.documents.len() - 1);
            let id = self.documents[self.active].info().id;
            self.events
                .lock()
                .push(SessionEvent::ActiveDocumentChanged(id));
        }
    }

    pub fn persist(&self) -> Result<()> {
        for doc in &self.documents {
            self.flush(doc)?;
        }
        Ok(())
    }

    fn flush(&self, doc: &ViewController) -> Result<()> {
        doc.annotations().flush()?;
        self.store.save(doc.info(), &doc.reading_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::Annotation;
    use crate::controller::Command;
    use crate::geometry::NormPoint;
    use crate::persistence::{MemoryAnnotationRepository, MemoryStateStore, ReadingState};
    use crate::test_support::FakeProvider;
    use crate::DocumentInfo;

    struct ReadOnlyStateStore;

    impl StateStore for ReadOnlyStateStore {
        fn load(&self, _doc: &DocumentInfo) -> Result<Option<ReadingState>> {
            Ok(None)
        }

        fn save(&self, _doc: &DocumentInfo, _state: &ReadingState) -> Result<()> {
            anyhow::bail!("state directory is read-only")
        }
    }

    fn session() -> (Session, Arc<MemoryStateStore>, Arc<MemoryAnnotationRepository>) {
        let store = Arc::new(MemoryStateStore::new());
        let repo = Arc::new(MemoryAnnotationRepository::default());
        let mut session = Session::new(
            store.clone(),
            repo.clone(),
            ViewPreferences::default(),
            EngineConfig::default(),
        );
        session.set_viewport(Viewport {
            width: 150.0,
            height: 180.0,
            device_pixel_ratio: 1.0,
        });
        (session, store, repo)
    }

    #[tokio::test]
    async fn session_navigation_and_close_persist_state() {
        let (mut session, store, repo) = session();
        let provider = FakeProvider { page_count: 12 };
        session
            .open_with(&provider, PathBuf::from("/tmp/example.pdf"), true)
            .await
            .unwrap();

        let doc = session.active_mut().unwrap();
        doc.apply(Command::GotoPage { page: 7 }).unwrap();
        doc.apply(Command::AddAnnotation {
            page: 7,
            annotation: Annotation::Note {
                rel_pos: NormPoint::new(0.5, 0.5),
                text: "later".into(),
            },
        })
        .unwrap();
        let info = doc.info().clone();

        session.close(0);
        assert!(session.is_empty());
        assert_eq!(store.load(&info).unwrap().unwrap().current_page, 7);
        assert_eq!(repo.load(&info.path).page(7).len(), 1);
        assert!(session
            .events()
            .lock()
            .contains(&SessionEvent::DocumentClosed(info.id)));
    }

    #[tokio::test]
    async fn close_survives_a_failing_state_store() {
        let repo = Arc::new(MemoryAnnotationRepository::default());
        let mut session = Session::new(
            Arc::new(ReadOnlyStateStore),
            repo,
            ViewPreferences::default(),
            EngineConfig::default(),
        );
        let provider = FakeProvider { page_count: 4 };
        for name in ["a.pdf", "b.pdf"] {
            session
                .open_with(&provider, PathBuf::from("/tmp").join(name), false)
                .await
                .unwrap();
        }
        let closing = session.active().unwrap().info().id;

        session.close(1);
        assert_eq!(session.len(), 1);
        assert_eq!(session.active_index(), 0);
        assert!(session
            .events()
            .lock()
            .contains(&SessionEvent::DocumentClosed(closing)));
        assert!(session.persist().is_err());
    }

    #[tokio::test]
    async fn reopening_restores_clamped_position() {
        let (mut session, store, _) = session();
        let provider = FakeProvider { page_count: 5 };
        let path = PathBuf::from("/tmp/restore.pdf");
        session
            .open_with(&provider, path.clone(), true)
            .await
            .unwrap();
        let info = session.active().unwrap().info().clone();
        session.close(0);

        store
            .save(
                &info,
                &ReadingState {
                    current_page: 40,
                    scroll_offset: 0.0,
                },
            )
            .unwrap();
        session.open_with(&provider, path, true).await.unwrap();
        assert_eq!(session.active().unwrap().current_page(), 4);
    }

    #[tokio::test]
    async fn switching_and_closing_tabs_tracks_active_document() {
        let (mut session, _, _) = session();
        let provider = FakeProvider { page_count: 3 };
        for name in ["a.pdf", "b.pdf", "c.pdf"] {
            session
                .open_with(&provider, PathBuf::from("/tmp").join(name), false)
                .await
                .unwrap();
        }
        assert_eq!(session.active_index(), 2);
        session.switch(1);
        assert_eq!(session.active_index(), 1);
        session.close(0);
        assert_eq!(session.active_index(), 0);
        assert!(session
            .active()
            .unwrap()
            .info()
            .path
            .ends_with("b.pdf"));
        session.close(5);
        assert_eq!(session.len(), 2);
    }

    #[tokio::test]
    async fn new_tabs_inherit_changed_preferences() {
        let (mut session, _, _) = session();
        let provider = FakeProvider { page_count: 3 };
        session
            .open_with(&provider, PathBuf::from("/tmp/one.pdf"), false)
            .await
            .unwrap();
        let doc = session.active_mut().unwrap();
        doc.apply(Command::ToggleDarkMode).unwrap();
        let events = doc.drain_events();
        let prefs = session.absorb_preferences(&events).unwrap();
        assert!(prefs.dark_mode);

        session
            .open_with(&provider, PathBuf::from("/tmp/two.pdf"), false)
            .await
            .unwrap();
        assert!(session.active().unwrap().preferences().dark_mode);
    }
}
