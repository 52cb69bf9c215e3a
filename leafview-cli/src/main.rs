use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use leafview_core::config::project_dirs;
use leafview_core::search::SearchNavigator;
use leafview_core::{
    Annotation, AnnotationRepository, AnnotationStore, Command, DocRect, DocumentProvider,
    EngineConfig, FileStateStore, FormFieldKind, FormOverlay, FormValue, Frame, NormPoint,
    Overlay, PageSize, PixelPoint, SearchDirection, SearchHit, Session, SidecarRepository,
    StateStore, ViewController, ViewError, ViewPreferences, Viewport,
};
use leafview_render::PdfiumProvider;
use leafview_tty::paint::{self, Placement, DARK_BACKGROUND, LIGHT_BACKGROUND};
use leafview_tty::{
    write_status_line, DrawParams, EventMapper, KittyRenderer, PointerPhase, Tool, UiEvent,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Logical pixels moved per wheel notch.
const SCROLL_STEP: f32 = 48.0;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Parser)]
#[command(
    name = "leafview",
    version,
    about = "kitty-native document viewer with annotations"
)]
struct Args {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Open documents in the interactive viewer
    View {
        /// Page to open each document on (0-based)
        #[arg(short = 'p', long = "page")]
        page: Option<usize>,

        /// Ignore the saved reading position
        #[arg(long)]
        no_restore: bool,

        /// Paths to PDF files to open
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Export a document's annotations as Markdown
    Notes {
        file: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Search a document without opening the viewer
    Find {
        file: PathBuf,
        term: String,

        /// Page (0-based) the scan starts after
        #[arg(long = "from", default_value_t = 0)]
        from: usize,

        #[arg(long)]
        backward: bool,

        /// List every matching page instead of the first one
        #[arg(long)]
        all: bool,
    },
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        crossterm::execute!(io::stdout(), EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, DisableMouseCapture);
        let _ = terminal::disable_raw_mode();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let project_dirs =
        project_dirs().ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let interactive = matches!(args.command, Mode::View { .. });
    let _log_guard = init_logging(&project_dirs, !interactive)?;

    match args.command {
        Mode::View {
            page,
            no_restore,
            files,
        } => view(&project_dirs, files, page, !no_restore).await,
        Mode::Notes { file, output } => export_notes(&file, output),
        Mode::Find {
            file,
            term,
            from,
            backward,
            all,
        } => find(&file, &term, from, backward, all).await,
    }
}

async fn view(
    project_dirs: &ProjectDirs,
    files: Vec<PathBuf>,
    page: Option<usize>,
    restore: bool,
) -> Result<()> {
    let prefs_path = ViewPreferences::default_path(project_dirs);
    let prefs = ViewPreferences::load(&prefs_path);
    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let repository: Arc<dyn AnnotationRepository> = Arc::new(SidecarRepository);
    let mut session = Session::new(store, repository, prefs, EngineConfig::default());

    let screen = Screen::query()?;
    session.set_viewport(screen.viewport());

    let provider = PdfiumProvider::new()?;
    for path in &files {
        session
            .open_with(&provider, path.clone(), restore)
            .await
            .with_context(|| format!("failed to open {:?}", path))?;
        if let (Some(page), Some(doc)) = (page, session.active_mut()) {
            open_at(doc, page);
        }
    }

    let mut viewer = Viewer {
        session,
        prefs_path,
        screen,
        interaction: Interaction::default(),
        flash: None,
    };

    let _raw = RawModeGuard::new()?;
    let mut renderer = KittyRenderer::new(io::stdout());
    {
        let mut writer = renderer.writer();
        crossterm::execute!(&mut writer, cursor::Hide, Clear(ClearType::All))?;
    }

    let mut redraw = Redraw::Full;
    loop {
        match redraw {
            Redraw::Full => viewer.redraw(&mut renderer, true)?,
            Redraw::Status => viewer.redraw(&mut renderer, false)?,
            Redraw::Nothing => {}
        }
        redraw = Redraw::Nothing;

        if event::poll(POLL_INTERVAL)? {
            let action = match event::read()? {
                Event::Resize(..) => {
                    viewer.resize()?;
                    LoopAction::ContinueRedraw
                }
                ev => {
                    let ui_event = viewer.interaction.mapper.map_event(ev);
                    viewer.handle(ui_event)?
                }
            };
            match action {
                LoopAction::ContinueRedraw => redraw = Redraw::Full,
                LoopAction::Status => redraw = Redraw::Status,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }

        if viewer.settle(Instant::now()) {
            redraw = Redraw::Full;
        }
    }

    renderer.delete_images()?;
    renderer.clear_all()?;
    viewer.session.persist()?;
    Ok(())
}

enum LoopAction {
    Continue,
    Status,
    ContinueRedraw,
    Quit,
}

#[derive(Clone, Copy)]
enum Redraw {
    Nothing,
    Status,
    Full,
}

/// Terminal geometry in cells and the pixel size of one cell.
#[derive(Debug, Clone, Copy)]
struct Screen {
    columns: u16,
    rows: u16,
    cell_width: f32,
    cell_height: f32,
}

impl Screen {
    /// Used when the terminal does not report its pixel size.
    const FALLBACK_CELL: (f32, f32) = (8.0, 16.0);

    fn query() -> Result<Self> {
        let window = terminal::window_size()?;
        let columns = window.columns.max(1);
        let rows = window.rows.max(2);
        let (cell_width, cell_height) = if window.width > 0 && window.height > 0 {
            (
                f32::from(window.width) / f32::from(columns),
                f32::from(window.height) / f32::from(rows),
            )
        } else {
            Self::FALLBACK_CELL
        };
        Ok(Self {
            columns,
            rows,
            cell_width,
            cell_height,
        })
    }

    /// Rows available to the page image; the last row is the status line.
    fn image_rows(&self) -> u16 {
        self.rows.saturating_sub(1).max(1)
    }

    fn viewport(&self) -> Viewport {
        Viewport {
            width: f32::from(self.columns) * self.cell_width,
            height: f32::from(self.image_rows()) * self.cell_height,
            device_pixel_ratio: 1.0,
        }
    }

    /// Center of a cell in viewport pixels.
    fn point(&self, column: u16, row: u16) -> PixelPoint {
        PixelPoint::new(
            (f32::from(column) + 0.5) * self.cell_width,
            (f32::from(row) + 0.5) * self.cell_height,
        )
    }
}

/// Free-text prompt in progress and what its text is for.
#[derive(Debug, Clone)]
enum PromptTarget {
    NewNote { page: usize, position: NormPoint },
    EditNote { page: usize, index: usize },
    FormText { page: usize, doc_rect: DocRect },
}

#[derive(Default)]
struct Interaction {
    mapper: EventMapper,
    tool: Tool,
    prompt: Option<PromptTarget>,
    /// Page a markup drag started on.
    markup_page: Option<usize>,
}

impl Interaction {
    fn pointer(
        &mut self,
        doc: &mut ViewController,
        phase: PointerPhase,
        point: PixelPoint,
        viewport: Viewport,
        flash: &mut Option<String>,
    ) {
        let size = page_size(doc);
        let scroll_offset = doc.reading_state().scroll_offset;
        let placements = paint::placements(doc.layout(), scroll_offset, viewport, size);
        let target = paint::locate(&placements, point);
        match (self.tool, phase) {
            (Tool::Markup(kind), PointerPhase::Down) => {
                if let Some((page, position)) = target {
                    self.markup_page = Some(page);
                    run(
                        doc,
                        Command::BeginMarkup {
                            page,
                            position,
                            kind,
                        },
                        flash,
                    );
                }
            }
            (Tool::Markup(_), PointerPhase::Drag) => {
                if let Some(position) = self.markup_local(&placements, point) {
                    run(doc, Command::DragMarkup { position }, flash);
                }
            }
            (Tool::Markup(_), PointerPhase::Up) => {
                if let Some(position) = self.markup_local(&placements, point) {
                    run(doc, Command::DragMarkup { position }, flash);
                }
                if self.markup_page.take().is_some() {
                    run(doc, Command::EndMarkup { color: None }, flash);
                }
            }
            (Tool::Eraser, PointerPhase::Down) => {
                if let Some((page, position)) = target {
                    run(doc, Command::Erase { page, position }, flash);
                }
            }
            (Tool::Note, PointerPhase::Down) => {
                if let Some((page, position)) = target {
                    self.open_note(doc, page, position);
                }
            }
            (Tool::Browse, PointerPhase::Down) => {
                if let Some((page, position)) = target {
                    if let Some(form) = form_at(doc, page, position) {
                        self.activate_form(doc, page, form, flash);
                    }
                }
            }
            _ => {}
        }
    }

    /// `point` relative to the page the running markup drag started on, even
    /// when the pointer left that page.
    fn markup_local(&self, placements: &[Placement], point: PixelPoint) -> Option<PixelPoint> {
        let page = self.markup_page?;
        let placement = placements.iter().find(|placement| placement.page == page)?;
        Some(PixelPoint::new(
            point.x - placement.rect.x,
            point.y - placement.rect.y,
        ))
    }

    fn open_note(&mut self, doc: &mut ViewController, page: usize, position: PixelPoint) {
        match doc.note_at(page, position) {
            Some(index) => {
                let text = match doc.annotations().page(page).get(index) {
                    Some(Annotation::Note { text, .. }) => text.clone(),
                    _ => String::new(),
                };
                self.mapper.begin_text_entry("note", &text);
                self.prompt = Some(PromptTarget::EditNote { page, index });
            }
            None => {
                let position = doc.page_geometry(page).normalize(position);
                self.mapper.begin_text_entry("note", "");
                self.prompt = Some(PromptTarget::NewNote { page, position });
            }
        }
    }

    fn activate_form(
        &mut self,
        doc: &mut ViewController,
        page: usize,
        form: FormOverlay,
        flash: &mut Option<String>,
    ) {
        match form.kind {
            FormFieldKind::Checkbox | FormFieldKind::RadioButton => run(
                doc,
                Command::SetFormValue {
                    page,
                    doc_rect: form.doc_rect,
                    value: FormValue::Checked(!form.checked),
                },
                flash,
            ),
            FormFieldKind::Text => {
                self.mapper.begin_text_entry("field", &form.value);
                self.prompt = Some(PromptTarget::FormText {
                    page,
                    doc_rect: form.doc_rect,
                });
            }
            FormFieldKind::Other(_) => {}
        }
    }
}

struct Viewer {
    session: Session,
    prefs_path: PathBuf,
    screen: Screen,
    interaction: Interaction,
    /// One-shot status message from the shell itself.
    flash: Option<String>,
}

impl Viewer {
    fn handle(&mut self, event: UiEvent) -> Result<LoopAction> {
        if !matches!(event, UiEvent::None) {
            self.flash = None;
        }
        match event {
            UiEvent::None => return Ok(LoopAction::Continue),
            UiEvent::Quit => return Ok(LoopAction::Quit),
            UiEvent::BeginSearch { .. }
            | UiEvent::SearchQueryChanged { .. }
            | UiEvent::BeginZoomEntry => return Ok(LoopAction::Status),
            UiEvent::SearchCancel | UiEvent::TextCancel => {
                self.interaction.prompt = None;
                return Ok(LoopAction::Status);
            }
            UiEvent::SelectTool(tool) => {
                if let (Tool::Markup(_), Some(doc)) =
                    (self.interaction.tool, self.session.active_mut())
                {
                    run(doc, Command::CancelMarkup, &mut self.flash);
                }
                self.interaction.markup_page = None;
                self.interaction.tool = tool;
                return Ok(LoopAction::Status);
            }
            UiEvent::SwitchDocument { delta } => {
                let len = self.session.len() as isize;
                if len > 1 {
                    let next = (self.session.active_index() as isize + delta).rem_euclid(len);
                    self.session.switch(next as usize);
                    self.sync_viewport();
                }
                return Ok(LoopAction::ContinueRedraw);
            }
            UiEvent::CloseDocument => {
                self.session.close(self.session.active_index());
                if self.session.is_empty() {
                    return Ok(LoopAction::Quit);
                }
                self.sync_viewport();
                return Ok(LoopAction::ContinueRedraw);
            }
            UiEvent::ExportNotes => {
                self.export_notes();
                return Ok(LoopAction::Status);
            }
            _ => {}
        }

        let viewport = self.screen.viewport();
        let screen = self.screen;
        let flash = &mut self.flash;
        let Some(doc) = self.session.active_mut() else {
            return Ok(LoopAction::Quit);
        };
        match event {
            UiEvent::Command(command) => run(doc, command, flash),
            UiEvent::Repeat { command, count } => {
                for _ in 0..count {
                    run(doc, command.clone(), flash);
                }
            }
            UiEvent::GotoLast => {
                let page = doc.page_count().saturating_sub(1);
                run(doc, Command::GotoPage { page }, flash);
            }
            UiEvent::Scroll { notches } => scroll(doc, notches, viewport, flash),
            UiEvent::SearchSubmit { query, direction } => run(
                doc,
                Command::Find {
                    term: query,
                    direction,
                },
                flash,
            ),
            UiEvent::ZoomSubmit { text } => run(doc, Command::ZoomText { text }, flash),
            UiEvent::TextSubmit { text } => {
                if let Some(target) = self.interaction.prompt.take() {
                    submit_text(doc, target, text, flash);
                }
            }
            UiEvent::Pointer { phase, column, row } => {
                let point = screen.point(column, row);
                self.interaction.pointer(doc, phase, point, viewport, flash);
            }
            _ => {}
        }
        Ok(LoopAction::ContinueRedraw)
    }

    fn resize(&mut self) -> Result<()> {
        self.screen = Screen::query()?;
        self.session.set_viewport(self.screen.viewport());
        self.sync_viewport();
        Ok(())
    }

    /// Tabs only learn about the viewport while active.
    fn sync_viewport(&mut self) {
        let viewport = self.screen.viewport();
        if let Some(doc) = self.session.active_mut() {
            run(doc, Command::Resize { viewport }, &mut self.flash);
        }
    }

    /// Lets the active tab settle pending scrolls and expire notifications,
    /// then writes back changed preferences. Returns true when a repaint is
    /// due.
    fn settle(&mut self, now: Instant) -> bool {
        let Some(doc) = self.session.active_mut() else {
            return false;
        };
        let settled = doc.tick(now);
        let events = doc.drain_events();
        if let Some(prefs) = self.session.absorb_preferences(&events) {
            if let Err(err) = prefs.save(&self.prefs_path) {
                warn!(?err, path = %self.prefs_path.display(), "failed to save preferences");
            }
        }
        settled || !events.is_empty()
    }

    fn export_notes(&mut self) {
        let Some(doc) = self.session.active() else {
            return;
        };
        let target = notes_path(&doc.info().path);
        match fs::write(&target, doc.export_markdown()) {
            Ok(()) => {
                info!(path = %target.display(), "exported notes");
                self.flash = Some(format!("notes written to {}", target.display()));
            }
            Err(err) => {
                warn!(?err, path = %target.display(), "failed to export notes");
                self.flash = Some(format!("failed to export notes: {err}"));
            }
        }
    }

    fn redraw(&mut self, renderer: &mut KittyRenderer<io::Stdout>, with_page: bool) -> Result<()> {
        let screen = self.screen;
        let viewport = screen.viewport();
        let pending = self.interaction.mapper.pending_input();
        let tool = self.interaction.tool;
        let flash = self.flash.clone();
        let Some(doc) = self.session.active_mut() else {
            return Ok(());
        };

        let name = file_name(&doc.info().path);
        let term = doc.search().term().map(str::to_string);
        let size = page_size(doc);
        let scroll_offset = doc.reading_state().scroll_offset;
        let background = if doc.preferences().dark_mode {
            DARK_BACKGROUND
        } else {
            LIGHT_BACKGROUND
        };
        let frame = doc.frame();

        renderer.begin_sync_update()?;
        if with_page {
            match frame.reflow_text.as_deref() {
                Some(text) => {
                    renderer.delete_images()?;
                    renderer.clear_all()?;
                    draw_reflow(renderer, text, screen)?;
                }
                None => {
                    let image =
                        paint::compose_frame(&frame, scroll_offset, viewport, size, background);
                    {
                        let mut writer = renderer.writer();
                        crossterm::execute!(&mut writer, cursor::MoveTo(0, 0))?;
                    }
                    renderer.draw(
                        &image,
                        DrawParams::clamped(
                            u32::from(screen.columns),
                            u32::from(screen.image_rows()),
                        ),
                    )?;
                }
            }
        }
        let message = flash.as_deref().or(frame.notification);
        let status = format_status(&name, &frame, tool, term.as_deref(), message, pending.as_deref());
        draw_status_line(renderer, screen, &status)?;
        renderer.end_sync_update()
    }
}

/// Moves a freshly opened tab to `page`. A page the document does not have
/// leaves the restored position in place.
fn open_at(doc: &mut ViewController, page: usize) {
    if let Err(err) = doc.apply(Command::GotoPage { page }) {
        warn!(%err, path = %doc.info().path.display(), "ignoring start page");
    }
}

fn run(doc: &mut ViewController, command: Command, flash: &mut Option<String>) {
    if let Err(err) = doc.apply(command) {
        warn!(%err, "command rejected");
        *flash = Some(err.to_string());
    }
}

fn scroll(doc: &mut ViewController, notches: i32, viewport: Viewport, flash: &mut Option<String>) {
    if !doc.preferences().continuous_scroll {
        let command = if notches > 0 {
            Command::NextPage
        } else {
            Command::PrevPage
        };
        run(doc, command, flash);
        return;
    }
    let max = (doc.layout().content_height() - viewport.height).max(0.0);
    let offset =
        (doc.reading_state().scroll_offset + notches as f32 * SCROLL_STEP).clamp(0.0, max);
    run(doc, Command::Scroll { offset }, flash);
}

fn submit_text(
    doc: &mut ViewController,
    target: PromptTarget,
    text: String,
    flash: &mut Option<String>,
) {
    let command = match target {
        PromptTarget::NewNote { page, position } => {
            if text.trim().is_empty() {
                return;
            }
            Command::AddAnnotation {
                page,
                annotation: Annotation::Note {
                    rel_pos: position,
                    text,
                },
            }
        }
        PromptTarget::EditNote { page, index } => Command::EditNote { page, index, text },
        PromptTarget::FormText { page, doc_rect } => Command::SetFormValue {
            page,
            doc_rect,
            value: FormValue::Text(text),
        },
    };
    run(doc, command, flash);
}

fn form_at(doc: &ViewController, page: usize, position: PixelPoint) -> Option<FormOverlay> {
    doc.cache()
        .get(page)?
        .overlays
        .iter()
        .find_map(|overlay| match overlay {
            Overlay::Form(form) if form.rect.contains(position, 0.0) => Some(form.clone()),
            _ => None,
        })
}

fn page_size(doc: &mut ViewController) -> PageSize {
    let geometry = doc.page_geometry(doc.current_page());
    PageSize {
        width: geometry.width,
        height: geometry.height,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn notes_path(document: &Path) -> PathBuf {
    let mut name = document.as_os_str().to_owned();
    name.push(".notes.md");
    PathBuf::from(name)
}

fn tool_label(tool: Tool) -> Option<String> {
    match tool {
        Tool::Browse => None,
        Tool::Markup(kind) => Some(kind.label().to_lowercase()),
        Tool::Note => Some("note".to_string()),
        Tool::Eraser => Some("eraser".to_string()),
    }
}

fn format_status(
    name: &str,
    frame: &Frame<'_>,
    tool: Tool,
    term: Option<&str>,
    message: Option<&str>,
    pending: Option<&str>,
) -> String {
    let mut status = format!(
        "{} | page {}/{} | {}",
        name,
        frame.current_page + 1,
        frame.page_count,
        frame.zoom_label
    );
    let extras = [
        tool_label(tool),
        term.map(|term| format!("/{term}")),
        message.map(str::to_string),
        pending.filter(|s| !s.is_empty()).map(str::to_string),
    ];
    for extra in extras.into_iter().flatten() {
        status.push_str(" | ");
        status.push_str(&extra);
    }
    status
}

fn draw_status_line(
    renderer: &mut KittyRenderer<io::Stdout>,
    screen: Screen,
    status: &str,
) -> Result<()> {
    let line: String = status.chars().take(usize::from(screen.columns)).collect();
    let mut writer = renderer.writer();
    crossterm::execute!(
        &mut writer,
        cursor::MoveTo(0, screen.rows.saturating_sub(1)),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(&mut writer, &line)?;
    Ok(())
}

fn draw_reflow(
    renderer: &mut KittyRenderer<io::Stdout>,
    text: &str,
    screen: Screen,
) -> Result<()> {
    let width = usize::from(screen.columns).max(1);
    let lines = text.lines().flat_map(|line| {
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            vec![String::new()]
        } else {
            chars
                .chunks(width)
                .map(|chunk| chunk.iter().collect())
                .collect()
        }
    });
    let mut writer = renderer.writer();
    for (row, line) in (0..screen.image_rows()).zip(lines) {
        crossterm::queue!(&mut writer, cursor::MoveTo(0, row), Print(line))?;
    }
    writer.flush()?;
    Ok(())
}

fn export_notes(file: &Path, output: Option<PathBuf>) -> Result<()> {
    let document = file
        .canonicalize()
        .with_context(|| format!("failed to resolve path for {:?}", file))?;
    let repository: Arc<dyn AnnotationRepository> = Arc::new(SidecarRepository);
    let store = AnnotationStore::open(&document, repository);
    let markdown = store.export_markdown(&file_name(&document));
    match output {
        Some(path) => {
            fs::write(&path, markdown)
                .with_context(|| format!("failed to write notes to {:?}", path))?;
            info!(path = %path.display(), records = store.map().len(), "exported notes");
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(markdown.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn find(file: &Path, term: &str, from: usize, backward: bool, all: bool) -> Result<()> {
    let provider = PdfiumProvider::new()?;
    let backend = provider
        .open(file)
        .await
        .with_context(|| format!("failed to open {:?}", file))?;
    let page_count = backend.info().page_count;
    if from >= page_count {
        return Err(ViewError::NavigationOutOfRange {
            requested: from,
            page_count,
        }
        .into());
    }
    let direction = if backward {
        SearchDirection::Backward
    } else {
        SearchDirection::Forward
    };

    let mut navigator = SearchNavigator::new();
    let first = match navigator.find(backend.as_ref(), term, from, direction) {
        Ok(hit) => hit,
        Err(ViewError::SearchMiss { .. }) => {
            bail!("no matches for '{}' in {}", term, file.display())
        }
        Err(err) => return Err(err.into()),
    };

    let mut stdout = io::stdout().lock();
    print_hit(&mut stdout, &first)?;
    if all {
        let mut current = first.page;
        while let Some(Ok(hit)) = navigator.find_again(backend.as_ref(), current, direction) {
            if hit.page == first.page {
                break;
            }
            print_hit(&mut stdout, &hit)?;
            current = hit.page;
        }
    }
    Ok(())
}

fn print_hit<W: Write>(out: &mut W, hit: &SearchHit) -> io::Result<()> {
    writeln!(out, "page {}: {} highlight(s)", hit.page + 1, hit.rects.len())?;
    for rect in &hit.rects {
        writeln!(
            out,
            "  [{:.1}, {:.1}, {:.1}, {:.1}]",
            rect.left, rect.top, rect.right, rect.bottom
        )?;
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs, console: bool) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "leafview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // The interactive viewer owns the terminal, so it only logs to file.
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafview_core::{
        document_id_for_path, DocumentBackend, DocumentInfo, FormWidget,
        MemoryAnnotationRepository, RenderImage, RenderRequest, TextSegment,
    };

    struct BlankBackend {
        info: DocumentInfo,
    }

    impl BlankBackend {
        fn new(path: &Path, page_count: usize) -> Self {
            Self {
                info: DocumentInfo {
                    id: document_id_for_path(path),
                    path: path.to_path_buf(),
                    page_count,
                },
            }
        }
    }

    impl DocumentBackend for BlankBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
            let width = (60.0 * request.scale).round().max(1.0) as u32;
            let height = (80.0 * request.scale).round().max(1.0) as u32;
            Ok(RenderImage {
                width,
                height,
                pixels: vec![255; (width * height * 4) as usize],
            })
        }

        fn page_text(&self, _page_index: usize) -> Result<String> {
            Ok(String::new())
        }

        fn text_segments(&self, _page_index: usize) -> Result<Vec<TextSegment>> {
            Ok(Vec::new())
        }

        fn search_page(&self, _page_index: usize, _term: &str) -> Result<Vec<DocRect>> {
            Ok(Vec::new())
        }

        fn form_widgets(&self, _page_index: usize) -> Result<Vec<FormWidget>> {
            Ok(Vec::new())
        }
    }

    fn blank_controller(page_count: usize) -> ViewController {
        let path = Path::new("/tmp/blank.pdf");
        let repository = Arc::new(MemoryAnnotationRepository::default());
        ViewController::new(
            Arc::new(BlankBackend::new(path, page_count)),
            AnnotationStore::open(path, repository),
            ViewPreferences::default(),
            EngineConfig::default(),
            Viewport {
                width: 150.0,
                height: 180.0,
                device_pixel_ratio: 1.0,
            },
        )
    }

    #[test]
    fn start_page_past_the_end_keeps_the_document_open() {
        let mut doc = blank_controller(4);
        open_at(&mut doc, 2);
        assert_eq!(doc.current_page(), 2);
        open_at(&mut doc, 40);
        assert_eq!(doc.current_page(), 2);
    }

    #[test]
    fn cli_parses_subcommands() {
        let args = Args::try_parse_from(["leafview", "view", "-p", "3", "a.pdf", "b.pdf"]).unwrap();
        match args.command {
            Mode::View { page, files, .. } => {
                assert_eq!(page, Some(3));
                assert_eq!(files.len(), 2);
            }
            other => panic!("unexpected mode: {:?}", other),
        }

        let args =
            Args::try_parse_from(["leafview", "find", "a.pdf", "fox", "--from", "2", "--backward"])
                .unwrap();
        match args.command {
            Mode::Find {
                term,
                from,
                backward,
                all,
                ..
            } => {
                assert_eq!(term, "fox");
                assert_eq!(from, 2);
                assert!(backward);
                assert!(!all);
            }
            other => panic!("unexpected mode: {:?}", other),
        }

        assert!(Args::try_parse_from(["leafview", "view"]).is_err());
    }

    #[test]
    fn notes_land_next_to_the_document() {
        assert_eq!(
            notes_path(Path::new("/docs/paper.pdf")),
            PathBuf::from("/docs/paper.pdf.notes.md")
        );
    }

    #[test]
    fn notes_export_reads_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let document = dir.path().join("paper.pdf");
        fs::write(&document, b"%PDF-1.4").unwrap();
        let canonical = document.canonicalize().unwrap();
        let repository: Arc<dyn AnnotationRepository> = Arc::new(SidecarRepository);
        let mut store = AnnotationStore::open(&canonical, Arc::clone(&repository));
        store.add(
            1,
            Annotation::Note {
                rel_pos: NormPoint::new(0.5, 0.5),
                text: "check this".into(),
            },
        );
        store.flush().unwrap();

        let output = dir.path().join("notes.md");
        export_notes(&document, Some(output.clone())).unwrap();
        let markdown = fs::read_to_string(output).unwrap();
        assert!(markdown.starts_with("# Notes: paper.pdf"));
        assert!(markdown.contains("## Page 2"));
        assert!(markdown.contains("check this"));
    }

    #[test]
    fn search_hits_print_one_based_pages() {
        let hit = SearchHit {
            page: 4,
            rects: vec![DocRect::new(1.0, 20.0, 30.0, 10.0)],
        };
        let mut out = Vec::new();
        print_hit(&mut out, &hit).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "page 5: 1 highlight(s)\n  [1.0, 20.0, 30.0, 10.0]\n");
    }
}
