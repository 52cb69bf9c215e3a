use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    terminal::{Clear, ClearType},
};
use leafview_core::{Command, MarkupKind, RenderImage, SearchDirection, ZoomMode};
use png::{BitDepth, ColorType, Encoder};
use tracing::debug;

pub mod paint;

/// Largest base64 payload the kitty graphics protocol takes per escape.
const KITTY_CHUNK: usize = 4096;
/// Every frame reuses one image and placement id, so a draw replaces the
/// previous page image instead of stacking on top of it.
const FRAME_ID: u32 = 1;

/// Sends composed viewer frames to a kitty-compatible terminal.
pub struct KittyRenderer<W: Write> {
    writer: W,
    frames_sent: u64,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frames_sent: 0,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Transmits `frame` and places it at the cursor over `params` cells.
    /// Nothing is written when the frame cannot be encoded.
    pub fn draw(&mut self, frame: &RenderImage, params: DrawParams) -> Result<()> {
        let payload = BASE64.encode(encode_frame(frame)?);
        let chunks: Vec<&[u8]> = payload.as_bytes().chunks(KITTY_CHUNK).collect();
        let last = chunks.len().saturating_sub(1);
        for (idx, chunk) in chunks.iter().enumerate() {
            let control = if idx == 0 {
                format!(
                    "a=T,f=100,C=1,q=2,i={FRAME_ID},p={FRAME_ID},c={},r={},s={},v={},z=-1",
                    params.columns, params.rows, frame.width, frame.height
                )
            } else {
                String::new()
            };
            write_chunk(&mut self.writer, &control, chunk, idx < last)?;
        }
        self.writer.flush().context("failed to flush frame to terminal")?;
        self.frames_sent += 1;
        debug!(
            frame = self.frames_sent,
            width = frame.width,
            height = frame.height,
            chunks = chunks.len(),
            "sent frame"
        );
        Ok(())
    }

    /// Removes the page image and every placement of it.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={FRAME_ID},q=2\u{1b}\\")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Holds terminal output until `end_sync_update` so a page swap lands
    /// in one paint.
    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// PNG-encodes an RGBA frame after checking its buffer matches its size.
fn encode_frame(frame: &RenderImage) -> Result<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * 4;
    if frame.width == 0 || frame.height == 0 {
        bail!("cannot send an empty {}x{} frame", frame.width, frame.height);
    }
    if frame.pixels.len() != expected {
        bail!(
            "{}x{} frame carries {} bytes, expected {expected}",
            frame.width,
            frame.height,
            frame.pixels.len()
        );
    }
    let mut png = Vec::with_capacity(expected / 4);
    let mut encoder = Encoder::new(&mut png, frame.width, frame.height);
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let failed = || format!("failed to encode {}x{} frame", frame.width, frame.height);
    let mut writer = encoder.write_header().with_context(failed)?;
    writer.write_image_data(&frame.pixels).with_context(failed)?;
    writer.finish().context("failed to finish frame")?;
    Ok(png)
}

/// Writes one APC graphics escape. Continuation chunks carry only `m`.
fn write_chunk<W: Write>(
    writer: &mut W,
    control: &str,
    chunk: &[u8],
    more: bool,
) -> io::Result<()> {
    writer.write_all(b"\x1b_G")?;
    if !control.is_empty() {
        writer.write_all(control.as_bytes())?;
        writer.write_all(b",")?;
    }
    write!(writer, "m={}", u8::from(more))?;
    if control.is_empty() {
        writer.write_all(b",q=2")?;
    }
    writer.write_all(b";")?;
    writer.write_all(chunk)?;
    writer.write_all(b"\x1b\\")
}

/// What a pointer gesture does on the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tool {
    #[default]
    Browse,
    Markup(MarkupKind),
    Note,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Drag,
    Up,
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    /// A page step with a numeric prefix.
    Repeat { command: Command, count: usize },
    GotoLast,
    /// Wheel notches; positive scrolls down.
    Scroll { notches: i32 },
    Pointer { phase: PointerPhase, column: u16, row: u16 },
    SelectTool(Tool),
    SwitchDocument { delta: isize },
    CloseDocument,
    ExportNotes,
    BeginSearch { direction: SearchDirection },
    SearchQueryChanged { query: String },
    SearchSubmit { query: String, direction: SearchDirection },
    SearchCancel,
    BeginZoomEntry,
    ZoomSubmit { text: String },
    TextSubmit { text: String },
    TextCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Search,
    Zoom,
    Text,
}

/// Turns terminal events into view commands, keeping vi-style numeric
/// prefixes and the text typed into the search and zoom prompts.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    buffer: String,
    prompt_label: String,
    search_direction: Option<SearchDirection>,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.buffer.clear();
            self.mode = mode;
        }
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Mouse(mouse) => self.map_mouse(mouse),
            Event::Key(key) => match self.mode {
                InputMode::Normal => self.map_key_normal(key),
                _ => self.map_key_prompt(key),
            },
            _ => UiEvent::None,
        }
    }

    fn map_key_normal(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('r'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.command(Command::Redo)
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE)
            | (KeyCode::PageDown, _) => self.repeat(Command::NextPage),
            (KeyCode::Char('k'), KeyModifiers::NONE)
            | (KeyCode::Up, KeyModifiers::NONE)
            | (KeyCode::PageUp, _) => self.repeat(Command::PrevPage),
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_count().saturating_sub(1);
                UiEvent::Command(Command::GotoPage { page })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => match self.pending_count.take() {
                Some(count) if count > 0 => {
                    self.pending_digits.clear();
                    UiEvent::Command(Command::GotoPage { page: count - 1 })
                }
                _ => {
                    self.reset_count();
                    UiEvent::GotoLast
                }
            },
            (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => self.command(Command::ZoomIn),
            (KeyCode::Char('-'), _) => self.command(Command::ZoomOut),
            (KeyCode::Char('w'), KeyModifiers::NONE) => self.command(Command::SetZoomMode {
                mode: ZoomMode::FitWidth,
            }),
            (KeyCode::Char('e'), KeyModifiers::NONE) => self.command(Command::SetZoomMode {
                mode: ZoomMode::FitHeight,
            }),
            (KeyCode::Char(':'), _) => {
                self.set_mode(InputMode::Zoom);
                UiEvent::BeginZoomEntry
            }
            (KeyCode::Char('f'), KeyModifiers::NONE) => self.command(Command::ToggleFacingPages),
            (KeyCode::Char('c'), KeyModifiers::NONE) => {
                self.command(Command::ToggleContinuousScroll)
            }
            (KeyCode::Char('r'), KeyModifiers::NONE) => self.command(Command::ToggleViewMode),
            (KeyCode::Char('d'), KeyModifiers::NONE) => self.command(Command::ToggleDarkMode),
            (KeyCode::Char('u'), KeyModifiers::NONE) => self.command(Command::Undo),
            (KeyCode::Char('/'), _) => self.begin_search(SearchDirection::Forward),
            (KeyCode::Char('?'), _) => self.begin_search(SearchDirection::Backward),
            (KeyCode::Char('n'), KeyModifiers::NONE) => self.command(Command::FindNext {
                direction: SearchDirection::Forward,
            }),
            (KeyCode::Char('N'), modifiers)
                if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
            {
                self.command(Command::FindNext {
                    direction: SearchDirection::Backward,
                })
            }
            (KeyCode::Esc, _) => self.command(Command::ClearSearch),
            (KeyCode::Char('b'), KeyModifiers::NONE) => self.tool(Tool::Browse),
            (KeyCode::Char('h'), KeyModifiers::NONE) => {
                self.tool(Tool::Markup(MarkupKind::Highlight))
            }
            (KeyCode::Char('U'), _) => self.tool(Tool::Markup(MarkupKind::Underline)),
            (KeyCode::Char('s'), KeyModifiers::NONE) => {
                self.tool(Tool::Markup(MarkupKind::Strikeout))
            }
            (KeyCode::Char('a'), KeyModifiers::NONE) => self.tool(Tool::Note),
            (KeyCode::Char('x'), KeyModifiers::NONE) => self.tool(Tool::Eraser),
            (KeyCode::Char('m'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::ExportNotes
            }
            (KeyCode::Tab, KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::SwitchDocument { delta: 1 }
            }
            (KeyCode::BackTab, _) => {
                self.reset_count();
                UiEvent::SwitchDocument { delta: -1 }
            }
            (KeyCode::Char('w'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::CloseDocument
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_key_prompt(&mut self, key: KeyEvent) -> UiEvent {
        let mode = self.mode;
        match (key.code, key.modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                match mode {
                    InputMode::Search => UiEvent::SearchCancel,
                    InputMode::Text => UiEvent::TextCancel,
                    _ => UiEvent::None,
                }
            }
            (KeyCode::Enter, _) => {
                let text = std::mem::take(&mut self.buffer);
                self.set_mode(InputMode::Normal);
                match mode {
                    InputMode::Search => UiEvent::SearchSubmit {
                        query: text,
                        direction: self
                            .search_direction
                            .take()
                            .unwrap_or(SearchDirection::Forward),
                    },
                    InputMode::Text => UiEvent::TextSubmit { text },
                    _ => UiEvent::ZoomSubmit { text },
                }
            }
            (KeyCode::Backspace, _) => {
                self.buffer.pop();
                self.prompt_changed()
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.buffer.push(c);
                self.prompt_changed()
            }
            _ => UiEvent::None,
        }
    }

    fn prompt_changed(&self) -> UiEvent {
        match self.mode {
            InputMode::Search => UiEvent::SearchQueryChanged {
                query: self.buffer.clone(),
            },
            _ => UiEvent::None,
        }
    }

    /// Opens a free-text prompt, prefilled with `text`.
    pub fn begin_text_entry(&mut self, label: &str, text: &str) {
        self.set_mode(InputMode::Text);
        self.prompt_label = label.to_string();
        self.buffer.clear();
        self.buffer.push_str(text);
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let MouseEvent {
            kind,
            column,
            row,
            modifiers,
        } = mouse;
        let zoom = modifiers.contains(KeyModifiers::CONTROL);
        match kind {
            MouseEventKind::ScrollUp if zoom => self.command(Command::ZoomWheel { delta: 1.0 }),
            MouseEventKind::ScrollDown if zoom => self.command(Command::ZoomWheel { delta: -1.0 }),
            MouseEventKind::ScrollDown => UiEvent::Scroll { notches: 1 },
            MouseEventKind::ScrollUp => UiEvent::Scroll { notches: -1 },
            MouseEventKind::Down(MouseButton::Left) => UiEvent::Pointer {
                phase: PointerPhase::Down,
                column,
                row,
            },
            MouseEventKind::Drag(MouseButton::Left) => UiEvent::Pointer {
                phase: PointerPhase::Drag,
                column,
                row,
            },
            MouseEventKind::Up(MouseButton::Left) => UiEvent::Pointer {
                phase: PointerPhase::Up,
                column,
                row,
            },
            _ => UiEvent::None,
        }
    }

    fn command(&mut self, command: Command) -> UiEvent {
        self.reset_count();
        UiEvent::Command(command)
    }

    fn tool(&mut self, tool: Tool) -> UiEvent {
        self.reset_count();
        UiEvent::SelectTool(tool)
    }

    fn repeat(&mut self, command: Command) -> UiEvent {
        match self.take_count() {
            1 => UiEvent::Command(command),
            count => UiEvent::Repeat { command, count },
        }
    }

    fn begin_search(&mut self, direction: SearchDirection) -> UiEvent {
        self.set_mode(InputMode::Search);
        self.search_direction = Some(direction);
        UiEvent::BeginSearch { direction }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    /// Text to echo on the status line: typed digits or the open prompt.
    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => {
                let prefix = match self.search_direction {
                    Some(SearchDirection::Backward) => '?',
                    _ => '/',
                };
                Some(format!("{prefix}{}", self.buffer))
            }
            InputMode::Zoom => Some(format!(":{}", self.buffer)),
            InputMode::Text => Some(format!("{}: {}", self.prompt_label, self.buffer)),
            InputMode::Normal if self.pending_digits.is_empty() => None,
            InputMode::Normal => Some(self.pending_digits.clone()),
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
