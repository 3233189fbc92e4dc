use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use textwrap::wrap;
use unicode_width::UnicodeWidthStr;

use crate::archive::{SortOption, ViewMode};
use crate::feed::{Controller, Slot, SlotMedia, GRID_COLS};
use crate::lifecycle::{Affordance, SlotPhase};
use crate::storage::{FeedPrefs, Store};
use crate::visibility::Viewport;

const COLOR_BG: Color = Color::Rgb(30, 30, 46);
const COLOR_PANEL_BG: Color = Color::Rgb(24, 24, 36);
const COLOR_BORDER: Color = Color::Rgb(49, 50, 68);
const COLOR_BORDER_FOCUSED: Color = Color::Rgb(137, 180, 250);
const COLOR_TEXT_PRIMARY: Color = Color::Rgb(205, 214, 244);
const COLOR_TEXT_SECONDARY: Color = Color::Rgb(166, 173, 200);
const COLOR_ACCENT: Color = Color::Rgb(137, 180, 250);
const COLOR_SUCCESS: Color = Color::Rgb(166, 227, 161);
const COLOR_ERROR: Color = Color::Rgb(243, 139, 168);
const COLOR_SELECTED_BG: Color = Color::Rgb(69, 71, 90);

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

struct Spinner {
    frame: usize,
}

impl Spinner {
    fn new() -> Self {
        Self { frame: 0 }
    }

    fn advance(&mut self) -> bool {
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
        true
    }

    fn reset(&mut self) {
        self.frame = 0;
    }

    fn glyph(&self) -> &'static str {
        SPINNER_FRAMES[self.frame]
    }
}

pub struct Options {
    pub controller: Controller,
    pub subreddit: String,
    pub store: Option<Arc<Store>>,
    pub status_message: String,
}

pub struct Model {
    controller: Controller,
    subreddit: String,
    store: Option<Arc<Store>>,
    status_message: String,
    selected: usize,
    viewport_top: usize,
    viewport_height: usize,
    needs_redraw: bool,
    spinner: Spinner,
}

impl Model {
    pub fn new(opts: Options) -> Self {
        Self {
            controller: opts.controller,
            subreddit: opts.subreddit,
            store: opts.store,
            status_message: opts.status_message,
            selected: 0,
            viewport_top: 0,
            viewport_height: 0,
            needs_redraw: true,
            spinner: Spinner::new(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode()?;
        stdout.execute(EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;
        terminal.clear()?;

        let result = self.event_loop(&mut terminal);

        // Every live player is released before the terminal is restored.
        self.controller.teardown();

        disable_raw_mode()?;
        terminal.backend_mut().execute(LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let mut last_tick = Instant::now();
        let tick_rate = Duration::from_millis(120);

        loop {
            if self.controller.pump() {
                self.mark_dirty();
            }

            if self.needs_redraw {
                terminal.draw(|frame| self.draw(frame))?;
                self.needs_redraw = false;
                self.push_viewport();
                // A sweep can start or stop players; reflect it right away.
                if self.controller.pump() {
                    self.needs_redraw = true;
                }
            }

            let timeout = tick_rate
                .checked_sub(last_tick.elapsed())
                .unwrap_or_else(|| Duration::from_millis(16));

            if event::poll(timeout)? {
                match event::read()? {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        match self.handle_key(key.code) {
                            Ok(true) => break,
                            Ok(false) => {}
                            Err(err) => {
                                self.status_message = format!("Error: {err}");
                                self.mark_dirty();
                            }
                        }
                    }
                    Event::Resize(_, _) => self.mark_dirty(),
                    _ => {}
                }
            }

            if last_tick.elapsed() >= tick_rate {
                last_tick = Instant::now();
                if self.controller.is_loading() {
                    self.spinner.advance();
                    self.mark_dirty();
                } else {
                    self.spinner.reset();
                }
            }
        }

        Ok(())
    }

    fn mark_dirty(&mut self) {
        self.needs_redraw = true;
    }

    fn viewport(&self) -> Viewport {
        Viewport {
            top: self.viewport_top,
            height: self.viewport_height,
        }
    }

    fn push_viewport(&mut self) {
        if self.viewport_height > 0 {
            self.controller.on_viewport(self.viewport());
        }
    }

    fn handle_key(&mut self, code: KeyCode) -> Result<bool> {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.select_next(),
            KeyCode::Char('k') | KeyCode::Up => self.select_prev(),
            KeyCode::Char('g') | KeyCode::Home => self.select_index(0),
            KeyCode::Char('G') | KeyCode::End => {
                let last = self.controller.slots().len().saturating_sub(1);
                self.select_index(last);
            }
            KeyCode::PageDown => self.scroll_page(true),
            KeyCode::PageUp => self.scroll_page(false),
            KeyCode::Char('s') => self.cycle_sort()?,
            KeyCode::Char('v') => self.cycle_view_mode()?,
            KeyCode::Char(' ') | KeyCode::Enter => self.toggle_selected_playback(),
            KeyCode::Char('m') => self.toggle_selected_mute(),
            KeyCode::Char('r') => self.reload(),
            _ => {}
        }
        Ok(false)
    }

    fn select_next(&mut self) {
        let len = self.controller.slots().len();
        if len == 0 {
            return;
        }
        self.select_index((self.selected + 1).min(len - 1));
    }

    fn select_prev(&mut self) {
        self.select_index(self.selected.saturating_sub(1));
    }

    fn select_index(&mut self, index: usize) {
        let len = self.controller.slots().len();
        if len == 0 {
            return;
        }
        self.selected = index.min(len - 1);
        self.ensure_selected_visible();
        self.mark_dirty();
        self.push_viewport();
    }

    fn ensure_selected_visible(&mut self) {
        let Some(slot) = self.controller.slots().get(self.selected) else {
            return;
        };
        if self.viewport_height == 0 {
            return;
        }
        let bottom = slot.top + slot.height;
        if slot.top < self.viewport_top {
            self.viewport_top = slot.top;
        } else if bottom > self.viewport_top + self.viewport_height {
            self.viewport_top = bottom.saturating_sub(self.viewport_height);
        }
    }

    fn scroll_page(&mut self, down: bool) {
        if self.viewport_height == 0 {
            return;
        }
        let total = self.controller.total_rows();
        if down {
            let max_top = total.saturating_sub(self.viewport_height);
            self.viewport_top = (self.viewport_top + self.viewport_height).min(max_top);
        } else {
            self.viewport_top = self.viewport_top.saturating_sub(self.viewport_height);
        }
        self.mark_dirty();
        self.push_viewport();
    }

    fn cycle_sort(&mut self) -> Result<()> {
        let Some(sort) = self.controller.sort() else {
            return Ok(());
        };
        let next = sort.next();
        self.persist_prefs(next, self.controller.mode().unwrap_or(ViewMode::Single));
        self.controller.switch_sort(next)?;
        self.selected = 0;
        self.viewport_top = 0;
        self.status_message = format!("Sorting by {}.", sort_label(next));
        self.mark_dirty();
        Ok(())
    }

    fn cycle_view_mode(&mut self) -> Result<()> {
        let Some(mode) = self.controller.mode() else {
            return Ok(());
        };
        let next = mode.next();
        self.persist_prefs(self.controller.sort().unwrap_or(SortOption::Score), next);
        self.controller.switch_view_mode(next)?;
        self.selected = 0;
        self.viewport_top = 0;
        self.status_message = format!("Switched to {} view.", mode_label(next));
        self.mark_dirty();
        Ok(())
    }

    fn persist_prefs(&mut self, sort: SortOption, view_mode: ViewMode) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save_feed_prefs(FeedPrefs { sort, view_mode }) {
                self.status_message = format!("Failed to save preferences: {err}");
            }
        }
    }

    fn toggle_selected_playback(&mut self) {
        let slot_id = match self.controller.slots().get(self.selected) {
            Some(slot) if matches!(slot.media, SlotMedia::Video(_)) => slot.id.clone(),
            _ => return,
        };
        self.controller.toggle_playback(&slot_id);
        self.mark_dirty();
    }

    fn toggle_selected_mute(&mut self) {
        let slot_id = match self.controller.slots().get(self.selected) {
            Some(slot) if matches!(slot.media, SlotMedia::Video(_)) => slot.id.clone(),
            _ => return,
        };
        self.controller.toggle_mute(&slot_id);
        self.mark_dirty();
    }

    fn reload(&mut self) {
        let sort = self.controller.sort().unwrap_or(SortOption::Score);
        let mode = self.controller.mode().unwrap_or(ViewMode::Single);
        let subreddit = self.subreddit.clone();
        self.controller.load(&subreddit, sort, mode);
        self.selected = 0;
        self.viewport_top = 0;
        self.status_message = format!("Reloading r/{subreddit}…");
        self.mark_dirty();
    }

    fn draw(&mut self, frame: &mut Frame<'_>) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Min(3),
                Constraint::Length(1),
            ])
            .split(frame.size());

        self.draw_header(frame, chunks[0]);
        self.draw_feed(frame, chunks[1]);
        self.draw_status(frame, chunks[2]);
    }

    fn draw_header(&self, frame: &mut Frame<'_>, area: Rect) {
        let sort = self
            .controller
            .sort()
            .map(sort_label)
            .unwrap_or("-");
        let mode = self
            .controller
            .mode()
            .map(mode_label)
            .unwrap_or("-");
        let players = self.controller.lifecycle().live_players();
        let header = Line::from(vec![
            Span::styled(
                format!(" r/{} ", self.subreddit),
                Style::default()
                    .fg(COLOR_ACCENT)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("sort:{sort}  view:{mode}  players:{players} "),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ),
        ]);
        frame.render_widget(
            Paragraph::new(header).style(Style::default().bg(COLOR_BG)),
            area,
        );
    }

    fn draw_feed(&mut self, frame: &mut Frame<'_>, area: Rect) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(COLOR_BORDER_FOCUSED))
            .style(Style::default().bg(COLOR_PANEL_BG));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        self.viewport_height = inner.height as usize;
        let max_top = self
            .controller
            .total_rows()
            .saturating_sub(self.viewport_height);
        if self.viewport_top > max_top {
            self.viewport_top = max_top;
        }

        if let Some(error) = self.controller.error() {
            let text = vec![
                Line::from(Span::styled(
                    "Failed to load the feed",
                    Style::default()
                        .fg(COLOR_ERROR)
                        .add_modifier(Modifier::BOLD),
                )),
                Line::default(),
                Line::from(Span::styled(
                    error.to_string(),
                    Style::default().fg(COLOR_TEXT_PRIMARY),
                )),
                Line::default(),
                Line::from(Span::styled(
                    "Press r to retry.",
                    Style::default().fg(COLOR_TEXT_SECONDARY),
                )),
            ];
            frame.render_widget(
                Paragraph::new(text)
                    .alignment(Alignment::Center)
                    .wrap(Wrap { trim: true }),
                inner,
            );
            return;
        }

        if self.controller.slots().is_empty() {
            let message = if self.controller.is_loading() {
                format!("{} Loading r/{}…", self.spinner.glyph(), self.subreddit)
            } else {
                format!("r/{} has no posts.", self.subreddit)
            };
            frame.render_widget(
                Paragraph::new(message)
                    .style(Style::default().fg(COLOR_TEXT_SECONDARY))
                    .alignment(Alignment::Center),
                inner,
            );
            return;
        }

        let lines = self.feed_lines(inner.width as usize);
        let visible: Vec<Line> = lines
            .into_iter()
            .skip(self.viewport_top)
            .take(self.viewport_height)
            .collect();
        frame.render_widget(Paragraph::new(visible), inner);
    }

    /// Renders the whole feed into one line buffer whose row indices match
    /// the slot geometry handed to the visibility sweep. Each slot emits
    /// exactly `slot.height` lines.
    fn feed_lines(&self, width: usize) -> Vec<Line<'static>> {
        let mode = self.controller.mode().unwrap_or(ViewMode::Single);
        if mode == ViewMode::Grid {
            return self.grid_lines(width);
        }

        let mut lines: Vec<Line<'static>> = Vec::with_capacity(self.controller.total_rows());
        for slot in self.controller.slots() {
            let selected = slot.post_index == self.selected;
            let mut emitted = self.slot_lines(slot, width, selected);
            emitted.truncate(slot.height);
            while emitted.len() < slot.height {
                emitted.push(Line::default());
            }
            lines.extend(emitted);
        }
        lines
    }

    fn slot_lines(&self, slot: &Slot, width: usize, selected: bool) -> Vec<Line<'static>> {
        let Some(post) = self.controller.post(slot.post_index) else {
            return Vec::new();
        };
        let title_style = if selected {
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .bg(COLOR_SELECTED_BG)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
                .fg(COLOR_TEXT_PRIMARY)
                .add_modifier(Modifier::BOLD)
        };

        let marker = if selected { "▸ " } else { "  " };
        let mut lines = vec![
            Line::from(Span::styled(format!("{marker}{}", post.title), title_style)),
            Line::from(Span::styled(
                format!(
                    "  u/{}  {} points  {}",
                    post.author,
                    post.score,
                    relative_age(post.created_utc)
                ),
                Style::default().fg(COLOR_TEXT_SECONDARY),
            )),
        ];

        let body_budget = slot
            .height
            .saturating_sub(3)
            .saturating_sub(if slot.media == SlotMedia::None { 0 } else { media_rows(slot) });
        if body_budget > 0 && !post.selftext.trim().is_empty() {
            let wrapped = wrap(post.selftext.trim(), width.saturating_sub(4).max(16));
            for line in wrapped.iter().take(body_budget) {
                lines.push(Line::from(Span::styled(
                    format!("  {line}"),
                    Style::default().fg(COLOR_TEXT_PRIMARY),
                )));
            }
            while lines.len() < 2 + body_budget {
                lines.push(Line::default());
            }
        }

        if slot.media != SlotMedia::None {
            lines.extend(self.media_block(slot, media_rows(slot)));
        }

        lines.push(Line::from(Span::styled(
            "─".repeat(width.max(1)),
            Style::default().fg(COLOR_BORDER),
        )));
        lines
    }

    /// The media block stands in for the player surface: a framed area whose
    /// center line describes the decode state of the slot.
    fn media_block(&self, slot: &Slot, rows: usize) -> Vec<Line<'static>> {
        let (label, color) = self.media_status(slot);
        let mut lines = Vec::with_capacity(rows);
        for row in 0..rows {
            if row == rows / 2 {
                lines.push(Line::from(Span::styled(
                    format!("    {label}"),
                    Style::default().fg(color),
                )));
            } else {
                lines.push(Line::from(Span::styled(
                    "    ░░░░░░░░░░░░░░░░░░░░░░░░",
                    Style::default().fg(COLOR_BORDER),
                )));
            }
        }
        lines
    }

    fn media_status(&self, slot: &Slot) -> (String, Color) {
        match &slot.media {
            SlotMedia::Video(_) => {
                slot_status(self.controller.lifecycle(), &slot.id, self.spinner.glyph())
            }
            SlotMedia::PendingVideo => (
                "video still archiving".to_string(),
                COLOR_TEXT_SECONDARY,
            ),
            SlotMedia::Image => ("image".to_string(), COLOR_TEXT_SECONDARY),
            SlotMedia::Gallery(count) => {
                (format!("gallery · {count} items"), COLOR_TEXT_SECONDARY)
            }
            SlotMedia::None => (String::new(), COLOR_TEXT_SECONDARY),
        }
    }

    fn grid_lines(&self, width: usize) -> Vec<Line<'static>> {
        let slots = self.controller.slots();
        let cell_width = (width / GRID_COLS).max(8);
        let mut lines: Vec<Line<'static>> = Vec::new();

        for row_slots in slots.chunks(GRID_COLS) {
            let height = row_slots
                .iter()
                .map(|slot| slot.height)
                .max()
                .unwrap_or(0);
            for row in 0..height {
                let mut spans: Vec<Span<'static>> = Vec::new();
                for slot in row_slots {
                    let selected = slot.post_index == self.selected;
                    let text = self.grid_cell_line(slot, row, cell_width, selected);
                    spans.push(text);
                }
                lines.push(Line::from(spans));
            }
        }
        lines
    }

    fn grid_cell_line(
        &self,
        slot: &Slot,
        row: usize,
        cell_width: usize,
        selected: bool,
    ) -> Span<'static> {
        let (content, style) = match row {
            0 => {
                let title = self
                    .controller
                    .post(slot.post_index)
                    .map(|post| post.title.clone())
                    .unwrap_or_default();
                let marker = if selected { "▸" } else { " " };
                (
                    format!("{marker}{title}"),
                    if selected {
                        Style::default()
                            .fg(COLOR_TEXT_PRIMARY)
                            .bg(COLOR_SELECTED_BG)
                            .add_modifier(Modifier::BOLD)
                    } else {
                        Style::default()
                            .fg(COLOR_TEXT_PRIMARY)
                            .add_modifier(Modifier::BOLD)
                    },
                )
            }
            1 => {
                let (label, color) = self.media_status(slot);
                (format!(" {label}"), Style::default().fg(color))
            }
            _ => (
                " ░░░░░░".to_string(),
                Style::default().fg(COLOR_BORDER),
            ),
        };
        Span::styled(pad_cell(&content, cell_width), style)
    }

    fn draw_status(&self, frame: &mut Frame<'_>, area: Rect) {
        let mut spans = vec![Span::styled(
            format!(" {} ", self.status_message),
            Style::default().fg(COLOR_TEXT_PRIMARY),
        )];
        if self.controller.is_loading() {
            spans.push(Span::styled(
                format!("{} loading…  ", self.spinner.glyph()),
                Style::default().fg(COLOR_ACCENT),
            ));
        } else if self.controller.is_exhausted() && !self.controller.slots().is_empty() {
            spans.push(Span::styled(
                "end of feed  ",
                Style::default().fg(COLOR_TEXT_SECONDARY),
            ));
        }
        spans.push(Span::styled(
            "j/k scroll · space play · m mute · s sort · v view · r reload · q quit",
            Style::default().fg(COLOR_TEXT_SECONDARY),
        ));
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(COLOR_BG)),
            area,
        );
    }
}

fn media_rows(slot: &Slot) -> usize {
    // Paged slots reserve a fixed block; single and grid slots give the
    // media whatever remains after two header lines and the separator.
    slot.height.saturating_sub(3).min(8)
}

fn slot_status(
    lifecycle: &crate::lifecycle::Manager,
    slot_id: &str,
    spinner: &str,
) -> (String, Color) {
    match lifecycle.affordance(slot_id) {
        Some(Affordance::Retry(reason)) => {
            return (
                format!("✕ {reason} — space to retry"),
                COLOR_ERROR,
            );
        }
        Some(Affordance::ManualStart) => {
            return ("▶ ready — space to play".to_string(), COLOR_ACCENT);
        }
        _ => {}
    }
    match lifecycle.phase(slot_id) {
        Some(SlotPhase::Playing) => {
            let muted = lifecycle.is_muted(slot_id).unwrap_or(true);
            let tag = if muted { " (muted)" } else { "" };
            (format!("▶ playing{tag}"), COLOR_SUCCESS)
        }
        Some(SlotPhase::Paused) => ("⏸ paused".to_string(), COLOR_ACCENT),
        Some(SlotPhase::Ready) => ("ready".to_string(), COLOR_ACCENT),
        Some(SlotPhase::Loading) => (format!("{spinner} buffering…"), COLOR_TEXT_SECONDARY),
        Some(SlotPhase::Observed) => ("queued".to_string(), COLOR_TEXT_SECONDARY),
        None => ("offscreen".to_string(), COLOR_TEXT_SECONDARY),
    }
}

fn pad_cell(content: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for ch in content.chars() {
        let w = UnicodeWidthStr::width(ch.to_string().as_str());
        if used + w > width.saturating_sub(1) {
            break;
        }
        out.push(ch);
        used += w;
    }
    while used < width {
        out.push(' ');
        used += 1;
    }
    out
}

fn sort_label(sort: SortOption) -> &'static str {
    match sort {
        SortOption::Score => "score",
        SortOption::New => "new",
        SortOption::Random => "random",
    }
}

fn mode_label(mode: ViewMode) -> &'static str {
    match mode {
        ViewMode::Paged => "paged",
        ViewMode::Single => "single",
        ViewMode::Grid => "grid",
    }
}

fn relative_age(created_utc: f64) -> String {
    let created = created_utc as i64;
    let now = Utc::now().timestamp();
    let delta = (now - created).max(0);
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{}m ago", delta / 60)
    } else if delta < 86_400 {
        format!("{}h ago", delta / 3600)
    } else if delta < 31_536_000 {
        format!("{}d ago", delta / 86_400)
    } else {
        format!("{}y ago", delta / 31_536_000)
    }
}
