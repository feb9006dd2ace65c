//! Virtual terminal screen for interactive mode.
//!
//! Wraps the alacritty terminal emulator behind a lock so the PTY reader
//! can feed raw bytes while the dashboard renders the current screen.
//! This models only the visible grid; scrollback history belongs to the
//! log buffer.

use std::sync::Mutex;

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::Line;
use alacritty_terminal::term::cell::Flags;
use alacritty_terminal::term::{Config, Term};
use alacritty_terminal::vte::ansi::Processor;

#[derive(Clone, Copy)]
struct ScreenSize {
    rows: usize,
    cols: usize,
}

impl Dimensions for ScreenSize {
    fn total_lines(&self) -> usize {
        self.rows
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// Discards emulator events (bells, title changes, clipboard requests).
struct EventSink;

impl EventListener for EventSink {
    fn send_event(&self, _event: Event) {}
}

/// Thread-safe VT100-style screen model over raw PTY bytes.
pub struct VtermScreen {
    inner: Mutex<ScreenState>,
}

struct ScreenState {
    term: Term<EventSink>,
    parser: Processor,
    size: ScreenSize,
}

impl VtermScreen {
    pub fn new(rows: u16, cols: u16) -> Self {
        let size = ScreenSize {
            rows: rows as usize,
            cols: cols as usize,
        };
        let config = Config {
            scrolling_history: 0,
            ..Config::default()
        };
        let term = Term::new(config, &size, EventSink);
        Self {
            inner: Mutex::new(ScreenState {
                term,
                parser: Processor::new(),
                size,
            }),
        }
    }

    /// Feeds raw PTY output through the emulator.
    pub fn write(&self, data: &[u8]) {
        let mut state = self.lock();
        let ScreenState { term, parser, .. } = &mut *state;
        for byte in data {
            parser.advance(term, *byte);
        }
    }

    /// Renders the visible screen: each row right-trimmed, trailing
    /// blank rows removed.
    pub fn content(&self) -> String {
        let state = self.lock();
        let grid = state.term.grid();

        let mut lines: Vec<String> = Vec::with_capacity(state.size.rows);
        for y in 0..grid.screen_lines() {
            let Ok(row_idx) = i32::try_from(y) else {
                break;
            };
            let row = &grid[Line(row_idx)];
            let text: String = row
                .into_iter()
                .filter(|cell| !cell.flags.contains(Flags::WIDE_CHAR_SPACER))
                .map(|cell| if cell.c == '\0' { ' ' } else { cell.c })
                .collect();
            lines.push(text.trim_end().to_string());
        }

        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }

        lines.join("\n")
    }

    /// Changes the screen geometry, matching a PTY resize.
    pub fn resize(&self, rows: u16, cols: u16) {
        let mut state = self.lock();
        state.size = ScreenSize {
            rows: rows as usize,
            cols: cols as usize,
        };
        let size = state.size;
        state.term.resize(size);
    }

    /// Current geometry as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        let state = self.lock();
        (state.size.rows as u16, state.size.cols as u16)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScreenState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_written_lines() {
        let screen = VtermScreen::new(6, 40);
        screen.write(b"hello\r\nworld");
        assert_eq!(screen.content(), "hello\nworld");
    }

    #[test]
    fn trims_trailing_blank_rows_and_spaces() {
        let screen = VtermScreen::new(10, 40);
        screen.write(b"only line\r\n");
        assert_eq!(screen.content(), "only line");
    }

    #[test]
    fn carriage_return_overwrites_in_place() {
        let screen = VtermScreen::new(4, 40);
        screen.write(b"progress: 10%\rprogress: 99%");
        assert_eq!(screen.content(), "progress: 99%");
    }

    #[test]
    fn clear_screen_resets_content() {
        let screen = VtermScreen::new(4, 40);
        screen.write(b"old\r\ncontent\r\n");
        screen.write(b"\x1b[2J\x1b[Hfresh");
        assert_eq!(screen.content(), "fresh");
    }

    #[test]
    fn resize_changes_wrap_width() {
        let screen = VtermScreen::new(4, 80);
        screen.resize(4, 10);
        assert_eq!(screen.size(), (4, 10));
        screen.write(b"0123456789abc");
        // 13 cells wrap at column 10.
        assert_eq!(screen.content(), "0123456789\nabc");
    }
}
