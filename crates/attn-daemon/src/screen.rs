//! Virtual terminal screen maintained alongside the scrollback ring.
//!
//! Full-screen agent UIs (alternate screen, cursor addressing) cannot be
//! reconstructed from scrollback replay alone; the worker keeps a vt100
//! grid fed with every output chunk and serializes it on attach.

use attn_protocol::types::ScreenSnapshot;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

pub struct VirtualScreen {
    parser: vt100::Parser,
}

impl VirtualScreen {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
        }
    }

    pub fn process(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn resize(&mut self, rows: u16, cols: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    /// Serialize the visible frame. `fresh` is false when the grid may
    /// lag the live stream (e.g. rebuilt after a resize glitch).
    pub fn snapshot(&self, fresh: bool) -> ScreenSnapshot {
        let screen = self.parser.screen();
        let (rows, cols) = screen.size();
        let (cursor_row, cursor_col) = screen.cursor_position();
        let lines = screen
            .rows_formatted(0, cols)
            .map(|row| BASE64.encode(row))
            .collect();
        ScreenSnapshot {
            cols,
            rows,
            cursor_row,
            cursor_col,
            cursor_visible: !screen.hide_cursor(),
            alternate_screen: screen.alternate_screen(),
            lines,
            fresh,
        }
    }
}
