use std::io::{self, Write};
use std::mem;

/// The row model a view emits: everything the rendering side needs to
/// paint one frame, with no terminal detail leaking back into the views.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowModel {
    pub title: String,
    pub summary: Vec<String>,
    pub header: String,
    pub rows: Vec<String>,
    pub highlight: Option<usize>,
    pub note: String,
}

impl RowModel {
    pub fn dump_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.summary.len() + self.rows.len() + 3);
        lines.push(self.title.clone());
        lines.extend(self.summary.iter().cloned());
        if !self.header.is_empty() {
            lines.push(self.header.clone());
        }
        lines.extend(self.rows.iter().cloned());
        if !self.note.is_empty() {
            lines.push(self.note.clone());
        }
        lines
    }
}

/// Minimal terminal boundary: raw mode on stdin, size queries, and a
/// plain ANSI renderer for the row model.
pub struct Screen {
    saved: Option<libc::termios>,
    width: u16,
    height: u16,
    interactive: bool,
}

impl Screen {
    pub fn new(interactive: bool) -> Screen {
        let mut screen = Screen {
            saved: None,
            width: 80,
            height: 24,
            interactive,
        };

        if interactive {
            screen.enter_raw_mode();
        }
        screen.resize();
        screen
    }

    fn enter_raw_mode(&mut self) {
        unsafe {
            let mut termios: libc::termios = mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut termios) != 0 {
                return;
            }
            self.saved = Some(termios);

            termios.c_lflag &= !(libc::ICANON | libc::ECHO);
            termios.c_cc[libc::VMIN] = 1;
            termios.c_cc[libc::VTIME] = 0;
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios);
        }
    }

    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &saved);
            }
            let _ = write!(io::stdout(), "\x1b[?25h\x1b[0m\n");
            let _ = io::stdout().flush();
        }
    }

    /// Re-query the window size after SIGWINCH.
    pub fn resize(&mut self) {
        unsafe {
            let mut ws: libc::winsize = mem::zeroed();
            if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) == 0 && ws.ws_col > 0 {
                self.width = ws.ws_col;
                self.height = ws.ws_row;
            }
        }
    }

    pub fn too_small(&self) -> bool {
        self.width < 80 || self.height < 24
    }

    pub fn render(&mut self, model: &RowModel) {
        if !self.interactive {
            return;
        }

        let width = self.width as usize;
        let mut out = io::stdout().lock();
        let _ = write!(out, "\x1b[2J\x1b[H\x1b[?25l");
        let _ = writeln!(out, "\x1b[7m{:<width$}\x1b[0m", clip(&model.title, width));

        for line in &model.summary {
            let _ = writeln!(out, "{}", clip(line, width));
        }
        if !model.header.is_empty() {
            let _ = writeln!(out, "\x1b[1m{}\x1b[0m", clip(&model.header, width));
        }

        let body_rows = (self.height as usize).saturating_sub(model.summary.len() + 4);
        for (i, row) in model.rows.iter().take(body_rows).enumerate() {
            if model.highlight == Some(i) {
                let _ = writeln!(out, "\x1b[7m{:<width$}\x1b[0m", clip(row, width));
            } else {
                let _ = writeln!(out, "{}", clip(row, width));
            }
        }

        if !model.note.is_empty() {
            let _ = writeln!(out, "{}", clip(&model.note, width));
        }
        let _ = out.flush();
    }

    pub fn warn(&mut self, message: &str) {
        if !self.interactive {
            return;
        }

        let mut out = io::stdout().lock();
        let _ = write!(out, "\x1b[{};1H\x1b[K{}", self.height, message);
        let _ = out.flush();
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        self.restore();
    }
}

fn clip(s: &str, width: usize) -> &str {
    match s.char_indices().nth(width) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_lines_carry_all_sections() {
        let model = RowModel {
            title: "title".into(),
            summary: vec!["sum".into()],
            header: "HDR".into(),
            rows: vec!["r1".into(), "r2".into()],
            highlight: Some(1),
            note: "note".into(),
        };

        assert_eq!(
            model.dump_lines(),
            vec!["title", "sum", "HDR", "r1", "r2", "note"]
        );
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("abcdef", 3), "abc");
        assert_eq!(clip("ab", 3), "ab");
    }
}
