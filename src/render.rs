//! Progress view written to the connecting terminal.
//!
//! Output is plain ANSI over the SSH channel: one line per provisioning
//! step, rewritten in place when the step completes, with init-container log
//! lines streamed beneath their header. The terminal is in raw mode on the
//! client side, so every line ends in `\r\n`.

use std::fmt::Display;
use std::time::Duration;

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use tokio::time::Instant;

use crate::state::State;

const CRLF: &str = "\r\n";

#[derive(Debug, Default)]
pub struct Renderer {
    /// Step currently shown as in progress, with its start time.
    step: Option<(State, Instant)>,
    /// True while the in-progress line has no line break after it.
    line_open: bool,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banner(&self, username: &str) -> Vec<u8> {
        format!("{}{CRLF}Hi {}!{CRLF}{CRLF}", "boombox".bold().magenta(), username.bold())
            .into_bytes()
    }

    /// Render a state change at `now`: the previous step is marked done with
    /// its duration and the new step is shown as in progress.
    pub fn state_changed(&mut self, state: State, now: Instant) -> Vec<u8> {
        let mut out = String::new();

        if let Some((prev, started)) = self.step.take() {
            if self.line_open {
                out.push('\r');
                push_clear_line(&mut out);
            }
            out.push_str(&format!(
                "{} {} {}{CRLF}",
                "✓".green(),
                prev.label(),
                format_duration(now.saturating_duration_since(started)).dark_grey()
            ));
            self.line_open = false;
        }

        let mut out = out.into_bytes();
        match state {
            State::PodRunning => {
                out.extend(clear_screen());
            }
            State::PodTerminated | State::Error | State::Unknown => {}
            _ => {
                out.extend(format!("{} {}", "·".cyan(), state.label()).into_bytes());
                self.step = Some((state, now));
                self.line_open = true;
            }
        }
        out
    }

    /// Render one init-container log line beneath the setup header.
    pub fn log_line(&mut self, line: &str) -> Vec<u8> {
        let mut out = String::new();
        if self.line_open {
            out.push_str(CRLF);
            self.line_open = false;
        }
        out.push_str(&format!("  {} {}{CRLF}", "│".dark_grey(), line));
        out.into_bytes()
    }

    pub fn error(&mut self, err: &dyn Display) -> Vec<u8> {
        let mut out = String::new();
        if self.line_open {
            out.push_str(CRLF);
            self.line_open = false;
        }
        self.step = None;
        out.push_str(&format!(
            "{CRLF}{}{CRLF}{err}{CRLF}Press any key to exit{CRLF}",
            "ERROR".red().bold()
        ));
        out.into_bytes()
    }

    pub fn terminated(&mut self, grace: Duration) -> Vec<u8> {
        self.step = None;
        self.line_open = false;
        format!(
            "{CRLF}{}{CRLF}Exiting in {}s{CRLF}Press any key to exit{CRLF}",
            "Session ended".bold(),
            grace.as_secs()
        )
        .into_bytes()
    }

    pub fn farewell(&self) -> Vec<u8> {
        format!("Buh bye!{CRLF}").into_bytes()
    }
}

fn format_duration(d: Duration) -> String {
    format!("({:.1}s)", d.as_secs_f64())
}

fn clear_screen() -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = queue!(buf, Clear(ClearType::All), MoveTo(0, 0));
    buf
}

fn push_clear_line(out: &mut String) {
    let mut buf = Vec::new();
    let _ = queue!(buf, Clear(ClearType::CurrentLine));
    out.push_str(&String::from_utf8_lossy(&buf));
}
