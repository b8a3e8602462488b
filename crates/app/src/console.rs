use agent_host::controller::PLACEHOLDER_TEXT;
use agent_host::Presenter;
use shared::agent_api::{ChatMessage, Role};
use std::io::Write;

/// Renders controller callbacks as plain text lines.
///
/// Streamed replies are printed incrementally: each increment carries the
/// whole reply so far, so only the part not yet shown is written.
pub struct ConsolePresenter<W: Write> {
    out: W,
    shown: usize,
    mid_line: bool,
}

impl ConsolePresenter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            shown: 0,
            mid_line: false,
        }
    }

    fn write_suffix(&mut self, text: &str) {
        match text.get(self.shown..) {
            Some(suffix) => {
                let _ = write!(self.out, "{}", suffix);
            }
            None => {
                // reply shrank or split a char; start over on a fresh line
                let _ = write!(self.out, "\n{}", text);
            }
        }
        self.shown = text.len();
        self.mid_line = true;
        let _ = self.out.flush();
    }

    fn end_line(&mut self) {
        if self.mid_line {
            let _ = writeln!(self.out);
            self.mid_line = false;
        }
    }
}

impl<W: Write> Presenter for ConsolePresenter<W> {
    fn on_increment(&mut self, text: &str) {
        self.write_suffix(text);
    }

    fn on_final(&mut self, success: bool, text: &str) {
        if success {
            self.write_suffix(text);
            self.end_line();
        } else {
            self.end_line();
            let _ = writeln!(self.out, "error: {}", text);
        }
        self.shown = 0;
    }

    fn on_message_added(&mut self, role: Role, text: &str) {
        match role {
            // the user just typed it
            Role::User => {}
            Role::Assistant if text == PLACEHOLDER_TEXT => {
                let _ = writeln!(self.out, "({})", text.to_lowercase());
            }
            _ => {
                self.end_line();
                let _ = writeln!(self.out, "{}> {}", role, text);
            }
        }
    }

    fn on_message_removed(&mut self, position: usize) {
        self.end_line();
        let _ = writeln!(self.out, "(message {} removed)", position);
    }

    fn on_reply_started(&mut self, position: usize) {
        self.end_line();
        let _ = write!(self.out, "[{}] assistant> ", position);
        let _ = self.out.flush();
        self.shown = 0;
        self.mid_line = true;
    }

    fn on_conversation_opened(&mut self, name: &str, messages: &[ChatMessage]) {
        self.end_line();
        let _ = writeln!(self.out, "== {} ==", name);
        for (i, message) in messages.iter().enumerate() {
            let _ = writeln!(self.out, "[{}] {}> {}", i, message.role, message.content);
        }
    }

    fn on_notice(&mut self, text: &str) {
        self.end_line();
        let _ = writeln!(self.out, "* {}", text);
    }
}
