use agent_host::{ConversationController, Phase, ValidationError};
use serde_json::{Map, Value};
use services::SettingsProvider;
use shared::settings::{SettingsPatch, COMMON_SECTION};
use std::sync::Arc;

use crate::commands::{self, Command, HELP};

/// Conversation created on first run.
pub const DEFAULT_CONVERSATION: &str = "chat";

/// Keys of the `common` section `/set` accepts.
const COMMON_KEYS: &[&str] = &["key", "endpoint", "model", "proxy"];

/// Line-oriented front end over the controller. Errors are printed and the
/// shell keeps going.
pub struct Shell {
    controller: ConversationController,
    settings: Arc<dyn SettingsProvider>,
}

impl Shell {
    pub fn new(controller: ConversationController, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            controller,
            settings,
        }
    }

    /// Open the most recently used conversation, creating one if there are none.
    pub fn open_initial(&mut self) -> anyhow::Result<()> {
        let name = match self.controller.list_conversations().into_iter().next() {
            Some(name) => name,
            None => self
                .controller
                .create_conversation(DEFAULT_CONVERSATION, "")?,
        };
        self.controller.open_conversation(&name)?;
        Ok(())
    }

    pub fn poll(&mut self) -> usize {
        self.controller.poll_events()
    }

    pub fn is_busy(&self) -> bool {
        self.controller.has_pending_replies()
    }

    /// Handle one input line. Returns `false` once the user asks to quit.
    pub fn handle_line(&mut self, line: &str) -> bool {
        let command = match commands::parse(line) {
            None => return true,
            Some(Ok(command)) => command,
            Some(Err(e)) => {
                println!("! {}", e);
                return true;
            }
        };
        if command == Command::Quit {
            return false;
        }
        if let Err(e) = self.run(command) {
            tracing::debug!(error = %e, "command failed");
            println!("! {}", e);
        }
        true
    }

    fn run(&mut self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Say(text) => {
                self.controller.send(&text)?;
            }
            Command::New { name, description } => {
                let name = self.controller.create_conversation(&name, &description)?;
                self.controller.open_conversation(&name)?;
            }
            Command::Open(name) => self.controller.open_conversation(&name)?,
            Command::List => {
                for name in self.controller.list_conversations() {
                    let marker = if self.controller.active() == Some(name.as_str()) {
                        '*'
                    } else {
                        ' '
                    };
                    let status = match self.controller.phase(&name) {
                        Phase::Idle => "",
                        Phase::Sending | Phase::Streaming => " (replying)",
                    };
                    println!("{} {}{}", marker, name, status);
                }
            }
            Command::Rename(new_name) => {
                let old_name = self
                    .controller
                    .active()
                    .ok_or(ValidationError::NoActiveConversation)?
                    .to_string();
                self.controller.rename_conversation(&old_name, &new_name)?;
                println!("renamed '{}' to '{}'", old_name, new_name.trim());
            }
            Command::DeleteChat(name) => {
                self.controller.delete_conversation(&name)?;
                println!("deleted '{}'", name);
                if self.controller.active().is_none() {
                    self.open_initial()?;
                }
            }
            Command::DeleteMessage(position) => {
                self.controller.delete_message(position)?;
            }
            Command::Regenerate(position) => {
                self.controller.regenerate(position)?;
            }
            Command::System(text) => {
                self.controller.set_system_message(&text)?;
                if text.is_empty() {
                    println!("system message removed");
                } else {
                    println!("system message set");
                }
            }
            Command::Set { key, value } => self.set_common(&key, &value)?,
            Command::Temperature(t) => {
                self.controller
                    .update_settings(SettingsPatch::new().temperature(t))?;
                println!("temperature set to {}", t);
            }
            Command::Tokens => match self.controller.token_estimate() {
                Some(tokens) => println!("~{} tokens", tokens),
                None => println!("no conversation is open"),
            },
            Command::Stop => {
                if !self.controller.cancel() {
                    println!("nothing to stop");
                }
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    fn set_common(&self, key: &str, value: &str) -> anyhow::Result<()> {
        if !COMMON_KEYS.contains(&key) {
            anyhow::bail!(
                "unknown setting '{}' (expected one of: {})",
                key,
                COMMON_KEYS.join(", ")
            );
        }
        let mut partial = Map::new();
        partial.insert(key.to_string(), Value::String(value.to_string()));
        self.settings.set(COMMON_SECTION, partial)?;

        let shown = if key == "key" { "********" } else { value };
        println!("{} = {}", key, shown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsolePresenter;
    use providers::CompletionWorker;
    use services::transcript::TRANSCRIPT_FILE;
    use services::{JsonSettings, TranscriptStore};
    use tempfile::TempDir;

    fn shell(dir: &TempDir) -> (Shell, Arc<JsonSettings>) {
        let store = TranscriptStore::open(dir.path().join(TRANSCRIPT_FILE)).unwrap();
        let settings = Arc::new(JsonSettings::in_memory());
        let controller = ConversationController::new(
            store,
            settings.clone(),
            Box::new(ConsolePresenter::new(Vec::new())),
            Box::new(CompletionWorker),
        );
        (Shell::new(controller, settings.clone()), settings)
    }

    #[test]
    fn test_first_run_creates_default_conversation() {
        let dir = TempDir::new().unwrap();
        let (mut shell, _) = shell(&dir);
        shell.open_initial().unwrap();
        assert_eq!(shell.controller.active(), Some(DEFAULT_CONVERSATION));
        assert!(!shell.is_busy());
    }

    #[test]
    fn test_commands_drive_the_controller() {
        let dir = TempDir::new().unwrap();
        let (mut shell, settings) = shell(&dir);
        shell.open_initial().unwrap();

        assert!(shell.handle_line("/new poet write in verse"));
        assert_eq!(shell.controller.active(), Some("poet"));
        assert_eq!(
            shell.controller.store().get_messages("poet").unwrap()[0].content,
            "write in verse"
        );

        assert!(shell.handle_line("/rename verse"));
        assert_eq!(shell.controller.active(), Some("verse"));

        assert!(shell.handle_line("/set model gpt-4o"));
        assert_eq!(settings.get(COMMON_SECTION)["model"], "gpt-4o");
        assert!(shell.handle_line("/set colour blue"));
        assert!(settings.get(COMMON_SECTION).get("colour").is_none());

        // errors are reported, never fatal
        assert!(shell.handle_line("/del 5"));
        assert!(shell.handle_line("/bogus"));

        assert!(shell.handle_line("/delete-chat verse"));
        assert_eq!(shell.controller.active(), Some(DEFAULT_CONVERSATION));
        assert!(!shell.handle_line("/quit"));
    }
}
