//! Line parsing for the interactive shell.

pub const HELP: &str = "\
Commands:
  /new <name> [description]   create a conversation and open it
  /open <name>                switch to a conversation
  /list                       list conversations, most recent first
  /rename <new name>          rename the open conversation
  /delete-chat <name>         delete a conversation
  /del <pos>                  delete the message at a position
  /regen <pos>                regenerate the assistant reply at a position
  /system <text>              set the system message (empty removes it)
  /set <key> <value>          set a global setting (key, endpoint, model)
  /temp <t>                   set the temperature of the open conversation (0-1)
  /tokens                     rough token count of the open conversation
  /stop                       cancel the reply in progress
  /help                       show this help
  /quit                       exit
Anything else is sent as a message.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    New { name: String, description: String },
    Open(String),
    List,
    Rename(String),
    DeleteChat(String),
    DeleteMessage(usize),
    Regenerate(usize),
    System(String),
    Set { key: String, value: String },
    Temperature(f32),
    Tokens,
    Stop,
    Help,
    Quit,
    Say(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("unknown command '/{0}' (try /help)")]
    Unknown(String),
}

/// Parse one input line. `None` for blank lines.
pub fn parse(line: &str) -> Option<Result<Command, ParseError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(body) = line.strip_prefix('/') else {
        return Some(Ok(Command::Say(line.to_string())));
    };

    let (verb, rest) = match body.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (body, ""),
    };

    let required = |usage: &'static str| {
        if rest.is_empty() {
            Err(ParseError::Usage(usage))
        } else {
            Ok(rest.to_string())
        }
    };
    let position = |usage: &'static str| rest.parse::<usize>().map_err(|_| ParseError::Usage(usage));

    let command = match verb {
        "new" => {
            let (name, description) = match rest.split_once(char::is_whitespace) {
                Some((name, description)) => (name, description.trim()),
                None => (rest, ""),
            };
            if name.is_empty() {
                return Some(Err(ParseError::Usage("/new <name> [description]")));
            }
            Ok(Command::New {
                name: name.to_string(),
                description: description.to_string(),
            })
        }
        "open" => required("/open <name>").map(Command::Open),
        "list" => Ok(Command::List),
        "rename" => required("/rename <new name>").map(Command::Rename),
        "delete-chat" => required("/delete-chat <name>").map(Command::DeleteChat),
        "del" => position("/del <pos>").map(Command::DeleteMessage),
        "regen" => position("/regen <pos>").map(Command::Regenerate),
        "system" => Ok(Command::System(rest.to_string())),
        "set" => match rest.split_once(char::is_whitespace) {
            Some((key, value)) => Ok(Command::Set {
                key: key.to_string(),
                value: value.trim().to_string(),
            }),
            None => Err(ParseError::Usage("/set <key> <value>")),
        },
        "temp" => rest
            .parse::<f32>()
            .map(Command::Temperature)
            .map_err(|_| ParseError::Usage("/temp <0-1>")),
        "tokens" => Ok(Command::Tokens),
        "stop" => Ok(Command::Stop),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ParseError::Unknown(other.to_string())),
    };
    Some(command)
}
