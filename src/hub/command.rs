//! Chat command parsing.

/// Every dispatchable command starts with this marker.
pub const COMMAND_MARKER: char = '/';

pub const HELP_COMMAND: &str = "/help";

pub const HELP_TEXT: &str = r#"chatrelay commands:

/help - Show this message
/<command> <agent> [args...] - Run <command> on <agent> and reply with its output

Messages queued for you while you were away are delivered when you next write here."#;

pub const USAGE_TEXT: &str = "Usage: /<command> <agent> [args...]";

/// A parsed chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    /// Run `command` (marker stripped) on `agent`.
    Dispatch {
        command: String,
        agent: String,
        args: Vec<String>,
    },
    /// Not a command, or no agent named.
    Usage,
}

/// Parse message text: first whitespace token is the command, the rest are
/// arguments, the first argument names the agent.
pub fn parse(text: &str) -> ChatCommand {
    let mut tokens = text.split_whitespace();
    let Some(first) = tokens.next() else {
        return ChatCommand::Usage;
    };

    // "/run@SomeBot" as sent when picking a command from the client menu.
    let first = first.split('@').next().unwrap_or(first);

    if first == HELP_COMMAND {
        return ChatCommand::Help;
    }

    let Some(command) = first.strip_prefix(COMMAND_MARKER) else {
        return ChatCommand::Usage;
    };
    if command.is_empty() {
        return ChatCommand::Usage;
    }

    let Some(agent) = tokens.next() else {
        return ChatCommand::Usage;
    };

    ChatCommand::Dispatch {
        command: command.to_string(),
        agent: agent.to_string(),
        args: tokens.map(str::to_string).collect(),
    }
}
