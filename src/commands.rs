use std::str::FromStr;

use crate::events::{ConversationSummary, Feedback};

use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

/// Commands that can be invoked by starting a message with a leading slash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, AsRefStr, IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Start a new conversation
    New,
    /// List conversations
    List,
    /// Make another conversation active
    Switch,
    /// Rename the active conversation
    Rename,
    /// Delete a conversation
    Delete,
    /// Show the active conversation
    History,
    /// Choose the prompt template for following messages
    Template,
    /// List prompt templates
    Templates,
    /// Turn streaming on or off
    Stream,
    /// Ask again for the last answer
    Retry,
    /// Replace the last question and ask again
    Edit,
    /// Remove the last message
    Undo,
    Like,
    Dislike,
    /// Show help
    Help,
    /// Exit
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl ParsedCommand {
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_deref()
    }

    pub fn feedback(&self) -> Option<Feedback> {
        match self.command {
            SlashCommand::Like => Some(Feedback::Like),
            SlashCommand::Dislike => Some(Feedback::Dislike),
            _ => None,
        }
    }

    /// `/stream on|off`; no argument toggles
    pub fn stream_setting(&self, current: bool) -> Option<bool> {
        if self.command != SlashCommand::Stream {
            return None;
        }
        match self.argument().map(|a| a.trim().to_lowercase()) {
            None => Some(!current),
            Some(arg) => match arg.as_str() {
                "on" | "true" | "yes" => Some(true),
                "off" | "false" | "no" => Some(false),
                _ => None,
            },
        }
    }
}

impl SlashCommand {
    /// User-visible description shown in help.
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::New => "start a new conversation",
            SlashCommand::List => "list conversations, most recent first",
            SlashCommand::Switch => "switch to a conversation by number or id prefix",
            SlashCommand::Rename => "rename the active conversation",
            SlashCommand::Delete => "delete a conversation (the active one by default)",
            SlashCommand::History => "show the messages of the active conversation",
            SlashCommand::Template => "use a prompt template for the next messages",
            SlashCommand::Templates => "list prompt templates",
            SlashCommand::Stream => "turn streaming on or off",
            SlashCommand::Retry => "regenerate the last answer",
            SlashCommand::Edit => "replace your last message and ask again",
            SlashCommand::Undo => "remove the last message",
            SlashCommand::Like => "rate the active conversation up",
            SlashCommand::Dislike => "rate the active conversation down",
            SlashCommand::Help => "show available commands",
            SlashCommand::Bye => "exit",
        }
    }

    /// Command string without the leading '/'.
    pub fn command(self) -> &'static str {
        self.into()
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let rest = input.trim().strip_prefix('/')?;
    let (head, argument) = match rest.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, Some(tail.trim())),
        None => (rest, None),
    };

    let command = SlashCommand::from_str(head).ok().or_else(|| match head.to_lowercase().as_str() {
        "q" | "quit" | "exit" => Some(SlashCommand::Bye),
        "ls" => Some(SlashCommand::List),
        "s" | "open" => Some(SlashCommand::Switch),
        "rm" => Some(SlashCommand::Delete),
        "regenerate" | "r" => Some(SlashCommand::Retry),
        "h" | "?" => Some(SlashCommand::Help),
        _ => None,
    })?;

    let argument = argument.filter(|a| !a.is_empty()).map(str::to_string);
    Some(ParsedCommand { command, argument })
}

/// Find a conversation by its 1-based position in `list` or by id prefix
pub fn resolve_conversation(selector: &str, list: &[ConversationSummary]) -> Option<String> {
    let selector = selector.trim();
    if let Ok(index) = selector.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| list.get(i))
            .map(|s| s.id.clone());
    }
    let mut matches = list.iter().filter(|s| s.id.starts_with(selector));
    match (matches.next(), matches.next()) {
        (Some(only), None) if !selector.is_empty() => Some(only.id.clone()),
        _ => None,
    }
}

/// Leading characters of an id, enough to pick it with `resolve_conversation`
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

/// Get help text for all available commands
pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n\n");
    for command in SlashCommand::iter() {
        help.push_str(&format!("/{} - {}\n", command.command(), command.description()));
    }

    help.push_str("\nAliases: /q for /bye, /ls for /list, /s for /switch, /r for /retry.");
    help.push_str("\nPress Ctrl-C while an answer is streaming to cancel it.");

    help
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn summary(id: &str) -> ConversationSummary {
        ConversationSummary {
            id: id.to_string(),
            title: "t".to_string(),
            updated_at: Utc::now(),
            message_count: 0,
            likes: 0,
            dislikes: 0,
        }
    }

    #[test]
    fn parses_commands_and_arguments() {
        let parsed = parse_slash_command("/rename  Rust questions ").unwrap();
        assert_eq!(parsed.command, SlashCommand::Rename);
        assert_eq!(parsed.argument(), Some("Rust questions"));

        let parsed = parse_slash_command("/templates").unwrap();
        assert_eq!(parsed.command, SlashCommand::Templates);
        assert_eq!(parsed.argument(), None);

        assert_eq!(parse_slash_command("/q").unwrap().command, SlashCommand::Bye);
        assert_eq!(parse_slash_command("/r").unwrap().command, SlashCommand::Retry);

        let parsed = parse_slash_command("/edit what is 2+2").unwrap();
        assert_eq!(parsed.command, SlashCommand::Edit);
        assert_eq!(parsed.argument(), Some("what is 2+2"));
        assert!(parse_slash_command("/unknown").is_none());
        assert!(parse_slash_command("hello /new").is_none());
    }

    #[test]
    fn stream_and_feedback_arguments() {
        let parsed = parse_slash_command("/stream off").unwrap();
        assert_eq!(parsed.stream_setting(true), Some(false));
        let parsed = parse_slash_command("/stream").unwrap();
        assert_eq!(parsed.stream_setting(true), Some(false));
        assert_eq!(parse_slash_command("/stream maybe").unwrap().stream_setting(true), None);

        assert_eq!(parse_slash_command("/like").unwrap().feedback(), Some(Feedback::Like));
        assert_eq!(parse_slash_command("/new").unwrap().feedback(), None);
    }

    #[test]
    fn resolves_by_position_or_prefix() {
        let list = vec![summary("abc123"), summary("abd456"), summary("xyz")];
        assert_eq!(resolve_conversation("2", &list), Some("abd456".to_string()));
        assert_eq!(resolve_conversation("0", &list), None);
        assert_eq!(resolve_conversation("x", &list), Some("xyz".to_string()));
        assert_eq!(resolve_conversation("ab", &list), None);
        assert_eq!(resolve_conversation("abc", &list), Some("abc123".to_string()));
    }

    #[test]
    fn short_ids_cut_on_characters() {
        assert_eq!(short_id("3f2a9c1e-77b0-4c1d"), "3f2a9c1e");
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("对话记录一二三四五"), "对话记录一二三四");
        let list = vec![summary("对话记录一二三四五")];
        assert_eq!(resolve_conversation(&short_id(&list[0].id), &list), Some(list[0].id.clone()));
    }

    #[test]
    fn help_lists_every_command() {
        let help = get_help_text();
        for command in SlashCommand::iter() {
            assert!(help.contains(&format!("/{}", command.command())));
        }
    }
}
