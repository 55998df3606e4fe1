/// Colon-command language.
///
/// A line is a command when it starts with `:` (leading whitespace ignored).
/// Anything else is a query for the language model. Command lines are split
/// with POSIX shell quoting, so `:instruct "be concise please"` carries one
/// argument.
use thiserror::Error;

use crate::similarity;

pub const SENTINEL: char = ':';

// ── Arg domains ───────────────────────────────────────────────────────────────

/// What `:select` can choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selectable {
    Provider,
    Lm,
    Voice,
    Whisper,
}

impl Selectable {
    pub const ALL: [Selectable; 4] = [
        Selectable::Provider,
        Selectable::Lm,
        Selectable::Voice,
        Selectable::Whisper,
    ];
    pub const NAMES: &'static [&'static str] = &["provider", "lm", "voice", "whisper"];

    pub fn name(self) -> &'static str {
        match self {
            Selectable::Provider => "provider",
            Selectable::Lm => "lm",
            Selectable::Voice => "voice",
            Selectable::Whisper => "whisper",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            Selectable::Provider => "select the language model provider",
            Selectable::Lm => "select the model for generating responses",
            Selectable::Voice => "select the assistant's voice",
            Selectable::Whisper => "select the model interpreting speech",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|x| x.name() == s)
    }
}

/// What `:toggle` can switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Togglable {
    Speech,
    Hearing,
    Context,
}

impl Togglable {
    pub const ALL: [Togglable; 3] = [Togglable::Speech, Togglable::Hearing, Togglable::Context];
    pub const NAMES: &'static [&'static str] = &["speech", "hearing", "context"];

    pub fn name(self) -> &'static str {
        match self {
            Togglable::Speech => "speech",
            Togglable::Hearing => "hearing",
            Togglable::Context => "context",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            Togglable::Speech => "toggle the assistant's speech",
            Togglable::Hearing => "toggle the assistant's ability to hear you",
            Togglable::Context => "toggle the use of conversation history for coherent responses",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|x| x.name() == s)
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select,
    Toggle,
    Key,
    Instruct,
    Status,
    Mute,
    Cmd,
    Commands,
    Clear,
    Exit,
}

/// How many arguments a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    /// Zero or one free-form argument
    Optional,
    /// Exactly one argument from the domain
    OneOf(&'static [&'static str]),
}

impl Command {
    /// Catalogue order; also the order suggestions and completions are offered in.
    pub const ALL: [Command; 10] = [
        Command::Select,
        Command::Toggle,
        Command::Key,
        Command::Instruct,
        Command::Status,
        Command::Mute,
        Command::Cmd,
        Command::Commands,
        Command::Clear,
        Command::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Select => ":select",
            Command::Toggle => ":toggle",
            Command::Key => ":key",
            Command::Instruct => ":instruct",
            Command::Status => ":status",
            Command::Mute => ":mute",
            Command::Cmd => ":cmd",
            Command::Commands => ":commands",
            Command::Clear => ":clear",
            Command::Exit => ":exit",
        }
    }

    pub fn summary(self) -> &'static str {
        match self {
            Command::Select => "for selecting from available models and voices",
            Command::Toggle => "to turn features on or off",
            Command::Key => "to set the LLM API key for the selected provider",
            Command::Instruct => "to instruct the model to behave a certain way",
            Command::Status => "to display status and settings",
            Command::Mute => "to mute the assistant",
            Command::Cmd => "to launch a shell session",
            Command::Commands => "to print this help message",
            Command::Clear => "to clear the terminal",
            Command::Exit => "to exit",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Command::Select => Arity::OneOf(Selectable::NAMES),
            Command::Toggle => Arity::OneOf(Togglable::NAMES),
            Command::Key | Command::Instruct => Arity::Optional,
            _ => Arity::None,
        }
    }

    /// Valid argument values, empty when the command has no arg domain.
    pub fn domain(self) -> &'static [&'static str] {
        match self.arity() {
            Arity::OneOf(domain) => domain,
            _ => &[],
        }
    }

    pub fn from_name(word: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == word)
    }
}

// ── Parsed input ──────────────────────────────────────────────────────────────

/// A validated command, ready to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Select(Selectable),
    Toggle(Togglable),
    Key(Option<String>),
    Instruct(Option<String>),
    Status,
    Mute,
    Cmd,
    Commands,
    Clear,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Blank line, nothing to do
    Empty,
    /// Free text for the language model
    Query(String),
    Command(Invocation),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("invalid command")]
    Malformed,
    #[error("command not found, did you mean '{suggestion}'?")]
    Unknown { word: String, suggestion: &'static str },
    #[error("{command} needs an argument")]
    MissingArgument { command: &'static str },
    #[error("{command} only takes one argument")]
    TooManyArguments { command: &'static str },
    #[error("{command} takes no arguments")]
    UnexpectedArgument { command: &'static str },
    #[error("invalid argument {arg}, must be one of [{}]", .allowed.join(", "))]
    InvalidArgument {
        arg: String,
        allowed: &'static [&'static str],
    },
}

pub fn is_command(line: &str) -> bool {
    line.trim_start().starts_with(SENTINEL)
}

/// Classify and validate one line of input.
pub fn parse(line: &str) -> Result<Input, CommandError> {
    if line.trim().is_empty() {
        return Ok(Input::Empty);
    }
    if !is_command(line) {
        return Ok(Input::Query(line.to_string()));
    }

    let words = shell_words::split(line).map_err(|_| CommandError::Malformed)?;
    let Some((first, args)) = words.split_first() else {
        return Err(CommandError::Malformed);
    };
    let Some(command) = Command::from_name(first) else {
        return Err(CommandError::Unknown {
            word: first.clone(),
            suggestion: suggest(first),
        });
    };

    validate(command, args).map(Input::Command)
}

fn validate(command: Command, args: &[String]) -> Result<Invocation, CommandError> {
    let name = command.name();
    match command.arity() {
        Arity::None => {
            if !args.is_empty() {
                return Err(CommandError::UnexpectedArgument { command: name });
            }
        }
        Arity::Optional => {
            if args.len() > 1 {
                return Err(CommandError::TooManyArguments { command: name });
            }
        }
        Arity::OneOf(allowed) => match args {
            [] => return Err(CommandError::MissingArgument { command: name }),
            [arg] if !allowed.contains(&arg.as_str()) => {
                return Err(CommandError::InvalidArgument {
                    arg: arg.clone(),
                    allowed,
                });
            }
            [_] => {}
            _ => return Err(CommandError::TooManyArguments { command: name }),
        },
    }

    let arg = args.first().cloned();
    Ok(match command {
        Command::Select => match arg.as_deref().and_then(Selectable::from_name) {
            Some(s) => Invocation::Select(s),
            None => return Err(CommandError::MissingArgument { command: name }),
        },
        Command::Toggle => match arg.as_deref().and_then(Togglable::from_name) {
            Some(t) => Invocation::Toggle(t),
            None => return Err(CommandError::MissingArgument { command: name }),
        },
        Command::Key => Invocation::Key(arg),
        Command::Instruct => Invocation::Instruct(arg),
        Command::Status => Invocation::Status,
        Command::Mute => Invocation::Mute,
        Command::Cmd => Invocation::Cmd,
        Command::Commands => Invocation::Commands,
        Command::Clear => Invocation::Clear,
        Command::Exit => Invocation::Exit,
    })
}

// ── Misspelling suggestion ────────────────────────────────────────────────────

/// Known command closest to `word`. Candidates whose first two characters
/// differ from the word's are scored at 80%.
pub fn suggest(word: &str) -> &'static str {
    let head = |s: &str| s.chars().take(2).collect::<String>();
    let word_head = head(word);
    let score = |name: &str| {
        let penalty = if head(name) != word_head { 0.8 } else { 1.0 };
        similarity::ratio(word, name) * penalty
    };

    let mut best = Command::ALL[0].name();
    let mut best_score = score(best);
    for command in &Command::ALL[1..] {
        let s = score(command.name());
        if s > best_score {
            best = command.name();
            best_score = s;
        }
    }
    best
}

// ── Completion ────────────────────────────────────────────────────────────────

/// Completion candidates for a partial line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Byte offset in the line where the completed token starts
    pub start: usize,
    pub candidates: Vec<&'static str>,
}

/// Everything that could complete the token under the cursor at the end of `line`.
pub fn complete(line: &str) -> Completion {
    let trimmed = line.trim_start();
    let offset = line.len() - trimmed.len();
    if !trimmed.starts_with(SENTINEL) {
        return Completion::default();
    }

    let mut parts = trimmed.split_whitespace();
    let first = parts.next().unwrap_or("");
    let second = parts.next();
    if parts.next().is_some() {
        return Completion::default();
    }
    let ends_with_space = trimmed.ends_with(char::is_whitespace);

    match second {
        None if !ends_with_space => Completion {
            start: offset,
            candidates: Command::ALL
                .iter()
                .map(|c| c.name())
                .filter(|name| name.starts_with(first))
                .collect(),
        },
        Some(_) if ends_with_space => Completion::default(),
        _ => {
            let Some(command) = Command::from_name(first) else {
                return Completion::default();
            };
            let partial = second.unwrap_or("");
            Completion {
                start: line.len() - partial.len(),
                candidates: command
                    .domain()
                    .iter()
                    .copied()
                    .filter(|v| v.starts_with(partial))
                    .collect(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(line: &str) -> Invocation {
        match parse(line) {
            Ok(Input::Command(inv)) => inv,
            other => panic!("expected a command for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_and_blank_are_empty() {
        assert_eq!(parse(""), Ok(Input::Empty));
        assert_eq!(parse("   "), Ok(Input::Empty));
        assert_eq!(parse("\t\n"), Ok(Input::Empty));
    }

    #[test]
    fn test_plain_text_is_a_query() {
        assert_eq!(
            parse("what is the capital of peru"),
            Ok(Input::Query("what is the capital of peru".to_string()))
        );
        // colon later in the line doesn't make it a command
        assert!(matches!(parse("time: now?"), Ok(Input::Query(_))));
    }

    #[test]
    fn test_quoted_argument_is_one_token() {
        assert_eq!(
            command(":instruct \"be concise please\""),
            Invocation::Instruct(Some("be concise please".to_string()))
        );
        assert_eq!(command(":instruct"), Invocation::Instruct(None));
    }

    #[test]
    fn test_unbalanced_quote_is_malformed() {
        assert_eq!(parse(":instruct \"oops"), Err(CommandError::Malformed));
        assert_eq!(CommandError::Malformed.to_string(), "invalid command");
    }

    #[test]
    fn test_select_and_toggle_domains() {
        assert_eq!(command(":select voice"), Invocation::Select(Selectable::Voice));
        assert_eq!(command(":select lm"), Invocation::Select(Selectable::Lm));
        assert_eq!(command("  :toggle context"), Invocation::Toggle(Togglable::Context));
        assert_eq!(command(":toggle hearing"), Invocation::Toggle(Togglable::Hearing));
    }

    #[test]
    fn test_arity_diagnostics() {
        assert_eq!(
            parse(":select").unwrap_err().to_string(),
            ":select needs an argument"
        );
        assert_eq!(
            parse(":toggle speech context").unwrap_err().to_string(),
            ":toggle only takes one argument"
        );
        assert_eq!(
            parse(":status now").unwrap_err().to_string(),
            ":status takes no arguments"
        );
        assert_eq!(
            parse(":key a b").unwrap_err().to_string(),
            ":key only takes one argument"
        );
    }

    #[test]
    fn test_invalid_argument_lists_domain() {
        let err = parse(":toggle music").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid argument music, must be one of [speech, hearing, context]"
        );
        assert!(matches!(parse(":select banana"), Err(CommandError::InvalidArgument { .. })));
    }

    #[test]
    fn test_every_command_parses_by_name() {
        for c in Command::ALL {
            let line = match c.domain().first() {
                Some(arg) => format!("{} {arg}", c.name()),
                None => c.name().to_string(),
            };
            assert!(matches!(parse(&line), Ok(Input::Command(_))), "{line}");
        }
    }

    #[test]
    fn test_misspelling_suggestions() {
        assert_eq!(suggest(":toogle"), ":toggle");
        assert_eq!(suggest(":selct"), ":select");
        assert_eq!(suggest(":exot"), ":exit");
        assert_eq!(suggest(":stauts"), ":status");
        assert_eq!(
            parse(":toogle speech").unwrap_err().to_string(),
            "command not found, did you mean ':toggle'?"
        );
    }

    #[test]
    fn test_complete_command_names() {
        let c = complete(":c");
        assert_eq!(c.start, 0);
        assert_eq!(c.candidates, vec![":cmd", ":commands", ":clear"]);

        let c = complete("  :st");
        assert_eq!(c.start, 2);
        assert_eq!(c.candidates, vec![":status"]);

        assert!(complete(":zzz").candidates.is_empty());
    }

    #[test]
    fn test_complete_arguments() {
        let c = complete(":toggle ");
        assert_eq!(c.start, 8);
        assert_eq!(c.candidates, vec!["speech", "hearing", "context"]);

        let c = complete(":select v");
        assert_eq!(c.start, 8);
        assert_eq!(c.candidates, vec!["voice"]);

        // commands without a domain, unknown commands, and finished arguments
        assert!(complete(":status ").candidates.is_empty());
        assert!(complete(":nope x").candidates.is_empty());
        assert!(complete(":select voice ").candidates.is_empty());
        assert!(complete(":select voice x").candidates.is_empty());
    }

    #[test]
    fn test_complete_ignores_queries() {
        assert_eq!(complete("hello"), Completion::default());
        assert_eq!(complete(""), Completion::default());
    }
}
