/// Line editing for the prompt.
///
/// rustyline blocks, so the editor lives on its own thread and the session
/// talks to it over channels. That lets the main loop wait on a typed line
/// and a transcript at the same time.
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use crossterm::style::Stylize;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Editor, Helper};
use std::borrow::Cow;
use std::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::commands;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// Ctrl-C at the prompt
    Interrupted,
    /// Ctrl-D or a closed stdin
    Eof,
}

/// Source of user lines.
#[async_trait]
pub trait LineSource: Send {
    /// Show `prompt` and wait for a line. `keep` adds it to history.
    ///
    /// Must be cancel-safe: if the future is dropped before completing, the
    /// next call picks up the same pending line.
    async fn read(&mut self, prompt: &str, keep: bool) -> ReadOutcome;
}

// ── Threaded rustyline ────────────────────────────────────────────────────────

struct ReadRequest {
    prompt: String,
    keep: bool,
}

pub struct LineReader {
    requests: mpsc::Sender<ReadRequest>,
    replies: UnboundedReceiver<ReadOutcome>,
    /// A request was sent and its reply not yet taken
    pending: bool,
}

impl LineReader {
    pub fn spawn() -> Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<ReadRequest>();
        let (reply_tx, reply_rx) = tokio::sync::mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("line-editor".to_string())
            .spawn(move || editor_loop(req_rx, reply_tx, ready_tx))
            .map_err(|e| anyhow!("failed to start line editor thread: {e}"))?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("line editor thread exited during startup"))??;
        Ok(Self {
            requests: req_tx,
            replies: reply_rx,
            pending: false,
        })
    }
}

fn editor_loop(
    requests: mpsc::Receiver<ReadRequest>,
    replies: UnboundedSender<ReadOutcome>,
    ready: mpsc::Sender<Result<()>>,
) {
    let mut editor = match Editor::<CommandHelper, DefaultHistory>::new() {
        Ok(editor) => editor,
        Err(e) => {
            let _ = ready.send(Err(anyhow!("failed to initialise line editor: {e}")));
            return;
        }
    };
    editor.set_helper(Some(CommandHelper));
    let _ = ready.send(Ok(()));

    while let Ok(req) = requests.recv() {
        let outcome = match editor.readline(&req.prompt) {
            Ok(line) => {
                if req.keep && !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                ReadOutcome::Line(line)
            }
            Err(ReadlineError::Interrupted) => ReadOutcome::Interrupted,
            Err(ReadlineError::Eof) => ReadOutcome::Eof,
            Err(e) => {
                tracing::warn!("line editor error: {e}");
                ReadOutcome::Eof
            }
        };
        if replies.send(outcome).is_err() {
            break;
        }
    }
}

#[async_trait]
impl LineSource for LineReader {
    async fn read(&mut self, prompt: &str, keep: bool) -> ReadOutcome {
        if !self.pending {
            let req = ReadRequest {
                prompt: prompt.to_string(),
                keep,
            };
            if self.requests.send(req).is_err() {
                return ReadOutcome::Eof;
            }
            self.pending = true;
        }
        let outcome = self.replies.recv().await.unwrap_or(ReadOutcome::Eof);
        self.pending = false;
        outcome
    }
}

// ── Completion and hints ──────────────────────────────────────────────────────

struct CommandHelper;

impl Completer for CommandHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        let completion = commands::complete(&line[..pos]);
        let pairs = completion
            .candidates
            .into_iter()
            .map(|c| Pair {
                display: c.to_string(),
                replacement: c.to_string(),
            })
            .collect();
        Ok((completion.start, pairs))
    }
}

impl Hinter for CommandHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if pos < line.len() {
            return None;
        }
        hint_for(line)
    }
}

/// Remainder of the only candidate that completes `line`, if there is exactly one.
fn hint_for(line: &str) -> Option<String> {
    let completion = commands::complete(line);
    let [only] = completion.candidates.as_slice() else {
        return None;
    };
    let typed = &line[completion.start..];
    only.strip_prefix(typed)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

impl Highlighter for CommandHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Cow::Owned(hint.dark_grey().to_string())
    }
}

impl Validator for CommandHelper {
    fn validate(&self, _ctx: &mut ValidationContext<'_>) -> rustyline::Result<ValidationResult> {
        Ok(ValidationResult::Valid(None))
    }
}

impl Helper for CommandHelper {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_completes_unique_command() {
        assert_eq!(hint_for(":sta").as_deref(), Some("tus"));
        assert_eq!(hint_for(":toggle sp").as_deref(), Some("eech"));
    }

    #[test]
    fn test_no_hint_when_ambiguous_or_complete() {
        // :clear and :cmd and :commands
        assert_eq!(hint_for(":c"), None);
        assert_eq!(hint_for(":status"), None);
        assert_eq!(hint_for("hello"), None);
        assert_eq!(hint_for(""), None);
    }

    #[test]
    fn test_no_hint_for_unknown_argument() {
        assert_eq!(hint_for(":select zz"), None);
    }
}
