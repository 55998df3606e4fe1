/// Terminal output helpers shared by the session and the reporters.
use std::io::{self, Write};

use crossterm::{
    cursor::MoveTo,
    execute,
    style::Stylize,
    terminal::{Clear, ClearType},
};

use crate::commands::Command;

/// Print `msg` with explicit carriage returns. A transcript can be answered
/// while the line editor holds the terminal in raw mode, where a bare `\n`
/// does not return to column 0.
pub fn write(msg: &str) {
    let mut out = io::stdout().lock();
    for line in msg.lines() {
        let _ = write!(out, "{line}\r\n");
    }
    let _ = out.flush();
}

/// Return the cursor to column 0 without printing a newline (after Ctrl-C).
pub fn reset_line() {
    print!("\r");
    let _ = io::stdout().flush();
}

pub fn clear() {
    let mut out = io::stdout();
    if execute!(out, Clear(ClearType::All), MoveTo(0, 0)).is_err() {
        // not a terminal, fall back to a blank line
        println!();
    }
}

pub fn heading(s: &str) -> String {
    s.bold().cyan().to_string()
}

pub fn key(s: &str) -> String {
    s.cyan().to_string()
}

pub fn label_switch(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

pub fn banner() -> String {
    let art = r"
 ___   ____      _         _      ____
|_ _| / ___|    / \       / \    / ___|
 | |  \___ \   / _ \     / _ \  | |
 | | _ ___) | / ___ \ _ / ___ \ | |___
|___(_)____(_)_/   \_(_)_/   \_(_)____|";
    format!(
        "{}   type {} to see commands.\n",
        art.cyan(),
        Command::Commands.name().bold().cyan()
    )
}

/// `>> ` normally, `~> ` while the listener is running.
pub fn prompt(listening: bool) -> &'static str {
    if listening { "~> " } else { ">> " }
}

/// Show the prompt again for a read that is still pending, e.g. after a
/// transcript was answered underneath it.
pub fn redraw_prompt(prompt: &str) {
    let mut out = io::stdout().lock();
    let _ = write!(out, "{}", reprompt(prompt));
    let _ = out.flush();
}

fn reprompt(prompt: &str) -> String {
    format!("\r{prompt}")
}

pub fn render_response(text: &str) {
    write(&format!("\n{}\n\n", text.trim_end()));
}

/// Echo a transcript so the user can see what was heard.
pub fn render_heard(text: &str) {
    write(&format!("\r{} {}", "heard:".dark_grey(), text));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_switch() {
        assert_eq!(label_switch(true), "on");
        assert_eq!(label_switch(false), "off");
    }

    #[test]
    fn test_banner_mentions_commands() {
        assert!(banner().contains(":commands"));
    }

    #[test]
    fn test_prompt_reflects_listening() {
        assert_ne!(prompt(true), prompt(false));
    }

    #[test]
    fn test_reprompt_starts_at_column_zero() {
        let out = reprompt(prompt(true));
        assert!(out.starts_with('\r'));
        assert!(out.ends_with(prompt(true)));
        assert!(!out.contains('\n'));
    }
}
