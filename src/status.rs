/// `:status` and `:commands` rendering. Both are pure over their inputs;
/// the live memory figure is sampled separately and passed in.
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::commands::{Command, Selectable, Togglable};
use crate::config::Settings;
use crate::ui::{heading, key, label_switch};

pub fn render_status(settings: &Settings, memory_percent: f64) -> String {
    let line = |name: &str, value: &str| format!("  {} {}", key(&format!("{name}:")), value);
    let lines = [
        heading("language model:"),
        line("provider", settings.provider.name()),
        line("model", settings.model()),
        line("instruction", settings.instruction.as_deref().unwrap_or("null")),
        line("context", label_switch(settings.context_enabled)),
        heading("speech:"),
        line("status", label_switch(settings.speech.enabled)),
        line("voice", &settings.speech.voice),
        heading("hearing:"),
        line("status", label_switch(settings.hearing.enabled)),
        line("model", settings.hearing.model.as_deref().unwrap_or("null")),
        heading("consumption:"),
        line("prompt tokens", &settings.prompt_tokens.to_string()),
        line("completion tokens", &settings.completion_tokens.to_string()),
        line("memory", &format!("{memory_percent:.2}%")),
    ];
    lines.join("\n")
}

pub fn render_commands() -> String {
    let mut lines = Vec::new();
    for command in Command::ALL {
        lines.push(format!("{} {}", heading(command.name()), command.summary()));
        match command {
            Command::Toggle => {
                for t in Togglable::ALL {
                    let usage = format!("{} {}", command.name(), t.name());
                    lines.push(format!("  {} to {}", key(&usage), t.summary()));
                }
            }
            Command::Select => {
                for s in Selectable::ALL {
                    let usage = format!("{} {}", command.name(), s.name());
                    lines.push(format!("  {} to {}", key(&usage), s.summary()));
                }
            }
            _ => {}
        }
    }
    lines.join("\n")
}

/// Resident memory of this process and all its descendants as a percentage
/// of total system memory.
pub fn memory_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let total = sys.total_memory();
    let Ok(root) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    if total == 0 {
        return 0.0;
    }
    tree_memory(&sys, root) as f64 / total as f64 * 100.0
}

/// Bytes resident in `root` and its descendants. On Linux sysinfo also lists
/// every thread as a child entry sharing its process's memory, so those are
/// skipped.
fn tree_memory(sys: &System, root: Pid) -> u64 {
    sys.processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .filter(|(pid, _)| descends_from(sys, **pid, root))
        .map(|(_, process)| process.memory())
        .sum()
}

fn descends_from(sys: &System, pid: Pid, root: Pid) -> bool {
    let mut current = Some(pid);
    // bounded walk guards against parent cycles in stale snapshots
    for _ in 0..64 {
        match current {
            Some(p) if p == root => return true,
            Some(p) => current = sys.process(p).and_then(|process| process.parent()),
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;

    #[test]
    fn test_status_shows_every_setting() {
        let mut settings = Settings {
            provider: Provider::Gemini,
            context_enabled: true,
            prompt_tokens: 120,
            completion_tokens: 45,
            ..Default::default()
        };
        settings.set_instruction("be terse".to_string());
        settings.hearing.model = Some("small.en".to_string());

        let out = render_status(&settings, 1.5);
        for needle in [
            "gemini",
            Provider::Gemini.default_model(),
            "be terse",
            "small.en",
            "120",
            "45",
            "1.50%",
            settings.speech.voice.as_str(),
        ] {
            assert!(out.contains(needle), "missing {needle} in\n{out}");
        }
    }

    #[test]
    fn test_status_shows_null_for_unset() {
        let out = render_status(&Settings::default(), 0.0);
        assert_eq!(out.matches("null").count(), 2);
    }

    #[test]
    fn test_status_does_not_mutate() {
        let settings = Settings {
            prompt_tokens: 9,
            completion_tokens: 3,
            ..Default::default()
        };
        let before = settings.clone();
        let _ = render_status(&settings, memory_percent());
        let _ = render_status(&settings, 0.0);
        assert_eq!(settings, before);
    }

    #[test]
    fn test_commands_catalogue_is_complete() {
        let out = render_commands();
        for c in Command::ALL {
            assert!(out.contains(c.name()));
        }
        for name in Selectable::NAMES.iter().chain(Togglable::NAMES) {
            assert!(out.contains(name), "missing {name}");
        }
    }

    #[test]
    fn test_memory_percent_is_a_percentage() {
        let pct = memory_percent();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn test_threads_are_not_counted_as_processes() {
        use std::sync::{Arc, Barrier};

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers + 1));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                })
            })
            .collect();

        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let root = sysinfo::get_current_pid().unwrap();
        let own = sys.process(root).map(|p| p.memory()).unwrap_or(0);
        let counted = tree_memory(&sys, root);

        barrier.wait();
        for handle in handles {
            handle.join().unwrap();
        }

        // counting each thread would give at least nine times our own memory
        assert!(counted >= own);
        assert!(counted < own * 2 + (16 << 20), "own={own} counted={counted}");
    }
}
