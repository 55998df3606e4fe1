/// `:cmd` shell passthrough.
///
/// The listener shares the terminal's microphone session with the user, so it
/// is paused for as long as the subshell runs. `ListenerPause` resumes it on
/// drop, which covers normal return, spawn errors and panics alike.
use anyhow::{Context, Result};
use std::process::Command;

use crate::hearing::Listener;

/// Something that runs an interactive shell and blocks until it exits.
pub trait Shell: Send + Sync {
    fn run(&self) -> Result<()>;
}

pub struct SystemShell {
    program: String,
}

impl SystemShell {
    /// `custom` comes from the settings file; otherwise the platform shell.
    pub fn new(custom: Option<&str>) -> Self {
        let program = custom
            .map(str::to_string)
            .unwrap_or_else(|| default_program().to_string());
        Self { program }
    }
}

pub fn default_program() -> &'static str {
    if cfg!(windows) { "powershell.exe" } else { "/bin/sh" }
}

impl Shell for SystemShell {
    fn run(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .status()
            .with_context(|| format!("Failed to launch {}", self.program))?;
        if !status.success() {
            tracing::debug!(shell = %self.program, ?status, "shell exited with failure");
        }
        Ok(())
    }
}

// ── Pause guard ───────────────────────────────────────────────────────────────

pub struct ListenerPause<'a> {
    listener: Option<&'a dyn Listener>,
}

impl<'a> ListenerPause<'a> {
    pub fn pause(listener: Option<&'a dyn Listener>) -> Self {
        if let Some(l) = listener {
            if let Err(e) = l.pause() {
                tracing::warn!("failed to pause listener: {e:#}");
            }
        }
        Self { listener }
    }
}

impl Drop for ListenerPause<'_> {
    fn drop(&mut self) {
        if let Some(l) = self.listener {
            if let Err(e) = l.resume() {
                tracing::warn!("failed to resume listener: {e:#}");
            }
        }
    }
}

/// Run `shell` with the listener (if any) paused.
pub fn passthrough(listener: Option<&dyn Listener>, shell: &dyn Shell) -> Result<()> {
    let _pause = ListenerPause::pause(listener);
    shell.run()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Listener that only counts calls.
    #[derive(Default, Clone)]
    pub struct CountingListener {
        pub pauses: Arc<AtomicUsize>,
        pub resumes: Arc<AtomicUsize>,
        pub stops: Arc<AtomicUsize>,
    }

    impl Listener for CountingListener {
        fn pause(&self) -> Result<()> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(self: Box<Self>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub struct FailingShell;

    impl Shell for FailingShell {
        fn run(&self) -> Result<()> {
            anyhow::bail!("spawn failed")
        }
    }

    struct OkShell;

    impl Shell for OkShell {
        fn run(&self) -> Result<()> {
            Ok(())
        }
    }

    struct PanickingShell;

    impl Shell for PanickingShell {
        fn run(&self) -> Result<()> {
            panic!("shell blew up")
        }
    }

    #[test]
    fn test_pause_and_resume_once_on_success() {
        let listener = CountingListener::default();
        passthrough(Some(&listener), &OkShell).unwrap();
        assert_eq!(listener.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_once_when_spawn_fails() {
        let listener = CountingListener::default();
        assert!(passthrough(Some(&listener), &FailingShell).is_err());
        assert_eq!(listener.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(listener.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resume_once_when_shell_panics() {
        let listener = CountingListener::default();
        let probe = listener.clone();
        let result = std::panic::catch_unwind(move || {
            let _ = passthrough(Some(&listener), &PanickingShell);
        });
        assert!(result.is_err());
        assert_eq!(probe.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(probe.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_listener_still_runs_shell() {
        assert!(passthrough(None, &OkShell).is_ok());
        assert!(passthrough(None, &FailingShell).is_err());
    }

    #[test]
    fn test_system_shell_program() {
        assert_eq!(SystemShell::new(Some("/bin/zsh")).program, "/bin/zsh");
        assert_eq!(SystemShell::new(None).program, default_program());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let shell = SystemShell::new(Some("/definitely/not/a/shell"));
        assert!(shell.run().is_err());
    }
}
