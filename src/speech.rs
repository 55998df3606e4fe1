/// Spoken responses through piper.
///
/// Synthesis writes a wav file with the `piper` binary, then a platform
/// player reads it aloud. Both run on a background thread so the prompt
/// comes back immediately; `mute` kills whichever process is running.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::download;

pub const DEFAULT_VOICE: &str = "en_US-amy-medium";

/// Piper voices offered by `:select voice`.
pub const VOICES: &[&str] = &[
    "en_US-amy-medium",
    "en_US-arctic-medium",
    "en_US-bryce-medium",
    "en_US-danny-low",
    "en_US-hfc_female-medium",
    "en_US-hfc_male-medium",
    "en_US-joe-medium",
    "en_US-john-medium",
    "en_US-kathleen-low",
    "en_US-kristin-medium",
    "en_US-kusal-medium",
    "en_US-l2arctic-medium",
    "en_US-lessac-medium",
    "en_US-libritts-high",
    "en_US-libritts_r-medium",
    "en_US-ljspeech-medium",
    "en_US-norman-medium",
    "en_US-ryan-medium",
    "en_GB-alan-medium",
    "en_GB-alba-medium",
    "en_GB-cori-medium",
    "en_GB-jenny_dioco-medium",
    "en_GB-northern_english_male-medium",
    "en_GB-semaine-medium",
    "en_GB-southern_english_female-low",
    "en_GB-vctk-medium",
];

const VOICE_REPO: &str = "https://huggingface.co/rhasspy/piper-voices/resolve/main";

pub const PIPER: &str = "piper";

#[async_trait]
pub trait Speaker: Send + Sync {
    /// Voice identifiers the user may pick from.
    fn voices(&self) -> Vec<String>;

    /// Make `voice` ready to speak (download it if needed).
    async fn prepare(&self, voice: &str) -> Result<()>;

    /// Start speaking `text`, interrupting anything already playing.
    fn speak(&self, text: &str, voice: &str) -> Result<()>;

    fn mute(&self);
}

// ── Piper ─────────────────────────────────────────────────────────────────────

pub struct PiperSpeaker {
    http: reqwest::Client,
    voices_dir: PathBuf,
    /// Process currently synthesising or playing
    current: Arc<Mutex<Option<Child>>>,
    /// Bumped by every speak/mute so stale playback threads stop early
    generation: Arc<AtomicU64>,
}

impl PiperSpeaker {
    pub fn new(http: reqwest::Client, voices_dir: PathBuf) -> Self {
        Self {
            http,
            voices_dir,
            current: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn model_path(&self, voice: &str) -> PathBuf {
        self.voices_dir.join(format!("{voice}.onnx"))
    }

    fn kill_current(&self) {
        let mut slot = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = slot.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[async_trait]
impl Speaker for PiperSpeaker {
    fn voices(&self) -> Vec<String> {
        VOICES.iter().map(|v| v.to_string()).collect()
    }

    async fn prepare(&self, voice: &str) -> Result<()> {
        let base = voice_url(voice)?;
        let model = self.model_path(voice);
        let config = self.voices_dir.join(format!("{voice}.onnx.json"));
        download::fetch_to(&self.http, &format!("{base}.onnx"), &model).await?;
        download::fetch_to(&self.http, &format!("{base}.onnx.json"), &config).await?;
        Ok(())
    }

    fn speak(&self, text: &str, voice: &str) -> Result<()> {
        let model = self.model_path(voice);
        if !model.exists() {
            return Err(anyhow!("voice {voice} is not downloaded"));
        }
        let text = speakable(text);
        if text.is_empty() {
            return Ok(());
        }

        self.mute();
        let generation = self.generation.load(Ordering::SeqCst);
        let current = Arc::clone(&self.current);
        let latest = Arc::clone(&self.generation);
        let wav = std::env::temp_dir().join(format!("isaac-speech-{}-{generation}.wav", std::process::id()));

        std::thread::spawn(move || {
            if let Err(e) = synthesise_and_play(&model, &text, &wav, generation, &current, &latest) {
                tracing::warn!("speech failed: {e:#}");
            }
            let _ = std::fs::remove_file(&wav);
        });
        Ok(())
    }

    fn mute(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.kill_current();
    }
}

fn synthesise_and_play(
    model: &Path,
    text: &str,
    wav: &Path,
    generation: u64,
    current: &Mutex<Option<Child>>,
    latest: &AtomicU64,
) -> Result<()> {
    let mut piper = Command::new(PIPER)
        .arg("--model")
        .arg(model)
        .arg("--output_file")
        .arg(wav)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to start piper")?;
    if let Some(mut stdin) = piper.stdin.take() {
        stdin.write_all(text.as_bytes())?;
    }
    if !run_tracked(piper, generation, current, latest)? {
        return Ok(());
    }

    let player = player_command(wav)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to start audio player")?;
    run_tracked(player, generation, current, latest)?;
    Ok(())
}

/// Park `child` where `mute` can reach it and wait for it. Returns false when
/// it was muted before finishing.
fn run_tracked(
    child: Child,
    generation: u64,
    current: &Mutex<Option<Child>>,
    latest: &AtomicU64,
) -> Result<bool> {
    {
        let mut slot = current.lock().unwrap_or_else(|p| p.into_inner());
        if latest.load(Ordering::SeqCst) != generation {
            let mut child = child;
            let _ = child.kill();
            let _ = child.wait();
            return Ok(false);
        }
        *slot = Some(child);
    }
    loop {
        std::thread::sleep(Duration::from_millis(50));
        let mut slot = current.lock().unwrap_or_else(|p| p.into_inner());
        if latest.load(Ordering::SeqCst) != generation {
            return Ok(false);
        }
        let Some(child) = slot.as_mut() else {
            return Ok(false);
        };
        if let Some(status) = child.try_wait()? {
            slot.take();
            return Ok(status.success());
        }
    }
}

fn player_command(wav: &Path) -> Command {
    if cfg!(target_os = "macos") {
        let mut cmd = Command::new("afplay");
        cmd.arg(wav);
        cmd
    } else if cfg!(windows) {
        let mut cmd = Command::new("powershell.exe");
        cmd.arg("-NoProfile").arg("-Command").arg(format!(
            "(New-Object Media.SoundPlayer '{}').PlaySync()",
            wav.display()
        ));
        cmd
    } else {
        let mut cmd = Command::new("aplay");
        cmd.arg("-q").arg(wav);
        cmd
    }
}

/// `en_US-amy-medium` → `.../en/en_US/amy/medium/en_US-amy-medium`
fn voice_url(voice: &str) -> Result<String> {
    let mut parts = voice.splitn(3, '-');
    let (Some(locale), Some(name), Some(quality)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("malformed voice id {voice}"));
    };
    let family = locale.split('_').next().unwrap_or(locale);
    Ok(format!("{VOICE_REPO}/{family}/{locale}/{name}/{quality}/{voice}"))
}

/// Strip markdown decoration that would otherwise be read out.
pub fn speakable(text: &str) -> String {
    text.lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .map(|l| {
            l.trim_start_matches(|c: char| c == '#' || c == '>' || c.is_whitespace())
                .replace(['*', '`', '_'], "")
        })
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether `program` can be found on PATH.
pub fn on_path(program: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_voice_is_offered() {
        assert!(VOICES.contains(&DEFAULT_VOICE));
    }

    #[test]
    fn test_every_voice_has_a_url() {
        for v in VOICES {
            assert!(voice_url(v).is_ok(), "{v}");
        }
    }

    #[test]
    fn test_voice_url_layout() {
        assert_eq!(
            voice_url("en_GB-southern_english_female-low").unwrap(),
            format!("{VOICE_REPO}/en/en_GB/southern_english_female/low/en_GB-southern_english_female-low")
        );
        assert!(voice_url("amy").is_err());
    }

    #[test]
    fn test_speakable_strips_markdown() {
        let text = "# Title\n\n**Lima** is the `capital`.\n```\ncode\n```\n> quoted";
        assert_eq!(speakable(text), "Title\nLima is the capital.\ncode\nquoted");
    }

    #[test]
    fn test_speak_without_model_fails() {
        let dir = tempfile::tempdir().unwrap();
        let speaker = PiperSpeaker::new(reqwest::Client::new(), dir.path().to_path_buf());
        assert!(speaker.speak("hello", DEFAULT_VOICE).is_err());
    }

    #[test]
    fn test_mute_when_silent_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let speaker = PiperSpeaker::new(reqwest::Client::new(), dir.path().to_path_buf());
        speaker.mute();
        speaker.mute();
        assert!(speaker.current.lock().unwrap().is_none());
    }

    #[test]
    fn test_on_path() {
        assert!(!on_path("isaac-no-such-program-xyz"));
    }
}
