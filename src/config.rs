use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ── Provider ──────────────────────────────────────────────────────────────────

/// Remote API that generates responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Groq,
    Gemini,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Groq, Provider::Gemini];

    pub fn name(self) -> &'static str {
        match self {
            Provider::Groq => "groq",
            Provider::Gemini => "gemini",
        }
    }

    /// Model used until the user picks one with `:select lm`.
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Groq => "llama-3.3-70b-versatile",
            Provider::Gemini => "gemini-2.0-flash",
        }
    }

    /// Environment variable consulted when no key has been stored.
    pub fn key_env(self) -> &'static str {
        match self {
            Provider::Groq => "GROQ_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown provider '{s}'"))
    }
}

// ── Settings sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// None = the provider's default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_voice")]
    pub voice: String,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            voice: default_voice(),
        }
    }
}

fn default_voice() -> String {
    crate::speech::DEFAULT_VOICE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HearingSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Whisper model size, e.g. "base.en". None until the user picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Everything the user can change from the prompt. Every field has a default
/// so settings files written by older versions keep loading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub provider: Provider,
    /// System instruction sent with every query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Send prior exchanges along with each query
    #[serde(default)]
    pub context_enabled: bool,
    /// Shell launched by `:cmd`. None = platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,

    // Tables last: TOML needs plain values before sub-tables.
    #[serde(default)]
    pub groq: ProviderSettings,
    #[serde(default)]
    pub gemini: ProviderSettings,
    #[serde(default)]
    pub speech: SpeechSettings,
    #[serde(default)]
    pub hearing: HearingSettings,
}

impl Settings {
    /// Load from disk, or return defaults if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings at {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse settings at {}", path.display()))
    }

    /// Write the full record to disk, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, raw)
            .with_context(|| format!("Failed to write settings to {}", path.display()))
    }

    fn provider_settings(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::Groq => &self.groq,
            Provider::Gemini => &self.gemini,
        }
    }

    fn provider_settings_mut(&mut self, provider: Provider) -> &mut ProviderSettings {
        match provider {
            Provider::Groq => &mut self.groq,
            Provider::Gemini => &mut self.gemini,
        }
    }

    /// Model of the selected provider.
    pub fn model(&self) -> &str {
        self.provider_settings(self.provider)
            .model
            .as_deref()
            .unwrap_or(self.provider.default_model())
    }

    pub fn set_model(&mut self, model: String) {
        let provider = self.provider;
        self.provider_settings_mut(provider).model = Some(model);
    }

    /// API key of the selected provider, falling back to its environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.provider_settings(self.provider)
            .key
            .clone()
            .or_else(|| std::env::var(self.provider.key_env()).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn set_api_key(&mut self, key: String) {
        let provider = self.provider;
        self.provider_settings_mut(provider).key = Some(key);
    }

    /// Empty text clears the instruction.
    pub fn set_instruction(&mut self, text: String) {
        let text = text.trim();
        self.instruction = if text.is_empty() { None } else { Some(text.to_string()) };
    }

    pub fn toggle_context(&mut self) -> bool {
        self.context_enabled = !self.context_enabled;
        self.context_enabled
    }

    pub fn add_usage(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(completion_tokens);
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

const APP_DIR: &str = "isaac";

/// `~/.config/isaac` on Linux, `~/Library/Application Support/isaac` on macOS,
/// `%APPDATA%\isaac` on Windows. None on platforms without a per-user config dir.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR))
}

pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("settings.toml"))
}

/// Downloaded models and the log file live here.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trips_through_name() {
        for p in Provider::ALL {
            assert_eq!(p.name().parse::<Provider>().unwrap(), p);
        }
        assert!("openai".parse::<Provider>().is_err());
    }

    #[test]
    fn test_model_falls_back_to_provider_default() {
        let mut s = Settings::default();
        assert_eq!(s.model(), Provider::Groq.default_model());
        s.provider = Provider::Gemini;
        assert_eq!(s.model(), Provider::Gemini.default_model());
        s.set_model("gemini-1.5-pro".to_string());
        assert_eq!(s.model(), "gemini-1.5-pro");
        // groq keeps its own model
        s.provider = Provider::Groq;
        assert_eq!(s.model(), Provider::Groq.default_model());
    }

    #[test]
    fn test_api_key_is_per_provider() {
        let mut s = Settings::default();
        s.set_api_key("gsk-123".to_string());
        assert_eq!(s.groq.key.as_deref(), Some("gsk-123"));
        assert_eq!(s.gemini.key, None);
    }

    #[test]
    fn test_set_instruction_blank_clears() {
        let mut s = Settings::default();
        s.set_instruction("  be brief ".to_string());
        assert_eq!(s.instruction.as_deref(), Some("be brief"));
        s.set_instruction("   ".to_string());
        assert_eq!(s.instruction, None);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "provider = \"gemini\"\n\n[speech]\nenabled = true\n").unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.provider, Provider::Gemini);
        assert!(s.speech.enabled);
        assert_eq!(s.speech.voice, crate::speech::DEFAULT_VOICE);
        assert!(!s.context_enabled);
        assert_eq!(s.hearing.model, None);
    }

    #[test]
    fn test_save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let mut s = Settings {
            provider: Provider::Gemini,
            context_enabled: true,
            shell: Some("/bin/zsh".to_string()),
            ..Default::default()
        };
        s.set_model("gemini-1.5-flash".to_string());
        s.set_api_key("AIza-test".to_string());
        s.set_instruction("answer in one sentence".to_string());
        s.hearing.model = Some("base.en".to_string());
        s.add_usage(12, 34);
        s.save(&path).unwrap();

        assert_eq!(Settings::load(&path).unwrap(), s);
    }

    #[test]
    fn test_garbage_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "provider = [").unwrap();
        assert!(Settings::load(&path).is_err());
    }
}
