/// The interactive loop.
///
/// A `Session` owns everything that changes while the assistant runs: the
/// settings, the conversation history, the collaborators and the active
/// listener if any. Each iteration waits for either a typed line or a
/// transcript, handles it to completion, then goes back to waiting.
use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::client::{Exchange, LanguageModel, Request};
use crate::commands::{self, Command, Input, Invocation, Selectable, Togglable};
use crate::config::{Provider, Settings};
use crate::hearing::{Hearing, Listener};
use crate::input::{LineSource, ReadOutcome};
use crate::shell::{self, Shell};
use crate::speech::Speaker;
use crate::{status, ui};

const QUERY_FAILED: &str = "could not process that query, something went wrong";

/// External services a session drives.
pub struct Collaborators {
    pub lm: Box<dyn LanguageModel>,
    pub speaker: Box<dyn Speaker>,
    pub hearing: Box<dyn Hearing>,
    pub shell: Box<dyn Shell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

enum Event {
    Typed(ReadOutcome),
    Heard(String),
}

pub struct Session {
    settings: Settings,
    /// Where `:exit` persists settings. None skips persistence.
    settings_path: Option<PathBuf>,
    lm: Box<dyn LanguageModel>,
    speaker: Box<dyn Speaker>,
    hearing: Box<dyn Hearing>,
    shell: Box<dyn Shell>,
    listener: Option<Box<dyn Listener>>,
    history: Vec<Exchange>,
    heard_tx: UnboundedSender<String>,
    heard_rx: UnboundedReceiver<String>,
    /// Notified on Ctrl-C while a request or download is in flight
    interrupt: Arc<Notify>,
}

impl Session {
    pub fn new(settings: Settings, settings_path: Option<PathBuf>, collaborators: Collaborators) -> Self {
        let (heard_tx, heard_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            settings,
            settings_path,
            lm: collaborators.lm,
            speaker: collaborators.speaker,
            hearing: collaborators.hearing,
            shell: collaborators.shell,
            listener: None,
            history: Vec::new(),
            heard_tx,
            heard_rx,
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Handle the Ctrl-C watcher notifies to cancel in-flight work.
    pub fn interrupt_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.interrupt)
    }

    #[cfg(test)]
    fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run until `:exit` or end of input.
    pub async fn run(&mut self, reader: &mut dyn LineSource) -> Result<()> {
        ui::clear();
        ui::write(&ui::banner());
        self.enact().await;

        loop {
            let prompt = ui::prompt(self.listener.is_some());
            let event = tokio::select! {
                outcome = reader.read(prompt, true) => Event::Typed(outcome),
                Some(text) = self.heard_rx.recv() => Event::Heard(text),
            };
            let flow = match event {
                Event::Typed(ReadOutcome::Line(line)) => self.handle_line(&line, reader).await,
                Event::Typed(ReadOutcome::Interrupted) => {
                    ui::reset_line();
                    Flow::Continue
                }
                Event::Typed(ReadOutcome::Eof) => self.exit(),
                Event::Heard(text) => {
                    ui::render_heard(&text);
                    self.query(&text).await;
                    // the typed read is still pending, its prompt scrolled away
                    ui::redraw_prompt(ui::prompt(self.listener.is_some()));
                    Flow::Continue
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }
        tracing::info!("session ended");
        Ok(())
    }

    /// Bring collaborators in line with the loaded settings. A feature that
    /// cannot start is switched off.
    async fn enact(&mut self) {
        if self.settings.speech.enabled && !self.prepare_voice(&self.settings.speech.voice.clone()).await {
            self.settings.speech.enabled = false;
        }
        if self.settings.hearing.enabled {
            let started = match self.settings.hearing.model.clone() {
                Some(size) => self.start_listener(&size).await,
                None => false,
            };
            if !started {
                self.settings.hearing.enabled = false;
                ui::write("hearing turned off");
            }
        }
    }

    async fn handle_line(&mut self, line: &str, reader: &mut dyn LineSource) -> Flow {
        match commands::parse(line) {
            Ok(Input::Empty) => Flow::Continue,
            Ok(Input::Query(text)) => {
                self.query(&text).await;
                Flow::Continue
            }
            Ok(Input::Command(invocation)) => self.dispatch(invocation, reader).await,
            Err(e) => {
                tracing::debug!(%line, "rejected command: {e}");
                ui::write(&e.to_string());
                Flow::Continue
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    async fn query(&mut self, text: &str) {
        let Some(api_key) = self.settings.api_key() else {
            ui::write(&format!(
                "no API key for {}, set one with {}",
                self.settings.provider,
                Command::Key.name()
            ));
            return;
        };
        let history: &[Exchange] = if self.settings.context_enabled { &self.history } else { &[] };
        let request = Request {
            provider: self.settings.provider,
            model: self.settings.model(),
            api_key: &api_key,
            instruction: self.settings.instruction.as_deref(),
            history,
            query: text,
        };

        let result = self.interruptible(self.lm.ask(&request)).await;
        let reply = match result {
            Some(Ok(reply)) => reply,
            Some(Err(e)) => {
                tracing::error!("query failed: {e:#}");
                ui::write(QUERY_FAILED);
                return;
            }
            None => return,
        };

        self.settings.add_usage(reply.prompt_tokens, reply.completion_tokens);
        ui::render_response(&reply.text);
        if self.settings.speech.enabled {
            if let Err(e) = self.speaker.speak(&reply.text, &self.settings.speech.voice) {
                tracing::warn!("could not speak response: {e:#}");
            }
        }
        self.history.push(Exchange {
            query: text.to_string(),
            response: reply.text,
        });
    }

    /// Await `fut` unless Ctrl-C arrives first.
    async fn interruptible<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            _ = self.interrupt.notified() => {
                ui::reset_line();
                ui::write("cancelled");
                None
            }
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn dispatch(&mut self, invocation: Invocation, reader: &mut dyn LineSource) -> Flow {
        tracing::debug!(?invocation, "dispatch");
        match invocation {
            Invocation::Select(what) => self.select(what, reader).await,
            Invocation::Toggle(what) => self.toggle(what, reader).await,
            Invocation::Key(arg) => self.set_key(arg, reader).await,
            Invocation::Instruct(arg) => self.instruct(arg, reader).await,
            Invocation::Status => {
                ui::write(&status::render_status(&self.settings, status::memory_percent()));
            }
            Invocation::Mute => self.speaker.mute(),
            Invocation::Cmd => {
                if let Err(e) = shell::passthrough(self.listener.as_deref(), &*self.shell) {
                    tracing::warn!("shell failed: {e:#}");
                    ui::write(&format!("could not launch the shell: {e}"));
                }
            }
            Invocation::Commands => ui::write(&status::render_commands()),
            Invocation::Clear => ui::clear(),
            Invocation::Exit => return self.exit(),
        }
        Flow::Continue
    }

    async fn select(&mut self, what: Selectable, reader: &mut dyn LineSource) {
        match what {
            Selectable::Provider => {
                let options: Vec<String> = Provider::ALL.iter().map(|p| p.name().to_string()).collect();
                let Some(choice) = self.choose("provider", &options, reader).await else {
                    return;
                };
                if let Ok(provider) = choice.parse::<Provider>() {
                    self.settings.provider = provider;
                    ui::write(&format!("provider set to {provider}"));
                }
            }
            Selectable::Lm => {
                let Some(api_key) = self.settings.api_key() else {
                    ui::write(&format!(
                        "no API key for {}, set one with {}",
                        self.settings.provider,
                        Command::Key.name()
                    ));
                    return;
                };
                let provider = self.settings.provider;
                let models = match self.interruptible(self.lm.models(provider, &api_key)).await {
                    Some(Ok(models)) if !models.is_empty() => models,
                    Some(Ok(_)) => {
                        ui::write(&format!("{provider} offers no models for this key"));
                        return;
                    }
                    Some(Err(e)) => {
                        tracing::error!("model listing failed: {e:#}");
                        ui::write("could not fetch the model list");
                        return;
                    }
                    None => return,
                };
                if let Some(model) = self.choose("model", &models, reader).await {
                    ui::write(&format!("model set to {model}"));
                    self.settings.set_model(model);
                }
            }
            Selectable::Voice => {
                let voices = self.speaker.voices();
                let Some(voice) = self.choose("voice", &voices, reader).await else {
                    return;
                };
                // only a voice that is ready may replace one in use
                if self.settings.speech.enabled && !self.prepare_voice(&voice).await {
                    return;
                }
                ui::write(&format!("voice set to {voice}"));
                self.settings.speech.voice = voice;
            }
            Selectable::Whisper => {
                let sizes = self.hearing.model_sizes();
                let Some(size) = self.choose("whisper model", &sizes, reader).await else {
                    return;
                };
                ui::write(&format!("whisper model set to {size}"));
                self.settings.hearing.model = Some(size.clone());
                if let Some(listener) = self.listener.take() {
                    listener.stop();
                    if !self.start_listener(&size).await {
                        self.settings.hearing.enabled = false;
                        ui::write("hearing turned off");
                    }
                }
            }
        }
    }

    async fn toggle(&mut self, what: Togglable, reader: &mut dyn LineSource) {
        match what {
            Togglable::Speech => {
                if self.settings.speech.enabled {
                    self.speaker.mute();
                    self.settings.speech.enabled = false;
                } else if self.prepare_voice(&self.settings.speech.voice.clone()).await {
                    self.settings.speech.enabled = true;
                }
                ui::write(&format!("speech {}", ui::label_switch(self.settings.speech.enabled)));
            }
            Togglable::Context => {
                let on = self.settings.toggle_context();
                ui::write(&format!("context {}", ui::label_switch(on)));
            }
            Togglable::Hearing => {
                if let Some(listener) = self.listener.take() {
                    listener.stop();
                    self.settings.hearing.enabled = false;
                } else {
                    let size = match self.settings.hearing.model.clone() {
                        Some(size) => Some(size),
                        None => {
                            let sizes = self.hearing.model_sizes();
                            self.choose("whisper model", &sizes, reader).await
                        }
                    };
                    if let Some(size) = size {
                        if self.start_listener(&size).await {
                            self.settings.hearing.model = Some(size);
                            self.settings.hearing.enabled = true;
                        }
                    }
                }
                ui::write(&format!("hearing {}", ui::label_switch(self.settings.hearing.enabled)));
            }
        }
    }

    async fn set_key(&mut self, arg: Option<String>, reader: &mut dyn LineSource) {
        let provider = self.settings.provider;
        let key = match arg {
            Some(key) => key,
            None => match self.ask_line(&format!("{provider} API key: "), reader).await {
                Some(key) => key,
                None => return,
            },
        };
        let key = key.trim();
        if key.is_empty() {
            ui::write("key unchanged");
            return;
        }
        self.settings.set_api_key(key.to_string());
        ui::write(&format!("API key set for {provider}"));
    }

    async fn instruct(&mut self, arg: Option<String>, reader: &mut dyn LineSource) {
        let text = match arg {
            Some(text) => text,
            None => match self.ask_line("instruction: ", reader).await {
                Some(text) => text,
                None => return,
            },
        };
        self.settings.set_instruction(text);
        match self.settings.instruction {
            Some(_) => ui::write("instruction set"),
            None => ui::write("instruction cleared"),
        }
    }

    fn exit(&mut self) -> Flow {
        if let Some(path) = &self.settings_path {
            match self.settings.save(path) {
                Ok(()) => tracing::info!(path = %path.display(), "settings saved"),
                Err(e) => {
                    tracing::error!("failed to save settings: {e:#}");
                    ui::write(&format!("could not save settings: {e}"));
                }
            }
        }
        // the hearing flag stays as it is so the next run starts listening again
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        Flow::Exit
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn prepare_voice(&self, voice: &str) -> bool {
        ui::write(&format!("preparing voice {voice}..."));
        match self.interruptible(self.speaker.prepare(voice)).await {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                tracing::warn!(%voice, "voice unavailable: {e:#}");
                ui::write(&format!("could not prepare voice {voice}: {e}"));
                false
            }
            None => false,
        }
    }

    async fn start_listener(&mut self, size: &str) -> bool {
        ui::write(&format!("starting whisper {size}..."));
        let tx = self.heard_tx.clone();
        match self.interruptible(self.hearing.start(size, tx)).await {
            Some(Ok(listener)) => {
                self.listener = Some(listener);
                true
            }
            Some(Err(e)) => {
                tracing::warn!(%size, "listener failed to start: {e:#}");
                ui::write(&format!("could not start hearing: {e}"));
                false
            }
            None => false,
        }
    }

    /// Prompt for one line, kept out of history. None when cancelled.
    async fn ask_line(&self, prompt: &str, reader: &mut dyn LineSource) -> Option<String> {
        match reader.read(prompt, false).await {
            ReadOutcome::Line(line) => Some(line),
            ReadOutcome::Interrupted => {
                ui::reset_line();
                None
            }
            ReadOutcome::Eof => None,
        }
    }

    /// Show `options` as a numbered list and read a choice.
    async fn choose(&self, label: &str, options: &[String], reader: &mut dyn LineSource) -> Option<String> {
        let listing: Vec<String> = options
            .iter()
            .enumerate()
            .map(|(i, option)| format!("  {} {option}", ui::key(&format!("{}.", i + 1))))
            .collect();
        ui::write(&listing.join("\n"));

        let answer = self.ask_line(&format!("{label}: "), reader).await?;
        let picked = pick(options, &answer);
        if picked.is_none() && !answer.trim().is_empty() {
            ui::write(&format!("invalid choice {}", answer.trim()));
        }
        picked
    }
}

/// Resolve an answer to one of `options`: a 1-based number or an exact name.
fn pick(options: &[String], answer: &str) -> Option<String> {
    let answer = answer.trim();
    if answer.is_empty() {
        return None;
    }
    if let Ok(n) = answer.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| options.get(i)).cloned();
    }
    options.iter().find(|o| o.as_str() == answer).cloned()
}
