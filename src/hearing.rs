/// Background speech recognition.
///
/// A listener captures the default microphone, cuts the stream into
/// utterances on silence and hands each utterance to whisper. Transcripts
/// arrive on the session's channel exactly like typed queries. The capture
/// and inference code needs native libraries and sits behind the `hearing`
/// feature; segmentation and resampling are plain Rust and always built.
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;

/// Whisper expects 16 kHz mono.
pub const SAMPLE_RATE: u32 = 16_000;

/// ggml model sizes offered by `:select whisper`.
pub const MODEL_SIZES: &[&str] = &[
    "tiny", "tiny.en", "base", "base.en", "small", "small.en", "medium", "medium.en", "large-v3",
];

#[cfg_attr(not(feature = "hearing"), allow(dead_code))]
const MODEL_REPO: &str = "https://huggingface.co/ggerganov/whisper.cpp/resolve/main";

/// Handle to a running listener.
pub trait Listener: Send {
    /// Stop delivering transcripts until `resume`. Audio heard meanwhile is dropped.
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    /// Release the microphone and wait for the worker to exit.
    fn stop(self: Box<Self>);
}

#[async_trait]
pub trait Hearing: Send + Sync {
    fn model_sizes(&self) -> Vec<String>;

    /// Start listening with the given whisper model; every transcript is sent
    /// on `transcripts`.
    async fn start(&self, size: &str, transcripts: UnboundedSender<String>) -> Result<Box<dyn Listener>>;
}

// ── Whisper ───────────────────────────────────────────────────────────────────

#[cfg_attr(not(feature = "hearing"), allow(dead_code))]
pub struct WhisperHearing {
    http: reqwest::Client,
    models_dir: PathBuf,
}

impl WhisperHearing {
    pub fn new(http: reqwest::Client, models_dir: PathBuf) -> Self {
        Self { http, models_dir }
    }
}

#[async_trait]
impl Hearing for WhisperHearing {
    fn model_sizes(&self) -> Vec<String> {
        MODEL_SIZES.iter().map(|s| s.to_string()).collect()
    }

    async fn start(&self, size: &str, transcripts: UnboundedSender<String>) -> Result<Box<dyn Listener>> {
        if !MODEL_SIZES.contains(&size) {
            anyhow::bail!("unknown whisper model {size}");
        }
        self.start_listener(size, transcripts).await
    }
}

#[cfg(feature = "hearing")]
impl WhisperHearing {
    async fn start_listener(&self, size: &str, transcripts: UnboundedSender<String>) -> Result<Box<dyn Listener>> {
        let model = self.models_dir.join(format!("ggml-{size}.bin"));
        crate::download::fetch_to(&self.http, &model_url(size), &model).await?;
        let english_only = size.ends_with(".en");
        let listener = tokio::task::spawn_blocking(move || capture::spawn(&model, english_only, transcripts))
            .await??;
        Ok(Box::new(listener))
    }
}

#[cfg(not(feature = "hearing"))]
impl WhisperHearing {
    async fn start_listener(&self, _size: &str, _transcripts: UnboundedSender<String>) -> Result<Box<dyn Listener>> {
        anyhow::bail!("hearing support is not built in, rebuild with `--features hearing`")
    }
}

#[cfg_attr(not(feature = "hearing"), allow(dead_code))]
fn model_url(size: &str) -> String {
    format!("{MODEL_REPO}/ggml-{size}.bin")
}

/// Hand a finished transcript to the session unless the listener was paused
/// while it was being transcribed. Returns false once the session is gone.
#[cfg_attr(not(feature = "hearing"), allow(dead_code))]
fn deliver(paused: &AtomicBool, transcripts: &UnboundedSender<String>, text: String) -> bool {
    if paused.load(Ordering::SeqCst) {
        tracing::debug!("dropping transcript heard while paused");
        return true;
    }
    transcripts.send(text).is_ok()
}

#[cfg(feature = "hearing")]
mod capture {
    use super::{Listener, Segmenter, deliver, downmix, resample};
    use anyhow::{Context, Result, anyhow};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    pub struct WhisperListener {
        paused: Arc<AtomicBool>,
        stopping: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    }

    impl Listener for WhisperListener {
        fn pause(&self) -> Result<()> {
            self.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> Result<()> {
            self.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn stop(mut self: Box<Self>) {
            self.stopping.store(true, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                if worker.join().is_err() {
                    tracing::warn!("listener thread panicked");
                }
            }
        }
    }

    /// Load the model and start the capture thread. Blocks until the
    /// microphone stream is running or has failed to open.
    pub fn spawn(model: &Path, english_only: bool, transcripts: UnboundedSender<String>) -> Result<WhisperListener> {
        let path = model.to_str().ok_or_else(|| anyhow!("non-UTF-8 model path {}", model.display()))?;
        let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
            .map_err(|e| anyhow!("failed to load whisper model: {e}"))?;

        let paused = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let worker = {
            let paused = Arc::clone(&paused);
            let stopping = Arc::clone(&stopping);
            std::thread::spawn(move || {
                run(ctx, english_only, transcripts, &paused, &stopping, ready_tx);
            })
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WhisperListener {
                paused,
                stopping,
                worker: Some(worker),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(anyhow!("listener thread exited during startup"))
            }
        }
    }

    fn run(
        ctx: WhisperContext,
        english_only: bool,
        transcripts: UnboundedSender<String>,
        paused: &AtomicBool,
        stopping: &AtomicBool,
        ready: mpsc::Sender<Result<()>>,
    ) {
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<f32>>();
        // the stream is !Send, so it lives and dies on this thread
        let (stream, device_rate) = match open_stream(audio_tx) {
            Ok(v) => v,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        tracing::info!(device_rate, "listener started");

        let mut segmenter = Segmenter::default();
        while !stopping.load(Ordering::SeqCst) {
            let chunk = match audio_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(chunk) => chunk,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            if paused.load(Ordering::SeqCst) {
                segmenter.reset();
                continue;
            }
            for utterance in segmenter.push(&resample(&chunk, device_rate)) {
                match transcribe(&ctx, &utterance, english_only) {
                    Ok(text) if !text.is_empty() => {
                        if !deliver(&paused, &transcripts, text) {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("transcription failed: {e:#}"),
                }
            }
        }
        drop(stream);
        tracing::info!("listener stopped");
    }

    fn open_stream(audio: mpsc::Sender<Vec<f32>>) -> Result<(cpal::Stream, u32)> {
        let host = cpal::default_host();
        let device = host.default_input_device().context("no default input device available")?;
        let default_config = device.default_input_config()?;
        let format = default_config.sample_format();
        let config: StreamConfig = default_config.into();
        let rate = config.sample_rate.0;
        let channels = usize::from(config.channels.max(1));
        let err_fn = |err| tracing::warn!("audio stream error: {err}");

        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    let _ = audio.send(downmix(data, channels, |s| s));
                },
                err_fn,
                None,
            )?,
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    let _ = audio.send(downmix(data, channels, |s| s as f32 / 32_768.0));
                },
                err_fn,
                None,
            )?,
            SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _| {
                    let _ = audio.send(downmix(data, channels, |s| (s as f32 - 32_768.0) / 32_768.0));
                },
                err_fn,
                None,
            )?,
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };
        stream.play()?;
        Ok((stream, rate))
    }

    fn transcribe(ctx: &WhisperContext, samples: &[f32], english_only: bool) -> Result<String> {
        let mut state = ctx.create_state().context("failed to create whisper state")?;
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if english_only {
            params.set_language(Some("en"));
        } else {
            params.set_language(Some("auto"));
        }
        params.set_print_progress(false);
        params.set_print_timestamps(false);
        params.set_print_special(false);
        params.set_print_realtime(false);
        state.full(params, samples).context("whisper inference failed")?;

        let segments = state.full_n_segments().context("failed to read segment count")?;
        let mut text = String::new();
        for i in 0..segments {
            if let Ok(segment) = state.full_get_segment_text_lossy(i) {
                text.push_str(&segment);
            }
        }
        Ok(text.replace("[BLANK_AUDIO]", "").trim().to_string())
    }
}

// ── Segmentation ──────────────────────────────────────────────────────────────

const FRAME: usize = (SAMPLE_RATE as usize) * 30 / 1000;
const MIN_SPEECH: usize = (SAMPLE_RATE as usize) / 4;
const HANGOVER: usize = (SAMPLE_RATE as usize) * 800 / 1000;
const MAX_UTTERANCE: usize = (SAMPLE_RATE as usize) * 30;
const DEFAULT_THRESHOLD: f32 = 0.02;

/// Energy-based utterance detector over 16 kHz mono samples.
///
/// An utterance opens on the first loud frame and closes after 800 ms of
/// quiet or at 30 s. Utterances with less than 250 ms of loud audio are
/// dropped as noise.
pub struct Segmenter {
    threshold: f32,
    frame: Vec<f32>,
    speech: Vec<f32>,
    voiced: usize,
    quiet: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD)
    }
}

impl Segmenter {
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            frame: Vec::with_capacity(FRAME),
            speech: Vec::new(),
            voiced: 0,
            quiet: 0,
        }
    }

    /// Feed samples, returning every utterance that completed.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut done = Vec::new();
        for &s in samples {
            self.frame.push(s);
            if self.frame.len() == FRAME {
                if let Some(utterance) = self.close_frame() {
                    done.push(utterance);
                }
            }
        }
        done
    }

    /// Drop any partial utterance.
    pub fn reset(&mut self) {
        self.frame.clear();
        self.speech.clear();
        self.voiced = 0;
        self.quiet = 0;
    }

    fn close_frame(&mut self) -> Option<Vec<f32>> {
        let loud = rms(&self.frame) >= self.threshold;
        if self.speech.is_empty() && !loud {
            self.frame.clear();
            return None;
        }
        self.speech.append(&mut self.frame);
        if loud {
            self.voiced += FRAME;
            self.quiet = 0;
        } else {
            self.quiet += FRAME;
        }
        if self.quiet >= HANGOVER || self.speech.len() >= MAX_UTTERANCE {
            let utterance = std::mem::take(&mut self.speech);
            let voiced = std::mem::take(&mut self.voiced);
            self.quiet = 0;
            return (voiced >= MIN_SPEECH).then_some(utterance);
        }
        None
    }
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

/// Average interleaved channels into mono f32.
pub fn downmix<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear resample from `from_rate` to 16 kHz.
pub fn resample(input: &[f32], from_rate: u32) -> Vec<f32> {
    if from_rate == SAMPLE_RATE || from_rate == 0 || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / SAMPLE_RATE as f64;
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud(ms: usize) -> Vec<f32> {
        vec![0.5; SAMPLE_RATE as usize * ms / 1000]
    }

    fn quiet(ms: usize) -> Vec<f32> {
        vec![0.0; SAMPLE_RATE as usize * ms / 1000]
    }

    #[test]
    fn test_silence_yields_nothing() {
        let mut seg = Segmenter::default();
        assert!(seg.push(&quiet(5_000)).is_empty());
    }

    #[test]
    fn test_speech_then_silence_yields_one_utterance() {
        let mut seg = Segmenter::default();
        let mut audio = loud(1_000);
        audio.extend(quiet(1_000));
        let out = seg.push(&audio);
        assert_eq!(out.len(), 1);
        assert!(out[0].len() >= SAMPLE_RATE as usize);
    }

    #[test]
    fn test_chunked_feed_matches_whole() {
        let mut audio = loud(700);
        audio.extend(quiet(1_000));
        audio.extend(loud(500));
        audio.extend(quiet(1_000));

        let whole = Segmenter::default().push(&audio);
        let mut seg = Segmenter::default();
        let chunked: Vec<_> = audio.chunks(317).flat_map(|c| seg.push(c)).collect();
        assert_eq!(whole.len(), 2);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_short_blip_is_dropped() {
        let mut seg = Segmenter::default();
        let mut audio = loud(60);
        audio.extend(quiet(1_000));
        assert!(seg.push(&audio).is_empty());
    }

    #[test]
    fn test_long_speech_is_capped() {
        let mut seg = Segmenter::default();
        let out = seg.push(&loud(31_000));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), MAX_UTTERANCE);
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut seg = Segmenter::default();
        assert!(seg.push(&loud(500)).is_empty());
        seg.reset();
        assert!(seg.push(&quiet(1_000)).is_empty());
    }

    #[test]
    fn test_downmix_averages_channels() {
        let stereo = [1.0f32, 0.0, 0.5, 0.5];
        assert_eq!(downmix(&stereo, 2, |s| s), vec![0.5, 0.5]);
        let pcm = [16_384i16];
        assert_eq!(downmix(&pcm, 1, |s| s as f32 / 32_768.0), vec![0.5]);
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.25; 48_000];
        let out = resample(&input, 48_000);
        assert_eq!(out.len(), 16_000);
        assert!(out.iter().all(|s| (s - 0.25).abs() < 1e-6));
        assert_eq!(resample(&input, SAMPLE_RATE).len(), input.len());
    }

    #[test]
    fn test_model_sizes() {
        assert!(MODEL_SIZES.contains(&"base.en"));
        assert!(model_url("tiny").ends_with("/ggml-tiny.bin"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hearing = WhisperHearing::new(reqwest::Client::new(), dir.path().to_path_buf());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(hearing.start("huge", tx).await.is_err());
    }

    #[test]
    fn test_transcript_dropped_while_paused() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let paused = AtomicBool::new(true);
        assert!(deliver(&paused, &tx, "ls the folder".to_string()));
        assert!(rx.try_recv().is_err());

        paused.store(false, Ordering::SeqCst);
        assert!(deliver(&paused, &tx, "what time is it".to_string()));
        assert_eq!(rx.try_recv().unwrap(), "what time is it");

        drop(rx);
        assert!(!deliver(&paused, &tx, "anyone there".to_string()));
    }
}
