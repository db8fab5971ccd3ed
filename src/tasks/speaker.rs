use std::io::{BufReader, Cursor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{env_duration_seconds, env_optional_string, env_string};
use crate::protocol::{SpeakerCommand, SpeakerEvent, VoiceSettings};

#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    pub api_url: String,
    pub voices_url: String,
    pub voice_override: Option<String>,
    pub preferred_voices: Vec<String>,
    pub locale: String,
    pub timeout: Duration,
}

impl SpeakerConfig {
    pub fn from_env() -> Self {
        Self {
            api_url: env_string("TTS_API_URL", "http://localhost:8880/v1/audio/speech"),
            voices_url: env_string("TTS_VOICES_URL", "http://localhost:8880/v1/audio/voices"),
            voice_override: env_optional_string("TTS_VOICE"),
            preferred_voices: env_string("TTS_PREFERRED_VOICES", "af_alloy,af_heart,am_adam")
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
            locale: env_string("TTS_LOCALE", "en-US"),
            timeout: env_duration_seconds("TTS_TIMEOUT_SECONDS", 30.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Request(String),
    #[error("invalid synthesis response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<VoiceEntry>,
}

/// Voice listings come back either as bare id strings or as objects
/// with metadata, depending on the synthesis service.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VoiceEntry {
    Info(VoiceInfo),
    Name(String),
}

impl VoiceEntry {
    fn into_info(self) -> VoiceInfo {
        match self {
            VoiceEntry::Info(info) => info,
            VoiceEntry::Name(id) => VoiceInfo {
                id,
                name: None,
                language: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<&'a str>,
    speed: f32,
    pitch: f32,
    volume: f32,
    response_format: &'a str,
}

#[derive(Clone)]
pub struct SynthesisClient {
    client: reqwest::Client,
    api_url: String,
    voices_url: String,
}

impl SynthesisClient {
    pub fn new(config: &SpeakerConfig) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| SynthesisError::Request(err.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            voices_url: config.voices_url.clone(),
        })
    }

    pub async fn fetch_voices(&self) -> Result<Vec<VoiceInfo>, SynthesisError> {
        let response = self
            .client
            .get(&self.voices_url)
            .send()
            .await
            .map_err(|err| SynthesisError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| SynthesisError::Request(err.to_string()))?;
        let parsed: VoicesResponse = response
            .json()
            .await
            .map_err(|err| SynthesisError::InvalidResponse(err.to_string()))?;
        Ok(parsed
            .voices
            .into_iter()
            .map(VoiceEntry::into_info)
            .collect())
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
        settings: VoiceSettings,
    ) -> Result<Vec<u8>, SynthesisError> {
        let request = SynthesisRequest {
            input: text,
            voice,
            speed: settings.rate,
            pitch: settings.pitch,
            volume: settings.volume,
            response_format: "mp3",
        };
        let response = self
            .client
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| SynthesisError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| SynthesisError::Request(err.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| SynthesisError::InvalidResponse(err.to_string()))?;
        if bytes.is_empty() {
            return Err(SynthesisError::InvalidResponse(
                "empty audio body".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

/// Picks a voice id from the service listing: explicitly preferred
/// voices first, then an exact locale match, then any voice in the
/// locale's language, then whatever the service listed first.
pub fn choose_voice(voices: &[VoiceInfo], preferred: &[String], locale: &str) -> Option<String> {
    if voices.is_empty() {
        return None;
    }
    for wanted in preferred {
        let wanted = wanted.to_lowercase();
        if let Some(voice) = voices.iter().find(|voice| {
            voice.id.to_lowercase().contains(&wanted)
                || voice
                    .name
                    .as_deref()
                    .is_some_and(|name| name.to_lowercase().contains(&wanted))
        }) {
            return Some(voice.id.clone());
        }
    }
    if let Some(voice) = voices
        .iter()
        .find(|voice| voice.language.as_deref() == Some(locale))
    {
        return Some(voice.id.clone());
    }
    let primary = locale.split('-').next().unwrap_or(locale);
    if let Some(voice) = voices.iter().find(|voice| {
        voice
            .language
            .as_deref()
            .is_some_and(|language| language.starts_with(primary))
    }) {
        return Some(voice.id.clone());
    }
    voices.first().map(|voice| voice.id.clone())
}

pub async fn run(
    rx: mpsc::Receiver<SpeakerCommand>,
    events: broadcast::Sender<SpeakerEvent>,
    shutdown: watch::Receiver<bool>,
) {
    run_with(SpeakerConfig::from_env(), rx, events, shutdown).await;
}

async fn run_with(
    config: SpeakerConfig,
    mut rx: mpsc::Receiver<SpeakerCommand>,
    events: broadcast::Sender<SpeakerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match SynthesisClient::new(&config) {
        Ok(client) => client,
        Err(err) => {
            error!("speaker failed to build http client: {}", err);
            return;
        }
    };

    let voice = match config.voice_override.clone() {
        Some(voice) => {
            info!(voice = %voice, "using configured voice");
            Some(voice)
        }
        None => match client.fetch_voices().await {
            Ok(voices) => {
                let chosen = choose_voice(&voices, &config.preferred_voices, &config.locale);
                match &chosen {
                    Some(id) => info!(voice = %id, "selected synthesis voice"),
                    None => info!("no synthesis voices reported; using service default"),
                }
                chosen
            }
            Err(err) => {
                warn!(error = %err, "voice listing failed; using service default");
                None
            }
        },
    };

    let latest = Arc::new(AtomicU64::new(0));
    let playback = PlaybackHandle::spawn(events.clone(), Arc::clone(&latest));
    let mut enabled = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = rx.recv() => match command {
                Some(SpeakerCommand::Speak { text, settings }) => {
                    if !enabled {
                        let _ = events.send(SpeakerEvent::Finished);
                        continue;
                    }
                    let generation = latest.fetch_add(1, Ordering::SeqCst) + 1;
                    playback.stop();
                    debug!(chars = text.len(), "synthesizing speech");
                    let job_client = client.clone();
                    let job_voice = voice.clone();
                    let job_playback = playback.clone();
                    let job_events = events.clone();
                    tokio::spawn(async move {
                        synthesize_and_play(
                            job_client,
                            job_voice,
                            text,
                            settings,
                            job_playback,
                            job_events,
                            generation,
                        )
                        .await;
                    });
                }
                Some(SpeakerCommand::Stop) => {
                    latest.fetch_add(1, Ordering::SeqCst);
                    playback.stop();
                }
                Some(SpeakerCommand::SetEnabled(flag)) => {
                    enabled = flag;
                    if !flag {
                        latest.fetch_add(1, Ordering::SeqCst);
                        playback.stop();
                    }
                    info!(enabled = flag, "speaker toggled");
                }
                None => break,
            },
        }
    }
    playback.shutdown();
    info!("speaker task stopped");
}

async fn synthesize_and_play(
    client: SynthesisClient,
    voice: Option<String>,
    text: String,
    settings: VoiceSettings,
    playback: PlaybackHandle,
    events: broadcast::Sender<SpeakerEvent>,
    generation: u64,
) {
    match client.synthesize(&text, voice.as_deref(), settings).await {
        Ok(data) => playback.play(data, generation),
        Err(err) => {
            warn!(error = %err, "speech synthesis failed");
            let _ = events.send(SpeakerEvent::Failed {
                message: err.to_string(),
            });
        }
    }
}

enum PlaybackCommand {
    Play { data: Vec<u8>, generation: u64 },
    Stop,
    Shutdown,
}

#[derive(Clone)]
struct PlaybackHandle {
    tx: std_mpsc::Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    fn spawn(events: broadcast::Sender<SpeakerEvent>, latest: Arc<AtomicU64>) -> Self {
        let (tx, rx) = std_mpsc::channel();
        std::thread::spawn(move || playback_loop(rx, events, latest));
        Self { tx }
    }

    fn play(&self, data: Vec<u8>, generation: u64) {
        let _ = self.tx.send(PlaybackCommand::Play { data, generation });
    }

    fn stop(&self) {
        let _ = self.tx.send(PlaybackCommand::Stop);
    }

    fn shutdown(&self) {
        let _ = self.tx.send(PlaybackCommand::Shutdown);
    }
}

/// Owns the audio device. Utterances arrive as encoded buffers; a
/// stale generation means a newer utterance or a stop already
/// superseded this one, so the buffer is discarded.
fn playback_loop(
    rx: std_mpsc::Receiver<PlaybackCommand>,
    events: broadcast::Sender<SpeakerEvent>,
    latest: Arc<AtomicU64>,
) {
    let stream = match open_output_stream() {
        Ok(stream) => stream,
        Err(err) => {
            error!("speaker failed to open output device: {}", err);
            muted_loop(rx, events);
            return;
        }
    };
    let mut current: Option<Sink> = None;

    loop {
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(PlaybackCommand::Play { data, generation }) => {
                if stop_current(&mut current) {
                    let _ = events.send(SpeakerEvent::Finished);
                }
                if latest.load(Ordering::SeqCst) != generation {
                    debug!("skipping stale utterance");
                    continue;
                }
                match start_utterance(&stream, data) {
                    Ok(sink) => current = Some(sink),
                    Err(err) => {
                        warn!("speaker playback failed: {}", err);
                        let _ = events.send(SpeakerEvent::Failed { message: err });
                    }
                }
            }
            Ok(PlaybackCommand::Stop) => {
                if stop_current(&mut current) {
                    let _ = events.send(SpeakerEvent::Finished);
                }
            }
            Ok(PlaybackCommand::Shutdown) => {
                stop_current(&mut current);
                break;
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if current.as_ref().is_some_and(|sink| sink.empty()) {
                    current = None;
                    let _ = events.send(SpeakerEvent::Finished);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// No output device. Keeps the command channel drained and answers
/// every utterance with an immediate finish.
fn muted_loop(rx: std_mpsc::Receiver<PlaybackCommand>, events: broadcast::Sender<SpeakerEvent>) {
    while let Ok(command) = rx.recv() {
        match command {
            PlaybackCommand::Play { .. } => {
                let _ = events.send(SpeakerEvent::Finished);
            }
            PlaybackCommand::Stop => {}
            PlaybackCommand::Shutdown => break,
        }
    }
}

fn start_utterance(stream: &OutputStream, data: Vec<u8>) -> Result<Sink, String> {
    if data.is_empty() {
        return Err("synthesis returned no audio".to_string());
    }
    let reader = BufReader::new(Cursor::new(data));
    let decoder = Decoder::new(reader).map_err(|err| format!("decode failed: {}", err))?;
    let sink = Sink::connect_new(stream.mixer());
    sink.append(decoder);
    sink.play();
    Ok(sink)
}

fn stop_current(current: &mut Option<Sink>) -> bool {
    match current.take() {
        Some(sink) => {
            sink.stop();
            true
        }
        None => false,
    }
}

fn open_output_stream() -> Result<OutputStream, String> {
    let host = cpal::default_host();
    let requested =
        env_optional_string("PLAYBACK_DEVICE").or_else(|| env_optional_string("AUDIO_CARD"));
    let Some(name) = requested else {
        return OutputStreamBuilder::open_default_stream()
            .map_err(|err| format!("default output device failed: {}", err));
    };
    let device = host
        .output_devices()
        .map_err(|err| format!("failed to list output devices: {}", err))?
        .find(|device| device.name().map(|n| n.contains(&name)).unwrap_or(false))
        .ok_or_else(|| format!("output device '{}' not found", name))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let stream = OutputStreamBuilder::from_device(device)
        .and_then(|builder| builder.open_stream())
        .map_err(|err| format!("output device '{}' failed: {}", device_name, err))?;
    info!("using output device: '{}'", device_name);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: &str, name: Option<&str>, language: Option<&str>) -> VoiceInfo {
        VoiceInfo {
            id: id.to_string(),
            name: name.map(str::to_string),
            language: language.map(str::to_string),
        }
    }

    #[test]
    fn preferred_voice_wins() {
        let voices = vec![
            voice("bf_emma", Some("Emma"), Some("en-GB")),
            voice("af_heart", Some("Heart"), Some("en-US")),
        ];
        let preferred = vec!["af_heart".to_string()];
        assert_eq!(
            choose_voice(&voices, &preferred, "en-US").as_deref(),
            Some("af_heart")
        );
    }

    #[test]
    fn preferred_matches_display_name() {
        let voices = vec![
            voice("voice-1", Some("British English"), Some("en-GB")),
            voice("voice-2", Some("US English"), Some("en-US")),
        ];
        let preferred = vec!["us english".to_string()];
        assert_eq!(
            choose_voice(&voices, &preferred, "fr-FR").as_deref(),
            Some("voice-2")
        );
    }

    #[test]
    fn locale_match_beats_listing_order() {
        let voices = vec![
            voice("de_voice", None, Some("de-DE")),
            voice("us_voice", None, Some("en-US")),
        ];
        assert_eq!(
            choose_voice(&voices, &[], "en-US").as_deref(),
            Some("us_voice")
        );
    }

    #[test]
    fn language_prefix_is_enough() {
        let voices = vec![
            voice("de_voice", None, Some("de-DE")),
            voice("gb_voice", None, Some("en-GB")),
        ];
        assert_eq!(
            choose_voice(&voices, &[], "en-US").as_deref(),
            Some("gb_voice")
        );
    }

    #[test]
    fn falls_back_to_first_listed_voice() {
        let voices = vec![voice("anything", None, None)];
        assert_eq!(
            choose_voice(&voices, &["missing".to_string()], "en-US").as_deref(),
            Some("anything")
        );
        assert_eq!(choose_voice(&[], &[], "en-US"), None);
    }

    #[test]
    fn voice_listing_accepts_strings_and_objects() {
        let raw = r#"{"voices":["af_alloy",{"id":"bf_emma","name":"Emma","language":"en-GB"}]}"#;
        let parsed: VoicesResponse = serde_json::from_str(raw).expect("parse");
        let voices: Vec<VoiceInfo> = parsed
            .voices
            .into_iter()
            .map(VoiceEntry::into_info)
            .collect();
        assert_eq!(voices[0].id, "af_alloy");
        assert_eq!(voices[0].language, None);
        assert_eq!(voices[1].id, "bf_emma");
        assert_eq!(voices[1].name.as_deref(), Some("Emma"));
        assert_eq!(voices[1].language.as_deref(), Some("en-GB"));
    }

    #[test]
    fn synthesis_request_serializes_expected_fields() {
        let request = SynthesisRequest {
            input: "hello",
            voice: Some("af_heart"),
            speed: 1.1,
            pitch: 1.0,
            volume: 1.0,
            response_format: "mp3",
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["input"], "hello");
        assert_eq!(value["voice"], "af_heart");
        assert!((value["speed"].as_f64().expect("speed") - 1.1).abs() < 1e-6);
        assert_eq!(value["response_format"], "mp3");

        let without_voice = SynthesisRequest {
            voice: None,
            ..request
        };
        let value = serde_json::to_value(&without_voice).expect("serialize");
        assert!(value.get("voice").is_none());
    }

    /// Nothing listens on the loopback address, so any synthesis call
    /// fails fast; the voice override skips the startup voice listing.
    fn offline_config() -> SpeakerConfig {
        SpeakerConfig {
            api_url: "http://127.0.0.1:1/v1/audio/speech".to_string(),
            voices_url: "http://127.0.0.1:1/v1/audio/voices".to_string(),
            voice_override: Some("af_heart".to_string()),
            preferred_voices: vec![],
            locale: "en-US".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn disabled_speaker_still_reports_finished() {
        let (tx, rx) = mpsc::channel(4);
        let (events_tx, mut events_rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_with(offline_config(), rx, events_tx, shutdown_rx));

        tx.send(SpeakerCommand::SetEnabled(false))
            .await
            .expect("toggle");
        tx.send(SpeakerCommand::Speak {
            text: "hello".to_string(),
            settings: VoiceSettings::default(),
        })
        .await
        .expect("speak");

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("finish event in time")
            .expect("events channel open");
        assert!(matches!(event, SpeakerEvent::Finished));

        shutdown_tx.send(true).expect("shutdown");
        task.await.expect("speaker task");
    }

    #[tokio::test]
    async fn synthesis_failure_is_broadcast() {
        let (tx, rx) = mpsc::channel(4);
        let (events_tx, mut events_rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_with(offline_config(), rx, events_tx, shutdown_rx));

        tx.send(SpeakerCommand::Speak {
            text: "hello".to_string(),
            settings: VoiceSettings::default(),
        })
        .await
        .expect("speak");

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("failure event in time")
            .expect("events channel open");
        assert!(matches!(event, SpeakerEvent::Failed { .. }));

        shutdown_tx.send(true).expect("shutdown");
        task.await.expect("speaker task");
    }
}
