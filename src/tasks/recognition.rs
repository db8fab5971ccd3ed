use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{
    env_duration_ms, env_duration_seconds, env_optional_f32, env_optional_string,
    env_optional_u32, env_string,
};
use crate::protocol::{RecognitionCommand, RecognitionError, RecognitionEvent};

#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub capture_device: Option<String>,
    pub mock_file: Option<String>,
    pub stt_url: String,
    pub stt_timeout: Duration,
    pub speech_threshold: f32,
    pub no_speech_timeout: Duration,
    pub silence_hangover: Duration,
    pub max_utterance: Duration,
}

impl RecognitionConfig {
    pub fn from_env() -> Self {
        Self {
            sample_rate: env_optional_u32("STREAM_SAMPLE_RATE").unwrap_or(16_000),
            chunk_size: env_optional_u32("CHUNK_SIZE").unwrap_or(512) as usize,
            capture_device: env_optional_string("CAPTURE_DEVICE")
                .or_else(|| env_optional_string("AUDIO_CARD")),
            mock_file: env_optional_string("MOCK_AUDIO_FILE"),
            stt_url: env_string(
                "STT_API_URL",
                "http://localhost:8080/v1/audio/transcriptions",
            ),
            stt_timeout: env_duration_seconds("STT_TIMEOUT_SECONDS", 30.0),
            speech_threshold: env_optional_f32("SPEECH_RMS_THRESHOLD").unwrap_or(0.015),
            no_speech_timeout: env_duration_ms("NO_SPEECH_TIMEOUT_MS", 5_000),
            silence_hangover: env_duration_ms("SILENCE_HANGOVER_MS", 600),
            max_utterance: env_duration_ms("MAX_UTTERANCE_MS", 15_000),
        }
    }
}

/// Turns mono audio into text. Implementations may surface interim
/// transcripts from `on_audio_chunk`; the final transcript comes from
/// `finish`.
#[async_trait]
pub trait Transcriber: Send {
    async fn on_audio_chunk(
        &mut self,
        samples: &[i16],
        sample_rate: u32,
    ) -> Result<Option<String>, RecognitionError>;
    async fn finish(&mut self) -> Result<String, RecognitionError>;
    fn reset(&mut self);
}

/// Buffers the utterance and posts it as a WAV to an OpenAI-style
/// `/v1/audio/transcriptions` endpoint once the speaker stops.
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
    samples: Vec<i16>,
    sample_rate: u32,
}

impl HttpTranscriber {
    pub fn new(config: &RecognitionConfig) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(config.stt_timeout)
            .build()
            .map_err(|err| RecognitionError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            url: config.stt_url.clone(),
            samples: Vec::new(),
            sample_rate: config.sample_rate,
        })
    }
}

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn on_audio_chunk(
        &mut self,
        samples: &[i16],
        sample_rate: u32,
    ) -> Result<Option<String>, RecognitionError> {
        self.sample_rate = sample_rate;
        self.samples.extend_from_slice(samples);
        Ok(None)
    }

    async fn finish(&mut self) -> Result<String, RecognitionError> {
        let samples = std::mem::take(&mut self.samples);
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&samples, self.sample_rate)?;
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|err| RecognitionError::Failed(err.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("response_format", "json")
            .part("file", part);
        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| RecognitionError::Failed(format!("transcription request failed: {err}")))?
            .error_for_status()
            .map_err(|err| RecognitionError::Failed(format!("transcription request failed: {err}")))?;
        let parsed: TranscriptionResponse = response.json().await.map_err(|err| {
            RecognitionError::Failed(format!("invalid transcription response: {err}"))
        })?;
        Ok(parsed.text.trim().to_string())
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, RecognitionError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)
        .map_err(|err| RecognitionError::Failed(format!("wav encode failed: {err}")))?;
    for sample in samples {
        writer
            .write_sample(*sample)
            .map_err(|err| RecognitionError::Failed(format!("wav encode failed: {err}")))?;
    }
    writer
        .finalize()
        .map_err(|err| RecognitionError::Failed(format!("wav encode failed: {err}")))?;
    Ok(cursor.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pending,
    SpeechStarted,
    Complete,
    NoSpeech,
}

/// Energy-based utterance boundary detection. Listening ends when the
/// speaker has been quiet past the hangover window, when nothing voiced
/// arrives within the no-speech window, or at the utterance length cap.
struct Endpointer {
    threshold: f32,
    no_speech_timeout: Duration,
    silence_hangover: Duration,
    max_utterance: Duration,
    opened_at: Instant,
    speech_at: Option<Instant>,
    last_voice_at: Option<Instant>,
}

impl Endpointer {
    fn new(config: &RecognitionConfig, now: Instant) -> Self {
        Self {
            threshold: config.speech_threshold,
            no_speech_timeout: config.no_speech_timeout,
            silence_hangover: config.silence_hangover,
            max_utterance: config.max_utterance,
            opened_at: now,
            speech_at: None,
            last_voice_at: None,
        }
    }

    fn observe(&mut self, rms: f32, now: Instant) -> Verdict {
        let voiced = rms >= self.threshold;
        match self.speech_at {
            None => {
                if voiced {
                    self.speech_at = Some(now);
                    self.last_voice_at = Some(now);
                    Verdict::SpeechStarted
                } else if now.duration_since(self.opened_at) >= self.no_speech_timeout {
                    Verdict::NoSpeech
                } else {
                    Verdict::Pending
                }
            }
            Some(started) => {
                if voiced {
                    self.last_voice_at = Some(now);
                }
                if now.duration_since(started) >= self.max_utterance {
                    return Verdict::Complete;
                }
                let last = self.last_voice_at.unwrap_or(started);
                if !voiced && now.duration_since(last) >= self.silence_hangover {
                    Verdict::Complete
                } else {
                    Verdict::Pending
                }
            }
        }
    }

    fn in_speech(&self) -> bool {
        self.speech_at.is_some()
    }
}

fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|sample| {
            let value = *sample as f64 / i16::MAX as f64;
            value * value
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub async fn run(
    mut rx: mpsc::Receiver<RecognitionCommand>,
    events: broadcast::Sender<RecognitionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = RecognitionConfig::from_env();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = rx.recv() => match command {
                Some(RecognitionCommand::Start) => {
                    run_session(&config, &mut rx, &events, &mut shutdown).await;
                }
                Some(RecognitionCommand::Cancel) => {}
                None => break,
            },
        }
    }
    info!("recognition task stopped");
}

enum SessionOutcome {
    Finish,
    NoSpeech,
    Failed(RecognitionError),
    Cancelled,
}

async fn run_session(
    config: &RecognitionConfig,
    rx: &mut mpsc::Receiver<RecognitionCommand>,
    events: &broadcast::Sender<RecognitionEvent>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut transcriber: Box<dyn Transcriber> = match HttpTranscriber::new(config) {
        Ok(transcriber) => Box::new(transcriber),
        Err(err) => {
            fail(events, err);
            return;
        }
    };
    let (mut capture, mut pipeline) = match start_capture(config) {
        Ok(value) => value,
        Err(err) => {
            fail(events, err);
            return;
        }
    };
    let _ = events.send(RecognitionEvent::Started);
    info!("listening for speech");

    let mut endpointer = Endpointer::new(config, Instant::now());
    let outcome = loop {
        tokio::select! {
            _ = shutdown.changed() => break SessionOutcome::Cancelled,
            command = rx.recv() => match command {
                Some(RecognitionCommand::Cancel) => break SessionOutcome::Cancelled,
                Some(RecognitionCommand::Start) => debug!("already listening"),
                None => break SessionOutcome::Cancelled,
            },
            samples = capture.next() => match samples {
                Some(samples) => {
                    match feed(
                        &samples,
                        &mut pipeline,
                        &mut endpointer,
                        transcriber.as_mut(),
                        config,
                        events,
                    )
                    .await
                    {
                        Ok(Verdict::Complete) => break SessionOutcome::Finish,
                        Ok(Verdict::NoSpeech) => break SessionOutcome::NoSpeech,
                        Ok(_) => {}
                        Err(err) => break SessionOutcome::Failed(err),
                    }
                }
                // capture source exhausted (mock file played through)
                None => break SessionOutcome::Finish,
            },
        }
    };
    drop(capture);

    match outcome {
        SessionOutcome::Finish if endpointer.in_speech() => {
            finalize_utterance(&mut pipeline, transcriber.as_mut(), config, events).await;
        }
        SessionOutcome::Finish | SessionOutcome::NoSpeech => {
            let _ = events.send(RecognitionEvent::Failed(RecognitionError::NoSpeech));
        }
        SessionOutcome::Failed(err) => {
            warn!(error = %err, "recognition failed");
            let _ = events.send(RecognitionEvent::Failed(err));
        }
        SessionOutcome::Cancelled => {
            transcriber.reset();
            debug!("recognition cancelled");
        }
    }
    let _ = events.send(RecognitionEvent::Ended);
}

/// Runs the newly captured samples through the pipeline, watching for
/// utterance boundaries and forwarding speech to the transcriber.
async fn feed(
    samples: &[f32],
    pipeline: &mut AudioPipeline,
    endpointer: &mut Endpointer,
    transcriber: &mut dyn Transcriber,
    config: &RecognitionConfig,
    events: &broadcast::Sender<RecognitionEvent>,
) -> Result<Verdict, RecognitionError> {
    for chunk in pipeline.push_samples(samples) {
        let verdict = endpointer.observe(rms_level(&chunk), Instant::now());
        match verdict {
            Verdict::NoSpeech | Verdict::Complete => return Ok(verdict),
            Verdict::SpeechStarted => debug!("speech detected"),
            Verdict::Pending => {}
        }
        if endpointer.in_speech() {
            if let Some(partial) = transcriber.on_audio_chunk(&chunk, config.sample_rate).await? {
                let _ = events.send(RecognitionEvent::Partial { text: partial });
            }
        }
    }
    Ok(Verdict::Pending)
}

async fn finalize_utterance(
    pipeline: &mut AudioPipeline,
    transcriber: &mut dyn Transcriber,
    config: &RecognitionConfig,
    events: &broadcast::Sender<RecognitionEvent>,
) {
    if let Some(leftover) = pipeline.drain() {
        if let Err(err) = transcriber.on_audio_chunk(&leftover, config.sample_rate).await {
            warn!(error = %err, "transcription failed");
            let _ = events.send(RecognitionEvent::Failed(err));
            return;
        }
    }
    info!("utterance complete, transcribing");
    match transcriber.finish().await {
        Ok(text) if text.is_empty() => {
            let _ = events.send(RecognitionEvent::Failed(RecognitionError::NoSpeech));
        }
        Ok(text) => {
            info!(text = %text, "transcription complete");
            let _ = events.send(RecognitionEvent::Final { text });
        }
        Err(err) => {
            warn!(error = %err, "transcription failed");
            let _ = events.send(RecognitionEvent::Failed(err));
        }
    }
}

fn fail(events: &broadcast::Sender<RecognitionEvent>, err: RecognitionError) {
    warn!(error = %err, "speech capture failed");
    let _ = events.send(RecognitionEvent::Failed(err));
    let _ = events.send(RecognitionEvent::Ended);
}

struct CaptureStream {
    receiver: mpsc::Receiver<Vec<f32>>,
    shutdown: Option<std_mpsc::Sender<()>>,
}

impl CaptureStream {
    async fn next(&mut self) -> Option<Vec<f32>> {
        self.receiver.recv().await
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Downmixes captured audio to mono, resamples it to the target rate,
/// and yields fixed-size i16 chunks.
struct AudioPipeline {
    input_channels: usize,
    chunk_size: usize,
    pending: Vec<f32>,
    resampler: Option<LinearResampler>,
}

impl AudioPipeline {
    fn new(input_rate: u32, input_channels: usize, target_rate: u32, chunk_size: usize) -> Self {
        let resampler =
            (input_rate != target_rate).then(|| LinearResampler::new(input_rate, target_rate));
        Self {
            input_channels,
            chunk_size,
            pending: Vec::new(),
            resampler,
        }
    }

    fn push_samples(&mut self, input: &[f32]) -> Vec<Vec<i16>> {
        if input.is_empty() {
            return Vec::new();
        }
        let mut mono = downmix_mono(input, self.input_channels);
        if let Some(resampler) = &mut self.resampler {
            mono = resampler.process(&mono);
        }
        self.pending.extend_from_slice(&mono);
        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            chunks.push(f32_to_i16(&chunk));
        }
        chunks
    }

    fn drain(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            return None;
        }
        let leftover = std::mem::take(&mut self.pending);
        Some(f32_to_i16(&leftover))
    }
}

struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    pos: f32,
    carry: Vec<f32>,
}

impl LinearResampler {
    fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            pos: 0.0,
            carry: Vec::new(),
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }
        let mut combined = Vec::with_capacity(self.carry.len() + input.len());
        combined.extend_from_slice(&self.carry);
        combined.extend_from_slice(input);
        if combined.len() < 2 {
            self.carry = combined;
            return Vec::new();
        }

        let step = self.input_rate as f32 / self.output_rate as f32;
        let mut output = Vec::new();
        let mut pos = self.pos;
        while pos + 1.0 < combined.len() as f32 {
            let base = pos.floor() as usize;
            let frac = pos - base as f32;
            let s0 = combined[base];
            let s1 = combined[base + 1];
            output.push(s0 + (s1 - s0) * frac);
            pos += step;
        }

        // with a ratio above 2 the final step can overshoot the buffer;
        // the overhang stays in `pos` for the next call
        let keep = (pos.floor() as usize).min(combined.len());
        self.carry = combined[keep..].to_vec();
        self.pos = pos - keep as f32;
        output
    }
}

fn downmix_mono(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }
    input
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn f32_to_i16(input: &[f32]) -> Vec<i16> {
    input
        .iter()
        .map(|sample| {
            let scaled = (sample * i16::MAX as f32).round();
            scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

fn start_capture(
    config: &RecognitionConfig,
) -> Result<(CaptureStream, AudioPipeline), RecognitionError> {
    if let Some(path) = &config.mock_file {
        return start_mock_capture(path, config);
    }
    start_live_capture(config)
}

fn start_mock_capture(
    path: &str,
    config: &RecognitionConfig,
) -> Result<(CaptureStream, AudioPipeline), RecognitionError> {
    let reader = hound::WavReader::open(path)
        .map_err(|err| RecognitionError::Unavailable(format!("failed to open {path}: {err}")))?;
    let spec = reader.spec();
    let (tx, rx) = mpsc::channel(8);
    let path = path.to_string();
    let chunk_frames = config.chunk_size;
    tokio::spawn(async move {
        if let Err(err) = stream_mock_audio(&path, chunk_frames, tx).await {
            warn!(error = %err, "mock audio stream error");
        }
    });
    let pipeline = AudioPipeline::new(
        spec.sample_rate,
        spec.channels as usize,
        config.sample_rate,
        config.chunk_size,
    );
    Ok((
        CaptureStream {
            receiver: rx,
            shutdown: None,
        },
        pipeline,
    ))
}

/// Plays a WAV once at capture pace, then closes the channel so the
/// session wraps up as if the speaker had stopped.
async fn stream_mock_audio(
    path: &str,
    chunk_frames: usize,
    sender: mpsc::Sender<Vec<f32>>,
) -> Result<(), String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|err| format!("failed to read {path}: {err}"))?;
    let mut reader =
        hound::WavReader::new(std::io::Cursor::new(bytes)).map_err(|err| err.to_string())?;
    let spec = reader.spec();
    let mut samples = Vec::new();
    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|err| err.to_string())?;
        samples.push(sample as f32 / i16::MAX as f32);
    }
    let sleep_ms = ((chunk_frames as f32 / spec.sample_rate as f32) * 1000.0).max(1.0);
    for chunk in samples.chunks(chunk_frames * spec.channels as usize) {
        if sender.send(chunk.to_vec()).await.is_err() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;
    }
    Ok(())
}

fn start_live_capture(
    config: &RecognitionConfig,
) -> Result<(CaptureStream, AudioPipeline), RecognitionError> {
    let (tx, rx) = mpsc::channel(8);
    let (info_tx, info_rx) = std_mpsc::channel();
    let (shutdown_tx, shutdown_rx) = std_mpsc::channel();
    let device_name = config.capture_device.clone();
    let target_rate = config.sample_rate;

    std::thread::spawn(move || {
        match build_input_stream(device_name.as_deref(), target_rate, tx) {
            Ok((stream, info)) => {
                if let Err(err) = stream.play() {
                    let _ = info_tx.send(Err(classify_capture_error(format!(
                        "failed to start input stream: {err}"
                    ))));
                    return;
                }
                let _ = info_tx.send(Ok(info));
                while keep_capturing(&shutdown_rx) {
                    std::thread::sleep(Duration::from_millis(200));
                }
                drop(stream);
            }
            Err(err) => {
                let _ = info_tx.send(Err(err));
            }
        }
    });

    let info = info_rx
        .recv_timeout(Duration::from_secs(2))
        .map_err(|_| RecognitionError::Unavailable("timed out starting input stream".to_string()))??;

    let pipeline = AudioPipeline::new(
        info.sample_rate,
        info.channels,
        config.sample_rate,
        config.chunk_size,
    );
    Ok((
        CaptureStream {
            receiver: rx,
            shutdown: Some(shutdown_tx),
        },
        pipeline,
    ))
}

/// True while the capture thread should keep the stream alive. A
/// dropped shutdown handle counts as shutdown, including the opener
/// timing out before it ever stored the handle.
fn keep_capturing(shutdown_rx: &std_mpsc::Receiver<()>) -> bool {
    matches!(shutdown_rx.try_recv(), Err(std_mpsc::TryRecvError::Empty))
}

struct CaptureInfo {
    sample_rate: u32,
    channels: usize,
}

fn build_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    tx: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, CaptureInfo), RecognitionError> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|err| {
                classify_capture_error(format!("failed to list input devices: {err}"))
            })?
            .find(|device| device.name().map(|n| n.contains(name)).unwrap_or(false))
            .ok_or_else(|| {
                RecognitionError::Unavailable(format!("input device '{name}' not found"))
            })?,
        None => host.default_input_device().ok_or_else(|| {
            RecognitionError::Unavailable("no default input device available".to_string())
        })?,
    };

    let default_config = device
        .default_input_config()
        .map_err(|err| classify_capture_error(format!("failed to get input config: {err}")))?;
    let input_config =
        pick_input_config(&device, target_rate).unwrap_or_else(|| default_config.clone());
    let sample_format = input_config.sample_format();
    let stream_config: cpal::StreamConfig = input_config.into();
    let channels = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate.0;

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels,
        "using input device"
    );

    let err_fn = |err| warn!("audio capture error: {}", err);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    let _ = tx.try_send(data.to_vec());
                },
                err_fn,
                None,
            )
            .map_err(|err| classify_capture_error(format!("failed to build input stream: {err}")))?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|sample| *sample as f32 / i16::MAX as f32)
                        .collect();
                    let _ = tx.try_send(converted);
                },
                err_fn,
                None,
            )
            .map_err(|err| classify_capture_error(format!("failed to build input stream: {err}")))?,
        cpal::SampleFormat::U16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[u16], _| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|sample| (*sample as f32 / u16::MAX as f32) * 2.0 - 1.0)
                        .collect();
                    let _ = tx.try_send(converted);
                },
                err_fn,
                None,
            )
            .map_err(|err| classify_capture_error(format!("failed to build input stream: {err}")))?,
        cpal::SampleFormat::I32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i32], _| {
                    let converted: Vec<f32> = data
                        .iter()
                        .map(|sample| *sample as f32 / i32::MAX as f32)
                        .collect();
                    let _ = tx.try_send(converted);
                },
                err_fn,
                None,
            )
            .map_err(|err| classify_capture_error(format!("failed to build input stream: {err}")))?,
        _ => {
            return Err(RecognitionError::Unavailable(format!(
                "unsupported input sample format {sample_format:?}"
            )));
        }
    };

    Ok((
        stream,
        CaptureInfo {
            sample_rate,
            channels,
        },
    ))
}

fn pick_input_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    let mut configs = device.supported_input_configs().ok()?;
    configs.find_map(|config| {
        let min = config.min_sample_rate().0;
        let max = config.max_sample_rate().0;
        let supported = [
            cpal::SampleFormat::F32,
            cpal::SampleFormat::I16,
            cpal::SampleFormat::U16,
            cpal::SampleFormat::I32,
        ];
        if min <= target_rate && target_rate <= max && supported.contains(&config.sample_format()) {
            Some(config.with_sample_rate(cpal::SampleRate(target_rate)))
        } else {
            None
        }
    })
}

/// Backends report permission problems as free-form text, so sorting
/// them from plain unavailability is a keyword match.
fn classify_capture_error(message: String) -> RecognitionError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        RecognitionError::PermissionDenied(message)
    } else {
        RecognitionError::Unavailable(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RecognitionConfig {
        RecognitionConfig {
            sample_rate: 16_000,
            chunk_size: 512,
            capture_device: None,
            mock_file: None,
            stt_url: "http://localhost:9/v1/audio/transcriptions".to_string(),
            stt_timeout: Duration::from_secs(1),
            speech_threshold: 0.01,
            no_speech_timeout: Duration::from_secs(5),
            silence_hangover: Duration::from_millis(600),
            max_utterance: Duration::from_secs(15),
        }
    }

    struct ScriptedTranscriber {
        chunks_seen: usize,
        final_text: String,
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn on_audio_chunk(
            &mut self,
            _samples: &[i16],
            _sample_rate: u32,
        ) -> Result<Option<String>, RecognitionError> {
            self.chunks_seen += 1;
            Ok(Some(format!("interim {}", self.chunks_seen)))
        }

        async fn finish(&mut self) -> Result<String, RecognitionError> {
            Ok(self.final_text.clone())
        }

        fn reset(&mut self) {
            self.chunks_seen = 0;
        }
    }

    fn loud(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect()
    }

    #[test]
    fn endpointer_reports_no_speech_after_timeout() {
        let config = test_config();
        let start = Instant::now();
        let mut endpointer = Endpointer::new(&config, start);
        assert_eq!(endpointer.observe(0.0, start), Verdict::Pending);
        assert_eq!(
            endpointer.observe(0.0, start + Duration::from_secs(6)),
            Verdict::NoSpeech
        );
    }

    #[test]
    fn endpointer_completes_after_silence_hangover() {
        let config = test_config();
        let start = Instant::now();
        let mut endpointer = Endpointer::new(&config, start);
        assert_eq!(endpointer.observe(0.5, start), Verdict::SpeechStarted);
        assert_eq!(
            endpointer.observe(0.0, start + Duration::from_millis(300)),
            Verdict::Pending
        );
        assert_eq!(
            endpointer.observe(0.0, start + Duration::from_millis(1000)),
            Verdict::Complete
        );
    }

    #[test]
    fn endpointer_hangover_resets_on_new_voice() {
        let config = test_config();
        let start = Instant::now();
        let mut endpointer = Endpointer::new(&config, start);
        endpointer.observe(0.5, start);
        assert_eq!(
            endpointer.observe(0.5, start + Duration::from_millis(500)),
            Verdict::Pending
        );
        // only 400ms since the last voiced chunk
        assert_eq!(
            endpointer.observe(0.0, start + Duration::from_millis(900)),
            Verdict::Pending
        );
        assert_eq!(
            endpointer.observe(0.0, start + Duration::from_millis(1200)),
            Verdict::Complete
        );
    }

    #[test]
    fn endpointer_caps_utterance_length() {
        let config = test_config();
        let start = Instant::now();
        let mut endpointer = Endpointer::new(&config, start);
        endpointer.observe(0.5, start);
        assert_eq!(
            endpointer.observe(0.5, start + Duration::from_secs(16)),
            Verdict::Complete
        );
    }

    #[test]
    fn rms_tracks_amplitude() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0, 0, 0, 0]), 0.0);
        let full = vec![i16::MAX; 64];
        assert!((rms_level(&full) - 1.0).abs() < 1e-3);
        let half = vec![i16::MAX / 2; 64];
        assert!((rms_level(&half) - 0.5).abs() < 1e-2);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.5, 1.0, -0.5, -1.0];
        assert_eq!(downmix_mono(&stereo, 2), vec![0.75, -0.75]);
        let mono = [0.25, 0.5];
        assert_eq!(downmix_mono(&mono, 1), vec![0.25, 0.5]);
    }

    #[test]
    fn pipeline_yields_fixed_chunks() {
        let mut pipeline = AudioPipeline::new(16_000, 1, 16_000, 512);
        let chunks = pipeline.push_samples(&loud(1300));
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk.len() == 512));
        let leftover = pipeline.drain().expect("leftover samples");
        assert_eq!(leftover.len(), 276);
    }

    #[test]
    fn pipeline_resamples_to_target_rate() {
        let mut pipeline = AudioPipeline::new(32_000, 2, 16_000, 160);
        let chunks = pipeline.push_samples(&loud(6400));
        assert!(chunks.iter().all(|chunk| chunk.len() == 160));
        let total: usize =
            chunks.iter().map(Vec::len).sum::<usize>() + pipeline.pending.len();
        // 3200 stereo frames at 32k come out near 1600 mono samples at 16k
        assert!((1590..=1600).contains(&total), "got {total}");
    }

    #[test]
    fn resampler_carries_position_across_calls() {
        let mut resampler = LinearResampler::new(32_000, 16_000);
        let first = resampler.process(&[0.0, 0.1, 0.2, 0.3]);
        let second = resampler.process(&[0.4, 0.5, 0.6, 0.7]);
        let total = first.len() + second.len();
        assert!((3..=4).contains(&total), "got {total}");
    }

    #[test]
    fn resampler_handles_ratios_above_two() {
        // at step 3 the position overshoots the buffer end; the
        // overhang must carry into the next call instead of panicking
        let mut resampler = LinearResampler::new(48_000, 16_000);
        let first = resampler.process(&[0.25; 512]);
        let second = resampler.process(&[0.25; 512]);
        assert_eq!(first.len(), 171);
        assert_eq!(second.len(), 170);
        assert!(first.iter().chain(&second).all(|s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn pipeline_downsamples_high_rate_capture() {
        let mut pipeline = AudioPipeline::new(48_000, 1, 16_000, 512);
        let chunks = pipeline.push_samples(&loud(512));
        assert!(chunks.is_empty());
        assert_eq!(pipeline.pending.len(), 171);
    }

    #[test]
    fn wav_encoding_is_readable() {
        let samples: Vec<i16> = (0..100).map(|i| (i * 300) as i16).collect();
        let bytes = encode_wav(&samples, 16_000).expect("encode");
        let mut reader =
            hound::WavReader::new(std::io::Cursor::new(bytes)).expect("parse encoded wav");
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.bits_per_sample, 16);
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn capture_errors_are_classified() {
        assert!(matches!(
            classify_capture_error("Permission denied by the system".to_string()),
            RecognitionError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_capture_error("device disconnected".to_string()),
            RecognitionError::Unavailable(_)
        ));
    }

    #[test]
    fn capture_stops_on_shutdown_signal_or_dropped_handle() {
        let (tx, rx) = std_mpsc::channel();
        assert!(keep_capturing(&rx));
        tx.send(()).expect("send shutdown");
        assert!(!keep_capturing(&rx));

        let (tx, rx) = std_mpsc::channel::<()>();
        drop(tx);
        assert!(!keep_capturing(&rx));
    }

    #[tokio::test]
    async fn feed_forwards_interim_transcripts() {
        let config = test_config();
        let mut pipeline = AudioPipeline::new(16_000, 1, 16_000, 512);
        let mut endpointer = Endpointer::new(&config, Instant::now());
        let mut transcriber = ScriptedTranscriber {
            chunks_seen: 0,
            final_text: "turn on the lights".to_string(),
        };
        let (events, mut rx) = broadcast::channel(16);

        let verdict = feed(
            &loud(1024),
            &mut pipeline,
            &mut endpointer,
            &mut transcriber,
            &config,
            &events,
        )
        .await
        .expect("feed");
        assert_eq!(verdict, Verdict::Pending);
        assert!(endpointer.in_speech());
        match rx.try_recv().expect("interim event") {
            RecognitionEvent::Partial { text } => assert_eq!(text, "interim 1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn feed_detects_utterance_end() {
        let mut config = test_config();
        config.silence_hangover = Duration::ZERO;
        let mut pipeline = AudioPipeline::new(16_000, 1, 16_000, 512);
        let mut endpointer = Endpointer::new(&config, Instant::now());
        let mut transcriber = ScriptedTranscriber {
            chunks_seen: 0,
            final_text: String::new(),
        };
        let (events, _rx) = broadcast::channel(16);

        let verdict = feed(
            &loud(512),
            &mut pipeline,
            &mut endpointer,
            &mut transcriber,
            &config,
            &events,
        )
        .await
        .expect("feed voiced");
        assert_eq!(verdict, Verdict::Pending);

        let silence = vec![0.0f32; 512];
        let verdict = feed(
            &silence,
            &mut pipeline,
            &mut endpointer,
            &mut transcriber,
            &config,
            &events,
        )
        .await
        .expect("feed silence");
        assert_eq!(verdict, Verdict::Complete);
    }
}
