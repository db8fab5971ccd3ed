use serde::{Deserialize, Serialize};

use crate::format::ResponseBlock;

/// Status line shown whenever the app is ready for a new query.
pub const READY_PROMPT: &str = "Ask anything...";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    TextCommand { text: String },
    VoiceCommand { text: String },
    AudioData { audio: String },
    StatusRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendMessage {
    Connection {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Status {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Transcription {
        text: String,
    },
    Intent {
        intent: String,
        #[serde(default)]
        entities: serde_json::Value,
        #[serde(default)]
        confidence: f64,
    },
    Result {
        success: bool,
        message: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Speech {
        text: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiState {
    Idle,
    Listening,
    Searching,
    Results,
}

impl UiState {
    pub fn as_str(self) -> &'static str {
        match self {
            UiState::Idle => "idle",
            UiState::Listening => "listening",
            UiState::Searching => "searching",
            UiState::Results => "results",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error { message: String },
    Message(BackendMessage),
}

#[derive(Debug, Clone)]
pub enum RecognitionCommand {
    Start,
    Cancel,
}

#[derive(Debug, Clone)]
pub enum RecognitionEvent {
    Started,
    Partial { text: String },
    Final { text: String },
    Failed(RecognitionError),
    Ended,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RecognitionError {
    #[error("speech capture unavailable: {0}")]
    Unavailable(String),
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no speech detected")]
    NoSpeech,
    #[error("recognition failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoiceSettings {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            rate: 1.1,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SpeakerCommand {
    Speak { text: String, settings: VoiceSettings },
    Stop,
    SetEnabled(bool),
}

#[derive(Debug, Clone)]
pub enum SpeakerEvent {
    Finished,
    Failed { message: String },
}

/// Pointer and keyboard gestures the terminal surface reports to the
/// controller. Coordinates are terminal cells.
#[derive(Debug, Clone)]
pub enum UiEvent {
    SubmitText { text: String },
    VoiceKey,
    ToggleSpeaker,
    CloseResults,
    PointerDown { x: u16, y: u16, over_orb: bool },
    PointerMove { x: u16, y: u16 },
    PointerUp { x: u16, y: u16 },
    Quit,
}

#[derive(Debug, Clone)]
pub enum OrbCommand {
    RotateBy { yaw: f32, pitch: f32 },
    Pulse,
}

#[derive(Debug, Clone)]
pub struct ResultsCard {
    pub query: String,
    pub blocks: Vec<ResponseBlock>,
}

#[derive(Debug, Clone)]
pub struct UiSnapshot {
    pub state: UiState,
    pub status: String,
    pub notice: Option<String>,
    pub results: Option<ResultsCard>,
    pub auto_rotate: bool,
    pub speaker_enabled: bool,
    pub connected: bool,
}

impl UiSnapshot {
    pub fn initial(speaker_enabled: bool) -> Self {
        Self {
            state: UiState::Idle,
            status: READY_PROMPT.to_string(),
            notice: None,
            results: None,
            auto_rotate: true,
            speaker_enabled,
            connected: false,
        }
    }
}
