use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::format::format_response;
use crate::protocol::{
    BackendMessage, ClientCommand, OrbCommand, RecognitionCommand, RecognitionError,
    RecognitionEvent, ResultsCard, SpeakerCommand, TransportEvent, UiEvent, UiSnapshot, UiState,
    VoiceSettings, READY_PROMPT,
};
use crate::transport::{self, TransportConfig, TransportHandle};
use crate::{tasks, ui};

/// Cells the pointer must travel in one move before a press counts as
/// a drag rather than a click.
const DRAG_THRESHOLD: f32 = 1.0;
/// Radians of orb rotation per cell of pointer travel.
const ROTATE_SPEED: f32 = 0.08;
const AUTO_ROTATE_RESUME: Duration = Duration::from_secs(2);
/// Matches the results card dismissal animation.
const DISMISS_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
enum ControllerEvent {
    DismissResults,
    ResumeAutoRotate { generation: u64 },
}

#[derive(Debug, Default)]
struct DragState {
    active: bool,
    dragging: bool,
    last: (u16, u16),
}

struct Controller {
    state: UiState,
    status: String,
    notice: Option<String>,
    results: Option<ResultsCard>,
    current_query: Option<String>,
    auto_rotate: bool,
    rotate_generation: u64,
    speaker_enabled: bool,
    connected: bool,
    drag: DragState,
    voice: VoiceSettings,
    transport: TransportHandle,
    recognition: mpsc::Sender<RecognitionCommand>,
    speaker: mpsc::Sender<SpeakerCommand>,
    orb_tx: mpsc::UnboundedSender<OrbCommand>,
    snapshot_tx: watch::Sender<UiSnapshot>,
    internal_tx: mpsc::Sender<ControllerEvent>,
}

impl Controller {
    fn new(
        config: &AppConfig,
        transport: TransportHandle,
        recognition: mpsc::Sender<RecognitionCommand>,
        speaker: mpsc::Sender<SpeakerCommand>,
        orb_tx: mpsc::UnboundedSender<OrbCommand>,
        snapshot_tx: watch::Sender<UiSnapshot>,
        internal_tx: mpsc::Sender<ControllerEvent>,
    ) -> Self {
        Self {
            state: UiState::Idle,
            status: READY_PROMPT.to_string(),
            notice: None,
            results: None,
            current_query: None,
            auto_rotate: true,
            rotate_generation: 0,
            speaker_enabled: config.speaker_enabled,
            connected: false,
            drag: DragState::default(),
            voice: config.voice,
            transport,
            recognition,
            speaker,
            orb_tx,
            snapshot_tx,
            internal_tx,
        }
    }

    async fn run(
        &mut self,
        mut ui_rx: mpsc::Receiver<UiEvent>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
        mut recognition_events: broadcast::Receiver<RecognitionEvent>,
        mut internal_rx: mpsc::Receiver<ControllerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.publish();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                event = ui_rx.recv() => {
                    match event {
                        Some(UiEvent::Quit) | None => break,
                        Some(event) => self.handle_ui_event(event).await,
                    }
                }
                event = transport_events.recv() => {
                    match event {
                        Ok(event) => self.handle_transport_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!("transport events lagged by {}", count);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                event = recognition_events.recv() => {
                    match event {
                        Ok(event) => self.handle_recognition_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!("recognition events lagged by {}", count);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                event = internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal_event(event);
                    }
                }
            }
        }
    }

    async fn handle_ui_event(&mut self, event: UiEvent) {
        match event {
            UiEvent::SubmitText { text } => self.submit_query(text).await,
            UiEvent::VoiceKey => {
                self.clear_notice();
                self.start_voice_recognition().await;
            }
            UiEvent::ToggleSpeaker => {
                self.speaker_enabled = !self.speaker_enabled;
                let _ = self
                    .speaker
                    .send(SpeakerCommand::SetEnabled(self.speaker_enabled))
                    .await;
                info!(enabled = self.speaker_enabled, "speaker toggled");
                self.publish();
            }
            UiEvent::CloseResults => self.close_results().await,
            UiEvent::PointerDown { x, y, over_orb } => {
                if over_orb {
                    self.drag = DragState {
                        active: true,
                        dragging: false,
                        last: (x, y),
                    };
                }
            }
            UiEvent::PointerMove { x, y } => self.handle_pointer_move(x, y),
            UiEvent::PointerUp { x, y } => self.handle_pointer_up(x, y).await,
            UiEvent::Quit => {}
        }
    }

    async fn submit_query(&mut self, text: String) {
        self.clear_notice();
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.state != UiState::Idle {
            debug!(state = ?self.state, "busy, dropping query");
            return;
        }
        info!(query = %text, "submitting query");
        self.current_query = Some(text.clone());
        self.set_state(UiState::Searching);
        self.transport
            .send(ClientCommand::TextCommand { text })
            .await;
    }

    async fn start_voice_recognition(&mut self) {
        if self.state != UiState::Idle {
            debug!(state = ?self.state, "busy, ignoring voice request");
            return;
        }
        // an utterance still playing would end up in the capture
        let _ = self.speaker.send(SpeakerCommand::Stop).await;
        if self
            .recognition
            .send(RecognitionCommand::Start)
            .await
            .is_err()
        {
            self.notice = Some("Voice recognition is not available".to_string());
            self.publish();
            return;
        }
        self.set_state(UiState::Listening);
    }

    async fn close_results(&mut self) {
        self.clear_notice();
        if self.state == UiState::Listening {
            let _ = self.recognition.send(RecognitionCommand::Cancel).await;
        }
        if self.results.is_some() {
            self.results = None;
            self.publish();
        }
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DISMISS_DELAY).await;
            let _ = tx.send(ControllerEvent::DismissResults).await;
        });
    }

    fn handle_pointer_move(&mut self, x: u16, y: u16) {
        if !self.drag.active {
            return;
        }
        let dx = x as f32 - self.drag.last.0 as f32;
        let dy = y as f32 - self.drag.last.1 as f32;
        if (dx * dx + dy * dy).sqrt() >= DRAG_THRESHOLD {
            if !self.drag.dragging {
                self.drag.dragging = true;
                self.set_auto_rotate(false);
            }
            let _ = self.orb_tx.send(OrbCommand::RotateBy {
                yaw: dx * ROTATE_SPEED,
                pitch: dy * ROTATE_SPEED,
            });
        }
        self.drag.last = (x, y);
    }

    async fn handle_pointer_up(&mut self, _x: u16, _y: u16) {
        let was_active = self.drag.active;
        let was_dragging = self.drag.dragging;
        self.drag = DragState::default();

        if was_dragging {
            self.rotate_generation += 1;
            let generation = self.rotate_generation;
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_ROTATE_RESUME).await;
                let _ = tx
                    .send(ControllerEvent::ResumeAutoRotate { generation })
                    .await;
            });
        } else if was_active && self.state == UiState::Idle {
            let _ = self.orb_tx.send(OrbCommand::Pulse);
            self.clear_notice();
            self.start_voice_recognition().await;
        }
    }

    async fn handle_recognition_event(&mut self, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Started => {
                debug!("recognition started");
            }
            RecognitionEvent::Partial { text } => {
                if self.state == UiState::Listening {
                    self.set_status(text);
                }
            }
            RecognitionEvent::Final { text } => {
                if self.state != UiState::Listening {
                    info!("dropping stale recognition result");
                    return;
                }
                info!(query = %text, "voice query recognized");
                self.current_query = Some(text.clone());
                self.set_state(UiState::Searching);
                self.transport
                    .send(ClientCommand::VoiceCommand { text })
                    .await;
            }
            RecognitionEvent::Failed(err) => {
                if self.state != UiState::Listening {
                    debug!("dropping stale recognition failure");
                    return;
                }
                self.handle_recognition_failure(err);
            }
            RecognitionEvent::Ended => {
                if self.state == UiState::Listening {
                    self.set_state(UiState::Idle);
                }
            }
        }
    }

    fn handle_recognition_failure(&mut self, err: RecognitionError) {
        match err {
            RecognitionError::NoSpeech => {
                self.set_state(UiState::Idle);
                self.set_status("No speech detected. Try again.".to_string());
            }
            RecognitionError::PermissionDenied(message) => {
                warn!(error = %message, "microphone permission denied");
                self.notice = Some(
                    "Microphone access denied. Allow microphone access and try again.".to_string(),
                );
                self.set_state(UiState::Idle);
                self.publish();
            }
            RecognitionError::Unavailable(message) => {
                warn!(error = %message, "speech capture unavailable");
                self.notice = Some(format!("Voice capture is not available: {message}"));
                self.set_state(UiState::Idle);
                self.publish();
            }
            RecognitionError::Failed(message) => {
                warn!(error = %message, "recognition failed");
                self.set_state(UiState::Idle);
                self.set_status(format!("Error: {message}"));
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("backend connected");
                self.connected = true;
                self.publish();
            }
            TransportEvent::Disconnected => {
                info!("backend disconnected");
                self.connected = false;
                self.connection_lost();
            }
            TransportEvent::Error { message } => {
                warn!(error = %message, "transport error");
                self.connection_lost();
            }
            TransportEvent::Message(message) => self.handle_backend_message(message).await,
        }
    }

    fn connection_lost(&mut self) {
        self.set_state(UiState::Idle);
        self.set_status("Connection error".to_string());
    }

    async fn handle_backend_message(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::Connection { status, message } => {
                info!(status = ?status, message = ?message, "backend session ready");
            }
            BackendMessage::Status { message, .. } => {
                if self.state == UiState::Searching {
                    if let Some(message) = message {
                        self.set_status(message);
                    }
                }
            }
            BackendMessage::Transcription { text } => {
                if self.state == UiState::Searching {
                    self.set_status(text);
                }
            }
            BackendMessage::Intent {
                intent, confidence, ..
            } => {
                debug!(intent = %intent, confidence, "intent classified");
            }
            BackendMessage::Result {
                success, message, ..
            } => {
                self.handle_result(success, message).await;
            }
            BackendMessage::Speech { text } => {
                if self.speaker_enabled {
                    let _ = self
                        .speaker
                        .send(SpeakerCommand::Speak {
                            text,
                            settings: self.voice,
                        })
                        .await;
                }
            }
            BackendMessage::Error { message } => {
                warn!(error = %message, "backend error");
                self.connection_lost();
            }
        }
    }

    async fn handle_result(&mut self, success: bool, message: String) {
        if !success {
            self.set_state(UiState::Idle);
            self.set_status(format!("Error: {message}"));
            return;
        }
        let query = self.current_query.take().unwrap_or_default();
        info!(query = %query, "result received");
        self.results = Some(ResultsCard {
            query,
            blocks: format_response(&message),
        });
        self.set_state(UiState::Results);
        self.publish();
        if self.speaker_enabled {
            let _ = self
                .speaker
                .send(SpeakerCommand::Speak {
                    text: message,
                    settings: self.voice,
                })
                .await;
        }
    }

    fn handle_internal_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::DismissResults => {
                self.set_state(UiState::Idle);
            }
            ControllerEvent::ResumeAutoRotate { generation } => {
                if generation == self.rotate_generation {
                    self.set_auto_rotate(true);
                } else {
                    debug!("dropping stale auto-rotate resume");
                }
            }
        }
    }

    fn set_state(&mut self, next: UiState) {
        if self.state != next {
            self.state = next;
            self.status = status_for(next).to_string();
            info!(state = ?next, "state changed");
            self.publish();
        }
    }

    fn set_status(&mut self, status: String) {
        if self.status != status {
            self.status = status;
            self.publish();
        }
    }

    fn set_auto_rotate(&mut self, enabled: bool) {
        if self.auto_rotate != enabled {
            self.auto_rotate = enabled;
            self.publish();
        }
    }

    fn clear_notice(&mut self) {
        if self.notice.is_some() {
            self.notice = None;
            self.publish();
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(UiSnapshot {
            state: self.state,
            status: self.status.clone(),
            notice: self.notice.clone(),
            results: self.results.clone(),
            auto_rotate: self.auto_rotate,
            speaker_enabled: self.speaker_enabled,
            connected: self.connected,
        });
    }
}

fn status_for(state: UiState) -> &'static str {
    match state {
        UiState::Idle => READY_PROMPT,
        UiState::Listening => "Listening...",
        UiState::Searching => "Searching...",
        UiState::Results => "",
    }
}

/// Wires the transport, audio tasks, and terminal surface together and
/// runs the controller loop until the user quits.
pub async fn run_app(config: AppConfig) -> Result<(), String> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ui_tx, ui_rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::channel(16);
    let (orb_tx, orb_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(UiSnapshot::initial(config.speaker_enabled));

    let transport = transport::spawn(
        TransportConfig {
            url: config.backend_url.clone(),
            retry_interval: config.retry_interval,
            connect_timeout: config.connect_timeout,
        },
        shutdown_rx.clone(),
    );
    let transport_events = transport.subscribe();

    let (recognition_tx, recognition_rx) = mpsc::channel(16);
    let (recognition_events_tx, recognition_events_rx) = broadcast::channel(32);
    tokio::spawn(tasks::recognition::run(
        recognition_rx,
        recognition_events_tx,
        shutdown_rx.clone(),
    ));

    let (speaker_tx, speaker_rx) = mpsc::channel(16);
    let (speaker_events_tx, _) = broadcast::channel(16);
    tokio::spawn(tasks::speaker::run(
        speaker_rx,
        speaker_events_tx,
        shutdown_rx.clone(),
    ));
    if !config.speaker_enabled {
        let _ = speaker_tx.send(SpeakerCommand::SetEnabled(false)).await;
    }

    // raw mode swallows SIGINT from the keyboard, but a signal can
    // still arrive from outside; route it through the quit path
    let signal_ui = ui_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", err);
        }
        let _ = signal_ui.send(UiEvent::Quit).await;
    });

    let ui_context = ui::UiContext {
        snapshot_rx,
        ui_tx,
        orb_rx,
        shutdown_rx: shutdown_rx.clone(),
    };
    let ui_thread = std::thread::spawn(move || ui::run(ui_context));

    let mut controller = Controller::new(
        &config,
        transport,
        recognition_tx,
        speaker_tx,
        orb_tx,
        snapshot_tx,
        internal_tx,
    );
    controller
        .run(
            ui_rx,
            transport_events,
            recognition_events_rx,
            internal_rx,
            shutdown_rx,
        )
        .await;

    let _ = shutdown_tx.send(true);
    match ui_thread.join() {
        Ok(result) => result.map_err(|err| format!("terminal ui failed: {err}")),
        Err(_) => Err("terminal ui panicked".to_string()),
    }
}
