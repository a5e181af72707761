//! Manages the WebSocket connection lifecycle for one device session.
//!
//! A session moves through `Connecting -> AwaitingBindDecision -> {Bound,
//! NeedsBinding} -> Active -> Closing -> Closed`. All inbound traffic is
//! converted into typed [`SessionEvent`]s consumed by a single loop; the
//! binding lookup, the idle supervisor, the ASR pipeline, and the TTS worker
//! run as separate tasks feeding that loop or the socket sink.

use super::{
    codec::{self, FrameError},
    protocol::{AudioParams, ClientMessage, ListenState, ServerMessage},
    reorder::ReorderBuffer,
    report::ReportSink,
    turn::{MAX_TOOL_DEPTH, TurnOutcome, TurnRunner},
};
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use murmur_core::{
    dialogue::Dialogue,
    registry::{ChatReport, ConfigOverlay, RegistryError, ReportKind},
    speech::{SentenceBoundary, SpeechRecognizer, SpeechSynthesizer, TtsContent, TtsUnit},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_QUEUE_CAPACITY: usize = 256;
const BIND_WAIT: Duration = Duration::from_secs(1);
const BIND_PROMPT_COOLDOWN: Duration = Duration::from_secs(60);
const IDLE_TICK: Duration = Duration::from_secs(10);

type SocketSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Everything the session learns from the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub device_id: Option<String>,
    pub client_id: Option<String>,
    pub protocol_version: Option<u8>,
    /// Connection came through the MQTT/UDP relay; binary frames carry the
    /// 16-byte relay prefix.
    pub relayed: bool,
}

impl ConnectionMeta {
    fn from_parts(headers: &HeaderMap, params: &HashMap<String, String>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            device_id: header("device-id"),
            client_id: header("client-id"),
            protocol_version: header("protocol-version").and_then(|v| v.parse().ok()),
            relayed: params
                .get("from")
                .is_some_and(|from| from == "mqtt_gateway"),
        }
    }
}

/// Outcome of the background binding lookup.
#[derive(Debug, Clone, PartialEq)]
enum BindDecision {
    Pending,
    Bound,
    /// Code the user must enter to bind; empty when the backend issued none.
    NeedsBinding(String),
}

/// Typed inbound-event stream consumed by the session loop.
enum SessionEvent {
    Control(ClientMessage),
    Frame(Bytes),
    Transcript(String),
    ProvidersReady(Box<SessionProviders>),
    TurnFinished(TurnOutcome),
    IdleTimeout,
    SocketClosed,
    SocketError(axum::Error),
}

/// Per-session provider instances resolved off the read loop.
struct SessionProviders {
    overlay: ConfigOverlay,
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Commands for the session's speech-recognition pipeline task.
enum AsrCommand {
    Reset,
    Frame(Bytes),
    Finalize,
}

/// Decodes inbound binary frames and reorders them for recognition.
struct FramePipeline {
    /// Frames arrive with the 16-byte relay prefix instead of a version
    /// header.
    relayed: bool,
    reorder: ReorderBuffer,
}

impl FramePipeline {
    fn new(relayed: bool) -> Self {
        Self {
            relayed,
            reorder: ReorderBuffer::new(),
        }
    }

    /// Returns the payloads released for recognition, oldest first.
    fn ingest(&mut self, version: u8, data: Bytes) -> Result<Vec<Bytes>, FrameError> {
        let frame = if self.relayed {
            codec::unwrap_relay_frame(data)?
        } else {
            codec::decode_frame(version, data)?
        };
        Ok(self.reorder.push(frame.timestamp, frame.payload))
    }
}

/// Rate-limits the bind prompt to once per cooldown window.
struct BindPromptCooldown {
    cooldown: Duration,
    last: Option<Instant>,
}

impl BindPromptCooldown {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: None,
        }
    }

    fn should_prompt(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.cooldown => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Single-shot guard for the Closing transition; an idle-timeout tick racing
/// a normal close must not tear down twice.
struct CloseOnce {
    closed: bool,
}

impl CloseOnce {
    fn new() -> Self {
        Self { closed: false }
    }

    /// Returns true exactly once.
    fn begin(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }
}

/// Wall-clock activity shared with the idle supervisor.
#[derive(Clone)]
struct ActivityTracker {
    last: Arc<StdMutex<Instant>>,
    first_seen: Instant,
}

impl ActivityTracker {
    fn new() -> Self {
        Self {
            last: Arc::new(StdMutex::new(Instant::now())),
            first_seen: Instant::now(),
        }
    }

    fn touch(&self) {
        *self.last.lock().expect("activity tracker poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .expect("activity tracker poisoned")
            .elapsed()
    }

    fn since_first_seen(&self) -> Duration {
        self.first_seen.elapsed()
    }
}

/// Idle time for timeout purposes. Unbound devices are measured from connect
/// so a stream of discarded frames cannot hold the session open.
fn effective_idle(decision: &BindDecision, activity: &ActivityTracker) -> Duration {
    match decision {
        BindDecision::Bound => activity.idle_for(),
        BindDecision::Pending | BindDecision::NeedsBinding(_) => activity.since_first_seen(),
    }
}

/// What to do with an inbound message given the current binding decision.
#[derive(Debug, PartialEq)]
enum BindGate {
    Proceed,
    Discard,
    Prompt(String),
}

fn gate_inbound(decision: &BindDecision, prompt: &mut BindPromptCooldown) -> BindGate {
    match decision {
        BindDecision::Bound => BindGate::Proceed,
        BindDecision::Pending => BindGate::Discard,
        BindDecision::NeedsBinding(code) => {
            if !code.is_empty() && prompt.should_prompt() {
                BindGate::Prompt(code.clone())
            } else {
                BindGate::Discard
            }
        }
    }
}

/// Clamps the client's requested binary protocol version to what the codec
/// supports.
fn negotiate_version(requested: u8) -> u8 {
    if (1..=3).contains(&requested) {
        requested
    } else {
        1
    }
}

/// Builds the hello acknowledgement, echoing the session id and the
/// negotiated binary version.
fn hello_reply(
    session_id: &str,
    requested: u8,
    audio_params: Option<AudioParams>,
) -> (u8, ServerMessage) {
    let negotiated = negotiate_version(requested);
    let reply = ServerMessage::Hello {
        session_id: session_id.to_string(),
        version: negotiated,
        transport: "websocket".to_string(),
        audio_params: audio_params.unwrap_or_default(),
    };
    (negotiated, reply)
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = &state.config.auth_token {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected);
        if !authorized {
            warn!("rejecting websocket upgrade with bad or missing token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let meta = ConnectionMeta::from_parts(&headers, &params);
    ws.on_upgrade(move |socket| handle_socket(socket, state, meta))
}

/// Main handler for an individual WebSocket connection.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, meta: ConnectionMeta) {
    let session_id = meta
        .device_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    tracing::Span::current().record("session_id", session_id.as_str());
    info!(relayed = meta.relayed, "new websocket connection");

    let (socket_tx, socket_rx) = socket.split();
    let socket_tx: SocketSink = Arc::new(Mutex::new(socket_tx));

    let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(EVENT_QUEUE_CAPACITY);
    let (bind_tx, bind_rx) = watch::channel(BindDecision::Pending);
    let (notice_tx, notice_rx) = mpsc::channel::<ServerMessage>(16);

    let reader = spawn_reader(socket_rx, events_tx.clone());
    let notice_forwarder = spawn_notice_forwarder(notice_rx, socket_tx.clone());

    let activity = ActivityTracker::new();
    let supervisor = spawn_idle_supervisor(
        activity.clone(),
        bind_rx.clone(),
        state.config.idle_timeout,
        events_tx.clone(),
    );

    tokio::spawn(background_initialize(
        state.clone(),
        meta.clone(),
        bind_tx,
        events_tx.clone(),
    ));

    let dialogue = Arc::new(Mutex::new(Dialogue::new(
        state.config.default_prompt.clone(),
        state.config.max_history_rounds,
    )));

    // The hello exchange can still renegotiate this.
    let binary_version = negotiate_version(meta.protocol_version.unwrap_or(1));
    let pipeline = FramePipeline::new(meta.relayed);

    let session = Session {
        state,
        meta,
        session_id,
        socket_tx,
        events_tx,
        events_rx,
        bind_rx,
        bind_prompt: BindPromptCooldown::new(BIND_PROMPT_COOLDOWN),
        activity,
        close: CloseOnce::new(),
        binary_version: Arc::new(AtomicU8::new(binary_version)),
        pipeline,
        listening: false,
        dialogue,
        abort: Arc::new(AtomicBool::new(false)),
        asr_tx: None,
        tts_tx: None,
        notice_tx,
        report_sink: None,
        turn_task: None,
        reader,
        supervisor,
        notice_forwarder,
    };
    session.run().await;
}

/// Resolves binding status and per-session providers without blocking the
/// read loop.
async fn background_initialize(
    state: Arc<AppState>,
    meta: ConnectionMeta,
    bind_tx: watch::Sender<BindDecision>,
    events_tx: mpsc::Sender<SessionEvent>,
) {
    let overlay = match (&state.registry, &meta.device_id) {
        (Some(registry), Some(device_id)) => {
            let client_id = meta.client_id.as_deref().unwrap_or("");
            match registry.fetch_device_config(device_id, client_id).await {
                Ok(overlay) => overlay,
                Err(RegistryError::NeedsBinding(code)) => {
                    info!(%device_id, "device awaits binding");
                    let _ = bind_tx.send(BindDecision::NeedsBinding(code));
                    return;
                }
                Err(RegistryError::NotFound) => {
                    warn!(%device_id, "device unknown to the registry");
                    let _ = bind_tx.send(BindDecision::NeedsBinding(String::new()));
                    return;
                }
                Err(e) => {
                    // Degrade to the gateway defaults rather than refusing
                    // service over a backend wobble.
                    warn!(error = ?e, "device config lookup failed, using defaults");
                    ConfigOverlay::default()
                }
            }
        }
        _ => ConfigOverlay::default(),
    };

    let providers = SessionProviders {
        overlay,
        recognizer: state.session_recognizer(),
        synthesizer: state.synthesizer.clone(),
    };
    let _ = events_tx
        .send(SessionEvent::ProvidersReady(Box::new(providers)))
        .await;
    let _ = bind_tx.send(BindDecision::Bound);
}

fn spawn_reader(
    mut socket_rx: SplitStream<WebSocket>,
    events: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = socket_rx.next().await {
            let event = match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => SessionEvent::Control(msg),
                    Err(e) => {
                        warn!(error = %e, "ignoring unrecognized control message");
                        continue;
                    }
                },
                Ok(Message::Binary(data)) => SessionEvent::Frame(data),
                Ok(Message::Close(_)) => SessionEvent::SocketClosed,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => SessionEvent::SocketError(e),
            };
            let last = matches!(
                event,
                SessionEvent::SocketClosed | SessionEvent::SocketError(_)
            );
            if events.send(event).await.is_err() || last {
                return;
            }
        }
        let _ = events.send(SessionEvent::SocketClosed).await;
    })
}

fn spawn_notice_forwarder(
    mut notice_rx: mpsc::Receiver<ServerMessage>,
    socket_tx: SocketSink,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = notice_rx.recv().await {
            if send_msg(&mut *socket_tx.lock().await, msg).await.is_err() {
                return;
            }
        }
    })
}

fn spawn_idle_supervisor(
    activity: ActivityTracker,
    bind_rx: watch::Receiver<BindDecision>,
    idle_timeout: Duration,
    events: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_TICK);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let idle = effective_idle(&bind_rx.borrow().clone(), &activity);
            if idle >= idle_timeout && events.send(SessionEvent::IdleTimeout).await.is_err() {
                return;
            }
        }
    })
}

struct Session {
    state: Arc<AppState>,
    meta: ConnectionMeta,
    session_id: String,
    socket_tx: SocketSink,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    bind_rx: watch::Receiver<BindDecision>,
    bind_prompt: BindPromptCooldown,
    activity: ActivityTracker,
    close: CloseOnce,
    /// Negotiated binary protocol version, shared with the TTS worker.
    binary_version: Arc<AtomicU8>,
    pipeline: FramePipeline,
    listening: bool,
    dialogue: Arc<Mutex<Dialogue>>,
    abort: Arc<AtomicBool>,
    asr_tx: Option<mpsc::Sender<AsrCommand>>,
    tts_tx: Option<mpsc::Sender<TtsUnit>>,
    notice_tx: mpsc::Sender<ServerMessage>,
    report_sink: Option<ReportSink>,
    turn_task: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    notice_forwarder: JoinHandle<()>,
}

impl Session {
    async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            match event {
                SessionEvent::Control(msg) => {
                    self.activity.touch();
                    if self.ensure_bound().await
                        && let Err(e) = self.handle_control(msg).await
                    {
                        error!(error = ?e, "control handling failed");
                        self.close.begin();
                    }
                }
                SessionEvent::Frame(data) => {
                    self.activity.touch();
                    if self.ensure_bound().await
                        && let Err(e) = self.handle_frame(data).await
                    {
                        warn!(error = %e, "bad binary frame, closing");
                        self.send(ServerMessage::Error {
                            message: e.to_string(),
                        })
                        .await;
                        self.close.begin();
                    }
                }
                SessionEvent::Transcript(text) => {
                    self.activity.touch();
                    self.handle_transcript(text).await;
                }
                SessionEvent::ProvidersReady(providers) => {
                    self.install_providers(*providers).await;
                }
                SessionEvent::TurnFinished(outcome) => {
                    self.turn_task = None;
                    if outcome.hang_up {
                        info!("turn requested hang-up");
                        self.close.begin();
                    }
                }
                SessionEvent::IdleTimeout => {
                    // Re-check against the tracker; the tick may have raced
                    // fresh activity.
                    let decision = self.bind_rx.borrow().clone();
                    if effective_idle(&decision, &self.activity) >= self.state.config.idle_timeout
                    {
                        info!("closing idle session");
                        self.close.begin();
                    }
                }
                SessionEvent::SocketClosed => {
                    info!("client closed the connection");
                    self.close.begin();
                }
                SessionEvent::SocketError(e) => {
                    error!(error = %e, "websocket read failed");
                    self.close.begin();
                }
            }
            if self.close.closed {
                break;
            }
        }
        self.teardown().await;
    }

    /// Waits up to one second for the binding decision, then gates the
    /// inbound event on it.
    async fn ensure_bound(&mut self) -> bool {
        if matches!(*self.bind_rx.borrow(), BindDecision::Pending) {
            let mut rx = self.bind_rx.clone();
            let _ = tokio::time::timeout(
                BIND_WAIT,
                rx.wait_for(|decision| *decision != BindDecision::Pending),
            )
            .await;
        }
        let decision = self.bind_rx.borrow().clone();
        match gate_inbound(&decision, &mut self.bind_prompt) {
            BindGate::Proceed => true,
            BindGate::Discard => {
                debug!("discarding inbound event while unbound");
                false
            }
            BindGate::Prompt(code) => {
                info!("prompting for device binding");
                self.send(ServerMessage::Bind { code }).await;
                false
            }
        }
    }

    async fn handle_control(&mut self, msg: ClientMessage) -> Result<()> {
        match msg {
            ClientMessage::Hello {
                version,
                audio_params,
                ..
            } => {
                let (negotiated, reply) = hello_reply(&self.session_id, version, audio_params);
                self.binary_version.store(negotiated, Ordering::Relaxed);
                self.send(reply).await;
            }
            ClientMessage::Listen { state, mode, text } => {
                debug!(?state, ?mode, "listen control");
                match state {
                    ListenState::Start => {
                        self.listening = true;
                        if let Some(tx) = &self.asr_tx {
                            let _ = tx.send(AsrCommand::Reset).await;
                        }
                    }
                    ListenState::Stop => {
                        self.listening = false;
                        if let Some(tx) = &self.asr_tx {
                            let _ = tx.send(AsrCommand::Finalize).await;
                        }
                    }
                    ListenState::Detect => {
                        // Wake word or typed text; skips recognition.
                        if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                            self.handle_transcript(text).await;
                        }
                    }
                }
            }
            ClientMessage::Abort { reason } => {
                info!(?reason, "client aborted the turn");
                self.abort.store(true, Ordering::Relaxed);
            }
            ClientMessage::Server { action } => {
                info!(?action, "acknowledging server command");
                self.send(ServerMessage::Server { action }).await;
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, data: Bytes) -> Result<(), FrameError> {
        let Some(asr_tx) = self.asr_tx.clone() else {
            debug!("dropping audio frame, providers not ready");
            return Ok(());
        };
        if !self.listening {
            debug!("dropping audio frame outside listen window");
            return Ok(());
        }
        let version = self.binary_version.load(Ordering::Relaxed);
        for payload in self.pipeline.ingest(version, data)? {
            if !self.state.vad.detect(&payload) {
                continue;
            }
            if asr_tx.send(AsrCommand::Frame(payload)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn handle_transcript(&mut self, text: String) {
        info!(%text, "transcript ready");
        self.send(ServerMessage::Stt { text: text.clone() }).await;
        if let Some(sink) = &self.report_sink {
            sink.submit(self.chat_report(ReportKind::Asr, &text));
        }

        if self
            .turn_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            debug!("turn already in flight, dropping transcript");
            return;
        }
        let Some(tts_tx) = self.tts_tx.clone() else {
            warn!("transcript before providers ready, dropping");
            return;
        };

        self.abort.store(false, Ordering::Relaxed);
        let runner = TurnRunner {
            llm: self.state.llm.clone(),
            tools: self.state.tools.clone(),
            memory: self.state.memory.clone(),
            tts_tx,
            notice_tx: self.notice_tx.clone(),
            abort: self.abort.clone(),
            max_depth: MAX_TOOL_DEPTH,
        };
        let dialogue = self.dialogue.clone();
        let events = self.events_tx.clone();
        self.turn_task = Some(tokio::spawn(async move {
            let outcome = runner.run(dialogue, text).await;
            let _ = events.send(SessionEvent::TurnFinished(outcome)).await;
        }));
    }

    /// Applies the device overlay and wires up the speech pipelines.
    async fn install_providers(&mut self, providers: SessionProviders) {
        let SessionProviders {
            overlay,
            recognizer,
            synthesizer,
        } = providers;

        {
            let mut dialogue = self.dialogue.lock().await;
            if let Some(prompt) = &overlay.prompt {
                dialogue.update_system(prompt.clone());
            }
            if let Some(rounds) = overlay.max_history_rounds {
                dialogue.set_max_rounds(rounds);
            }
        }
        if overlay.report_chat
            && let Some(registry) = &self.state.registry
        {
            let (sink, _worker) = ReportSink::spawn(registry.clone());
            self.report_sink = Some(sink);
        }

        let (asr_tx, asr_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        spawn_asr_pipeline(asr_rx, recognizer, self.events_tx.clone());
        self.asr_tx = Some(asr_tx);

        let (tts_tx, tts_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        spawn_tts_worker(
            tts_rx,
            synthesizer,
            self.socket_tx.clone(),
            self.binary_version.clone(),
            self.report_sink.clone(),
            self.meta.device_id.clone().unwrap_or_default(),
            self.session_id.clone(),
        );
        self.tts_tx = Some(tts_tx);

        info!("session providers installed");
    }

    fn chat_report(&self, kind: ReportKind, text: &str) -> ChatReport {
        ChatReport {
            device_id: self.meta.device_id.clone().unwrap_or_default(),
            session_id: self.session_id.clone(),
            kind,
            text: text.to_string(),
        }
    }

    async fn send(&self, msg: ServerMessage) {
        if let Err(e) = send_msg(&mut *self.socket_tx.lock().await, msg).await {
            debug!(error = ?e, "failed to send server message");
        }
    }

    /// Releases everything the session owns. Every step is guarded so one
    /// failure cannot skip the rest; the session always reaches Closed.
    async fn teardown(mut self) {
        info!("tearing down session");
        self.close.begin();

        self.supervisor.abort();
        self.reader.abort();
        if let Some(task) = self.turn_task.take() {
            self.abort.store(true, Ordering::Relaxed);
            task.abort();
        }

        // Dropping the senders closes the ASR and TTS workers.
        self.asr_tx = None;
        self.tts_tx = None;

        if let Some(sink) = self.report_sink.take() {
            sink.shutdown();
        }

        {
            let mut sink = self.socket_tx.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!(error = ?e, "socket already gone on close");
            }
        }
        self.notice_forwarder.abort();

        // Memory save must not block teardown.
        if let Some(memory) = self.state.memory.clone() {
            let dialogue = self.dialogue.clone();
            tokio::spawn(async move {
                let messages = dialogue.lock().await.messages().to_vec();
                if let Err(e) = memory.save(&messages).await {
                    warn!(error = ?e, "memory save failed");
                }
            });
        }

        info!("session closed");
    }
}

/// Buffers voice frames and produces one transcript per finalized utterance.
fn spawn_asr_pipeline(
    mut rx: mpsc::Receiver<AsrCommand>,
    recognizer: Arc<dyn SpeechRecognizer>,
    events: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut frames: Vec<Bytes> = Vec::new();
        while let Some(command) = rx.recv().await {
            match command {
                AsrCommand::Reset => frames.clear(),
                AsrCommand::Frame(payload) => frames.push(payload),
                AsrCommand::Finalize => {
                    if frames.is_empty() {
                        continue;
                    }
                    let utterance = std::mem::take(&mut frames);
                    match recognizer.transcribe(&utterance).await {
                        Ok(text) if !text.trim().is_empty() => {
                            if events.send(SessionEvent::Transcript(text)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => debug!("recognizer produced an empty transcript"),
                        Err(e) => warn!(error = ?e, "speech recognition failed"),
                    }
                }
            }
        }
    })
}

/// Turns TTS units into playback framing messages and synthesized audio.
#[allow(clippy::too_many_arguments)]
fn spawn_tts_worker(
    mut rx: mpsc::Receiver<TtsUnit>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    socket_tx: SocketSink,
    binary_version: Arc<AtomicU8>,
    report_sink: Option<ReportSink>,
    device_id: String,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(unit) = rx.recv().await {
            let result = match unit.boundary {
                SentenceBoundary::First => {
                    send_msg(
                        &mut *socket_tx.lock().await,
                        ServerMessage::Tts {
                            state: super::protocol::TtsState::Start,
                            text: None,
                        },
                    )
                    .await
                }
                SentenceBoundary::Last => {
                    send_msg(
                        &mut *socket_tx.lock().await,
                        ServerMessage::Tts {
                            state: super::protocol::TtsState::Stop,
                            text: None,
                        },
                    )
                    .await
                }
                SentenceBoundary::Middle => match &unit.content {
                    TtsContent::Text(text) => {
                        if let Some(sink) = &report_sink {
                            sink.submit(ChatReport {
                                device_id: device_id.clone(),
                                session_id: session_id.clone(),
                                kind: ReportKind::Tts,
                                text: text.clone(),
                            });
                        }
                        let announced = send_msg(
                            &mut *socket_tx.lock().await,
                            ServerMessage::Tts {
                                state: super::protocol::TtsState::SentenceStart,
                                text: Some(text.clone()),
                            },
                        )
                        .await;
                        match announced {
                            Ok(()) => match synthesizer.synthesize(text).await {
                                Ok(audio) => {
                                    send_audio(&socket_tx, &binary_version, &audio).await
                                }
                                Err(e) => {
                                    warn!(error = ?e, "synthesis failed, skipping sentence");
                                    Ok(())
                                }
                            },
                            Err(e) => Err(e),
                        }
                    }
                    TtsContent::File(path) => match tokio::fs::read(path).await {
                        Ok(audio) => send_audio(&socket_tx, &binary_version, &audio).await,
                        Err(e) => {
                            warn!(error = %e, path = %path.display(), "audio file unreadable");
                            Ok(())
                        }
                    },
                    TtsContent::Action => Ok(()),
                },
            };
            if result.is_err() {
                return;
            }
        }
    })
}

async fn send_audio(
    socket_tx: &SocketSink,
    binary_version: &Arc<AtomicU8>,
    audio: &[u8],
) -> Result<()> {
    if audio.is_empty() {
        return Ok(());
    }
    let version = binary_version.load(Ordering::Relaxed);
    let frame = codec::encode_frame(version, 0, audio)?;
    socket_tx
        .lock()
        .await
        .send(Message::Binary(frame))
        .await?;
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_guard_fires_exactly_once() {
        let mut close = CloseOnce::new();
        assert!(close.begin());
        // A racing second close attempt is a no-op.
        assert!(!close.begin());
        assert!(!close.begin());
    }

    #[test]
    fn bind_prompt_respects_the_cooldown() {
        let mut prompt = BindPromptCooldown::new(Duration::from_secs(60));
        assert!(prompt.should_prompt());
        assert!(!prompt.should_prompt());

        let mut no_cooldown = BindPromptCooldown::new(Duration::ZERO);
        assert!(no_cooldown.should_prompt());
        assert!(no_cooldown.should_prompt());
    }

    #[test]
    fn needs_binding_prompts_once_then_discards() {
        let decision = BindDecision::NeedsBinding("1234".to_string());
        let mut prompt = BindPromptCooldown::new(Duration::from_secs(60));

        assert_eq!(
            gate_inbound(&decision, &mut prompt),
            BindGate::Prompt("1234".to_string())
        );
        assert_eq!(gate_inbound(&decision, &mut prompt), BindGate::Discard);
        assert_eq!(gate_inbound(&decision, &mut prompt), BindGate::Discard);
    }

    #[test]
    fn unknown_device_discards_without_a_prompt() {
        let decision = BindDecision::NeedsBinding(String::new());
        let mut prompt = BindPromptCooldown::new(Duration::ZERO);
        assert_eq!(gate_inbound(&decision, &mut prompt), BindGate::Discard);
    }

    #[test]
    fn pending_discards_and_bound_proceeds() {
        let mut prompt = BindPromptCooldown::new(Duration::ZERO);
        assert_eq!(
            gate_inbound(&BindDecision::Pending, &mut prompt),
            BindGate::Discard
        );
        assert_eq!(
            gate_inbound(&BindDecision::Bound, &mut prompt),
            BindGate::Proceed
        );
    }

    #[test]
    fn version_negotiation_clamps_to_supported_range() {
        assert_eq!(negotiate_version(1), 1);
        assert_eq!(negotiate_version(2), 2);
        assert_eq!(negotiate_version(3), 3);
        assert_eq!(negotiate_version(0), 1);
        assert_eq!(negotiate_version(9), 1);
    }

    #[test]
    fn connection_meta_reads_headers_and_relay_marker() {
        let mut headers = HeaderMap::new();
        headers.insert("device-id", "AA:BB".parse().unwrap());
        headers.insert("client-id", "web".parse().unwrap());
        headers.insert("protocol-version", "2".parse().unwrap());
        let params = HashMap::from([("from".to_string(), "mqtt_gateway".to_string())]);

        let meta = ConnectionMeta::from_parts(&headers, &params);
        assert_eq!(meta.device_id.as_deref(), Some("AA:BB"));
        assert_eq!(meta.client_id.as_deref(), Some("web"));
        assert_eq!(meta.protocol_version, Some(2));
        assert!(meta.relayed);

        let direct = ConnectionMeta::from_parts(&HeaderMap::new(), &HashMap::new());
        assert_eq!(direct.device_id, None);
        assert!(!direct.relayed);
    }

    #[test]
    fn activity_tracker_reports_recent_touch_as_not_idle() {
        let tracker = ActivityTracker::new();
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn unbound_sessions_are_timed_from_first_seen() {
        let activity = ActivityTracker {
            last: Arc::new(StdMutex::new(Instant::now())),
            first_seen: Instant::now() - Duration::from_secs(300),
        };
        // Inbound frames keep touching the tracker but must not reset the
        // clock for a device that never bound.
        activity.touch();

        assert!(effective_idle(&BindDecision::Bound, &activity) < Duration::from_secs(1));
        assert!(effective_idle(&BindDecision::Pending, &activity) >= Duration::from_secs(300));
        assert!(
            effective_idle(&BindDecision::NeedsBinding("1234".to_string()), &activity)
                >= Duration::from_secs(300)
        );
    }

    #[test]
    fn hello_reply_echoes_the_session_and_negotiated_version() {
        let (negotiated, reply) = hello_reply("sess-1", 2, None);
        assert_eq!(negotiated, 2);
        match reply {
            ServerMessage::Hello {
                session_id,
                version,
                transport,
                audio_params,
            } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(version, 2);
                assert_eq!(transport, "websocket");
                assert_eq!(audio_params.sample_rate, 16000);
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let (negotiated, _) = hello_reply("sess-1", 9, None);
        assert_eq!(negotiated, 1);
    }

    #[test]
    fn v1_frames_pass_the_pipeline_in_arrival_order() {
        let mut pipeline = FramePipeline::new(false);
        let mut released = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            released.extend(
                pipeline
                    .ingest(1, Bytes::copy_from_slice(payload))
                    .expect("raw frames always decode"),
            );
        }
        assert_eq!(
            released,
            vec![
                Bytes::from_static(b"one"),
                Bytes::from_static(b"two"),
                Bytes::from_static(b"three"),
            ]
        );
    }

    #[test]
    fn relayed_frames_are_unwrapped_before_reordering() {
        let mut pipeline = FramePipeline::new(true);
        let mut frame = vec![0u8; 16];
        frame[8..12].copy_from_slice(&7u32.to_be_bytes());
        frame[12..16].copy_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(b"opus");

        let released = pipeline.ingest(1, Bytes::from(frame)).unwrap();
        assert_eq!(released, vec![Bytes::from_static(b"opus")]);

        let err = pipeline.ingest(1, Bytes::new()).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }
}
