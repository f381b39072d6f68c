//! Session facade: the one surface the UI layer consumes.
//!
//! Aggregates the connection manager, state reducer, voice cache and TTS
//! queue; exposes connection status, the latest snapshot, action
//! dispatchers and playback controls; and broadcasts typed events to any
//! number of UI listeners in emission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::protocol::{ClientMessage, EditInstructionPayload, ServerMessage, StartGamePayload};
use crate::scripts::ScriptApi;
use crate::state::{reduce, GameState, LogCursor, NarrativeEvent, Reduction};
use crate::tts::{AudioOutput, Caption, HttpSynthesizer, RodioOutput, Synthesizer, TtsPlayer};
use crate::voices::VoiceMappingCache;

/// Typed events delivered to UI listeners, in emission order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    /// Snapshot replaced; `None` marks a new generation
    State(Option<GameState>),
    /// One not-yet-rendered narrative line
    Narrative(NarrativeEvent),
    /// Server-reported error, non-fatal
    Notice(String),
    GameStarted,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Folds inbound messages into local state and fans out the effects:
/// snapshot updates, narrative lines, TTS enqueues, notices.
struct EventPump {
    state: Arc<StdMutex<Option<GameState>>>,
    cursor: Arc<StdMutex<LogCursor>>,
    events_tx: broadcast::Sender<SessionEvent>,
    tts: TtsPlayer,
    voices: Arc<VoiceMappingCache>,
}

impl EventPump {
    fn handle(&self, msg: ServerMessage) {
        match &msg {
            ServerMessage::GameStarted { .. } => {
                info!("🎬 Game started");
                // Voice identities may change per session
                let voices = self.voices.clone();
                tokio::spawn(async move { voices.refresh().await });
                let _ = self.events_tx.send(SessionEvent::GameStarted);
            }
            ServerMessage::Error { message } => {
                let notice = message
                    .clone()
                    .unwrap_or_else(|| "server reported an error".to_string());
                warn!("Server error: {}", notice);
                let _ = self.events_tx.send(SessionEvent::Notice(notice));
            }
            _ => {}
        }

        let prev = self
            .state
            .lock()
            .expect("state lock poisoned")
            .clone();
        match reduce(prev.as_ref(), &msg) {
            Reduction::Unchanged => {}
            Reduction::Replace(next) => {
                // Only the unseen suffix of the event list is rendered or
                // voiced, even when a wholesale replace re-delivers lines
                let new_events: Vec<NarrativeEvent> = self
                    .cursor
                    .lock()
                    .expect("cursor lock poisoned")
                    .take_new(&next)
                    .to_vec();
                *self.state.lock().expect("state lock poisoned") = Some(next.clone());
                let _ = self.events_tx.send(SessionEvent::State(Some(next)));
                for event in new_events {
                    if self.tts.is_enabled() {
                        self.tts.enqueue(&event.speaker, &event.content, None);
                    }
                    let _ = self.events_tx.send(SessionEvent::Narrative(event));
                }
            }
            Reduction::Clear => {
                info!("🔄 New session generation");
                self.cursor
                    .lock()
                    .expect("cursor lock poisoned")
                    .reset();
                *self.state.lock().expect("state lock poisoned") = None;
                let _ = self.events_tx.send(SessionEvent::State(None));
            }
        }
    }
}

/// One active game session. Constructed explicitly and disposed with
/// [`GameSession::shutdown`]; holds no global state.
pub struct GameSession {
    conn: ConnectionManager,
    tts: TtsPlayer,
    voices: Arc<VoiceMappingCache>,
    scripts: ScriptApi,
    state: Arc<StdMutex<Option<GameState>>>,
    cursor: Arc<StdMutex<LogCursor>>,
    events_tx: broadcast::Sender<SessionEvent>,
    next_message_id: AtomicU64,
    inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
    pump_task: StdMutex<Option<JoinHandle<()>>>,
    status_task: StdMutex<Option<JoinHandle<()>>>,
}

impl GameSession {
    /// Session with the default audio pipeline (HTTP synthesis, rodio
    /// output).
    pub fn new(config: ClientConfig) -> Self {
        let http = reqwest::Client::new();
        let synth = Arc::new(HttpSynthesizer::new(http.clone(), &config.api_url));
        let output = Arc::new(RodioOutput::new());
        Self::with_audio(config, synth, output)
    }

    /// Session with injected synthesis/output backends. This is the seam
    /// tests and embedders use; `new` is a thin wrapper over it.
    pub fn with_audio(
        config: ClientConfig,
        synth: Arc<dyn Synthesizer>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let http = reqwest::Client::new();
        let voices = Arc::new(VoiceMappingCache::new(
            http.clone(),
            &config.api_url,
            config.default_voice.clone(),
        ));
        let scripts = ScriptApi::new(http, config.api_url.clone());
        let tts = TtsPlayer::new(
            synth,
            output,
            voices.clone(),
            config.tts_enabled,
            config.volume,
        );
        let (conn, inbound_rx) =
            ConnectionManager::new(config.ws_url.clone(), config.reconnect_delay);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            conn,
            tts,
            voices,
            scripts,
            state: Arc::new(StdMutex::new(None)),
            cursor: Arc::new(StdMutex::new(LogCursor::new())),
            events_tx,
            next_message_id: AtomicU64::new(1),
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            pump_task: StdMutex::new(None),
            status_task: StdMutex::new(None),
        }
    }

    /// Connect and start pumping events. Safe to call once per session.
    pub async fn connect(&self) {
        if let Some(mut rx) = self
            .inbound_rx
            .lock()
            .expect("inbound rx lock poisoned")
            .take()
        {
            let pump = EventPump {
                state: self.state.clone(),
                cursor: self.cursor.clone(),
                events_tx: self.events_tx.clone(),
                tts: self.tts.clone(),
                voices: self.voices.clone(),
            };
            let handle = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    pump.handle(msg);
                }
            });
            *self.pump_task.lock().expect("pump task lock poisoned") = Some(handle);

            // Mirror status changes to listeners; every successful open
            // also refreshes the voice mapping
            let mut status_rx = self.conn.status();
            let events_tx = self.events_tx.clone();
            let voices = self.voices.clone();
            let handle = tokio::spawn(async move {
                while status_rx.changed().await.is_ok() {
                    let status = *status_rx.borrow();
                    let _ = events_tx.send(SessionEvent::Status(status));
                    if status == ConnectionStatus::Connected {
                        let voices = voices.clone();
                        tokio::spawn(async move { voices.refresh().await });
                    }
                }
            });
            *self.status_task.lock().expect("status task lock poisoned") = Some(handle);
        }

        if self.tts.is_enabled() {
            self.tts.start();
        }
        self.conn.connect().await;
    }

    /// Tear everything down: socket, pending reconnect, playback queue.
    pub async fn shutdown(&self) {
        self.conn.disconnect().await;
        self.tts.stop();
        if let Some(task) = self.pump_task.lock().expect("pump task lock poisoned").take() {
            task.abort();
        }
        if let Some(task) = self
            .status_task
            .lock()
            .expect("status task lock poisoned")
            .take()
        {
            task.abort();
        }
        info!("Session shut down");
    }

    // ----- action dispatchers -----

    /// Select a script and start a game. Starts a new generation: local
    /// log counters and the snapshot are cleared before asking the
    /// server.
    pub async fn start_game(&self, script_id: &str) {
        self.cursor.lock().expect("cursor lock poisoned").reset();
        *self.state.lock().expect("state lock poisoned") = None;
        let _ = self.events_tx.send(SessionEvent::State(None));
        self.conn
            .send(&ClientMessage::StartGame {
                data: StartGamePayload {
                    script_id: script_id.to_string(),
                },
            })
            .await;
    }

    pub async fn advance_phase(&self) {
        self.conn.send(&ClientMessage::NextPhase).await;
    }

    pub async fn reset_game(&self) {
        self.conn.send(&ClientMessage::ResetGame).await;
    }

    /// Free-form instruction to the AI director.
    pub async fn send_edit_instruction(&self, instruction: &str) {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.conn
            .send(&ClientMessage::EditInstruction {
                data: EditInstructionPayload {
                    instruction: instruction.to_string(),
                    message_id,
                },
            })
            .await;
    }

    // ----- reads -----

    pub fn current_state(&self) -> Option<GameState> {
        self.state.lock().expect("state lock poisoned").clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.conn.current_status()
    }

    /// Subscribe to session events. Any number of listeners; each sees
    /// events in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Scripts/characters read API for browse screens.
    pub fn scripts(&self) -> &ScriptApi {
        &self.scripts
    }

    // ----- playback controls -----

    /// One-time audio unlock; call from a user-gesture context. Failure
    /// leaves the session fully usable without narration.
    pub async fn initialize_audio(&self) -> crate::error::Result<()> {
        self.tts.initialize_audio().await
    }

    pub fn set_voice_enabled(&self, enabled: bool) {
        self.tts.set_enabled(enabled);
        if enabled {
            self.tts.start();
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.tts.set_muted(muted);
    }

    pub fn set_volume(&self, volume: f32) {
        self.tts.set_volume(volume);
    }

    pub fn voice_enabled(&self) -> bool {
        self.tts.is_enabled()
    }

    /// Current caption (speaker and text of the line being spoken).
    pub fn caption_watch(&self) -> watch::Receiver<Option<Caption>> {
        self.tts.caption_watch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::protocol::{AiActionPayload, StatePayload};
    use crate::tts::AudioClip;
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    struct NullSynth;
    impl Synthesizer for NullSynth {
        fn synthesize(&self, _voice: &str, _text: &str) -> BoxFuture<'static, Result<AudioClip>> {
            async { Ok(AudioClip { bytes: vec![0] }) }.boxed()
        }
    }

    struct NullOutput;
    impl AudioOutput for NullOutput {
        fn initialize(&self) -> BoxFuture<'static, Result<()>> {
            async { Ok(()) }.boxed()
        }
        fn play(&self, _clip: AudioClip) -> BoxFuture<'static, Result<()>> {
            async { Ok(()) }.boxed()
        }
        fn set_volume(&self, _volume: f32) {}
        fn set_muted(&self, _muted: bool) {}
        fn stop(&self) {}
    }

    fn pump(tts_enabled: bool) -> (EventPump, broadcast::Receiver<SessionEvent>, TtsPlayer) {
        let voices = Arc::new(VoiceMappingCache::new(
            reqwest::Client::new(),
            "http://unused",
            "narrator",
        ));
        let tts = TtsPlayer::new(
            Arc::new(NullSynth),
            Arc::new(NullOutput),
            voices.clone(),
            tts_enabled,
            1.0,
        );
        let (events_tx, events_rx) = broadcast::channel(64);
        let pump = EventPump {
            state: Arc::new(StdMutex::new(None)),
            cursor: Arc::new(StdMutex::new(LogCursor::new())),
            events_tx,
            tts: tts.clone(),
            voices,
        };
        (pump, events_rx, tts)
    }

    fn ai_action(character: &str, action: &str) -> ServerMessage {
        ServerMessage::AiAction {
            data: AiActionPayload {
                character: character.to_string(),
                action: action.to_string(),
                discovered_evidence: None,
            },
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn narrated(events: &[SessionEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Narrative(n) => Some((n.speaker.clone(), n.content.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn narrative_lines_are_rendered_once_in_order() {
        let (pump, mut rx, tts) = pump(true);

        pump.handle(ai_action("张三", "你好"));
        pump.handle(ai_action("李四", "在吗"));

        // A wholesale update re-delivering both lines must not duplicate
        let full = GameState {
            events: vec![
                NarrativeEvent {
                    speaker: "张三".to_string(),
                    content: "你好".to_string(),
                },
                NarrativeEvent {
                    speaker: "李四".to_string(),
                    content: "在吗".to_string(),
                },
            ],
            ..Default::default()
        };
        pump.handle(ServerMessage::GameStateUpdate {
            data: StatePayload {
                session_id: None,
                state: full,
            },
        });

        let events = drain(&mut rx);
        assert_eq!(
            narrated(&events),
            vec![
                ("张三".to_string(), "你好".to_string()),
                ("李四".to_string(), "在吗".to_string()),
            ]
        );
        // Each rendered line was also queued for speech, exactly once
        assert_eq!(tts.queue_len(), 2);
    }

    #[tokio::test]
    async fn reset_starts_a_clean_generation() {
        let (pump, mut rx, _tts) = pump(false);

        pump.handle(ai_action("张三", "第一代"));
        pump.handle(ServerMessage::GameReset);
        pump.handle(ai_action("李四", "第二代"));

        let events = drain(&mut rx);
        assert_eq!(
            narrated(&events),
            vec![
                ("张三".to_string(), "第一代".to_string()),
                ("李四".to_string(), "第二代".to_string()),
            ]
        );
        // The reset itself is visible as a None snapshot
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::State(None))));

        // Post-reset snapshot contains only post-reset events
        let snapshot = pump.state.lock().unwrap();
        match snapshot.as_ref() {
            Some(state) => {
                assert_eq!(state.events.len(), 1);
                assert_eq!(state.events[0].content, "第二代");
            }
            None => panic!("expected a post-reset snapshot"),
        }
    }

    #[tokio::test]
    async fn server_errors_become_notices() {
        let (pump, mut rx, _tts) = pump(false);
        pump.handle(ServerMessage::Error {
            message: Some("剧本不存在".to_string()),
        });
        let events = drain(&mut rx);
        assert!(matches!(
            &events[..],
            [SessionEvent::Notice(notice)] if notice == "剧本不存在"
        ));
        // Snapshot untouched
        assert!(pump.state.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_voice_skips_the_queue_but_not_the_log() {
        let (pump, mut rx, tts) = pump(false);
        pump.handle(ai_action("张三", "静音的一句"));
        assert_eq!(narrated(&drain(&mut rx)).len(), 1);
        assert_eq!(tts.queue_len(), 0);
    }

    #[tokio::test]
    async fn unknown_messages_are_inert() {
        let (pump, mut rx, tts) = pump(true);
        pump.handle(ServerMessage::Unknown);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(tts.queue_len(), 0);
        assert!(pump.state.lock().unwrap().is_none());
    }
}
