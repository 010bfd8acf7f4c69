//! Live session controller: the state machine that owns the capture
//! pipeline, the playback scheduler and the live connection.
//!
//! Lifecycle: `Idle -> Connecting -> Connected -> Closed | Error`. One
//! transport-level retry with a fixed backoff is the only automatic
//! recovery; every other failure requires an explicit user restart. The
//! controller's event loop is the sole mutator of session state: capture
//! frames, inbound connection events, playback completions and timers all
//! arrive as messages on its channels.

pub mod connection;

pub use connection::{
    DEFAULT_LIVE_ENDPOINT, LiveConnection, LiveConnector, LiveEvent, ShutdownHandle,
    TungsteniteConnector,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audio::scheduler::{PlaybackScheduler, PlaybackSink};
use crate::audio::{AUDIO_CHANNELS, CAPTURE_FRAME_SIZE, CapturePipeline, OUTPUT_SAMPLE_RATE_HZ, pcm};
use crate::error::MentorError;
use crate::types::{
    ClientMessage, GenerationConfig, PrebuiltVoiceConfig, RealtimeInput, ResponseModality,
    SessionSetup, SpeechConfig, TextContent, VoiceConfig,
};

/// Source of short-lived credentials for the live connection, normally the
/// backend proxy's `get_voice_key` action.
pub trait CredentialSource: Send + Sync + 'static {
    fn voice_key(&self) -> impl Future<Output = Result<String, MentorError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Closed,
    Error,
}

/// Snapshot of the session for whatever frontend renders it.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// True while the active playback set is non-empty.
    pub speaking: bool,
    pub error: Option<String>,
    /// Set when the error points at the backend proxy rather than the model,
    /// so the UI can hint at checking the local server or function deploy.
    pub backend_hint: bool,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    /// Wall-clock budget for credential fetch plus connection open.
    pub connect_timeout: Duration,
    /// Fixed backoff before the single transport-level retry.
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice_name: "Puck".to_string(),
            system_instruction: String::new(),
            connect_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            max_retries: 1,
            frame_size: CAPTURE_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    /// The fixed setup sent on every connection attempt: audio-only response
    /// modality, the named prebuilt voice and the system instruction.
    fn setup(&self) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![ResponseModality::Audio]),
                speech_config: Some(SpeechConfig {
                    voice_config: Some(VoiceConfig {
                        prebuilt_voice_config: Some(PrebuiltVoiceConfig {
                            voice_name: self.voice_name.clone(),
                        }),
                    }),
                }),
                temperature: None,
            }),
            system_instruction: if self.system_instruction.is_empty() {
                None
            } else {
                Some(TextContent::from_text(self.system_instruction.clone()))
            },
        }
    }
}

struct RunHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owner of the single live session. At most one run is active at a time;
/// the controller is safe to stop and restart (or drop) repeatedly without
/// leaking tasks or timers.
pub struct SessionController<C, K> {
    config: SessionConfig,
    connector: Arc<C>,
    credentials: Arc<K>,
    status_tx: watch::Sender<SessionStatus>,
    run: Option<RunHandle>,
}

impl<C: LiveConnector, K: CredentialSource> SessionController<C, K> {
    pub fn new(connector: C, credentials: K, config: SessionConfig) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        Self {
            config,
            connector: Arc::new(connector),
            credentials: Arc::new(credentials),
            status_tx,
            run: None,
        }
    }

    /// Watchable status for UI rendering.
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.status_tx.borrow().state
    }

    /// Starts the session: `frames_rx` carries raw capture batches from the
    /// input device, `sink` renders scheduled playback chunks.
    pub fn start(
        &mut self,
        frames_rx: mpsc::Receiver<Vec<f32>>,
        sink: Box<dyn PlaybackSink>,
    ) -> Result<(), MentorError> {
        if self.run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(MentorError::Internal("session already running".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            self.config.clone(),
            self.connector.clone(),
            self.credentials.clone(),
            frames_rx,
            sink,
            self.status_tx.clone(),
            shutdown_rx,
        ));
        self.run = Some(RunHandle {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Tears the session down: cancels timers, stops capture, halts all
    /// playback and waits for the run task to finish. Idempotent and callable
    /// from any state, including already-idle.
    pub async fn stop(&mut self) {
        if let Some(run) = self.run.take() {
            let _ = run.shutdown.send(());
            let _ = run.task.await;
        }
    }
}

impl<C, K> Drop for SessionController<C, K> {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            let _ = run.shutdown.send(());
            run.task.abort();
        }
    }
}

enum ConnectedOutcome {
    Stop,
    RemoteClose,
    TransportError(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_session<C: LiveConnector, K: CredentialSource>(
    config: SessionConfig,
    connector: Arc<C>,
    credentials: Arc<K>,
    frames_rx: mpsc::Receiver<Vec<f32>>,
    sink: Box<dyn PlaybackSink>,
    status: watch::Sender<SessionStatus>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    status.send_replace(SessionStatus {
        state: SessionState::Connecting,
        ..Default::default()
    });

    // Pre-flight, before any credential or device is touched.
    if !connector.is_secure() {
        let err = MentorError::InsecureContext(
            "live endpoint must use wss:// (or ws:// on loopback)".to_string(),
        );
        fail(&status, err.to_string(), false);
        return;
    }

    let (ended_tx, mut ended_rx) = mpsc::channel(32);
    let mut scheduler = PlaybackScheduler::new(sink, ended_tx);
    let mut capture = CapturePipeline::new();
    let (encoded_tx, mut encoded_rx) = mpsc::channel(64);
    // Handed to the capture pipeline on first open, then kept running across
    // the single retry.
    let mut frames_rx = Some(frames_rx);

    let mut attempt: u32 = 0;
    loop {
        let connect_result = tokio::select! {
            _ = &mut shutdown_rx => {
                teardown(&mut capture, &mut scheduler, &status);
                return;
            }
            result = tokio::time::timeout(
                config.connect_timeout,
                open_connection(&*connector, &*credentials, config.setup()),
            ) => result,
        };

        let mut conn = match connect_result {
            Err(_elapsed) => {
                warn!("[Session] Connection attempt timed out after {:?}", config.connect_timeout);
                capture.stop();
                scheduler.stop_all();
                fail(&status, "Connection timed out. Try again.".to_string(), false);
                return;
            }
            Ok(Err(e)) => {
                let retryable = matches!(e, MentorError::Transport(_));
                if retryable && attempt < config.max_retries {
                    attempt += 1;
                    info!("[Session] Transport error, retry {} in {:?}: {}", attempt, config.retry_delay, e);
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            teardown(&mut capture, &mut scheduler, &status);
                            return;
                        }
                        _ = tokio::time::sleep(config.retry_delay) => {}
                    }
                    continue;
                }
                let hint = e.is_backend_reachability();
                capture.stop();
                scheduler.stop_all();
                let message = if retryable {
                    "Connection lost.".to_string()
                } else {
                    e.to_string()
                };
                fail(&status, message, hint);
                return;
            }
            Ok(Ok(conn)) => conn,
        };

        info!("[Session] Connected");
        status.send_modify(|s| {
            s.state = SessionState::Connected;
            s.error = None;
            s.backend_hint = false;
        });

        if let Some(rx) = frames_rx.take() {
            capture.start(rx, encoded_tx.clone(), config.frame_size);
        }

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown_rx => break ConnectedOutcome::Stop,
                event = conn.events.recv() => match event {
                    Some(LiveEvent::Message(msg)) => {
                        handle_server_message(&msg, &mut scheduler, &status);
                    }
                    Some(LiveEvent::Error(e)) => break ConnectedOutcome::TransportError(e),
                    Some(LiveEvent::Closed) | None => break ConnectedOutcome::RemoteClose,
                    Some(LiveEvent::Open) => {}
                },
                Some(chunk) = encoded_rx.recv() => {
                    let msg = ClientMessage::RealtimeInput(RealtimeInput { audio: Some(chunk) });
                    // Best-effort delivery, no backpressure into the pipeline.
                    if conn.sender.try_send(msg).is_err() {
                        warn!("[Session] Dropping outbound frame: connection busy or gone");
                    }
                }
                Some(id) = ended_rx.recv() => {
                    if scheduler.on_chunk_ended(id) {
                        status.send_modify(|s| s.speaking = false);
                    }
                }
            }
        };
        conn.shutdown.shutdown();

        match outcome {
            ConnectedOutcome::Stop | ConnectedOutcome::RemoteClose => {
                teardown(&mut capture, &mut scheduler, &status);
                return;
            }
            ConnectedOutcome::TransportError(e) => {
                if attempt < config.max_retries {
                    attempt += 1;
                    warn!("[Session] Live connection error, retry {} in {:?}: {}", attempt, config.retry_delay, e);
                    scheduler.stop_all();
                    status.send_modify(|s| {
                        s.state = SessionState::Connecting;
                        s.speaking = false;
                    });
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            teardown(&mut capture, &mut scheduler, &status);
                            return;
                        }
                        _ = tokio::time::sleep(config.retry_delay) => {}
                    }
                    continue;
                }
                warn!("[Session] Retry budget exhausted: {}", e);
                capture.stop();
                scheduler.stop_all();
                fail(&status, "Connection lost.".to_string(), false);
                return;
            }
        }
    }
}

/// Fetches a credential and opens the live connection, resolving once the
/// remote acknowledges the setup. The caller bounds this with the connect
/// timeout.
async fn open_connection<C: LiveConnector, K: CredentialSource>(
    connector: &C,
    credentials: &K,
    setup: SessionSetup,
) -> Result<LiveConnection, MentorError> {
    let key = credentials.voice_key().await?;
    if key.trim().is_empty() {
        return Err(MentorError::Credential(
            "backend returned an empty API key".to_string(),
        ));
    }

    let mut conn = connector.connect(&key, setup).await?;
    loop {
        match conn.events.recv().await {
            Some(LiveEvent::Open) => return Ok(conn),
            Some(LiveEvent::Message(_)) => continue,
            Some(LiveEvent::Error(e)) => return Err(MentorError::Transport(e)),
            Some(LiveEvent::Closed) | None => {
                return Err(MentorError::Transport(
                    "connection closed before open".to_string(),
                ));
            }
        }
    }
}

/// Decodes the first audio part of an inbound message and schedules it.
/// Decode failures are logged and the message dropped; the session stays
/// connected.
fn handle_server_message(
    msg: &crate::types::ServerMessage,
    scheduler: &mut PlaybackScheduler,
    status: &watch::Sender<SessionStatus>,
) {
    let Some(blob) = msg.first_audio_payload() else {
        return;
    };
    let decoded = pcm::decode_chunk(&blob.data)
        .and_then(|bytes| pcm::bytes_to_playback_chunk(&bytes, OUTPUT_SAMPLE_RATE_HZ, AUDIO_CHANNELS));
    match decoded {
        Ok(chunk) => {
            scheduler.schedule(chunk);
            status.send_modify(|s| s.speaking = true);
        }
        Err(e) => {
            warn!("[Session] Dropping undecodable audio message: {}", e);
        }
    }
}

fn teardown(
    capture: &mut CapturePipeline,
    scheduler: &mut PlaybackScheduler,
    status: &watch::Sender<SessionStatus>,
) {
    capture.stop();
    scheduler.stop_all();
    status.send_modify(|s| {
        s.state = SessionState::Closed;
        s.speaking = false;
    });
    info!("[Session] Closed");
}

fn fail(status: &watch::Sender<SessionStatus>, message: String, backend_hint: bool) {
    status.send_replace(SessionStatus {
        state: SessionState::Error,
        speaking: false,
        error: Some(message),
        backend_hint,
    });
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    pub(crate) fn init_test_logger() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::builder()
                        .with_default_directive(Level::INFO.into())
                        .from_env_lossy(),
                )
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::init_test_logger;
    use super::*;
    use crate::audio::pcm::PlaybackChunk;
    use crate::types::AudioBlob;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink;

    impl PlaybackSink for NullSink {
        fn begin(&mut self, _id: u64, _chunk: &PlaybackChunk, _start_secs: f64) {}
        fn halt(&mut self, _id: u64) {}
    }

    struct FixedKey(&'static str);

    impl CredentialSource for FixedKey {
        fn voice_key(&self) -> impl Future<Output = Result<String, MentorError>> + Send {
            let key = self.0.to_string();
            async move { Ok(key) }
        }
    }

    struct CountingKey {
        calls: Arc<AtomicUsize>,
        result: Result<String, String>,
    }

    impl CredentialSource for CountingKey {
        fn voice_key(&self) -> impl Future<Output = Result<String, MentorError>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = self
                .result
                .clone()
                .map_err(MentorError::Backend);
            async move { result }
        }
    }

    /// One fake connection the test can drive from the server side.
    struct FakeHandle {
        events: mpsc::Sender<LiveEvent>,
        outbound: mpsc::Receiver<ClientMessage>,
    }

    struct FakeConnector {
        secure: bool,
        /// Emits `Open` immediately on successful connect.
        auto_open: bool,
        /// Scripted outcomes per connect attempt; exhausted script = success.
        connect_results: StdMutex<VecDeque<Result<(), String>>>,
        attempts: Arc<AtomicUsize>,
        handles: mpsc::UnboundedSender<FakeHandle>,
    }

    impl FakeConnector {
        fn new(auto_open: bool) -> (Self, mpsc::UnboundedReceiver<FakeHandle>) {
            let (handles_tx, handles_rx) = mpsc::unbounded_channel();
            (
                Self {
                    secure: true,
                    auto_open,
                    connect_results: StdMutex::new(VecDeque::new()),
                    attempts: Arc::new(AtomicUsize::new(0)),
                    handles: handles_tx,
                },
                handles_rx,
            )
        }

        fn script(self, results: Vec<Result<(), String>>) -> Self {
            *self.connect_results.lock().unwrap() = results.into();
            self
        }
    }

    impl LiveConnector for FakeConnector {
        fn is_secure(&self) -> bool {
            self.secure
        }

        fn connect(
            &self,
            _api_key: &str,
            _setup: SessionSetup,
        ) -> impl Future<Output = Result<LiveConnection, MentorError>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .connect_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()));
            let auto_open = self.auto_open;
            let handles = self.handles.clone();

            async move {
                scripted.map_err(MentorError::Transport)?;
                let (events_tx, events_rx) = mpsc::channel(16);
                let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
                let (shutdown_tx, _shutdown_rx) = oneshot::channel();
                if auto_open {
                    events_tx.send(LiveEvent::Open).await.ok();
                }
                let _ = handles.send(FakeHandle {
                    events: events_tx,
                    outbound: outgoing_rx,
                });
                Ok(LiveConnection {
                    sender: outgoing_tx,
                    events: events_rx,
                    shutdown: ShutdownHandle::new(shutdown_tx),
                })
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(200),
            retry_delay: Duration::from_millis(20),
            system_instruction: "You are a study mentor.".to_string(),
            ..Default::default()
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SessionStatus>,
        mut predicate: impl FnMut(&SessionStatus) -> bool,
    ) -> SessionStatus {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if predicate(&rx.borrow()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.expect("status channel closed");
            }
        })
        .await
        .expect("status never reached the expected shape")
    }

    fn audio_message(frames: usize) -> crate::types::ServerMessage {
        use base64::Engine as _;
        let bytes = vec![1u8; frames * 2];
        serde_json::from_value(serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [ { "inlineData": {
                "mimeType": "audio/pcm;rate=24000",
                "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
            }}]}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn insecure_endpoint_fails_before_credentials() {
        init_test_logger();
        let (mut connector, _handles) = FakeConnector::new(true);
        connector.secure = false;
        let calls = Arc::new(AtomicUsize::new(0));
        let creds = CountingKey {
            calls: calls.clone(),
            result: Ok("key".to_string()),
        };

        let mut controller = SessionController::new(connector, creds, fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert!(s.error.unwrap().contains("insecure transport"));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "pre-flight must run before credential fetch");
        controller.stop().await;
    }

    #[tokio::test]
    async fn open_never_arriving_times_out_and_tears_down() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(false);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert_eq!(s.error.as_deref(), Some("Connection timed out. Try again."));
        assert!(!s.speaking);
        controller.stop().await;
    }

    #[tokio::test]
    async fn empty_credential_is_fatal_without_retry() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let attempts = Arc::new(AtomicUsize::new(0));
        let creds = CountingKey {
            calls: attempts.clone(),
            result: Ok("   ".to_string()),
        };
        let mut controller = SessionController::new(connector, creds, fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert!(s.error.unwrap().contains("credential"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        controller.stop().await;
    }

    #[tokio::test]
    async fn backend_failure_sets_deployment_hint() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let creds = CountingKey {
            calls: Arc::new(AtomicUsize::new(0)),
            result: Err("fetch refused".to_string()),
        };
        let mut controller = SessionController::new(connector, creds, fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert!(s.backend_hint, "backend reachability errors carry the deploy hint");
        controller.stop().await;
    }

    #[tokio::test]
    async fn transport_failure_retries_once_then_connects() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let connector = connector.script(vec![Err("refused".to_string()), Ok(())]);
        let attempts = connector.attempts.clone();

        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        controller.stop().await;
        assert_eq!(controller.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn exhausted_retries_report_connection_lost() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let connector = connector.script(vec![
            Err("refused".to_string()),
            Err("refused again".to_string()),
        ]);

        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert_eq!(s.error.as_deref(), Some("Connection lost."));
        controller.stop().await;
    }

    #[tokio::test]
    async fn malformed_inbound_audio_is_dropped_session_stays_connected() {
        init_test_logger();
        let (connector, mut handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let handle = handles.recv().await.unwrap();

        let bad: crate::types::ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": { "modelTurn": { "parts": [ { "inlineData": {
                "mimeType": "audio/pcm;rate=24000",
                "data": "!!! definitely not base64 !!!"
            }}]}}
        }))
        .unwrap();
        handle.events.send(LiveEvent::Message(bad)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let s = status.borrow().clone();
        assert_eq!(s.state, SessionState::Connected);
        assert!(!s.speaking);
        controller.stop().await;
    }

    #[tokio::test]
    async fn inbound_audio_drives_the_speaking_flag() {
        init_test_logger();
        let (connector, mut handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let handle = handles.recv().await.unwrap();

        // 10ms of audio at 24kHz.
        handle.events.send(LiveEvent::Message(audio_message(240))).await.unwrap();
        wait_for(&mut status, |s| s.speaking).await;
        // The completion timer clears the flag once the chunk "finishes".
        let s = wait_for(&mut status, |s| !s.speaking).await;
        assert_eq!(s.state, SessionState::Connected);
        controller.stop().await;
    }

    #[tokio::test]
    async fn captured_frames_flow_to_the_connection() {
        init_test_logger();
        let (connector, mut handles) = FakeConnector::new(true);
        let mut config = fast_config();
        config.frame_size = 8;
        let mut controller = SessionController::new(connector, FixedKey("key"), config);
        let mut status = controller.status();
        let (frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let mut handle = handles.recv().await.unwrap();

        frames_tx.send(vec![0.25; 8]).await.unwrap();
        let sent = tokio::time::timeout(Duration::from_secs(2), handle.outbound.recv())
            .await
            .expect("no outbound frame")
            .unwrap();
        match sent {
            ClientMessage::RealtimeInput(RealtimeInput { audio: Some(AudioBlob { mime_type, data }) }) => {
                assert_eq!(mime_type, "audio/pcm;rate=16000");
                assert!(!data.is_empty());
            }
            other => panic!("unexpected outbound message: {other:?}"),
        }
        controller.stop().await;
    }

    #[tokio::test]
    async fn remote_error_while_connected_retries_then_fails() {
        init_test_logger();
        let (connector, mut handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let first = handles.recv().await.unwrap();
        first.events.send(LiveEvent::Error("stream reset".to_string())).await.unwrap();

        // One automatic retry reconnects.
        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let second = handles.recv().await.unwrap();
        second.events.send(LiveEvent::Error("stream reset".to_string())).await.unwrap();

        let s = wait_for(&mut status, |s| s.state == SessionState::Error).await;
        assert_eq!(s.error.as_deref(), Some("Connection lost."));
        controller.stop().await;
    }

    #[tokio::test]
    async fn remote_close_moves_session_to_closed() {
        init_test_logger();
        let (connector, mut handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        let handle = handles.recv().await.unwrap();
        handle.events.send(LiveEvent::Closed).await.unwrap();

        wait_for(&mut status, |s| s.state == SessionState::Closed).await;
        controller.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_controller_restarts() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let mut status = controller.status();

        let (_frames_tx, frames_rx) = mpsc::channel(4);
        controller.start(frames_rx, Box::new(NullSink)).unwrap();
        wait_for(&mut status, |s| s.state == SessionState::Connected).await;

        controller.stop().await;
        controller.stop().await; // second stop is a no-op
        assert_eq!(controller.state(), SessionState::Closed);

        // The controller is reusable after teardown.
        let (_frames_tx2, frames_rx2) = mpsc::channel(4);
        controller.start(frames_rx2, Box::new(NullSink)).unwrap();
        wait_for(&mut status, |s| s.state == SessionState::Connected).await;
        controller.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        init_test_logger();
        let (connector, _handles) = FakeConnector::new(true);
        let mut controller = SessionController::new(connector, FixedKey("key"), fast_config());
        let (_a_tx, a_rx) = mpsc::channel(4);
        let (_b_tx, b_rx) = mpsc::channel(4);
        controller.start(a_rx, Box::new(NullSink)).unwrap();
        assert!(controller.start(b_rx, Box::new(NullSink)).is_err());
        controller.stop().await;
    }
}
