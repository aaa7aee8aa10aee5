//! `Gateway`: process-wide state and the session factory.
//!
//! ## Lifecycle
//!
//! ```text
//! Gateway::from_config()
//!     └─► warm_up()              → default STT/TTS/LLM built eagerly
//!         └─► open_session()     → SessionHandle, actor task spawned
//!             ├─► push_audio()   → ordered per-session queue
//!             ├─► close()        → trailing speech flushed, actor joined
//!             └─► abort()        → in-flight turn cancelled, actor joined
//! ```
//!
//! ## Threading
//!
//! The speech-probability model is shared by every session; each session
//! owns its recurrent state and runs inference on the blocking pool.
//! Providers come from the registries on every turn, so a construction that
//! failed earlier is retried on the next utterance. Resolution runs on the
//! blocking pool because a first construction may load a model.

pub mod dialogue;
pub mod session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{GatewayConfig, VadConfig},
    conversation::{ConnectionHandle, ConversationContext},
    error::{Result, VoxgateError},
    inference::{ModelHandle, StubRecognizer},
    ipc::events::OutboundFrame,
    provider::{ProviderConfig, ProviderRegistry, Providers},
    tools::{
        iot::{IotDescriptor, IotStateUpdate},
        ToolRegistry,
    },
    vad::{EnergyModel, SessionModel, SpeechProbabilityModel, VadSession},
};

#[cfg(feature = "onnx")]
use crate::{
    inference::{WhisperConfig, WhisperModel},
    vad::SileroModel,
};

use session::{SessionActor, SessionDiagnostics, SessionInput};

pub use dialogue::{split_sentences, SentenceSplitter};
pub use session::DiagnosticsSnapshot;

/// Per-session overrides. `None` everywhere means process defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub stt: Option<ProviderConfig>,
    pub tts: Option<ProviderConfig>,
    pub llm: Option<ProviderConfig>,
    pub system_prompt: Option<String>,
    /// Global tools this session may use; empty allows all.
    pub allowed_tools: Vec<String>,
    pub vad: Option<VadConfig>,
}

/// Shared by every session. Wrap in `Arc` to open sessions.
pub struct Gateway {
    config: GatewayConfig,
    providers: Providers,
    tools: ToolRegistry,
    speech_model: Arc<dyn SpeechProbabilityModel>,
    next_session: AtomicU64,
}

impl Gateway {
    pub fn new(
        mut config: GatewayConfig,
        providers: Providers,
        tools: ToolRegistry,
        speech_model: Arc<dyn SpeechProbabilityModel>,
    ) -> Self {
        config.normalize();
        Self {
            config,
            providers,
            tools,
            speech_model,
            next_session: AtomicU64::new(1),
        }
    }

    /// Gateway with the built-in providers and tools. `recognizer` backs
    /// the `local` STT provider.
    ///
    /// # Errors
    /// A configured Silero model that cannot be loaded is fatal.
    pub fn from_config(config: GatewayConfig, recognizer: ModelHandle) -> Result<Self> {
        let speech_model = load_speech_model(&config)?;
        let providers = Providers::with_builtin(&config.providers, recognizer);
        Ok(Self::new(
            config,
            providers,
            ToolRegistry::with_builtin(),
            speech_model,
        ))
    }

    /// Build the default providers now so the first utterance does not pay
    /// for model warm-up. Failures are logged; the fallback rules apply.
    pub fn warm_up(&self) {
        info!("warming up default providers");
        self.providers.init_defaults();
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn speech_model(&self) -> Arc<dyn SpeechProbabilityModel> {
        Arc::clone(&self.speech_model)
    }

    /// Resolve a provider from async code. The lookup, and a construction it
    /// may trigger, run on the blocking pool.
    pub async fn resolve<P, F>(
        self: &Arc<Self>,
        pick: F,
        config: Option<&ProviderConfig>,
    ) -> Result<Arc<P>>
    where
        P: ?Sized + Send + Sync + 'static,
        F: FnOnce(&Providers) -> &ProviderRegistry<P> + Send + 'static,
    {
        let gateway = Arc::clone(self);
        let config = config.cloned();
        tokio::task::spawn_blocking(move || pick(&gateway.providers).get_service(config.as_ref()))
            .await
            .map_err(|e| VoxgateError::Other(anyhow::anyhow!("provider resolution failed: {e}")))?
    }

    /// Start a session actor. Must be called inside a Tokio runtime.
    pub fn open_session(self: &Arc<Self>, options: SessionOptions) -> SessionHandle {
        let session_id = options.session_id.clone().unwrap_or_else(|| {
            format!("session-{}", self.next_session.fetch_add(1, Ordering::Relaxed))
        });

        let mut vad_config = options.vad.clone().unwrap_or_else(|| self.config.vad.clone());
        vad_config.normalize();
        let window = self.speech_model.window_samples();
        if vad_config.window_samples != window {
            warn!(
                configured = vad_config.window_samples,
                model = window,
                "window size follows the speech model"
            );
            vad_config.window_samples = window;
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let diagnostics = Arc::new(SessionDiagnostics::default());

        let connection = ConnectionHandle::new(session_id.clone(), outbound_tx, cancel.clone());
        let ctx = ConversationContext::new(
            options
                .system_prompt
                .clone()
                .unwrap_or_else(|| self.config.dialogue.system_prompt.clone()),
            self.config.dialogue.max_history_turns,
            connection,
            self.tools.filtered(&options.allowed_tools),
        );
        let vad = VadSession::new(vad_config.clone(), SessionModel::new(self.speech_model()));

        let actor = SessionActor {
            gateway: Arc::clone(self),
            options,
            vad_config,
            vad: Some(vad),
            ctx,
            input: input_rx,
            cancel: cancel.clone(),
            diagnostics: Arc::clone(&diagnostics),
        };
        let task = tokio::spawn(actor.run());
        info!(session_id = %session_id, "session opened");

        SessionHandle {
            session_id,
            input: input_tx,
            outbound: Some(outbound_rx),
            cancel,
            diagnostics,
            task: Some(task),
        }
    }

    /// Release the speech model. Sessions still running score 0.0 from now on.
    pub fn shutdown(&self) {
        info!("gateway shutting down");
        self.speech_model.close();
    }
}

/// Pick the speech-probability model: Silero when a path is configured (and
/// the `onnx` feature is on), the energy model otherwise.
pub fn load_speech_model(config: &GatewayConfig) -> Result<Arc<dyn SpeechProbabilityModel>> {
    match &config.silero_model_path {
        #[cfg(feature = "onnx")]
        Some(path) => {
            let model = SileroModel::load(path)?;
            info!(path = %path.display(), "silero speech model loaded");
            Ok(Arc::new(model))
        }
        #[cfg(not(feature = "onnx"))]
        Some(path) => {
            warn!(
                path = %path.display(),
                "built without the onnx feature; using the energy model"
            );
            Ok(Arc::new(EnergyModel::default()))
        }
        None => Ok(Arc::new(EnergyModel::default())),
    }
}

/// Pick the offline recognizer behind the `local` STT provider. Whisper
/// files are only opened when that provider warms up.
pub fn load_recognizer(config: &GatewayConfig) -> ModelHandle {
    match &config.local_stt.model_dir {
        #[cfg(feature = "onnx")]
        Some(dir) => {
            info!(dir = %dir.display(), "local stt uses whisper");
            ModelHandle::new(WhisperModel::new(WhisperConfig::from_dir(
                dir,
                config.local_stt.language.clone(),
            )))
        }
        #[cfg(not(feature = "onnx"))]
        Some(dir) => {
            warn!(
                dir = %dir.display(),
                "built without the onnx feature; local stt recognizes nothing"
            );
            ModelHandle::new(StubRecognizer::new())
        }
        None => ModelHandle::new(StubRecognizer::new()),
    }
}

/// The host's side of one session.
///
/// Dropping the handle cancels the session like [`abort`](Self::abort)
/// without waiting for it.
pub struct SessionHandle {
    session_id: String,
    input: mpsc::UnboundedSender<SessionInput>,
    outbound: Option<mpsc::UnboundedReceiver<OutboundFrame>>,
    cancel: CancellationToken,
    diagnostics: Arc<SessionDiagnostics>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, input: SessionInput) -> Result<()> {
        self.input
            .send(input)
            .map_err(|_| VoxgateError::SessionClosed(self.session_id.clone()))
    }

    /// Queue one inbound PCM16 LE chunk.
    pub fn push_audio(&self, chunk: impl Into<Vec<u8>>) -> Result<()> {
        self.send(SessionInput::Audio(chunk.into()))
    }

    /// Device descriptors reported by the client; their tools become
    /// available from the next turn on.
    pub fn register_iot(&self, descriptors: Vec<IotDescriptor>) -> Result<()> {
        self.send(SessionInput::IotDescriptors(descriptors))
    }

    pub fn update_iot_state(&self, states: Vec<IotStateUpdate>) -> Result<()> {
        self.send(SessionInput::IotStates(states))
    }

    /// Frames for the transport. Yields `None` for the second caller; the
    /// stream ends once the session has stopped.
    pub fn outbound(&mut self) -> Option<mpsc::UnboundedReceiver<OutboundFrame>> {
        self.outbound.take()
    }

    /// `true` once the session stopped or was asked to stop, including after
    /// a close-after-reply tool.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.input.is_closed()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Finish queued audio, answer trailing speech, then stop.
    pub async fn close(mut self) -> Result<()> {
        // The actor may already be gone after close-after-reply.
        let _ = self.input.send(SessionInput::Close);
        self.join().await
    }

    /// Stop now, discarding any in-flight turn.
    pub async fn abort(mut self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await.map_err(|e| {
            VoxgateError::Other(anyhow::anyhow!("session task failed: {e}"))
        })
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
