//! Per-connection actor.
//!
//! ## Loop
//!
//! ```text
//! SessionInput queue ─► Audio ─► VadSession::process_audio (spawn_blocking)
//!        │                          ├─ SpeechStarted → listen start
//!        │                          └─ Utterance     → listen stop → dialogue turn
//!        ├─► IotDescriptors ─► device tools registered on the session
//!        ├─► IotStates      ─► device state updated
//!        └─► Close          ─► force_end → last turn → teardown
//! ```
//!
//! One task owns the `VadSession` and the `ConversationContext`, so inputs
//! are handled strictly in arrival order and a turn (including its tool
//! rounds) completes before the next queued chunk is looked at. The
//! session's `CancellationToken` aborts an in-flight turn at its next await.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::dialogue::{self, TurnEnv, TurnOutcome};
use super::{Gateway, SessionOptions};
use crate::config::VadConfig;
use crate::conversation::ConversationContext;
use crate::ipc::events::{ListenState, ServerMessage};
use crate::tools::iot::{self, IotDescriptor, IotStateUpdate};
use crate::vad::{SessionModel, VadOutcome, VadSession};

/// Everything the transport can hand to a session.
#[derive(Debug)]
pub(crate) enum SessionInput {
    Audio(Vec<u8>),
    IotDescriptors(Vec<IotDescriptor>),
    IotStates(Vec<IotStateUpdate>),
    /// Finish queued work, flush trailing speech, then stop.
    Close,
}

#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub chunks_in: AtomicUsize,
    pub bytes_in: AtomicUsize,
    pub speech_starts: AtomicUsize,
    pub utterances: AtomicUsize,
    pub turns: AtomicUsize,
    pub turn_errors: AtomicUsize,
    pub llm_calls: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub sentences_spoken: AtomicUsize,
    pub audio_frames_out: AtomicUsize,
    pub vad_task_failures: AtomicUsize,
}

impl SessionDiagnostics {
    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            speech_starts: self.speech_starts.load(Ordering::Relaxed),
            utterances: self.utterances.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
            turn_errors: self.turn_errors.load(Ordering::Relaxed),
            llm_calls: self.llm_calls.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            sentences_spoken: self.sentences_spoken.load(Ordering::Relaxed),
            audio_frames_out: self.audio_frames_out.load(Ordering::Relaxed),
            vad_task_failures: self.vad_task_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub bytes_in: usize,
    pub speech_starts: usize,
    pub utterances: usize,
    pub turns: usize,
    pub turn_errors: usize,
    pub llm_calls: usize,
    pub tool_calls: usize,
    pub sentences_spoken: usize,
    pub audio_frames_out: usize,
    pub vad_task_failures: usize,
}

pub(crate) struct SessionActor {
    pub gateway: Arc<Gateway>,
    pub options: SessionOptions,
    pub vad_config: VadConfig,
    /// `None` only while the session is inside `spawn_blocking`.
    pub vad: Option<VadSession>,
    pub ctx: ConversationContext,
    pub input: mpsc::UnboundedReceiver<SessionInput>,
    pub cancel: CancellationToken,
    pub diagnostics: Arc<SessionDiagnostics>,
}

impl SessionActor {
    pub(crate) async fn run(self) {
        let span = info_span!("session", session_id = %self.ctx.session_id());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(mut self) {
        info!("session started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = self.input.recv() => next,
            };
            let Some(input) = next else {
                debug!("session handle dropped");
                break;
            };

            match input {
                SessionInput::Audio(bytes) => {
                    SessionDiagnostics::bump(&self.diagnostics.chunks_in);
                    self.diagnostics
                        .bytes_in
                        .fetch_add(bytes.len(), Ordering::Relaxed);
                    if self.on_audio(bytes).await {
                        break;
                    }
                }
                SessionInput::IotDescriptors(descriptors) => {
                    iot::register_devices(&mut self.ctx, descriptors);
                }
                SessionInput::IotStates(states) => {
                    self.ctx.connection().update_iot_state(&states);
                }
                SessionInput::Close => {
                    let trailing = self.vad.as_mut().and_then(VadSession::force_end);
                    if let Some(utterance) = trailing {
                        debug!(bytes = utterance.len(), "flushing trailing speech at close");
                        self.turn(utterance).await;
                    }
                    break;
                }
            }
        }
        self.teardown();
    }

    /// Returns `true` when the session should stop.
    async fn on_audio(&mut self, bytes: Vec<u8>) -> bool {
        match self.process_vad(bytes).await {
            VadOutcome::SpeechStarted => {
                SessionDiagnostics::bump(&self.diagnostics.speech_starts);
                self.ctx.connection().send_message(ServerMessage::Listen {
                    state: ListenState::Start,
                });
                false
            }
            VadOutcome::Utterance(utterance) => {
                self.ctx.connection().send_message(ServerMessage::Listen {
                    state: ListenState::Stop,
                });
                self.turn(utterance).await;
                if self.ctx.connection().close_after_reply() {
                    info!("closing after reply");
                    return true;
                }
                false
            }
            VadOutcome::Idle | VadOutcome::Speaking => false,
        }
    }

    async fn process_vad(&mut self, bytes: Vec<u8>) -> VadOutcome {
        let Some(mut vad) = self.vad.take() else {
            return VadOutcome::Idle;
        };
        match tokio::task::spawn_blocking(move || {
            let outcome = vad.process_audio(&bytes);
            (vad, outcome)
        })
        .await
        {
            Ok((vad, outcome)) => {
                self.vad = Some(vad);
                outcome
            }
            Err(e) => {
                // The session moved into the failed task is gone; start over.
                SessionDiagnostics::bump(&self.diagnostics.vad_task_failures);
                error!("vad task failed: {e}");
                self.vad = Some(self.fresh_vad());
                VadOutcome::Idle
            }
        }
    }

    fn fresh_vad(&self) -> VadSession {
        VadSession::new(
            self.vad_config.clone(),
            SessionModel::new(self.gateway.speech_model()),
        )
    }

    async fn turn(&mut self, utterance: Vec<u8>) {
        SessionDiagnostics::bump(&self.diagnostics.utterances);
        let turn_no = self.diagnostics.turns.fetch_add(1, Ordering::Relaxed) + 1;
        let span = info_span!("turn", turn = turn_no, bytes = utterance.len());

        let env = TurnEnv {
            gateway: &self.gateway,
            options: &self.options,
            diagnostics: &self.diagnostics,
        };
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("turn cancelled");
                return;
            }
            outcome = dialogue::run_turn(&env, &mut self.ctx, utterance).instrument(span) => outcome,
        };

        if outcome == TurnOutcome::Failed {
            SessionDiagnostics::bump(&self.diagnostics.turn_errors);
            if let Some(vad) = self.vad.as_mut() {
                vad.reset_session();
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(vad) = self.vad.as_mut() {
            if vad.is_speaking() {
                warn!(bytes = vad.main_buffer_len(), "dropping unfinished utterance");
            }
            vad.close();
        }
        self.vad = None;
        self.cancel.cancel();
        info!(diagnostics = ?self.diagnostics.snapshot(), "session closed");
    }
}
