//! Voice Activity Detection.
//!
//! Two layers:
//!
//! - [`SpeechProbabilityModel`] scores one fixed-size window. Recurrent state
//!   is threaded explicitly (`state in → state out`), so a single loaded
//!   model can serve every session while each session keeps its own state.
//! - [`VadSession`] is the per-connection state machine that turns raw PCM
//!   chunks into utterances.
//!
//! Swap [`EnergyModel`] (default) for `SileroModel` (`onnx` feature) without
//! touching the session engine.

pub mod energy;
pub mod session;

#[cfg(feature = "onnx")]
pub mod silero;

#[cfg(feature = "onnx")]
pub use silero::SileroModel;

pub use energy::EnergyModel;
pub use session::{VadOutcome, VadSession};

use std::sync::Arc;

use tracing::error;

use crate::error::Result;

/// Floats in a recurrent state: 2 layers × 1 batch × 128 units.
pub const STATE_LEN: usize = 256;

/// Recurrent state carried between windows.
///
/// LSTM models read the first half as `h` and the second half as `c`; GRU
/// models read all of it as one `[2, 1, 128]` tensor. Stateless models
/// ignore it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechModelState(Vec<f32>);

impl SpeechModelState {
    pub fn zeroed() -> Self {
        Self(vec![0.0; STATE_LEN])
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

impl Default for SpeechModelState {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A fixed-topology model producing a speech probability for one window of
/// 16 kHz samples.
pub trait SpeechProbabilityModel: Send + Sync + 'static {
    /// Window length in samples the model expects.
    fn window_samples(&self) -> usize;

    /// Run one inference step.
    ///
    /// Returns the probability in [0, 1] and the successor state. Errors are
    /// returned as-is; the fail-safe lives in [`SessionModel`].
    fn infer(&self, window: &[f32], state: &SpeechModelState) -> Result<(f32, SpeechModelState)>;

    /// Release the underlying inference session. Idempotent.
    fn close(&self) {}
}

/// One session's view of a shared model: owns the recurrent state.
pub struct SessionModel {
    model: Arc<dyn SpeechProbabilityModel>,
    state: SpeechModelState,
    failures: u64,
}

impl SessionModel {
    pub fn new(model: Arc<dyn SpeechProbabilityModel>) -> Self {
        Self {
            model,
            state: SpeechModelState::zeroed(),
            failures: 0,
        }
    }

    /// Score one window. Any inference failure is logged and reported as
    /// 0.0 (no speech); the state is left as it was before the failed step.
    pub fn speech_probability(&mut self, window: &[f32]) -> f32 {
        match self.model.infer(window, &self.state) {
            Ok((prob, next)) => {
                self.state = next;
                if prob.is_finite() {
                    prob.clamp(0.0, 1.0)
                } else {
                    0.0
                }
            }
            Err(e) => {
                self.failures += 1;
                error!(failures = self.failures, "speech probability inference failed: {e}");
                0.0
            }
        }
    }

    /// Back to the zero state.
    pub fn reset(&mut self) {
        self.state = SpeechModelState::zeroed();
    }

    pub fn state(&self) -> &SpeechModelState {
        &self.state
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn window_samples(&self) -> usize {
        self.model.window_samples()
    }
}

impl std::fmt::Debug for SessionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionModel")
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoxgateError;

    /// Adds 1.0 to every state slot per call; fails on windows whose first
    /// sample is negative.
    struct CountingModel;

    impl SpeechProbabilityModel for CountingModel {
        fn window_samples(&self) -> usize {
            4
        }

        fn infer(
            &self,
            window: &[f32],
            state: &SpeechModelState,
        ) -> Result<(f32, SpeechModelState)> {
            if window[0] < 0.0 {
                return Err(VoxgateError::Inference("negative window".into()));
            }
            let next = state.as_slice().iter().map(|v| v + 1.0).collect();
            Ok((window[0], SpeechModelState::from_vec(next)))
        }
    }

    #[test]
    fn state_threads_through_calls() {
        let mut m = SessionModel::new(Arc::new(CountingModel));
        assert!(m.state().is_zeroed());
        m.speech_probability(&[0.3; 4]);
        m.speech_probability(&[0.3; 4]);
        assert_eq!(m.state().as_slice()[0], 2.0);
    }

    #[test]
    fn failure_yields_zero_and_keeps_state() {
        let mut m = SessionModel::new(Arc::new(CountingModel));
        m.speech_probability(&[0.9; 4]);
        let before = m.state().clone();
        assert_eq!(m.speech_probability(&[-1.0; 4]), 0.0);
        assert_eq!(m.state(), &before);
        assert_eq!(m.failures(), 1);
    }

    #[test]
    fn probability_is_clamped() {
        let mut m = SessionModel::new(Arc::new(CountingModel));
        assert_eq!(m.speech_probability(&[7.0; 4]), 1.0);
    }

    #[test]
    fn reset_zeroes_state() {
        let mut m = SessionModel::new(Arc::new(CountingModel));
        m.speech_probability(&[0.1; 4]);
        m.reset();
        assert!(m.state().is_zeroed());
    }

    #[test]
    fn sessions_sharing_a_model_keep_separate_state() {
        let shared: Arc<dyn SpeechProbabilityModel> = Arc::new(CountingModel);
        let mut a = SessionModel::new(Arc::clone(&shared));
        let b = SessionModel::new(shared);
        a.speech_probability(&[0.1; 4]);
        assert!(!a.state().is_zeroed());
        assert!(b.state().is_zeroed());
    }
}
