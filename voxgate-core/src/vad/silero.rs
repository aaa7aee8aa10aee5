//! Silero VAD neural speech-probability model.
//!
//! Wraps the Silero VAD ONNX model published at
//! <https://github.com/snakers4/silero-vad>. Both the v4 LSTM interface
//! (separate `h`/`c` tensors) and the v5 GRU interface (single `state`
//! tensor) are detected from the graph's input names.
//!
//! | Name     | Shape        | DType | Direction | Interface |
//! |----------|--------------|-------|-----------|-----------|
//! | `input`  | `[1, 512]`   | f32   | in        | both      |
//! | `sr`     | `[1]`        | i64   | in        | both      |
//! | `h`/`c`  | `[2,1,64]`   | f32   | in/out    | LSTM      |
//! | `state`  | `[2,1,128]`  | f32   | in/out    | GRU       |
//! | `output` | `[1, 1]`     | f32   | out       | both      |
//!
//! `ort::Session::run` needs exclusive access, so the session sits behind a
//! mutex; the recurrent state does not, since callers thread it through
//! [`SpeechProbabilityModel::infer`].

use std::path::Path;

use ndarray::{Array1, Array2, Array3};
use ort::session::builder::SessionBuilder;
use ort::session::{Session, SessionInputValue};
use ort::value::Value;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{SpeechModelState, SpeechProbabilityModel, STATE_LEN};
use crate::error::{Result, VoxgateError};

/// Window size expected by Silero VAD (samples at 16 kHz = 32 ms).
const WINDOW: usize = 512;
/// One LSTM tensor: 2 layers × 1 batch × 64 units.
const LSTM_HALF: usize = STATE_LEN / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SileroIoMode {
    StatefulLstm,
    StatefulGru,
    Stateless,
}

#[derive(Debug, Clone)]
struct IoNames {
    input: String,
    sr: Option<String>,
    output: String,
    h: Option<String>,
    c: Option<String>,
    hn: Option<String>,
    cn: Option<String>,
    state: Option<String>,
    state_out: Option<String>,
}

pub struct SileroModel {
    session: Mutex<Option<Session>>,
    io_mode: SileroIoMode,
    names: IoNames,
}

impl SileroModel {
    /// Load the graph. A missing or malformed artifact is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VoxgateError::ModelNotFound {
                path: path.to_path_buf(),
            });
        }

        let session = SessionBuilder::new()
            .map_err(|e| VoxgateError::OnnxSession(e.to_string()))?
            .commit_from_file(path)
            .map_err(|e| VoxgateError::OnnxSession(e.to_string()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let names = IoNames {
            input: resolve_name(&input_names, &["input", "audio", "x"])
                .or_else(|| input_names.first().cloned())
                .ok_or_else(|| VoxgateError::OnnxSession("Silero model has no inputs".into()))?,
            sr: resolve_name(&input_names, &["sr", "sample_rate"]),
            output: resolve_name(&output_names, &["output", "speech_prob", "prob"])
                .or_else(|| output_names.first().cloned())
                .ok_or_else(|| VoxgateError::OnnxSession("Silero model has no outputs".into()))?,
            h: resolve_name(&input_names, &["h", "state_h"]),
            c: resolve_name(&input_names, &["c", "state_c"]),
            hn: resolve_name(&output_names, &["hn", "state_hn", "h_out"]),
            cn: resolve_name(&output_names, &["cn", "state_cn", "c_out"]),
            state: resolve_name(&input_names, &["state", "h_0", "hidden"]),
            state_out: resolve_name(&output_names, &["stateN", "state_out", "hn_out"]),
        };

        let io_mode = if names.h.is_some()
            && names.c.is_some()
            && names.hn.is_some()
            && names.cn.is_some()
        {
            SileroIoMode::StatefulLstm
        } else if names.state.is_some() && names.state_out.is_some() {
            SileroIoMode::StatefulGru
        } else {
            SileroIoMode::Stateless
        };

        info!(
            path = %path.display(),
            inputs = ?input_names,
            outputs = ?output_names,
            io_mode = ?io_mode,
            "silero model loaded"
        );

        Ok(Self {
            session: Mutex::new(Some(session)),
            io_mode,
            names,
        })
    }

    fn tensor_err(e: impl std::fmt::Display) -> VoxgateError {
        VoxgateError::OnnxSession(e.to_string())
    }
}

impl SpeechProbabilityModel for SileroModel {
    fn window_samples(&self) -> usize {
        WINDOW
    }

    fn infer(&self, window: &[f32], state: &SpeechModelState) -> Result<(f32, SpeechModelState)> {
        if window.len() != WINDOW {
            return Err(VoxgateError::Inference(format!(
                "silero expects {WINDOW} samples, got {}",
                window.len()
            )));
        }
        let state_in = state.as_slice();
        if state_in.len() != STATE_LEN {
            return Err(VoxgateError::Inference("malformed recurrent state".into()));
        }

        let input_arr =
            Array2::<f32>::from_shape_vec((1, WINDOW), window.to_vec()).map_err(Self::tensor_err)?;
        let input_val = Value::from_array(input_arr).map_err(Self::tensor_err)?;

        let mut input_values: Vec<(String, SessionInputValue<'_>)> =
            vec![(self.names.input.clone(), input_val.into())];

        if let Some(sr_name) = &self.names.sr {
            let sr_val =
                Value::from_array(Array1::<i64>::from_elem(1, 16_000)).map_err(Self::tensor_err)?;
            input_values.push((sr_name.clone(), sr_val.into()));
        }

        match self.io_mode {
            SileroIoMode::StatefulLstm => {
                let h_arr = Array3::<f32>::from_shape_vec((2, 1, 64), state_in[..LSTM_HALF].to_vec())
                    .map_err(Self::tensor_err)?;
                let c_arr = Array3::<f32>::from_shape_vec((2, 1, 64), state_in[LSTM_HALF..].to_vec())
                    .map_err(Self::tensor_err)?;
                if let (Some(h), Some(c)) = (&self.names.h, &self.names.c) {
                    input_values.push((h.clone(), Value::from_array(h_arr).map_err(Self::tensor_err)?.into()));
                    input_values.push((c.clone(), Value::from_array(c_arr).map_err(Self::tensor_err)?.into()));
                }
            }
            SileroIoMode::StatefulGru => {
                let state_arr = Array3::<f32>::from_shape_vec((2, 1, 128), state_in.to_vec())
                    .map_err(Self::tensor_err)?;
                if let Some(name) = &self.names.state {
                    input_values.push((
                        name.clone(),
                        Value::from_array(state_arr).map_err(Self::tensor_err)?.into(),
                    ));
                }
            }
            SileroIoMode::Stateless => {}
        }

        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| VoxgateError::OnnxSession("silero session is closed".into()))?;
        let outputs = session.run(input_values).map_err(Self::tensor_err)?;

        let prob_output = outputs
            .get(self.names.output.as_str())
            .unwrap_or(&outputs[0]);
        let (_, prob_data) = prob_output
            .try_extract_tensor::<f32>()
            .map_err(Self::tensor_err)?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let next = match self.io_mode {
            SileroIoMode::StatefulLstm => {
                let hn = self.names.hn.as_deref().and_then(|n| outputs.get(n));
                let cn = self.names.cn.as_deref().and_then(|n| outputs.get(n));
                match (hn, cn) {
                    (Some(hn), Some(cn)) => {
                        let (_, hn_data) = hn.try_extract_tensor::<f32>().map_err(Self::tensor_err)?;
                        let (_, cn_data) = cn.try_extract_tensor::<f32>().map_err(Self::tensor_err)?;
                        let mut joined = Vec::with_capacity(STATE_LEN);
                        joined.extend_from_slice(hn_data);
                        joined.extend_from_slice(cn_data);
                        SpeechModelState::from_vec(joined)
                    }
                    _ => {
                        warn!("silero LSTM state outputs missing; state not advanced");
                        state.clone()
                    }
                }
            }
            SileroIoMode::StatefulGru => {
                match self.names.state_out.as_deref().and_then(|n| outputs.get(n)) {
                    Some(out) => {
                        let (_, data) = out.try_extract_tensor::<f32>().map_err(Self::tensor_err)?;
                        SpeechModelState::from_vec(data.to_vec())
                    }
                    None => {
                        warn!("silero GRU state output missing; state not advanced");
                        state.clone()
                    }
                }
            }
            SileroIoMode::Stateless => state.clone(),
        };

        Ok((prob, next))
    }

    fn close(&self) {
        if self.session.lock().take().is_some() {
            info!("silero session released");
        }
    }
}

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred.iter().find_map(|needle| {
        candidates
            .iter()
            .find(|name| name.eq_ignore_ascii_case(needle))
            .cloned()
    })
}
