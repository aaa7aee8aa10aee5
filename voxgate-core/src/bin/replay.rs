//! Feed a WAV file through a `VadSession` and print the utterances found.
//!
//! ```text
//! cargo run -p voxgate-core --bin replay -- --wav call.wav --timeout-ms 800
//! cargo run -p voxgate-core --features onnx --bin replay -- --wav call.wav --whisper models/whisper-base
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;
use voxgate_core::{
    audio::{bytes_for_ms, f32_to_pcm16, resample::resample_all, INPUT_SAMPLE_RATE},
    buffering::chunk::AudioChunk,
    engine::{load_recognizer, load_speech_model},
    GatewayConfig, ModelHandle, SessionModel, VadOutcome, VadSession,
};

const CHUNK_MS: u32 = 20;

#[derive(Debug)]
struct Args {
    wav: PathBuf,
    threshold: Option<f32>,
    timeout_ms: Option<u32>,
    denoise: bool,
    model: Option<PathBuf>,
    whisper: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UtteranceReport {
    index: usize,
    start_ms: u64,
    end_ms: u64,
    bytes: usize,
    /// Ended by end of file rather than by silence.
    forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    file: String,
    source_sample_rate: u32,
    duration_ms: u64,
    chunks: usize,
    speech_starts: usize,
    utterances: Vec<UtteranceReport>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voxgate_core=info,replay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("replay failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let mut config = GatewayConfig::default();
    config.silero_model_path = args.model.clone();
    if let Some(t) = args.threshold {
        config.vad.speech_threshold = t;
    }
    if let Some(ms) = args.timeout_ms {
        config.vad.silence_timeout_ms = ms;
    }
    if !args.denoise {
        config.vad.noise_reduction = None;
    }
    config.local_stt.model_dir = args.whisper.clone();
    config.normalize();

    let model = load_speech_model(&config)?;
    config.vad.window_samples = model.window_samples();

    let (samples, source_rate) = read_wav_mono_f32(&args.wav)?;
    let samples = resample_all(&samples, source_rate, INPUT_SAMPLE_RATE)?;
    let pcm = f32_to_pcm16(&samples);
    info!(
        file = %args.wav.display(),
        source_rate,
        seconds = samples.len() as f64 / INPUT_SAMPLE_RATE as f64,
        "replaying"
    );

    let recognizer = match &args.whisper {
        Some(_) => {
            let handle = load_recognizer(&config);
            handle.0.lock().warm_up()?;
            Some(handle)
        }
        None => None,
    };

    let mut vad = VadSession::new(config.vad.clone(), SessionModel::new(model));
    let chunk_bytes = bytes_for_ms(CHUNK_MS, INPUT_SAMPLE_RATE);
    let mut fed = 0usize;
    let mut speech_starts = 0usize;
    let mut utterances = Vec::new();

    for chunk in pcm.chunks(chunk_bytes) {
        fed += chunk.len();
        match vad.process_audio(chunk) {
            VadOutcome::SpeechStarted => speech_starts += 1,
            VadOutcome::Utterance(bytes) => {
                let text = transcribe(recognizer.as_ref(), &bytes)?;
                utterances.push(report(utterances.len(), fed, bytes.len(), false, text));
            }
            VadOutcome::Idle | VadOutcome::Speaking => {}
        }
    }
    if let Some(bytes) = vad.force_end() {
        let text = transcribe(recognizer.as_ref(), &bytes)?;
        utterances.push(report(utterances.len(), fed, bytes.len(), true, text));
    }

    let summary = Summary {
        file: args.wav.display().to_string(),
        source_sample_rate: source_rate,
        duration_ms: byte_offset_ms(pcm.len()),
        chunks: pcm.len().div_ceil(chunk_bytes),
        speech_starts,
        utterances,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn transcribe(recognizer: Option<&ModelHandle>, pcm: &[u8]) -> anyhow::Result<Option<String>> {
    let Some(handle) = recognizer else {
        return Ok(None);
    };
    let mut model = handle.0.lock();
    let text = model.transcribe(&AudioChunk::from_pcm16(pcm))?;
    model.reset();
    Ok(Some(text))
}

fn report(
    index: usize,
    end_offset: usize,
    len: usize,
    forced: bool,
    text: Option<String>,
) -> UtteranceReport {
    UtteranceReport {
        index,
        start_ms: byte_offset_ms(end_offset.saturating_sub(len)),
        end_ms: byte_offset_ms(end_offset),
        bytes: len,
        forced,
        text,
    }
}

fn byte_offset_ms(bytes: usize) -> u64 {
    (bytes as u64 / 2) * 1000 / INPUT_SAMPLE_RATE as u64
}

fn parse_args() -> anyhow::Result<Args> {
    let mut wav: Option<PathBuf> = None;
    let mut threshold = None;
    let mut timeout_ms = None;
    let mut denoise = true;
    let mut model = None;
    let mut whisper = None;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--wav" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --wav");
                };
                wav = Some(PathBuf::from(v));
            }
            "--threshold" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --threshold");
                };
                threshold = Some(
                    v.parse::<f32>()
                        .map_err(|_| anyhow::anyhow!("invalid value for --threshold"))?,
                );
            }
            "--timeout-ms" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --timeout-ms");
                };
                timeout_ms = Some(
                    v.parse::<u32>()
                        .map_err(|_| anyhow::anyhow!("invalid value for --timeout-ms"))?,
                );
            }
            "--no-denoise" => denoise = false,
            "--model" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --model");
                };
                model = Some(PathBuf::from(v));
            }
            "--whisper" => {
                let Some(v) = it.next() else {
                    anyhow::bail!("missing value for --whisper");
                };
                whisper = Some(PathBuf::from(v));
            }
            "--help" | "-h" => {
                println!(
                    "Usage: replay --wav <file.wav> [--threshold <0..1>] [--timeout-ms <n>] \\
  [--no-denoise] [--model <silero.onnx>] [--whisper <model dir>]"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let Some(wav) = wav else {
        anyhow::bail!("--wav is required");
    };
    Ok(Args {
        wav,
        threshold,
        timeout_ms,
        denoise,
        model,
        whisper,
    })
}

fn read_wav_mono_f32(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32_768.0))
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}
