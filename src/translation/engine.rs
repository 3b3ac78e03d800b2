//! Inference engine collaborators
//!
//! The engine turns a list of inputs into a positionally aligned list of
//! translations. It is not safe to call concurrently; callers go through
//! the engine worker.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::models::LoadedModels;
use crate::device::Device;

/// Sentence sent to a freshly started engine to confirm it is serving
const WARMUP_SENTENCE: &str = "Hallo .";

/// How long to wait for an exit status once the engine's output closed
const EXIT_POLLS: usize = 50;

/// One sentence handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorInput {
    pub sentence_id: u64,
    pub text: String,
}

impl TranslatorInput {
    pub fn from_plain_string(sentence_id: u64, text: impl Into<String>) -> Self {
        Self { sentence_id, text: text.into() }
    }
}

/// Engine output for one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub sentence_id: u64,
    pub translation: String,
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to start engine '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine closed its output ({0})")]
    Closed(String),

    #[error("Failed to encode engine input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Engine returned {actual} translations for {expected} inputs")]
    Misaligned { expected: usize, actual: usize },

    #[error("Translation failed: {0}")]
    Failed(String),

    #[error("Engine worker is not running")]
    WorkerGone,
}

/// External translation runtime
pub trait TranslationEngine: Send {
    /// Translate all inputs in one call. Output position `i` belongs to
    /// input position `i`.
    fn translate(&mut self, inputs: &[TranslatorInput]) -> Result<Vec<Translation>, EngineError>;

    fn name(&self) -> &str;
}

/// Returns every input unchanged. Used for dry runs of the RPC surface.
#[derive(Debug, Default)]
pub struct IdentityEngine;

impl TranslationEngine for IdentityEngine {
    fn translate(&mut self, inputs: &[TranslatorInput]) -> Result<Vec<Translation>, EngineError> {
        Ok(inputs
            .iter()
            .map(|input| Translation {
                sentence_id: input.sentence_id,
                translation: input.text.clone(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "identity"
    }
}

/// How ensemble member scores are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EnsembleMode {
    Linear,
    LogLinear,
}

impl EnsembleMode {
    fn as_arg(self) -> &'static str {
        match self {
            EnsembleMode::Linear => "linear",
            EnsembleMode::LogLinear => "log_linear",
        }
    }
}

/// Decoding options forwarded to the engine
#[derive(Debug, Clone)]
pub struct DecodingConfig {
    pub beam_size: usize,
    pub batch_size: usize,
    pub max_input_len: Option<usize>,
    pub length_penalty_alpha: f32,
    pub length_penalty_beta: f32,
    pub softmax_temperature: Option<f32>,
    pub ensemble_mode: EnsembleMode,
    pub strip_unknown_words: bool,
    pub json_input: bool,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            beam_size: 5,
            batch_size: 1,
            max_input_len: None,
            length_penalty_alpha: 1.0,
            length_penalty_beta: 0.0,
            softmax_temperature: None,
            ensemble_mode: EnsembleMode::Linear,
            strip_unknown_words: false,
            json_input: false,
        }
    }
}

#[derive(Serialize)]
struct JsonInput<'a> {
    text: &'a str,
}

/// Engine backed by an external translator process.
///
/// The process reads one sentence per line on stdin and answers each
/// line with exactly one translated line on stdout.
pub struct ProcessEngine {
    command: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    json_input: bool,
}

impl ProcessEngine {
    /// Start the translator for the loaded models on `device` and wait
    /// until it answers a warm-up batch
    pub fn spawn(
        command_line: &str,
        models: &LoadedModels,
        device: &Device,
        decoding: &DecodingConfig,
    ) -> Result<Self, EngineError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EngineError::Failed("empty engine command".to_string()))?;

        let mut command = Command::new(program);
        command.args(parts);
        command.args(engine_args(models, device, decoding));

        log::info!("Starting engine: {}", command_line);
        let mut engine = Self::start(command, command_line, decoding.json_input)?;
        engine.wait_ready(decoding.batch_size.max(1))?;
        Ok(engine)
    }

    fn start(mut command: Command, name: &str, json_input: bool) -> Result<Self, EngineError> {
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        log::debug!("Engine command: {:?}", command);

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            command: name.to_string(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Failed("engine stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("engine stdout not captured".to_string()))?;

        Ok(Self {
            command: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            json_input,
        })
    }

    /// Translate one full engine batch of warm-up sentences. Returns once
    /// the models are loaded, or with `Closed` if the engine died first.
    fn wait_ready(&mut self, batch_size: usize) -> Result<(), EngineError> {
        let start = Instant::now();
        let inputs: Vec<TranslatorInput> = (0..batch_size)
            .map(|i| TranslatorInput::from_plain_string(i as u64, WARMUP_SENTENCE))
            .collect();

        self.translate(&inputs)?;
        log::info!("Engine ready after {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }

    fn encode_inputs(&self, inputs: &[TranslatorInput]) -> Result<Vec<u8>, EngineError> {
        let mut payload = Vec::new();
        for input in inputs {
            if self.json_input {
                serde_json::to_writer(&mut payload, &JsonInput { text: &input.text })?;
            } else {
                // One sentence per line
                payload.extend_from_slice(input.text.replace(['\n', '\r'], " ").as_bytes());
            }
            payload.push(b'\n');
        }
        Ok(payload)
    }

    /// Describe how the engine ended after its output closed
    fn exit_status(&mut self) -> String {
        for _ in 0..EXIT_POLLS {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.to_string(),
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => return e.to_string(),
            }
        }
        "still running".to_string()
    }
}

/// Read up to `count` lines; fewer means the engine closed its output
fn read_lines<R: BufRead>(reader: &mut R, count: usize) -> io::Result<Vec<String>> {
    let mut lines = Vec::with_capacity(count);
    while lines.len() < count {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(lines)
}

impl TranslationEngine for ProcessEngine {
    fn translate(&mut self, inputs: &[TranslatorInput]) -> Result<Vec<Translation>, EngineError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let payload = self.encode_inputs(inputs)?;

        // The engine may read a whole chunk before answering, so the batch
        // is written from its own thread while replies are read here.
        let stdin = &mut self.stdin;
        let stdout = &mut self.stdout;
        let (written, read) = thread::scope(|scope| {
            let writer = scope.spawn(move || -> io::Result<()> {
                stdin.write_all(&payload)?;
                stdin.flush()
            });
            let read = read_lines(stdout, inputs.len());
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "engine writer panicked")));
            (written, read)
        });

        let lines = read?;
        if lines.len() < inputs.len() {
            return Err(EngineError::Closed(self.exit_status()));
        }
        match written {
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(EngineError::Closed(self.exit_status())),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }

        Ok(inputs
            .iter()
            .zip(lines)
            .map(|(input, translation)| Translation { sentence_id: input.sentence_id, translation })
            .collect())
    }

    fn name(&self) -> &str {
        &self.command
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        log::debug!("Stopping engine process {}", self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Translator arguments for the given models, device and decoding options
fn engine_args(models: &LoadedModels, device: &Device, decoding: &DecodingConfig) -> Vec<String> {
    let mut args = vec!["--models".to_string()];
    args.extend(models.models.iter().map(|m| m.dir.display().to_string()));

    let checkpoints: Vec<String> = models
        .models
        .iter()
        .filter_map(|m| m.checkpoint.map(|c| c.to_string()))
        .collect();
    if !checkpoints.is_empty() {
        args.push("--checkpoints".to_string());
        args.extend(checkpoints);
    }

    match device {
        Device::Cpu => args.push("--use-cpu".to_string()),
        Device::Gpu(id) => {
            // The lease is held by this process
            args.extend(["--device-ids".to_string(), id.to_string()]);
            args.push("--disable-device-locking".to_string());
        }
    }

    args.extend(["--beam-size".to_string(), decoding.beam_size.to_string()]);
    args.extend(["--batch-size".to_string(), decoding.batch_size.to_string()]);
    args.extend(["--length-penalty-alpha".to_string(), decoding.length_penalty_alpha.to_string()]);
    args.extend(["--length-penalty-beta".to_string(), decoding.length_penalty_beta.to_string()]);
    args.extend(["--ensemble-mode".to_string(), decoding.ensemble_mode.as_arg().to_string()]);
    if let Some(len) = decoding.max_input_len {
        args.extend(["--max-input-len".to_string(), len.to_string()]);
    }
    if let Some(temperature) = decoding.softmax_temperature {
        args.extend(["--softmax-temperature".to_string(), temperature.to_string()]);
    }
    if decoding.strip_unknown_words {
        args.push("--strip-unknown-words".to_string());
    }
    if decoding.json_input {
        args.push("--json-input".to_string());
    }

    args
}
