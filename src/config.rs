//! Command-line configuration
//!
//! Flags for the server and the test client. Each `*_config` method turns
//! the parsed flags into the settings struct of one component.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::bpe::{BpeConfig, DEFAULT_SEPARATOR};
use crate::device::DeviceConfig;
use crate::rpc::{ServiceConfig, DEFAULT_CLIENT_PORT, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_PORT};
use crate::translation::{DecodingConfig, EnsembleMode, ModelConfig};

/// Translate RPC server
#[derive(Debug, Parser)]
#[command(name = "nmt_rpc_server", version, about = "Serve NMT translations over Thrift RPC")]
pub struct ServerArgs {
    /// Model directories; more than one forms an ensemble
    #[arg(short = 'm', long, num_args = 1.., required_unless_present = "echo")]
    pub models: Vec<PathBuf>,

    /// Checkpoint per model (default: params.best)
    #[arg(short = 'c', long, num_args = 1..)]
    pub checkpoints: Option<Vec<u32>>,

    #[arg(long)]
    pub use_cpu: bool,

    /// GPU to run on; a negative id picks any free GPU
    #[arg(long, num_args = 1.., default_values_t = vec![-1], allow_negative_numbers = true)]
    pub device_ids: Vec<i32>,

    #[arg(long)]
    pub disable_device_locking: bool,

    /// Directory holding GPU lock files
    #[arg(long, env = "NMT_RPC_LOCK_DIR", default_value_os_t = std::env::temp_dir())]
    pub lock_dir: PathBuf,

    /// Give up waiting for a GPU lock after this many seconds
    #[arg(long, default_value_t = 60)]
    pub lock_timeout_secs: u64,

    #[arg(short = 'b', long, default_value_t = 1)]
    pub batch_size: usize,

    #[arg(short = 'k', long, default_value_t = 5)]
    pub beam_size: usize,

    #[arg(long)]
    pub max_input_len: Option<usize>,

    #[arg(long, default_value_t = 1.0)]
    pub length_penalty_alpha: f32,

    #[arg(long, default_value_t = 0.0)]
    pub length_penalty_beta: f32,

    #[arg(long)]
    pub softmax_temperature: Option<f32>,

    #[arg(long, value_enum, default_value_t = EnsembleMode::Linear)]
    pub ensemble_mode: EnsembleMode,

    #[arg(long)]
    pub strip_unknown_words: bool,

    /// BPE merge codes; segmentation is off without them
    #[arg(long)]
    pub bpe_codes: Option<PathBuf>,

    /// Only produce subwords found in this vocabulary
    #[arg(long, requires = "bpe_codes")]
    pub bpe_vocabulary: Option<PathBuf>,

    /// Vocabulary entries seen fewer times are treated as unknown
    #[arg(long, requires = "bpe_vocabulary")]
    pub bpe_vocabulary_threshold: Option<u64>,

    #[arg(long, default_value = DEFAULT_SEPARATOR)]
    pub bpe_separator: String,

    /// Apply only the first N merges
    #[arg(long)]
    pub bpe_merges: Option<usize>,

    /// Translator command; model and decoding flags are appended
    #[arg(long, env = "NMT_RPC_ENGINE", default_value = "python3 -m sockeye.translate")]
    pub engine_command: String,

    /// Send engine input as JSON lines
    #[arg(long)]
    pub json_input: bool,

    /// Echo (segmented) input back instead of running an engine
    #[arg(long)]
    pub echo: bool,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short = 'p', long, env = "NMT_RPC_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Connections served at once; 1 serves them one after another
    #[arg(long, default_value_t = 1)]
    pub max_connections: usize,

    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl ServerArgs {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            host: self.host.clone(),
            port: self.port,
            max_connections: self.max_connections.max(1),
            max_message_bytes: self.max_message_bytes,
            verbose: !self.quiet,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            use_cpu: self.use_cpu,
            device_ids: self.device_ids.clone(),
            disable_device_locking: self.disable_device_locking,
            lock_dir: self.lock_dir.clone(),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            ..DeviceConfig::default()
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model_dirs: self.models.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }

    pub fn decoding_config(&self) -> DecodingConfig {
        DecodingConfig {
            beam_size: self.beam_size,
            batch_size: self.batch_size,
            max_input_len: self.max_input_len,
            length_penalty_alpha: self.length_penalty_alpha,
            length_penalty_beta: self.length_penalty_beta,
            softmax_temperature: self.softmax_temperature,
            ensemble_mode: self.ensemble_mode,
            strip_unknown_words: self.strip_unknown_words,
            json_input: self.json_input,
        }
    }

    /// `None` when segmentation is disabled
    pub fn bpe_config(&self) -> Option<BpeConfig> {
        let codes = self.bpe_codes.as_ref()?;
        Some(BpeConfig {
            vocabulary: self.bpe_vocabulary.clone(),
            vocabulary_threshold: self.bpe_vocabulary_threshold,
            separator: self.bpe_separator.clone(),
            merges: self.bpe_merges,
            ..BpeConfig::new(codes)
        })
    }
}

/// Translate RPC test client
#[derive(Debug, Parser)]
#[command(name = "nmt_rpc_client", version, about = "Send test sentences to a Translate RPC server")]
pub struct ClientArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short = 'p', long, env = "NMT_RPC_PORT", default_value_t = DEFAULT_CLIENT_PORT)]
    pub port: u16,

    /// Idle connections kept by the pool
    #[arg(long, default_value_t = 10)]
    pub max_streams: usize,

    /// How many times to send each sentence
    #[arg(short = 'n', long, default_value_t = 20)]
    pub repeat: usize,

    /// Send all sentences in one batch_translate call per round
    #[arg(long)]
    pub batch: bool,

    /// Sentences to translate
    pub sentences: Vec<String>,
}

impl ClientArgs {
    pub fn server_addr(&self) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("cannot resolve {}", self.host)))
    }
}
