//! Translation backend
//!
//! The adapter around the external inference engine and the single worker
//! thread that owns it.

pub mod adapter;
pub mod engine;
pub mod models;
pub mod worker;

pub use adapter::{strip_bpe_markers, RequestCounter, TranslationAdapter};
pub use engine::{
    DecodingConfig, EngineError, EnsembleMode, IdentityEngine, ProcessEngine, Translation,
    TranslationEngine, TranslatorInput,
};
pub use models::{load_models, LoadedModel, LoadedModels, ModelConfig, ModelError, Vocab};
pub use worker::{EngineWorker, TranslationRequest, TranslationResponse, WorkerHandle};
