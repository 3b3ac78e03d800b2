//! Model directory loading
//!
//! Validates the model directories handed to the engine and loads their
//! vocabularies. Every model of an ensemble must share its vocabularies.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Token to id mapping
pub type Vocab = HashMap<String, u32>;

const CONFIG_NAME: &str = "config";
const PARAMS_BEST_NAME: &str = "params.best";
const VOCAB_TRG_NAME: &str = "vocab.trg.0.json";
const VOCAB_TRG_LEGACY_NAME: &str = "vocab.trg.json";
const VOCAB_SRC_LEGACY_NAME: &str = "vocab.src.json";

/// Which models to load
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    pub model_dirs: Vec<PathBuf>,
    /// One checkpoint per model; `None` selects `params.best`
    pub checkpoints: Option<Vec<u32>>,
}

/// One validated model directory
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub dir: PathBuf,
    pub params: PathBuf,
    pub checkpoint: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LoadedModels {
    pub models: Vec<LoadedModel>,
    pub source_vocabs: Vec<Vocab>,
    pub target_vocab: Vocab,
}

/// Model loading errors
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("No model directories given")]
    NoModels,

    #[error("Got {checkpoints} checkpoints for {models} models")]
    CheckpointCount { models: usize, checkpoints: usize },

    #[error("Missing model file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed vocabulary {}: {source}", .path.display())]
    Vocab {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Vocabularies of {} differ from the first model", .0.display())]
    VocabMismatch(PathBuf),
}

/// Validate all model directories and load their vocabularies
pub fn load_models(config: &ModelConfig) -> Result<LoadedModels, ModelError> {
    if config.model_dirs.is_empty() {
        return Err(ModelError::NoModels);
    }
    if let Some(checkpoints) = &config.checkpoints {
        if checkpoints.len() != config.model_dirs.len() {
            return Err(ModelError::CheckpointCount {
                models: config.model_dirs.len(),
                checkpoints: checkpoints.len(),
            });
        }
    }

    let mut models = Vec::with_capacity(config.model_dirs.len());
    let mut vocabs: Option<(Vec<Vocab>, Vocab)> = None;

    for (i, dir) in config.model_dirs.iter().enumerate() {
        let checkpoint = config.checkpoints.as_ref().map(|c| c[i]);
        let model = load_model(dir, checkpoint)?;

        let source_vocabs = load_source_vocabs(dir)?;
        let target_vocab = load_target_vocab(dir)?;

        let mismatch = matches!(
            &vocabs,
            Some((first_source, first_target))
                if *first_source != source_vocabs || *first_target != target_vocab
        );
        if mismatch {
            return Err(ModelError::VocabMismatch(dir.clone()));
        }
        if vocabs.is_none() {
            vocabs = Some((source_vocabs, target_vocab));
        }

        log::info!(
            "Model {} validated ({})",
            dir.display(),
            model.params.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        models.push(model);
    }

    let (source_vocabs, target_vocab) = vocabs.ok_or(ModelError::NoModels)?;
    log::info!(
        "Loaded {} model(s): {} source factor vocab(s), target vocab size {}",
        models.len(),
        source_vocabs.len(),
        target_vocab.len()
    );

    Ok(LoadedModels { models, source_vocabs, target_vocab })
}

fn load_model(dir: &Path, checkpoint: Option<u32>) -> Result<LoadedModel, ModelError> {
    let config = dir.join(CONFIG_NAME);
    require_file(&config)?;

    let params = match checkpoint {
        Some(n) => dir.join(format!("params.{:05}", n)),
        None => dir.join(PARAMS_BEST_NAME),
    };
    require_file(&params)?;

    Ok(LoadedModel { dir: dir.to_path_buf(), params, checkpoint })
}

fn require_file(path: &Path) -> Result<(), ModelError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ModelError::MissingFile(path.to_path_buf()))
    }
}

fn load_source_vocabs(dir: &Path) -> Result<Vec<Vocab>, ModelError> {
    let mut vocabs = Vec::new();
    loop {
        let path = dir.join(format!("vocab.src.{}.json", vocabs.len()));
        if !path.is_file() {
            break;
        }
        vocabs.push(read_vocab(&path)?);
    }

    if vocabs.is_empty() {
        let legacy = dir.join(VOCAB_SRC_LEGACY_NAME);
        if !legacy.is_file() {
            return Err(ModelError::MissingFile(dir.join("vocab.src.0.json")));
        }
        vocabs.push(read_vocab(&legacy)?);
    }

    Ok(vocabs)
}

fn load_target_vocab(dir: &Path) -> Result<Vocab, ModelError> {
    let path = dir.join(VOCAB_TRG_NAME);
    if path.is_file() {
        return read_vocab(&path);
    }
    let legacy = dir.join(VOCAB_TRG_LEGACY_NAME);
    if legacy.is_file() {
        return read_vocab(&legacy);
    }
    Err(ModelError::MissingFile(path))
}

fn read_vocab(path: &Path) -> Result<Vocab, ModelError> {
    let data = fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ModelError::Vocab {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a minimal model directory
    pub(crate) fn write_model(dir: &Path, params: &str, legacy: bool) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("config"), "num_layers: 6\n").unwrap();
        fs::write(dir.join(params), b"\0").unwrap();
        let vocab = r#"{"<pad>": 0, "<unk>": 1, "Haus": 2}"#;
        if legacy {
            fs::write(dir.join("vocab.src.json"), vocab).unwrap();
            fs::write(dir.join("vocab.trg.json"), vocab).unwrap();
        } else {
            fs::write(dir.join("vocab.src.0.json"), vocab).unwrap();
            fs::write(dir.join("vocab.trg.0.json"), vocab).unwrap();
        }
    }

    #[test]
    fn test_load_single_model() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("model");
        write_model(&dir, "params.best", false);

        let loaded = load_models(&ModelConfig { model_dirs: vec![dir.clone()], checkpoints: None }).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].params, dir.join("params.best"));
        assert_eq!(loaded.source_vocabs.len(), 1);
        assert_eq!(loaded.target_vocab.get("Haus"), Some(&2));
    }

    #[test]
    fn test_checkpoint_selection_and_legacy_vocab() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("model");
        write_model(&dir, "params.00012", true);

        let loaded = load_models(&ModelConfig {
            model_dirs: vec![dir.clone()],
            checkpoints: Some(vec![12]),
        })
        .unwrap();
        assert_eq!(loaded.models[0].checkpoint, Some(12));
        assert_eq!(loaded.models[0].params, dir.join("params.00012"));
    }

    #[test]
    fn test_missing_params_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("model");
        write_model(&dir, "params.00001", false);

        match load_models(&ModelConfig { model_dirs: vec![dir.clone()], checkpoints: None }) {
            Err(ModelError::MissingFile(path)) => assert_eq!(path, dir.join("params.best")),
            other => panic!("Expected MissingFile, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_vocab() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("model");
        write_model(&dir, "params.best", false);
        fs::write(dir.join("vocab.trg.0.json"), "[1, 2").unwrap();

        let err = load_models(&ModelConfig { model_dirs: vec![dir], checkpoints: None }).unwrap_err();
        assert!(matches!(err, ModelError::Vocab { .. }));
    }

    #[test]
    fn test_ensemble_vocab_mismatch() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        write_model(&a, "params.best", false);
        write_model(&b, "params.best", false);
        fs::write(b.join("vocab.trg.0.json"), r#"{"<pad>": 0}"#).unwrap();

        let err = load_models(&ModelConfig { model_dirs: vec![a, b.clone()], checkpoints: None }).unwrap_err();
        match err {
            ModelError::VocabMismatch(path) => assert_eq!(path, b),
            other => panic!("Expected VocabMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_count_mismatch() {
        let err = load_models(&ModelConfig {
            model_dirs: vec![PathBuf::from("a"), PathBuf::from("b")],
            checkpoints: Some(vec![1]),
        })
        .unwrap_err();
        assert!(matches!(err, ModelError::CheckpointCount { models: 2, checkpoints: 1 }));
    }
}
