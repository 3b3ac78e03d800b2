//! Translation adapter
//!
//! Wraps the inference engine: optional BPE segmentation on the way in,
//! one engine call for all inputs, separator marker removal on the way out.

use std::sync::atomic::{AtomicU64, Ordering};

use super::engine::{EngineError, TranslationEngine, TranslatorInput};
use crate::bpe::Bpe;

/// Process-lifetime source of sentence ids.
///
/// Ids are handed out in increasing order and never reused.
#[derive(Debug, Default)]
pub struct RequestCounter {
    next: AtomicU64,
}

impl RequestCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of ids issued so far
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Remove every occurrence of `marker` (normally `"@@ "`).
///
/// Literal replace only: a separator not followed by a space is left alone.
pub fn strip_bpe_markers(text: &str, marker: &str) -> String {
    text.replace(marker, "")
}

pub struct TranslationAdapter {
    engine: Box<dyn TranslationEngine>,
    bpe: Option<Bpe>,
}

impl TranslationAdapter {
    pub fn new(engine: Box<dyn TranslationEngine>, bpe: Option<Bpe>) -> Self {
        Self { engine, bpe }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn segmentation_enabled(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn translate_one(&mut self, source: &str, ids: &RequestCounter) -> Result<String, EngineError> {
        let mut translations = self.translate_batch(&[source], ids)?;
        translations.pop().ok_or(EngineError::Misaligned { expected: 1, actual: 0 })
    }

    /// Translate all sources with a single engine call. Any failure fails
    /// the whole batch.
    pub fn translate_batch<S: AsRef<str>>(
        &mut self,
        sources: &[S],
        ids: &RequestCounter,
    ) -> Result<Vec<String>, EngineError> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<TranslatorInput> = sources
            .iter()
            .map(|source| {
                let text = match &self.bpe {
                    Some(bpe) => bpe.segment(source.as_ref()),
                    None => source.as_ref().to_string(),
                };
                TranslatorInput::from_plain_string(ids.next_id(), text)
            })
            .collect();

        log::debug!(
            "Translating {} input(s), ids {}..={}",
            inputs.len(),
            inputs[0].sentence_id,
            inputs[inputs.len() - 1].sentence_id
        );

        let translations = self.engine.translate(&inputs)?;
        if translations.len() != inputs.len() {
            return Err(EngineError::Misaligned {
                expected: inputs.len(),
                actual: translations.len(),
            });
        }

        Ok(translations
            .into_iter()
            .map(|t| match &self.bpe {
                Some(bpe) => strip_bpe_markers(&t.translation, &bpe.marker()),
                None => t.translation,
            })
            .collect())
    }
}
