//! Preprocessing stage: text → fixed-width [`Encodings`].
//!
//! A [`Preprocessor`] is fitted once on training text and afterwards applied
//! unchanged to any input. Encoding is parallelised with `rayon`; output row
//! order always matches input order.

use std::collections::HashMap;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::data::Encodings;
use crate::error::{FitError, Phase, Result};

/// Text-to-ids collaborator composed in front of an estimator.
pub trait Preprocessor: Send + Sync {
    /// Learn whatever state the transform needs (vocabulary, statistics).
    fn fit(&mut self, texts: &[String]) -> Result<()>;

    /// Encode `texts`, padded/truncated to [`max_len`](Self::max_len).
    fn transform(&self, texts: &[String]) -> Result<Encodings>;

    fn fit_transform(&mut self, texts: &[String]) -> Result<Encodings> {
        self.fit(texts)?;
        self.transform(texts)
    }

    /// Number of distinct ids `transform` can emit.
    fn vocab_size(&self) -> usize;

    fn max_len(&self) -> usize;
}

// ── VocabTokenizer ──────────────────────────────────────────────────────────

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";

const PAD_ID: u32 = 0;
const UNK_ID: u32 = 1;
const CLS_ID: u32 = 2;

/// Word-level tokenizer whose vocabulary is learned from the training corpus.
///
/// Words are maximal alphanumeric runs (optionally lowercased). Vocabulary
/// order is frequency descending, ties broken lexicographically, so fitting
/// the same corpus always yields the same ids. Every row starts with
/// `[CLS]`, so even empty text has one attended position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabTokenizer {
    /// Id → token. Ids 0..3 are the special tokens.
    tokens: Vec<String>,
    max_len: usize,
    lowercase: bool,
    min_freq: usize,
    max_vocab: Option<usize>,
    #[serde(skip)]
    index: HashMap<String, u32>,
}

impl VocabTokenizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            tokens: Vec::new(),
            max_len,
            lowercase: true,
            min_freq: 1,
            max_vocab: None,
            index: HashMap::new(),
        }
    }

    pub fn with_min_freq(mut self, min_freq: usize) -> Self {
        self.min_freq = min_freq.max(1);
        self
    }

    /// Cap the vocabulary (special tokens included).
    pub fn with_max_vocab(mut self, max_vocab: usize) -> Self {
        self.max_vocab = Some(max_vocab);
        self
    }

    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    pub fn is_fitted(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    fn words<'a>(&self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        let lowercase = self.lowercase;
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(move |w| if lowercase { w.to_lowercase() } else { w.to_string() })
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.max_len);
        ids.push(CLS_ID);
        for w in self.words(text) {
            if ids.len() >= self.max_len {
                break;
            }
            ids.push(self.index.get(&w).copied().unwrap_or(UNK_ID));
        }
        ids
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut tok: Self = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        tok.rebuild_index();
        Ok(tok)
    }
}

impl Preprocessor for VocabTokenizer {
    fn fit(&mut self, texts: &[String]) -> Result<()> {
        if self.max_len == 0 {
            return Err(FitError::config("max_len must be at least 1"));
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for text in texts {
            for w in self.words(text) {
                *counts.entry(w).or_default() += 1;
            }
        }
        let mut words: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(_, c)| *c >= self.min_freq)
            .collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        self.tokens = vec![PAD_TOKEN.into(), UNK_TOKEN.into(), CLS_TOKEN.into()];
        let budget = self
            .max_vocab
            .map(|m| m.saturating_sub(self.tokens.len()))
            .unwrap_or(usize::MAX);
        self.tokens
            .extend(words.into_iter().take(budget).map(|(w, _)| w));
        self.rebuild_index();
        tracing::debug!(vocab_size = self.tokens.len(), "fitted vocabulary");
        Ok(())
    }

    fn transform(&self, texts: &[String]) -> Result<Encodings> {
        if !self.is_fitted() {
            return Err(FitError::NotFitted);
        }
        let rows: Vec<Vec<u32>> = texts.par_iter().map(|t| self.encode(t)).collect();
        Encodings::from_rows(&rows, self.max_len, PAD_ID)
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }

    fn max_len(&self) -> usize {
        self.max_len
    }
}

// ── PretrainedTokenizer ─────────────────────────────────────────────────────

/// Wraps a pretrained `tokenizer.json`. Fitting is a no-op; the vocabulary
/// identifier (the file) fully determines the output.
#[derive(Clone)]
pub struct PretrainedTokenizer {
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
}

impl PretrainedTokenizer {
    pub fn from_file(path: &Path, max_len: usize) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            FitError::collaborator_msg(Phase::Preprocess, format!("load tokenizer: {e}"))
        })?;
        Ok(Self::new(tokenizer, max_len))
    }

    pub fn new(tokenizer: Tokenizer, max_len: usize) -> Self {
        let pad_id = ["[PAD]", "<pad>", "<|endoftext|>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            .unwrap_or(0);
        Self {
            tokenizer,
            max_len,
            pad_id,
        }
    }
}

impl Preprocessor for PretrainedTokenizer {
    fn fit(&mut self, _texts: &[String]) -> Result<()> {
        if self.max_len == 0 {
            return Err(FitError::config("max_len must be at least 1"));
        }
        Ok(())
    }

    fn transform(&self, texts: &[String]) -> Result<Encodings> {
        let rows = texts
            .par_iter()
            .map(|t| {
                self.tokenizer
                    .encode(t.as_str(), true)
                    .map(|enc| enc.get_ids().to_vec())
                    .map_err(|e| {
                        FitError::collaborator_msg(Phase::Preprocess, format!("tokenize: {e}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Encodings::from_rows(&rows, self.max_len, self.pad_id)
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn max_len(&self) -> usize {
        self.max_len
    }
}
