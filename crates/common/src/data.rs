//! Data pipeline: labelled text loading, encodings, batching.
//!
//! * **[`Encodings`]** — fixed-width token ids + attention mask produced by a
//!   [`Preprocessor`](crate::Preprocessor).
//! * **[`Batch`]** / **[`make_batch`]** — a slice of rows turned into Candle
//!   tensors. Built fresh per iteration and dropped after use.
//! * **[`load_labeled`]** — read `(text, label)` pairs from JSONL or TSV.
//! * **[`train_test_split`]** — seeded shuffle + split.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{FitError, Phase, PhaseExt, Result};

// ── Encodings ───────────────────────────────────────────────────────────────

/// Token ids and attention mask for `len()` rows, every row `seq_len` wide.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Encodings {
    input_ids: Vec<u32>,
    attention_mask: Vec<u32>,
    seq_len: usize,
}

impl Encodings {
    /// Build from row-major buffers. Both must be `rows * seq_len` long.
    pub fn new(input_ids: Vec<u32>, attention_mask: Vec<u32>, seq_len: usize) -> Result<Self> {
        if input_ids.len() != attention_mask.len() {
            return Err(FitError::config(format!(
                "input_ids ({}) and attention_mask ({}) differ in length",
                input_ids.len(),
                attention_mask.len()
            )));
        }
        if seq_len == 0 || input_ids.len() % seq_len != 0 {
            return Err(FitError::config(format!(
                "buffer of {} ids is not a whole number of rows of width {seq_len}",
                input_ids.len()
            )));
        }
        Ok(Self {
            input_ids,
            attention_mask,
            seq_len,
        })
    }

    /// Build from per-row id lists, padding with `pad_id` / truncating to `seq_len`.
    pub fn from_rows(rows: &[Vec<u32>], seq_len: usize, pad_id: u32) -> Result<Self> {
        let mut input_ids = Vec::with_capacity(rows.len() * seq_len);
        let mut attention_mask = Vec::with_capacity(rows.len() * seq_len);
        for row in rows {
            let kept = row.len().min(seq_len);
            input_ids.extend_from_slice(&row[..kept]);
            attention_mask.extend(std::iter::repeat(1).take(kept));
            input_ids.extend(std::iter::repeat(pad_id).take(seq_len - kept));
            attention_mask.extend(std::iter::repeat(0).take(seq_len - kept));
        }
        Self::new(input_ids, attention_mask, seq_len)
    }

    pub fn len(&self) -> usize {
        if self.seq_len == 0 {
            0
        } else {
            self.input_ids.len() / self.seq_len
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn row_ids(&self, i: usize) -> &[u32] {
        &self.input_ids[i * self.seq_len..(i + 1) * self.seq_len]
    }

    pub fn row_mask(&self, i: usize) -> &[u32] {
        &self.attention_mask[i * self.seq_len..(i + 1) * self.seq_len]
    }

    /// Largest token id present, if any rows exist.
    pub fn max_id(&self) -> Option<u32> {
        self.input_ids.iter().copied().max()
    }

    /// Rows `indices` copied into a new `Encodings`, in the given order.
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut input_ids = Vec::with_capacity(indices.len() * self.seq_len);
        let mut attention_mask = Vec::with_capacity(indices.len() * self.seq_len);
        for &i in indices {
            input_ids.extend_from_slice(self.row_ids(i));
            attention_mask.extend_from_slice(self.row_mask(i));
        }
        Self {
            input_ids,
            attention_mask,
            seq_len: self.seq_len,
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// Named inputs handed to a module's forward pass.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `(batch, seq_len)` u32 token ids.
    pub input_ids: Tensor,
    /// `(batch, seq_len)` u32, 1 for real tokens and 0 for padding.
    pub attention_mask: Tensor,
}

/// One batch: inputs plus optional `(batch,)` u32 targets.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: ModelInputs,
    pub targets: Option<Tensor>,
    pub size: usize,
}

/// Convert the rows `indices` of `enc` (and matching `labels`) to tensors.
pub fn make_batch(
    enc: &Encodings,
    labels: Option<&[u32]>,
    indices: &[usize],
    device: &Device,
) -> Result<Batch> {
    let rows = enc.select(indices);
    let shape = (indices.len(), enc.seq_len());
    let input_ids = Tensor::from_vec(rows.input_ids, shape, device).during(Phase::Batching)?;
    let attention_mask =
        Tensor::from_vec(rows.attention_mask, shape, device).during(Phase::Batching)?;
    let targets = match labels {
        Some(labels) => {
            let t: Vec<u32> = indices.iter().map(|&i| labels[i]).collect();
            Some(Tensor::from_vec(t, indices.len(), device).during(Phase::Batching)?)
        }
        None => None,
    };
    Ok(Batch {
        inputs: ModelInputs {
            input_ids,
            attention_mask,
        },
        targets,
        size: indices.len(),
    })
}

/// Number of batches for `n` rows: `ceil(n / batch_size)`.
pub fn num_batches(n: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        0
    } else {
        n.div_ceil(batch_size)
    }
}

/// Row order for one epoch, chunked into batches. Shuffled when `rng` is given.
pub fn batch_plan(n: usize, batch_size: usize, rng: Option<&mut StdRng>) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    if batch_size == 0 {
        return Vec::new();
    }
    order.chunks(batch_size).map(|c| c.to_vec()).collect()
}

// ── Labelled text ───────────────────────────────────────────────────────────

/// A labelled text corpus.
#[derive(Debug, Clone, Default)]
pub struct LabeledTexts {
    pub texts: Vec<String>,
    pub labels: Vec<u32>,
}

impl LabeledTexts {
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Number of classes implied by the largest label (`max + 1`).
    pub fn num_classes(&self) -> usize {
        self.labels.iter().max().map(|&m| m as usize + 1).unwrap_or(0)
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            texts: indices.iter().map(|&i| self.texts[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Load `(text, label)` pairs.
///
/// Each non-empty line is either JSON (`{"text": ..., "label": 2}`) or
/// `label<TAB>text`. Lines that parse as neither are an error.
pub fn load_labeled(path: &Path) -> Result<LabeledTexts> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = LabeledTexts::default();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (text, label) = parse_labeled_line(line).ok_or_else(|| {
            FitError::config(format!(
                "{}:{}: expected JSON with text/label or `label<TAB>text`",
                path.display(),
                lineno + 1
            ))
        })?;
        out.texts.push(text);
        out.labels.push(label);
    }
    tracing::debug!(path = %path.display(), rows = out.len(), "loaded labelled texts");
    Ok(out)
}

/// Load unlabelled texts, one per non-empty line (JSON `text` field or raw).
pub fn load_texts(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(extract_text(line));
    }
    Ok(out)
}

fn parse_labeled_line(line: &str) -> Option<(String, u32)> {
    if line.starts_with('{') {
        let v = serde_json::from_str::<serde_json::Value>(line).ok()?;
        let text = v.get("text").and_then(|t| t.as_str())?;
        let label = v.get("label").and_then(|l| l.as_u64())?;
        return Some((text.to_string(), u32::try_from(label).ok()?));
    }
    let (label, text) = line.split_once('\t')?;
    Some((text.to_string(), label.trim().parse().ok()?))
}

/// Extract text from a line: JSON with `"text"`, or the raw line.
fn extract_text(line: &str) -> String {
    if line.starts_with('{') {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(t) = v.get("text").and_then(|t| t.as_str()) {
                return t.to_string();
            }
        }
    }
    line.to_string()
}

/// Seeded shuffle, then split off `test_fraction` of the rows.
pub fn train_test_split(
    data: &LabeledTexts,
    test_fraction: f64,
    seed: u64,
) -> Result<(LabeledTexts, LabeledTexts)> {
    if !(0.0..1.0).contains(&test_fraction) {
        return Err(FitError::config(format!(
            "test_fraction must be in [0, 1), got {test_fraction}"
        )));
    }
    let mut order: Vec<usize> = (0..data.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_test = (data.len() as f64 * test_fraction).round() as usize;
    let (test, train) = order.split_at(n_test);
    Ok((data.select(train), data.select(test)))
}
