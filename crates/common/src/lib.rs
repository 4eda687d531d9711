//! # fitloop-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ClassifierConfig`]** — module hyper-parameters (serialised as JSON).
//! * **[`FitError`]** — the error taxonomy, tagged with a lifecycle [`Phase`].
//! * **[`Encodings`]** / **[`make_batch`]** — encoded rows → Candle tensors.
//! * **[`Preprocessor`]** — text → ids stage (`VocabTokenizer`, `PretrainedTokenizer`).

pub mod config;
pub mod data;
pub mod error;
pub mod preprocess;

pub use config::{ClassifierConfig, FfnActivation, ModelArch};
pub use data::{
    batch_plan, load_labeled, load_texts, make_batch, num_batches, train_test_split, Batch,
    Encodings, LabeledTexts, ModelInputs,
};
pub use error::{FitError, Phase, PhaseExt, Result};
pub use preprocess::{PretrainedTokenizer, Preprocessor, VocabTokenizer};
