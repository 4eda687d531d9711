use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};

use fitloop_common::{
    load_labeled, load_texts, train_test_split, ClassifierConfig, LabeledTexts, Preprocessor,
    PretrainedTokenizer, VocabTokenizer,
};
use fitloop_train::{
    EpochLogger, Estimator, EstimatorConfig, FitParams, OptimizerKind, Pipeline, PrecisionKind,
    ProgressBar, ScheduleKind, PREFETCH_BUFFER,
};

const MODEL_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";
const ESTIMATOR_FILE: &str = "estimator.json";
const HISTORY_FILE: &str = "history.json";
const VOCAB_FILE: &str = "vocab.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

#[derive(Parser, Debug)]
#[command(name = "fitloop", about = "Train and run text classifiers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit a classifier on a labelled dataset and save the artefacts.
    Train(TrainArgs),
    /// Classify texts with a trained model directory.
    Predict(PredictArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// JSONL (`{"text": ..., "label": n}`) or `label<TAB>text` lines.
    #[arg(long)]
    data: PathBuf,
    #[arg(long, default_value = "model")]
    output_dir: PathBuf,
    /// Estimator config JSON. When given, the optimisation flags below are ignored.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Pretrained `tokenizer.json`; a word vocabulary is learned when absent.
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    #[arg(long, default_value = "bag-of-embeddings", value_parser = ["bag-of-embeddings", "transformer-encoder"])]
    arch: String,
    #[arg(long, default_value_t = 64)]
    hidden_size: usize,
    #[arg(long, default_value_t = 2)]
    num_layers: usize,
    #[arg(long, default_value_t = 4)]
    num_heads: usize,
    /// Tokens per row (padded / truncated).
    #[arg(long, default_value_t = 64)]
    max_len: usize,
    #[arg(long, default_value_t = 0.0)]
    dropout: f32,
    #[arg(long, default_value_t = 1)]
    min_freq: usize,
    #[arg(long)]
    max_vocab: Option<usize>,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 10)]
    epochs: usize,
    #[arg(long, default_value_t = 1e-3)]
    lr: f64,
    #[arg(long, default_value_t = 0.01)]
    weight_decay: f64,
    #[arg(long, default_value = "adamw", value_parser = ["adamw", "sgd"])]
    optimizer: String,
    #[arg(long, default_value = "linear", value_parser = ["linear", "constant", "cosine"])]
    schedule: String,
    /// Warmup steps for the cosine schedule.
    #[arg(long, default_value_t = 0)]
    warmup_steps: usize,
    #[arg(long, default_value = "f32", value_parser = ["f32", "f16", "bf16"])]
    precision: String,
    #[arg(long)]
    grad_clip: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f64,
    #[arg(long, default_value_t = 0.2)]
    test_fraction: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Log every N steps at debug level (0 = off).
    #[arg(long, default_value_t = 0)]
    log_every: usize,
    #[arg(long)]
    progress: bool,
}

// ── Predict ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct PredictArgs {
    #[arg(long, default_value = "model")]
    model_dir: PathBuf,
    /// File with one text per line (JSONL `text` fields are accepted).
    #[arg(long)]
    input: Option<PathBuf>,
    /// Text to classify; repeatable.
    #[arg(long)]
    text: Vec<String>,
    /// Print class probabilities instead of labels.
    #[arg(long)]
    proba: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Predict(args) => cmd_predict(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let data = load_labeled(&args.data)?;
    let num_labels = data.num_classes();
    if num_labels < 2 {
        anyhow::bail!("need at least 2 classes, found {num_labels}");
    }
    let (train, test) = train_test_split(&data, args.test_fraction, args.seed)?;
    eprintln!(
        "Loaded {} examples, {} classes ({} train / {} test)",
        data.len(),
        num_labels,
        train.len(),
        test.len()
    );

    std::fs::create_dir_all(&args.output_dir)?;
    match &args.tokenizer {
        Some(path) => {
            let tokenizer = PretrainedTokenizer::from_file(path, args.max_len)?;
            std::fs::copy(path, args.output_dir.join(TOKENIZER_FILE))?;
            fit_and_save(tokenizer, &args, num_labels, &train, &test)
        }
        None => {
            let mut vocab = VocabTokenizer::new(args.max_len).with_min_freq(args.min_freq);
            if let Some(max_vocab) = args.max_vocab {
                vocab = vocab.with_max_vocab(max_vocab);
            }
            vocab.fit(&train.texts)?;
            vocab.save(&args.output_dir.join(VOCAB_FILE))?;
            eprintln!("Vocabulary: {} tokens", vocab.vocab_size());
            fit_and_save(vocab, &args, num_labels, &train, &test)
        }
    }
}

/// `preprocessor` must already be fitted: its vocabulary sizes the module.
fn fit_and_save<P: Preprocessor>(
    preprocessor: P,
    args: &TrainArgs,
    num_labels: usize,
    train: &LabeledTexts,
    test: &LabeledTexts,
) -> Result<()> {
    let mut module = ClassifierConfig::new(&args.arch, num_labels, preprocessor.vocab_size());
    module.hidden_size = args.hidden_size;
    module.intermediate_size = 2 * args.hidden_size;
    module.num_layers = args.num_layers;
    module.num_heads = args.num_heads;
    module.max_seq_len = args.max_len;
    module.dropout = args.dropout;
    module.validate()?;

    let config = match &args.config {
        Some(path) => EstimatorConfig::load(path)?,
        None => estimator_config(args)?,
    };
    eprintln!(
        "Prefetch buffer: {} batches (batch_size={}, epochs={})",
        config.prefetch, config.batch_size, config.max_epochs
    );

    let device = Device::cuda_if_available(0)?;
    let mut estimator = Estimator::new(module.clone(), config.clone())?
        .with_device(device)
        .with_callback(EpochLogger::with_batch_logging(args.log_every));
    if args.progress {
        estimator = estimator.with_callback(ProgressBar::new());
    }

    let x = preprocessor.transform(&train.texts)?;
    let mut params = FitParams::seeded(args.seed);
    if !test.is_empty() {
        params = params.with_validation(preprocessor.transform(&test.texts)?, test.labels.clone());
    }
    estimator.fit(&x, &train.labels, params)?;

    if let Some(last) = estimator.history().last() {
        eprintln!(
            "Finished {} epochs, {} steps, final train loss {}",
            estimator.history().len(),
            estimator.global_step(),
            fmt_opt(last.train_loss)
        );
    }
    if !test.is_empty() {
        let acc = estimator.score(&preprocessor.transform(&test.texts)?, &test.labels)?;
        println!("test accuracy: {acc:.4}");
    }

    let dir = &args.output_dir;
    estimator.save_params(&dir.join(MODEL_FILE))?;
    module.save(&dir.join(CONFIG_FILE))?;
    config.save(&dir.join(ESTIMATOR_FILE))?;
    estimator.history().save(&dir.join(HISTORY_FILE))?;
    eprintln!("Saved model to {}", dir.display());
    Ok(())
}

fn estimator_config(args: &TrainArgs) -> Result<EstimatorConfig> {
    let schedule = match args.schedule.as_str() {
        "cosine" => ScheduleKind::WarmupCosine {
            warmup_steps: args.warmup_steps,
            floor: 0.0,
        },
        other => ScheduleKind::from_name(other)
            .ok_or_else(|| anyhow::anyhow!("unknown schedule {other:?}"))?,
    };
    let optimizer = OptimizerKind::from_name(&args.optimizer)
        .ok_or_else(|| anyhow::anyhow!("unknown optimizer {:?}", args.optimizer))?;
    let precision = PrecisionKind::from_name(&args.precision)
        .ok_or_else(|| anyhow::anyhow!("unknown precision {:?}", args.precision))?;
    Ok(EstimatorConfig {
        batch_size: args.batch_size,
        max_epochs: args.epochs,
        lr: args.lr,
        weight_decay: args.weight_decay,
        optimizer,
        schedule,
        grad_clip: args.grad_clip,
        prefetch: PREFETCH_BUFFER,
        label_smoothing: args.label_smoothing,
        precision,
        ..Default::default()
    })
}

fn cmd_predict(args: PredictArgs) -> Result<()> {
    let mut texts = args.text.clone();
    if let Some(path) = &args.input {
        texts.extend(load_texts(path)?);
    }
    if texts.is_empty() {
        anyhow::bail!("nothing to classify; pass --input or --text");
    }

    let module = ClassifierConfig::load(&args.model_dir.join(CONFIG_FILE))?;
    let tokenizer_path = args.model_dir.join(TOKENIZER_FILE);
    if tokenizer_path.exists() {
        let tokenizer = PretrainedTokenizer::from_file(&tokenizer_path, module.max_seq_len)?;
        classify(tokenizer, module, &args, &texts)
    } else {
        let vocab = VocabTokenizer::load(&args.model_dir.join(VOCAB_FILE))?;
        classify(vocab, module, &args, &texts)
    }
}

fn classify<P: Preprocessor>(
    preprocessor: P,
    module: ClassifierConfig,
    args: &PredictArgs,
    texts: &[String],
) -> Result<()> {
    let config = load_estimator_config(&args.model_dir)?;
    let mut estimator =
        Estimator::new(module, config)?.with_device(Device::cuda_if_available(0)?);
    estimator.load_params(&args.model_dir.join(MODEL_FILE))?;
    let pipeline = Pipeline::new(preprocessor, estimator);

    if args.proba {
        for (probs, text) in pipeline.predict_proba(texts)?.iter().zip(texts) {
            println!("{}\t{}", serde_json::to_string(probs)?, text);
        }
    } else {
        for (label, text) in pipeline.predict(texts)?.iter().zip(texts) {
            println!("{label}\t{text}");
        }
    }
    Ok(())
}

fn load_estimator_config(dir: &Path) -> Result<EstimatorConfig> {
    let path = dir.join(ESTIMATOR_FILE);
    if path.exists() {
        Ok(EstimatorConfig::load(&path)?)
    } else {
        Ok(EstimatorConfig::default())
    }
}

fn fmt_opt(v: Option<f32>) -> String {
    v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string())
}
