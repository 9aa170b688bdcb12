use anyhow::Context;
use clap::Parser;
use crowd_dataset::{load_dataset, LabelEncoder};
use std::path::PathBuf;
use tracing::info;
use training::util::{
    evaluate_and_report, init_tracing, load_classifier_from_checkpoint, prepare_with_encoder,
    validate_backend_choice, BackendKind, Device,
};
use training::{plot, TrainConfig};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a crowd-density checkpoint and regenerate the report and plots"
)]
struct Args {
    /// TOML config used for training (class list, split ratios, seed, model widths).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Dataset root; defaults to the config value.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Directory holding the checkpoint and labels; reports are written here too.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Checkpoint path (without or with `.bin`); defaults to `<output_dir>/<checkpoint_name>`.
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Label encoder JSON; defaults to `<output_dir>/labels.json`.
    #[arg(long)]
    labels: Option<PathBuf>,
    /// Evaluate every loaded image instead of the held-out test split.
    #[arg(long)]
    all: bool,
    /// Re-render the training curves from `<output_dir>/history.json` if present.
    #[arg(long)]
    plot_history: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let mut cfg = match &args.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::load()?,
    };
    if let Some(dir) = args.data_dir {
        cfg.data_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("failed to create {}", cfg.output_dir.display()))?;

    let labels_path = args
        .labels
        .unwrap_or_else(|| cfg.output_dir.join("labels.json"));
    let encoder = LabelEncoder::load(&labels_path)
        .with_context(|| format!("failed to load label encoder {}", labels_path.display()))?;
    if LabelEncoder::fit(&cfg.classes) != encoder {
        anyhow::bail!(
            "label encoder {:?} does not match configured classes {:?}",
            encoder.classes(),
            cfg.classes
        );
    }
    // Same directory order as training so the seeded split selects the same test images.
    let dataset = load_dataset(&cfg.data_dir, &cfg.classes)
        .with_context(|| format!("failed to load dataset from {}", cfg.data_dir.display()))?;
    let data = prepare_with_encoder(&cfg, dataset, encoder)?;

    let device = Device::default();
    let checkpoint = args.checkpoint.unwrap_or_else(|| cfg.checkpoint_path());
    let model = load_classifier_from_checkpoint(&checkpoint, &cfg.model_config(), &device)?;
    info!("loaded checkpoint {}", checkpoint.display());

    let indices: Vec<usize> = if args.all {
        (0..data.dataset.len()).collect()
    } else {
        data.split.test.clone()
    };
    let report = evaluate_and_report(
        &model,
        &data,
        &indices,
        cfg.batch_size,
        &device,
        &cfg.output_dir,
    )?;
    info!(
        "evaluated {} images: accuracy {:.4}, loss {:.4}",
        report.samples, report.report.accuracy, report.loss
    );

    if args.plot_history {
        let history_path = cfg.output_dir.join("history.json");
        let history = training::History::load_json(&history_path)?;
        plot::plot_history(&history, &cfg.output_dir.join("training_metrics.png"))?;
    }
    plot::plot_technique_comparison(&cfg.output_dir.join("technique_comparison.png"))?;
    Ok(())
}
