pub mod config;
pub mod error;
pub mod export;
pub mod logging;
pub mod model;
pub mod parsing;
pub mod pipeline;
pub mod train;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::TrainConfig;
use error::Result;
use model::conv_net::ConvNet;
use model::optim::Adam;
use model::InitMethod;
use parsing::{DataSource, DatasetName, Split};
use pipeline::Pipeline;
use rand::{rngs::StdRng, SeedableRng};
use train::Trainer;

#[derive(Parser, Debug)]
#[command(version, about = "Train a convolutional MNIST classifier", long_about = None)]
struct Args {
    /// TOML file with training configuration. Flags given here override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name of the dataset to train on
    #[arg(long, value_enum)]
    dataset: Option<DatasetName>,

    /// Directory holding the IDX files of the dataset
    #[arg(short = 'D', long)]
    data_dir: Option<PathBuf>,

    /// Download missing dataset files into the data directory
    #[arg(long)]
    download: bool,

    /// The path of the training dataset in CSV format (requires --test-csv)
    #[arg(long, requires = "test_csv")]
    train_csv: Option<PathBuf>,

    /// The path of the test dataset in CSV format (requires --train-csv)
    #[arg(long, requires = "train_csv")]
    test_csv: Option<PathBuf>,

    /// Number of epochs to train the network for
    #[arg(short = 'n', long)]
    epochs: Option<usize>,

    /// Batch size of the network
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Learning rate of the Adam optimizer
    #[arg(short, long)]
    learning_rate: Option<f64>,

    /// Seed for weight initialization, shuffling and augmentation
    #[arg(short, long)]
    seed: Option<u64>,

    /// Worker threads for the per-sample map of the input pipeline
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of batches prepared ahead of the training loop
    #[arg(short, long)]
    prefetch: Option<usize>,

    /// Weight initialization method
    #[arg(short, long, value_enum)]
    initialization: Option<InitMethod>,

    /// Directory the trained model is exported to
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Write the per-epoch loss and accuracy to this file
    #[arg(long)]
    history_path: Option<PathBuf>,
}

/// Merge the defaults, the optional config file and the command line, in that order
fn build_config(args: &Args) -> Result<TrainConfig> {
    let mut config = match &args.config {
        Some(path) => TrainConfig::from_file(path)?,
        None => TrainConfig::default(),
    };

    if let Some(name) = args.dataset {
        config.dataset.name = name;
    }
    if let Some(dir) = &args.data_dir {
        config.dataset.data_dir = dir.clone();
    }
    config.dataset.download |= args.download;
    if args.train_csv.is_some() {
        config.dataset.train_csv = args.train_csv.clone();
        config.dataset.test_csv = args.test_csv.clone();
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.pipeline.batch_size = batch_size;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.optimizer.learning_rate = learning_rate;
    }
    if let Some(seed) = args.seed {
        config.pipeline.seed = seed;
    }
    if args.workers.is_some() {
        config.pipeline.workers = args.workers;
    }
    if let Some(prefetch) = args.prefetch {
        config.pipeline.prefetch = prefetch;
    }
    if let Some(initialization) = args.initialization {
        config.model.initialization = initialization;
    }
    if let Some(model_dir) = &args.model_dir {
        config.export.model_dir = model_dir.clone();
    }
    if args.history_path.is_some() {
        config.export.history_path = args.history_path.clone();
    }

    config.validate()?;
    Ok(config)
}

fn run(config: &TrainConfig) -> Result<()> {
    let source = config.data_source()?;
    if let (DataSource::Idx { dir }, true) = (&source, config.dataset.download) {
        parsing::download::download(dir)?;
    }

    let train_set = Arc::new(parsing::load(&source, Split::Train)?);
    let test_set = Arc::new(parsing::load(&source, Split::Test)?);

    let train_pipeline = Pipeline::train(train_set, &config.pipeline, config.augment.clone())?;
    let test_pipeline = Pipeline::test(test_set, &config.pipeline)?;

    let mut rng = StdRng::seed_from_u64(config.pipeline.seed);
    let model = ConvNet::new(&config.model, &mut rng)?;
    model.summary();

    let mut trainer = Trainer::new(model, Adam::new(&config.optimizer));
    let history = trainer.fit(&train_pipeline, config.training.epochs)?;

    if let Some(path) = &config.export.history_path {
        train::write_history(path, &history)?;
    }

    trainer.evaluate(&test_pipeline)?;
    export::export(trainer.model(), config, &config.export.model_dir)?;

    Ok(())
}

fn main() -> Result<()> {
    logging::init();

    let args = Args::parse();
    let config = build_config(&args)?;

    if let Err(err) = run(&config) {
        tracing::error!("{err}");
        return Err(err);
    }

    Ok(())
}
