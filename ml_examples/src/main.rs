// ml_examples/src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netlearner::config::{Config, GanConfig, MergerConfig};
use netlearner::datasets::{load_csv_matrix, load_mnist_images, load_schema, load_table, resolve_schema};
use netlearner::features::FeaturePlan;
use netlearner::metrics::{confusion_matrix, CsvSink, FanoutSink, LogSink};
use netlearner::{FeatureMerger, GanData, RunDir, TrainSchedule, VanillaGan};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ml_examples", about = "UNSW-NB15 feature merger and vanilla GAN runs")]
struct Cli {
    /// TOML run configuration; defaults apply to anything it leaves out
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train and evaluate the embedding classifier
    Merger,
    /// Train the GAN and write sample grids
    Gan,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Merger => run_merger(&config.merger),
        Command::Gan => run_gan(&config.gan),
    }
}

fn run_merger(config: &MergerConfig) -> Result<()> {
    let drop: Vec<&str> = config.drop_columns.iter().map(String::as_str).collect();
    let schema = load_schema(&config.schema_path)
        .with_context(|| format!("reading schema {}", config.schema_path.display()))?;
    let train = load_table(&config.train_path, &drop)
        .with_context(|| format!("reading {}", config.train_path.display()))?;
    let test = match &config.test_path {
        Some(path) => Some(load_table(path, &drop).with_context(|| format!("reading {}", path.display()))?),
        None => None,
    };
    info!("Loaded {} training rows", train.num_rows());

    let mut tables = vec![&train];
    tables.extend(test.as_ref());
    let plan = FeaturePlan::new(resolve_schema(&schema, &tables)?)?;
    let fitted = plan.fit(&train)?;
    let encoded = fitted.encode(&train)?;
    let labels = train.labels(&config.label_column)?;

    let mut model = FeatureMerger::new(fitted, config)?;
    println!("{model}");
    model.train(&encoded, &labels)?;

    if let Some(test) = &test {
        let encoded = model.plan().encode(test)?;
        let labels = test.labels(&config.label_column)?;
        let accuracy = model.evaluate(&encoded, &labels)?;
        let [[tn, fp], [fn_, tp]] = confusion_matrix(&model.predict(&encoded)?, &labels);
        info!("Test accuracy: {:.2}%", accuracy * 100.0);
        info!("Confusion: tn={} fp={} fn={} tp={}", tn, fp, fn_, tp);
    }

    if let Some(path) = &config.model_path {
        model.save(path).with_context(|| format!("saving model to {}", path.display()))?;
        info!("Model saved to {}", path.display());
    }
    Ok(())
}

fn run_gan(config: &GanConfig) -> Result<()> {
    let data = match &config.data {
        GanData::Mnist(path) => load_mnist_images(path),
        GanData::Csv(path) => load_csv_matrix(path, false),
    }
    .context("loading GAN training data")?;
    info!("Loaded {} samples of width {}", data.len(), data.first().map_or(0, Vec::len));

    let run = RunDir::create(&config.output_dir, &config.name)?;
    let mut sink = FanoutSink::new(vec![
        Box::new(LogSink),
        Box::new(CsvSink::create(run.join("metrics.csv"))?),
    ]);

    let mut gan = VanillaGan::new(config)?;
    let report = gan.train(&data, TrainSchedule::from(config), &run, &mut sink)?;
    info!(
        "Run finished: V(D) = {:.6}, V(G) = {:.6}, {} figures in {}",
        report.final_d_value,
        report.final_g_value,
        report.figures,
        run.path().display()
    );
    gan.save(run.join("model.nlm"))?;
    Ok(())
}
