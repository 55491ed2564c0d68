use anyhow::Context;
use clap::{Parser, Subcommand};
use plotsync::persistence::persist_layout;
use plotsync::{CsvDatasetLoader, DatasetLoader, StateStore, SyncHost, load_config, normalize_path, save_config_to_file};
use shared::{HostMessage, ViewerStateMirror};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "plotsync")]
#[command(about = "Keeps plot layouts in sync between viewers and their layout files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a dataset in a console viewer and keep its layout file in sync.
    /// Viewer messages (one JSON envelope per line) are read from stdin.
    Watch {
        #[arg(long, short)]
        dataset: PathBuf,

        /// Layout file; defaults to the dataset's sidecar
        #[arg(long, short)]
        layout: Option<PathBuf>,

        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Write the default layout sidecar for a dataset if it has none
    Init {
        #[arg(long, short)]
        dataset: PathBuf,

        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Also write the effective configuration to this path
        #[arg(long)]
        write_config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Watch {
            dataset,
            layout,
            config,
        } => watch(&dataset, layout.as_deref(), config.as_deref()).await,
        Commands::Init {
            dataset,
            config,
            write_config,
        } => init(&dataset, config.as_deref(), write_config.as_deref()).await,
    }
}

async fn watch(dataset: &Path, layout: Option<&Path>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let (config, source) = load_config(config_path).context("cannot load configuration")?;
    if let Some(source) = source {
        log::info!("using configuration from '{}'", source.display());
    }

    let host = SyncHost::new(config, Arc::new(CsvDatasetLoader));
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let viewer_id = host.open_viewer(outbox);
    host.open_dataset(&viewer_id, dataset, layout)
        .with_context(|| format!("cannot open '{}'", dataset.display()))?;
    println!("viewer id: {viewer_id}");

    let console = tokio::spawn(async move {
        let mut mirror = ViewerStateMirror::new();
        while let Some(message) = inbox.recv().await {
            if let HostMessage::HostError(error) = &message {
                log::error!("{} (request {:?})", error.message, error.request_id);
                continue;
            }
            if !mirror.apply(&message) {
                continue;
            }
            if let Some(workspace) = mirror.workspace() {
                let traces: usize = workspace.plots.iter().map(|plot| plot.traces.len()).sum();
                log::info!(
                    "revision {}: {} plots, {} traces, active plot '{}'",
                    message.revision().unwrap_or_default(),
                    workspace.plots.len(),
                    traces,
                    workspace.active_plot_id
                );
            }
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("cannot read stdin")? {
                Some(line) if !line.trim().is_empty() => {
                    host.handle_viewer_message(&line);
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let flushed = host.shutdown().await;
    log::info!("flushed {} pending layout writes", flushed.len());
    console.abort();
    Ok(())
}

async fn init(dataset: &Path, config_path: Option<&Path>, write_config: Option<&Path>) -> anyhow::Result<()> {
    let (config, _) = load_config(config_path).context("cannot load configuration")?;
    if let Some(path) = write_config {
        save_config_to_file(&config, path).with_context(|| format!("cannot write '{}'", path.display()))?;
        log::info!("configuration written to '{}'", path.display());
    }

    let loaded = CsvDatasetLoader
        .load_dataset(dataset)
        .with_context(|| format!("cannot load '{}'", dataset.display()))?;
    let dataset_key = normalize_path(dataset);
    let layout = plotsync::persistence::sidecar_path(Path::new(&dataset_key), &config.layout.suffix);
    if layout.exists() {
        log::info!("'{}' already exists; nothing to do", layout.display());
        return Ok(());
    }

    let snapshot = StateStore::new().ensure_snapshot(&dataset_key, &loaded.default_x_signal);
    persist_layout(&layout, Path::new(&dataset_key), &snapshot)
        .await
        .with_context(|| format!("cannot write '{}'", layout.display()))?;
    log::info!(
        "wrote '{}' ({} signals, x = '{}')",
        layout.display(),
        loaded.dataset.columns.len(),
        loaded.default_x_signal
    );
    Ok(())
}
