use core::future::pending;
use std::env::var;
use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use convergence_tests::client::ReplicaClient;
use convergence_tests::config::{Config, Properties};
use convergence_tests::driver::{default_data_root, Driver, RunLayout};
use convergence_tests::launcher::ProcessLauncher;
use convergence_tests::output::{OutputFormat, OutputWriter};
use convergence_tests::settle::SettleStrategy;
use convergence_tests::verifier::Property;
use eyre::{bail, Result as EyreResult, WrapErr};
use tokio::signal::ctrl_c;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, EnvFilter};

/// Verifies that replicas of a CRDT store converge.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Scenario file. Without one, the built-in two-replica scenario runs.
    #[arg(long, env = "CONVERGENCE_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Replica binary, overriding `replica.binary` from the config file.
    #[arg(long, env = "REPLICA_BINARY")]
    replica_binary: Option<Utf8PathBuf>,

    /// Directory for reports, replica logs and snapshots.
    #[arg(long, env = "CONVERGENCE_OUTPUT_DIR", default_value = "./convergence-output")]
    output_dir: Utf8PathBuf,

    #[arg(long, value_enum, default_value_t)]
    output_format: OutputFormat,

    #[arg(long, env = "CONVERGENCE_BASE_PORT")]
    base_port: Option<u16>,

    /// Parent of the per-run data directories.
    #[arg(long, env = "CONVERGENCE_DATA_ROOT")]
    data_root: Option<Utf8PathBuf>,

    /// Fixed settle window, replacing the configured strategy.
    #[arg(long)]
    settle_ms: Option<u64>,

    #[arg(long)]
    readiness_timeout_ms: Option<u64>,

    /// Properties to check, replacing the configured selection.
    #[arg(long, value_enum, value_delimiter = ',')]
    properties: Option<Vec<Property>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = setup() {
        eprintln!("Failed to initialize: {err:?}");
        return ExitCode::from(2);
    }

    let args = Args::parse();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::from(2)
        }
    }
}

fn setup() -> EyreResult<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "convergence_tests=info".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer().with_writer(std::io::stderr))
        .init();

    color_eyre::install()?;

    Ok(())
}

async fn run(args: Args) -> EyreResult<u8> {
    let config = load_config(&args).await?;
    config.validate().wrap_err("invalid scenario")?;

    let data_root = match config.replica.data_root.clone() {
        Some(root) => root,
        None => default_data_root()?,
    };

    let layout = RunLayout::new(RunLayout::generate_run_id(), args.output_dir, data_root);
    let output = OutputWriter::new(args.output_format);

    let client = ReplicaClient::new(config.timeouts.request())
        .wrap_err("failed to build the replica HTTP client")?;
    let launcher = Arc::new(ProcessLauncher::from_config(&config.replica));

    tracing::info!(run_id = layout.run_id(), binary = %config.replica.binary, "starting verification run");

    let driver = Driver::new(config, layout, launcher, client, output);
    let report = driver.run(shutdown_signal()).await;

    output.write_summary(&report);

    let files = report
        .store_to_dir(&driver.layout().report_dir())
        .await
        .wrap_err("failed to write the report")?;
    output.write_str(&format!("Report files: {} {}", files.json, files.markdown));

    Ok(report.status().exit_code())
}

async fn load_config(args: &Args) -> EyreResult<Config> {
    let mut config = match (&args.config, &args.replica_binary) {
        (Some(path), _) => Config::load(path).await?,
        (None, Some(binary)) => Config::two_replica(binary.clone()),
        (None, None) => bail!("either --config or --replica-binary is required"),
    };

    if let Some(binary) = &args.replica_binary {
        config.replica.binary = binary.clone();
    }
    if let Some(root) = &args.data_root {
        config.replica.data_root = Some(root.clone());
    }
    if let Some(port) = args.base_port {
        config.network.base_port = Some(port);
    }
    if let Some(delay_ms) = args.settle_ms {
        config.settle = SettleStrategy::Fixed { delay_ms };
    }
    if let Some(readiness_ms) = args.readiness_timeout_ms {
        config.timeouts.readiness_ms = readiness_ms;
    }
    if let Some(properties) = &args.properties {
        config.properties = Properties::only(properties);
    }

    Ok(config)
}

/// Resolves on Ctrl-C or SIGTERM. Never resolves if neither can be watched.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = ctrl_c().await {
            tracing::warn!(%err, "failed to listen for Ctrl-C");
            pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                let _received = stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(%err, "failed to listen for SIGTERM");
                pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = interrupt => tracing::warn!("received Ctrl-C"),
        () = terminate => tracing::warn!("received SIGTERM"),
    }
}
