mod chat;
mod config_commands;
mod extension_commands;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, Subcommand},
    parley_plugins::{ExtensionHost, HostServices, Pipeline, bundled},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "parley", about = "Parley: message pipeline with pluggable extensions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/parley/).
    #[arg(long, global = true, env = "PARLEY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Custom data directory for extension state.
    #[arg(long, global = true, env = "PARLEY_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat over stdin (default when no subcommand is provided).
    Chat {
        /// Source identity attached to every fragment.
        #[arg(long, default_value = "local")]
        source: String,
    },
    /// Run an extension command.
    Command {
        /// Extension id, e.g. `content-guard`.
        extension: String,
        /// Command name, e.g. `stats`.
        name: String,
        /// Parameters as `key=value`; values that parse as JSON keep their type.
        params: Vec<String>,
    },
    /// List extensions, their commands and the handler chain per point.
    Extensions {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Load the host config and register the bundled extensions.
fn build_pipeline() -> anyhow::Result<Pipeline> {
    let config = parley_config::discover_and_load();
    let data_dir = parley_config::data_dir(&config);

    let services = HostServices::new(Arc::new(chat::LoopbackModel), Arc::new(chat::StdoutOutbox))
        .with_model_config(config.model.clone());
    let mut host = ExtensionHost::from_config(&config.hooks);
    bundled::register_all(&mut host, &config, &data_dir, services.clone())?;
    info!(data_dir = %data_dir.display(), "extensions loaded");

    Ok(Pipeline::new(Arc::new(host), services))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "parley starting");

    // Apply directory overrides before loading config
    if let Some(ref dir) = cli.config_dir {
        parley_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        parley_config::set_data_dir(dir.clone());
    }

    match cli.command {
        Some(Commands::Config { action }) => config_commands::handle_config(action),
        command => {
            let pipeline = build_pipeline()?;
            let result = match command {
                None => chat::run_chat(&pipeline, "local").await,
                Some(Commands::Chat { source }) => chat::run_chat(&pipeline, &source).await,
                Some(Commands::Command {
                    extension,
                    name,
                    params,
                }) => extension_commands::run_command(&pipeline, &extension, &name, &params).await,
                Some(Commands::Extensions { json }) => {
                    extension_commands::list_extensions(pipeline.host(), json)
                },
                Some(Commands::Config { .. }) => Ok(()),
            };
            pipeline.host().shutdown_all();
            result
        },
    }
}
