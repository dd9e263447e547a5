use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use scriptpool_host::{setup_reload_signal, HostConfig, ScriptHost, ScriptRequest, StoreWatcher};
use scriptpool_loader::{FsArtifactStore, ScriptId};

mod logging;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug mode (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the script sources
    #[arg(short, long, default_value = ".", global = true)]
    store: PathBuf,

    /// Also write logs to the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate one script and print its result
    Run {
        /// Script identifier, e.g. /apps/page.rhai
        id: String,

        /// Only run the top level, skip the entry function
        #[arg(long)]
        top_level: bool,
    },
    /// Keep the pool alive and reload scripts as the store changes
    Watch,
    /// Stage scripts as one fingerprinted bundle and print its path
    Bundle {
        main: String,
        companions: Vec<String>,
    },
    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Run { .. } => "run",
            Command::Watch => "watch",
            Command::Bundle { .. } => "bundle",
            Command::Init { .. } => "init",
        }
    }
}

fn config_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(path) => Ok(path.clone()),
        None => HostConfig::default_path().context("Failed to find a config directory"),
    }
}

/// An explicit path must exist; the default location falls back to defaults
fn load_config(explicit: Option<&Path>, default: &Path) -> Result<HostConfig> {
    if let Some(path) = explicit {
        return HostConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if default.exists() {
        return HostConfig::load(default)
            .with_context(|| format!("Failed to load config from {}", default.display()));
    }

    info!("No config at {}, using defaults", default.display());
    Ok(HostConfig::default())
}

fn create_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "Config already exists at {} (pass --force to overwrite)",
            path.display()
        );
    }

    HostConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    eprintln!("Config file created at: {}", path.display());

    Ok(())
}

fn parse_id(raw: &str) -> Result<ScriptId> {
    ScriptId::new(raw).with_context(|| format!("'{}' is not a script identifier", raw))
}

fn build_host(config: HostConfig, store: &FsArtifactStore) -> Result<ScriptHost> {
    let host = ScriptHost::new(config, Arc::new(store.clone()))
        .context("Failed to start the script host")?;
    host.prepare().context("Failed to prepare the staging area")?;
    Ok(host)
}

async fn watch(host: &ScriptHost, store: &FsArtifactStore) -> Result<()> {
    let config = host.config();
    let mut watcher = if config.hot_reload {
        let scanner = store.scanner(
            config.loader.script_extensions.clone(),
            config.loader.config_files.clone(),
            config.hot_reload_interval(),
        );
        Some(StoreWatcher::spawn(scanner, host.observer())?)
    } else {
        info!("Hot reload disabled, reloading only on SIGUSR2");
        None
    };

    let mut reload_rx = setup_reload_signal(Arc::clone(host.notifier()));
    info!("Watching {} (ctrl-c to stop)", store.root().display());

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
            changed = reload_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if reload_rx.borrow_and_update().is_some() {
                    info!("Reload requested, engines will recompile on their next task");
                }
            }
        }
    }

    if let Some(watcher) = watcher.as_mut() {
        watcher.stop();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = logging::init_logging(
        cli.command.name(),
        cli.log_file,
        logging::level_for(cli.debug),
    )
    .context("Failed to initialize logging")?;

    let default_path = config_path(&cli)?;
    if let Command::Init { force } = &cli.command {
        return create_config(&default_path, *force);
    }

    let config = load_config(cli.config.as_deref(), &default_path)?;
    let store = FsArtifactStore::new(&cli.store);
    let host = build_host(config, &store)?;

    let outcome = match &cli.command {
        Command::Run { id, top_level } => {
            let request = ScriptRequest::new(parse_id(id)?).call_entry(!top_level);
            let output = host
                .render_async(request)
                .await
                .with_context(|| format!("Failed to evaluate {}", id))?;
            println!("{}", output);
            Ok(())
        }
        Command::Watch => watch(&host, &store).await,
        Command::Bundle { main, companions } => {
            let main = parse_id(main)?;
            let companions = companions
                .iter()
                .map(|raw| parse_id(raw))
                .collect::<Result<Vec<_>>>()?;
            let path = host
                .loader()
                .bundle(&main, &companions)
                .with_context(|| format!("Failed to bundle {}", main))?;
            println!("{}", path.display());
            Ok(())
        }
        Command::Init { .. } => Ok(()),
    };

    tokio::task::block_in_place(|| host.shutdown());
    outcome
}
