//! lockbox: local file-encryption vault CLI
//!
//! Commands:
//!   keygen              - print a fresh master key
//!   encrypt <file>      - seal a file into the encrypted directory
//!   decrypt <file>      - restore a sealed file into the decrypted directory
//!   config show         - display the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use lockbox_core::config::LockboxConfig;
use lockbox_core::types::{is_tagged, new_file_id, split_file_id, tag_file_name};
use lockbox_core::{OperationStatus, Outcome, Progress, ProcessingRequest, VaultResult};
use lockbox_crypto::{generate_master_key, IntegrityGate, MasterKey};
use lockbox_engine::{CancellationToken, EngineOptions, StorageEngine};
use lockbox_storage::{DurableFile, DurableOptions};
use lockbox_vault::KeyVault;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Local file-encryption vault",
    long_about = "lockbox: encrypt and decrypt files with per-file keys sealed under a master key and an install-local system key"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(long, short = 'c', env = "LOCKBOX_CONFIG", default_value = "lockbox.toml")]
    config: PathBuf,

    /// Override the configured log level (e.g. debug, lockbox_engine=trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate and print a new master key
    Keygen,

    /// Encrypt a file into `<encrypted_dir>/<name>_<id>`
    Encrypt {
        /// File to encrypt
        file: PathBuf,

        /// Master key (base64 of 32 bytes); prompted for when absent
        #[arg(long, env = "LOCKBOX_MASTER_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Output directory (default: vault.encrypted_dir)
        #[arg(long, short = 'o')]
        out_dir: Option<PathBuf>,
    },

    /// Decrypt a `<name>_<id>` file into `<decrypted_dir>/<name>`
    Decrypt {
        /// Encrypted file
        file: PathBuf,

        /// Master key (base64 of 32 bytes); prompted for when absent
        #[arg(long, env = "LOCKBOX_MASTER_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Output directory (default: vault.decrypted_dir)
        #[arg(long, short = 'o')]
        out_dir: Option<PathBuf>,

        /// Replace an existing output file
        #[arg(long)]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LockboxConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    let status = match cli.command {
        Commands::Keygen => return cmd_keygen(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => return cmd_config_show(&config, &cli.config),
        Commands::Encrypt { file, key, out_dir } => {
            cmd_encrypt(&config, &file, key, out_dir.as_deref()).await?
        }
        Commands::Decrypt {
            file,
            key,
            out_dir,
            force,
        } => cmd_decrypt(&config, &file, key, out_dir.as_deref(), force).await?,
    };

    println!("{status}");
    if matches!(status, OperationStatus::Failed(_)) {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        .map(|s| s.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ── Shared setup ──────────────────────────────────────────────────────────────

/// Create `dir` if needed and confirm a durable write succeeds inside it.
fn bootstrap_dir(dir: &Path, options: &DurableOptions) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let probe = dir.join(format!(".probe_{}", new_file_id()));
    let mut file = DurableFile::create(&probe, options.clone())
        .with_context(|| format!("{} is not writable", dir.display()))?;
    file.write_all(b"probe")?;
    file.durable_flush()
        .with_context(|| format!("durable write failed in {}", dir.display()))?;
    file.close();
    std::fs::remove_file(&probe)?;

    debug!(dir = %dir.display(), "output directory ready");
    Ok(())
}

fn read_master_key(flag: Option<String>) -> Result<MasterKey> {
    let encoded = match flag {
        Some(k) => SecretString::from(k),
        None => SecretString::from(
            rpassword::prompt_password("Master key: ").context("reading master key")?,
        ),
    };
    MasterKey::from_encoded(&encoded).context("parsing master key")
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", path.display()))
}

/// Destination for an encrypted copy of `source`.
fn encrypted_destination(source: &Path, out_dir: &Path, file_id: &str) -> Result<PathBuf> {
    let name = file_name_of(source)?;
    if is_tagged(&name) {
        anyhow::bail!("{name} already carries a file id; decrypt it instead");
    }
    Ok(out_dir.join(tag_file_name(&name, file_id)))
}

/// Destination and file id for a decrypted copy of `source`.
fn decrypted_destination(source: &Path, out_dir: &Path) -> Result<(PathBuf, String)> {
    let name = file_name_of(source)?;
    let (original, file_id) = split_file_id(&name)
        .with_context(|| format!("{name} does not end in _<file-id>"))?;
    Ok((out_dir.join(original), file_id.to_string()))
}

struct Services {
    engine: Arc<StorageEngine>,
    durable: DurableOptions,
}

async fn build_services(config: &LockboxConfig) -> Result<Services> {
    let gate = Arc::new(IntegrityGate::new());
    let options = EngineOptions::from_config(&config.storage, Some(gate.clone()));
    let durable = options.durable.clone();
    let vault = Arc::new(KeyVault::from_config(&config.keyvault, durable.clone()));

    if !vault.system_keys().path().exists() {
        let spinner = make_spinner("setup");
        spinner.set_message("generating system key (first run)...");
        let warm = vault.clone();
        let result = tokio::task::spawn_blocking(move || warm.warm_up()).await?;
        spinner.finish_and_clear();
        result.context("initializing system key")?;
        info!(path = %vault.system_keys().path().display(), "system key created");
    }

    Ok(Services {
        engine: Arc::new(StorageEngine::new(vault, gate, options)),
        durable,
    })
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Run one engine operation off the async runtime with a progress bar and
/// Ctrl-C cancellation.
async fn run_operation(
    engine: Arc<StorageEngine>,
    request: ProcessingRequest,
    master: MasterKey,
    direction: Direction,
) -> Result<OperationStatus> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Progress>();
    let pb = make_progress_bar(match direction {
        Direction::Encrypt => "encrypt",
        Direction::Decrypt => "decrypt",
    });

    let token = cancel.clone();
    let worker = tokio::task::spawn_blocking(move || -> VaultResult<Outcome> {
        match direction {
            Direction::Encrypt => engine.encrypt(&request, &master, &token, &tx),
            Direction::Decrypt => engine.decrypt(&request, &master, &token, &tx),
        }
    });

    // The channel closes when the worker drops its sender.
    while let Some(event) = rx.recv().await {
        pb.set_position(u64::from(event.percent));
        pb.set_message(event.message);
    }
    pb.finish_and_clear();
    signal_task.abort();

    let status = match worker.await.context("engine task panicked")? {
        Ok(outcome) => OperationStatus::from(outcome),
        Err(e) => OperationStatus::Failed(e.to_string()),
    };
    Ok(status)
}

// ── `lockbox keygen` ──────────────────────────────────────────────────────────

async fn cmd_keygen(config: &LockboxConfig) -> Result<()> {
    let iterations = config.keyvault.pbkdf2_iterations;
    let spinner = make_spinner("keygen");
    spinner.set_message("deriving master key...");
    let key = tokio::task::spawn_blocking(move || generate_master_key(iterations)).await?;
    spinner.finish_and_clear();

    println!("{}", key.expose_secret());
    eprintln!("Store this key safely: files sealed with it cannot be recovered without it.");
    Ok(())
}

// ── `lockbox encrypt` ─────────────────────────────────────────────────────────

async fn cmd_encrypt(
    config: &LockboxConfig,
    file: &Path,
    key: Option<String>,
    out_dir: Option<&Path>,
) -> Result<OperationStatus> {
    let out_dir = out_dir.unwrap_or(&config.vault.encrypted_dir);
    let file_id = new_file_id();
    let dest = encrypted_destination(file, out_dir, &file_id)?;
    let master = read_master_key(key)?;

    let services = build_services(config).await?;
    bootstrap_dir(out_dir, &services.durable)?;

    let request = ProcessingRequest::new(file_id, file, &dest);
    let status = run_operation(services.engine, request, master, Direction::Encrypt).await?;

    if status == OperationStatus::Completed {
        let size = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        eprintln!("{} -> {} ({})", file.display(), dest.display(), fmt_bytes(size));
    }
    Ok(status)
}

// ── `lockbox decrypt` ─────────────────────────────────────────────────────────

async fn cmd_decrypt(
    config: &LockboxConfig,
    file: &Path,
    key: Option<String>,
    out_dir: Option<&Path>,
    force: bool,
) -> Result<OperationStatus> {
    let out_dir = out_dir.unwrap_or(&config.vault.decrypted_dir);
    let (dest, file_id) = decrypted_destination(file, out_dir)?;
    if dest.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", dest.display());
    }
    let master = read_master_key(key)?;

    let services = build_services(config).await?;
    bootstrap_dir(out_dir, &services.durable)?;

    let request = ProcessingRequest::new(file_id, file, &dest);
    let status = run_operation(services.engine, request, master, Direction::Decrypt).await?;

    if status == OperationStatus::Completed {
        let size = std::fs::metadata(&dest).map(|m| m.len()).unwrap_or(0);
        eprintln!("{} -> {} ({})", file.display(), dest.display(), fmt_bytes(size));
    }
    Ok(status)
}

// ── `lockbox config show` ─────────────────────────────────────────────────────

fn cmd_config_show(config: &LockboxConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
